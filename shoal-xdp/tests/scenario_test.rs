//! End-to-end control plane scenario.
//!
//! Brings up the whole stack on recording fakes (program, maps, sockets and
//! UDP transmit), issues commands the way the gRPC surface does and feeds
//! frames through the running receive threads.
//!
//! These tests use recording fakes and need no privileges.

use shoal_xdp::addr::MacAddr;
use shoal_xdp::audit::AuditLogger;
use shoal_xdp::ebpf_loader::RemoteAddr;
use shoal_xdp::fatal::FatalSignal;
use shoal_xdp::mirror::ForwardingMirror;
use shoal_xdp::pool::{ReceivePath, SocketPool};
use shoal_xdp::remote::{RegistryChange, RemoteRegistry};
use shoal_xdp::switch::{SwitchIdentity, SwitchTracker};
use shoal_xdp::test_util::{
    CapturingTransmit, DatapathEvent, RecordingLoader, ScriptedOpener, test_frame,
    test_static_identity, wait_for,
};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const SWITCH_MAC: MacAddr = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
const SWITCH_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
const REMOTE: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 9), 40000);

#[test]
fn test_end_to_end_scenario() {
    let switch = Arc::new(SwitchTracker::new(ForwardingMirror::new(Ipv4Addr::new(
        255, 255, 255, 0,
    ))));
    assert_eq!(switch.current(), SwitchIdentity::default());

    let notifications = Arc::new(AtomicUsize::new(0));
    {
        let n = Arc::clone(&notifications);
        switch.register_change_observer(move || {
            n.fetch_add(1, Ordering::SeqCst);
        });
    }

    let transmit = CapturingTransmit::new();
    let (audit, journal) = AuditLogger::new_memory();
    let audit = Arc::new(audit);
    let registry = Arc::new(RemoteRegistry::new(
        Arc::clone(&switch),
        transmit.clone(),
        Arc::clone(&audit),
    ));
    assert!(registry.is_empty());

    let fatal = Arc::new(FatalSignal::new());
    let (loader, kernel) = RecordingLoader::new();
    let mut pool = SocketPool::new("eth0", audit, Arc::clone(&fatal));
    pool.load_and_attach(&loader, &switch, &registry, test_static_identity())
        .unwrap();

    // Identity commands: one notification each.
    assert!(switch.set_switch_mac(SWITCH_MAC).unwrap());
    assert!(switch.set_switch_ip(SWITCH_IP).unwrap());
    assert_eq!(notifications.load(Ordering::SeqCst), 2);

    // One remote, one kernel push.
    assert_eq!(
        registry.upsert(LOCAL, *REMOTE.ip(), REMOTE.port()).unwrap(),
        RegistryChange::Inserted
    );
    assert_eq!(registry.len(), 1);
    assert_eq!(kernel.table.push_count(), 1);
    assert_eq!(
        kernel.table.entries().get(&LOCAL),
        Some(&RemoteAddr::new(*REMOTE.ip(), REMOTE.port()))
    );

    // The kernel block already carries the switch we configured.
    let block = kernel.mirror.block();
    assert_eq!(block.switch_mac, SWITCH_MAC.octets());
    assert_eq!(block.switch_ip, SWITCH_IP.octets());

    // Frames: a runt that is discarded and a 64-byte frame that is broadcast.
    let opener = ScriptedOpener::new(kernel.journal.clone(), 1);
    opener.queue_frame(0, test_frame(10));
    opener.queue_frame(0, test_frame(64));
    assert_eq!(pool.open_socket_pool(&opener, 1).unwrap(), 1);
    pool.start(Arc::new(ReceivePath::new(
        Arc::clone(&switch),
        Arc::clone(&registry),
    )))
    .unwrap();

    // Same queue, so the runt was handled before the 64-byte frame.
    assert!(wait_for(|| !transmit.sent().is_empty()));
    pool.teardown();

    let frame = test_frame(64);
    assert_eq!(transmit.sent(), vec![(REMOTE, frame[14..].to_vec())]);

    // Both frames reconciled against a consistent kernel block.
    assert_eq!(notifications.load(Ordering::SeqCst), 2);
    assert!(fatal.reason().is_none());

    assert!(
        journal
            .messages()
            .contains(&"Remote added: 10.0.0.5 -> 203.0.113.9:40000".to_string())
    );
    let events = kernel.journal.events();
    assert_eq!(events.last(), Some(&DatapathEvent::Close(0)));
}

#[test]
fn test_switch_learned_from_traffic_reaches_registry() {
    let switch = Arc::new(SwitchTracker::new(ForwardingMirror::new(Ipv4Addr::new(
        255, 255, 255, 0,
    ))));
    let notifications = Arc::new(AtomicUsize::new(0));
    {
        let n = Arc::clone(&notifications);
        switch.register_change_observer(move || {
            n.fetch_add(1, Ordering::SeqCst);
        });
    }
    let transmit = CapturingTransmit::new();
    let registry = Arc::new(RemoteRegistry::new(
        Arc::clone(&switch),
        transmit.clone(),
        Arc::new(AuditLogger::new_noop()),
    ));
    registry.upsert(LOCAL, *REMOTE.ip(), REMOTE.port()).unwrap();

    let (loader, kernel) = RecordingLoader::new();
    let mut pool = SocketPool::new(
        "eth0",
        Arc::new(AuditLogger::new_noop()),
        Arc::new(FatalSignal::new()),
    );
    pool.load_and_attach(&loader, &switch, &registry, test_static_identity())
        .unwrap();

    // The XDP program saw the switch before the frame reached userspace.
    kernel.mirror.learn_switch(SWITCH_MAC, SWITCH_IP);
    let stores = kernel.mirror.store_count();

    let opener = ScriptedOpener::new(kernel.journal.clone(), 1);
    opener.queue_frame(0, test_frame(64));
    pool.open_socket_pool(&opener, 1).unwrap();
    pool.start(Arc::new(ReceivePath::new(
        Arc::clone(&switch),
        Arc::clone(&registry),
    )))
    .unwrap();

    assert!(wait_for(|| !transmit.sent().is_empty()));
    pool.teardown();

    assert_eq!(notifications.load(Ordering::SeqCst), 1);
    assert_eq!(
        switch.current(),
        SwitchIdentity {
            mac: SWITCH_MAC,
            ip: SWITCH_IP
        }
    );
    assert_eq!(kernel.mirror.store_count(), stores);

    // The learned switch address can no longer be tunneled to.
    assert_eq!(
        registry.upsert(SWITCH_IP, *REMOTE.ip(), 40001).unwrap(),
        RegistryChange::Ignored
    );
}
