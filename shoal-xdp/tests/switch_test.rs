//! Switch identity integration tests.
//!
//! Exercises the tracker together with a recording MIRROR map: identity
//! updates, kernel-learned reconciliation and the fake-gateway policy.
//!
//! These tests use recording fakes and need no privileges.

use shoal_xdp::addr::MacAddr;
use shoal_xdp::mirror::{FAKE_GATEWAY_MASK, ForwardingMirror};
use shoal_xdp::switch::{SwitchIdentity, SwitchTracker};
use shoal_xdp::test_util::{MirrorHandle, RecordingMirror, test_static_identity};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

/// Mask of the uplink in these tests.
const REAL_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 252, 0);

const SWITCH_MAC: MacAddr = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

fn installed_tracker() -> (Arc<SwitchTracker>, MirrorHandle) {
    let tracker = Arc::new(SwitchTracker::new(ForwardingMirror::new(REAL_MASK)));
    let (store, kernel) = RecordingMirror::new();
    tracker
        .install_mirror(Box::new(store), test_static_identity())
        .unwrap();
    (tracker, kernel)
}

fn counting(tracker: &SwitchTracker) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    tracker.register_change_observer(move || {
        c.fetch_add(1, Ordering::SeqCst);
    });
    count
}

#[test]
fn test_repeated_identity_updates_notify_once() {
    let (tracker, kernel) = installed_tracker();
    let count = counting(&tracker);

    for _ in 0..3 {
        tracker.set_switch_ip(Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        tracker.set_switch_mac(SWITCH_MAC).unwrap();
    }

    assert_eq!(count.load(Ordering::SeqCst), 2);
    let block = kernel.block();
    assert_eq!(block.switch_ip, [10, 0, 0, 1]);
    assert_eq!(block.switch_mac, SWITCH_MAC.octets());
}

#[test]
fn test_fake_gateway_mask_for_any_address() {
    let (tracker, kernel) = installed_tracker();

    for last in [1u8, 77, 254] {
        for net in [[10, 0, 0], [172, 16, 5], [192, 168, 200]] {
            let gateway = Ipv4Addr::new(net[0], net[1], net[2], last);
            tracker.set_fake_gateway_ip(Some(gateway)).unwrap();
            assert_eq!(tracker.policy().subnet_mask, FAKE_GATEWAY_MASK);
            assert_eq!(kernel.block().subnet_mask, FAKE_GATEWAY_MASK.octets());
            assert_eq!(kernel.block().fake_gateway_ip, gateway.octets());
        }
    }

    tracker.set_fake_gateway_ip(None).unwrap();
    assert_eq!(tracker.policy().subnet_mask, REAL_MASK);
    assert_eq!(kernel.block().subnet_mask, REAL_MASK.octets());
    assert_eq!(kernel.block().fake_gateway_ip, [0; 4]);
}

#[test]
fn test_unspecified_gateway_means_none() {
    let (tracker, kernel) = installed_tracker();
    tracker
        .set_fake_gateway_ip(Some(Ipv4Addr::new(10, 0, 0, 254)))
        .unwrap();
    tracker
        .set_fake_gateway_ip(Some(Ipv4Addr::UNSPECIFIED))
        .unwrap();

    assert_eq!(tracker.policy().fake_gateway_ip, None);
    assert_eq!(kernel.block().subnet_mask, REAL_MASK.octets());
}

#[test]
fn test_gateway_set_before_install_reaches_kernel() {
    let tracker = SwitchTracker::with_identity(
        ForwardingMirror::new(REAL_MASK),
        SwitchIdentity {
            mac: SWITCH_MAC,
            ip: Ipv4Addr::new(10, 0, 0, 1),
        },
    );
    tracker
        .set_fake_gateway_ip(Some(Ipv4Addr::new(10, 0, 0, 254)))
        .unwrap();

    let (store, kernel) = RecordingMirror::new();
    tracker
        .install_mirror(Box::new(store), test_static_identity())
        .unwrap();

    let block = kernel.block();
    assert_eq!(block.switch_mac, SWITCH_MAC.octets());
    assert_eq!(block.switch_ip, [10, 0, 0, 1]);
    assert_eq!(block.fake_gateway_ip, [10, 0, 0, 254]);
    assert_eq!(block.subnet_mask, FAKE_GATEWAY_MASK.octets());
    assert_eq!(block.public_host_ip, [192, 168, 1, 20]);
    assert_eq!(block.vpn_port, test_static_identity().vpn_port);
}

#[test]
fn test_policy_push_keeps_learned_switch() {
    let (tracker, kernel) = installed_tracker();
    let learned_mac = MacAddr::new([2, 0, 0, 0, 0, 9]);
    kernel.learn_switch(learned_mac, Ipv4Addr::new(10, 0, 0, 9));

    // The kernel learned the switch but nobody reconciled yet.
    tracker
        .set_fake_gateway_ip(Some(Ipv4Addr::new(10, 0, 0, 254)))
        .unwrap();

    let block = kernel.block();
    assert_eq!(block.switch_mac, learned_mac.octets());
    assert_eq!(block.switch_ip, [10, 0, 0, 9]);

    assert!(tracker.reconcile_from_kernel().unwrap());
    assert_eq!(tracker.switch_ip(), Ipv4Addr::new(10, 0, 0, 9));
}

#[test]
fn test_kernel_learned_identity_wins() {
    let (tracker, kernel) = installed_tracker();
    tracker.set_switch_ip(Ipv4Addr::new(10, 0, 0, 1)).unwrap();
    let count = counting(&tracker);
    let stores = kernel.store_count();

    let learned = SwitchIdentity {
        mac: MacAddr::new([2, 0, 0, 0, 0, 9]),
        ip: Ipv4Addr::new(10, 0, 0, 9),
    };
    kernel.learn_switch(learned.mac, learned.ip);

    assert!(tracker.reconcile_from_kernel().unwrap());
    assert_eq!(tracker.current(), learned);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(kernel.store_count(), stores);
}

#[test]
fn test_failed_mirror_push_surfaces() {
    let (tracker, kernel) = installed_tracker();
    kernel.fail_next_store();
    assert!(tracker.set_switch_mac(SWITCH_MAC).is_err());
}

#[test]
fn test_concurrent_writers_are_serialized() {
    let (tracker, kernel) = installed_tracker();
    let in_observer = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    {
        let (busy, overlaps) = (Arc::clone(&in_observer), Arc::clone(&overlaps));
        tracker.register_change_observer(move || {
            if busy.swap(true, Ordering::SeqCst) {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            thread::yield_now();
            busy.store(false, Ordering::SeqCst);
        });
    }

    let mut workers = Vec::new();
    for t in 0..4u8 {
        let tracker = Arc::clone(&tracker);
        workers.push(thread::spawn(move || {
            for i in 0..100u8 {
                tracker.set_switch_ip(Ipv4Addr::new(10, t, 0, i)).unwrap();
                tracker.set_switch_mac(MacAddr::new([2, t, 0, 0, 0, i])).unwrap();
            }
        }));
    }
    {
        let tracker = Arc::clone(&tracker);
        let kernel = kernel.clone();
        workers.push(thread::spawn(move || {
            for i in 0..100u8 {
                kernel.learn_switch(MacAddr::new([2, 9, 0, 0, 0, i]), Ipv4Addr::new(10, 9, 0, i));
                tracker.reconcile_from_kernel().unwrap();
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);

    // After a final reconcile the local and kernel copies agree.
    tracker.reconcile_from_kernel().unwrap();
    let block = kernel.block();
    let current = tracker.current();
    assert_eq!(current.ip.octets(), block.switch_ip);
    assert_eq!(current.mac.octets(), block.switch_mac);
}
