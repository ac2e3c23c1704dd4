//! Remote endpoint registry.
//!
//! Maps virtual-LAN addresses to the UDP rendezvous points of the peers that
//! own them. The registry is the only writer of the `REMOTE_ADDRS` table: every
//! change is applied locally first and then pushed into the kernel copy.
//!
//! Entries, the table handle and broadcast fan-out share one mutex. The switch
//! IP is read from the tracker's published snapshot before that mutex is taken,
//! and the structural log is written after it is released.

use crate::audit::AuditLogger;
use crate::ebpf_loader::{RemoteAddr, RemoteTable, Result};
use crate::switch::SwitchTracker;
use std::collections::BTreeMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Outbound side of the rendezvous socket.
pub trait Transmit: Send + Sync {
    fn send_to(&self, frame: &[u8], target: SocketAddrV4) -> io::Result<usize>;
}

/// UDP rendezvous point of a remote peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
}

impl RemoteEndpoint {
    pub fn new(remote_ip: Ipv4Addr, remote_port: u16) -> Self {
        Self {
            remote_ip,
            remote_port,
        }
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.remote_ip, self.remote_port)
    }

    fn kernel_value(&self) -> RemoteAddr {
        RemoteAddr::new(self.remote_ip, self.remote_port)
    }
}

/// What a registry command did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryChange {
    /// The address is the switch's own, or there was nothing to remove.
    Ignored,
    Inserted,
    Updated,
    Removed,
}

struct RegistryState {
    entries: BTreeMap<Ipv4Addr, RemoteEndpoint>,
    table: Option<Box<dyn RemoteTable>>,
}

/// Registry of remote endpoints keyed by local IP.
pub struct RemoteRegistry {
    switch: Arc<SwitchTracker>,
    state: Mutex<RegistryState>,
    transmit: Arc<dyn Transmit>,
    audit: Arc<AuditLogger>,
}

impl RemoteRegistry {
    pub fn new(
        switch: Arc<SwitchTracker>,
        transmit: Arc<dyn Transmit>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            switch,
            state: Mutex::new(RegistryState {
                entries: BTreeMap::new(),
                table: None,
            }),
            transmit,
            audit,
        }
    }

    /// Insert or replace the endpoint for `local_ip` and push it to the kernel.
    pub fn upsert(
        &self,
        local_ip: Ipv4Addr,
        remote_ip: Ipv4Addr,
        remote_port: u16,
    ) -> Result<RegistryChange> {
        if local_ip == self.switch.switch_ip() {
            debug!(%local_ip, "Ignoring remote for the switch address");
            return Ok(RegistryChange::Ignored);
        }

        let endpoint = RemoteEndpoint::new(remote_ip, remote_port);
        let change = {
            let mut state = self.state.lock().unwrap();
            let change = match state.entries.insert(local_ip, endpoint) {
                Some(_) => RegistryChange::Updated,
                None => RegistryChange::Inserted,
            };
            if let Some(table) = state.table.as_mut() {
                table.insert(local_ip, endpoint.kernel_value())?;
            }
            change
        };

        if change == RegistryChange::Inserted {
            self.audit.remote_added(local_ip, endpoint.socket_addr());
        }
        info!(%local_ip, remote = %endpoint.socket_addr(), ?change, "Remote registered");
        Ok(change)
    }

    /// Remove the endpoint for `local_ip` and delete it from the kernel.
    pub fn remove(&self, local_ip: Ipv4Addr) -> Result<RegistryChange> {
        if local_ip == self.switch.switch_ip() {
            debug!(%local_ip, "Ignoring removal of the switch address");
            return Ok(RegistryChange::Ignored);
        }

        {
            let mut state = self.state.lock().unwrap();
            if state.entries.remove(&local_ip).is_none() {
                return Ok(RegistryChange::Ignored);
            }
            if let Some(table) = state.table.as_mut() {
                table.remove(local_ip)?;
            }
        }

        self.audit.remote_removed(local_ip);
        info!(%local_ip, "Remote removed");
        Ok(RegistryChange::Removed)
    }

    /// Send `frame` to every registered remote. Returns the number of sends
    /// that succeeded; failures are skipped.
    pub fn broadcast(&self, frame: &[u8]) -> usize {
        let state = self.state.lock().unwrap();
        let mut delivered = 0;
        for (local_ip, endpoint) in &state.entries {
            match self.transmit.send_to(frame, endpoint.socket_addr()) {
                Ok(_) => delivered += 1,
                Err(e) => {
                    debug!(%local_ip, remote = %endpoint.socket_addr(), error = %e, "Broadcast send failed");
                }
            }
        }
        delivered
    }

    /// Attach the kernel table and push every entry registered so far.
    pub fn install_table(&self, mut table: Box<dyn RemoteTable>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for (local_ip, endpoint) in &state.entries {
            table.insert(*local_ip, endpoint.kernel_value())?;
        }
        debug!(count = state.entries.len(), "Remote table installed");
        state.table = Some(table);
        Ok(())
    }

    /// Registered remotes ordered by local IP.
    pub fn snapshot(&self) -> Vec<(Ipv4Addr, RemoteEndpoint)> {
        let state = self.state.lock().unwrap();
        state.entries.iter().map(|(ip, ep)| (*ip, *ep)).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::ForwardingMirror;
    use crate::test_util::{CapturingTransmit, RecordingTable};

    const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 6);
    const SWITCH: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    struct Fixture {
        registry: RemoteRegistry,
        transmit: Arc<CapturingTransmit>,
        journal: crate::audit::AuditJournal,
    }

    fn fixture() -> Fixture {
        let switch = Arc::new(SwitchTracker::new(ForwardingMirror::new(Ipv4Addr::new(
            255, 255, 255, 0,
        ))));
        switch.set_switch_ip(SWITCH).unwrap();
        let transmit = CapturingTransmit::new();
        let (audit, journal) = AuditLogger::new_memory();
        let registry = RemoteRegistry::new(switch, transmit.clone(), Arc::new(audit));
        Fixture {
            registry,
            transmit,
            journal,
        }
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let f = fixture();
        assert_eq!(
            f.registry.upsert(A, Ipv4Addr::new(203, 0, 113, 9), 40000).unwrap(),
            RegistryChange::Inserted
        );
        assert_eq!(
            f.registry.upsert(A, Ipv4Addr::new(203, 0, 113, 10), 40001).unwrap(),
            RegistryChange::Updated
        );

        let snapshot = f.registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot[0],
            (A, RemoteEndpoint::new(Ipv4Addr::new(203, 0, 113, 10), 40001))
        );
        // Only the insertion is logged.
        assert_eq!(
            f.journal.messages(),
            vec!["Remote added: 10.0.0.5 -> 203.0.113.9:40000"]
        );
    }

    #[test]
    fn test_switch_address_is_never_registered() {
        let f = fixture();
        assert_eq!(
            f.registry.upsert(SWITCH, Ipv4Addr::new(203, 0, 113, 9), 40000).unwrap(),
            RegistryChange::Ignored
        );
        assert!(f.registry.is_empty());
        assert_eq!(f.registry.remove(SWITCH).unwrap(), RegistryChange::Ignored);
        assert!(f.journal.messages().is_empty());
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let f = fixture();
        let (table, kernel) = RecordingTable::new();
        f.registry.install_table(Box::new(table)).unwrap();

        assert_eq!(f.registry.remove(A).unwrap(), RegistryChange::Ignored);
        assert_eq!(kernel.remove_count(), 0);
        assert!(f.journal.messages().is_empty());
    }

    #[test]
    fn test_remove_deletes_kernel_entry() {
        let f = fixture();
        let (table, kernel) = RecordingTable::new();
        f.registry.install_table(Box::new(table)).unwrap();

        f.registry.upsert(A, Ipv4Addr::new(203, 0, 113, 9), 40000).unwrap();
        assert!(kernel.entries().contains_key(&A));

        assert_eq!(f.registry.remove(A).unwrap(), RegistryChange::Removed);
        assert!(kernel.entries().is_empty());
        assert!(f.registry.is_empty());
        assert_eq!(f.journal.messages().last().unwrap(), "Remote removed: 10.0.0.5");
    }

    #[test]
    fn test_install_table_pushes_earlier_entries() {
        let f = fixture();
        f.registry.upsert(A, Ipv4Addr::new(203, 0, 113, 9), 40000).unwrap();
        f.registry.upsert(B, Ipv4Addr::new(198, 51, 100, 4), 40002).unwrap();

        let (table, kernel) = RecordingTable::new();
        f.registry.install_table(Box::new(table)).unwrap();

        let entries = kernel.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[&B], RemoteAddr::new(Ipv4Addr::new(198, 51, 100, 4), 40002));
        assert_eq!(kernel.push_count(), 2);
    }

    #[test]
    fn test_kernel_push_failure_surfaces() {
        let f = fixture();
        let (table, kernel) = RecordingTable::new();
        f.registry.install_table(Box::new(table)).unwrap();

        kernel.fail_next();
        assert!(f.registry.upsert(A, Ipv4Addr::new(203, 0, 113, 9), 40000).is_err());
    }

    #[test]
    fn test_broadcast_reaches_every_remote() {
        let f = fixture();
        f.registry.upsert(A, Ipv4Addr::new(203, 0, 113, 9), 40000).unwrap();
        f.registry.upsert(B, Ipv4Addr::new(198, 51, 100, 4), 40002).unwrap();

        assert_eq!(f.registry.broadcast(b"frame"), 2);

        let mut targets: Vec<SocketAddrV4> = f.transmit.sent().into_iter().map(|(t, _)| t).collect();
        targets.sort();
        assert_eq!(
            targets,
            vec![
                SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 4), 40002),
                SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 9), 40000),
            ]
        );
        assert!(f.transmit.sent().iter().all(|(_, frame)| frame == b"frame"));
    }

    #[test]
    fn test_broadcast_skips_failing_remote() {
        let f = fixture();
        f.registry.upsert(A, Ipv4Addr::new(203, 0, 113, 9), 40000).unwrap();
        f.registry.upsert(B, Ipv4Addr::new(198, 51, 100, 4), 40002).unwrap();
        f.transmit
            .fail_to(SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 9), 40000));

        assert_eq!(f.registry.broadcast(b"frame"), 1);
        assert_eq!(
            f.transmit.sent()[0].0,
            SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 4), 40002)
        );
    }

    #[test]
    fn test_broadcast_with_no_remotes() {
        let f = fixture();
        assert_eq!(f.registry.broadcast(b"frame"), 0);
        assert!(f.transmit.sent().is_empty());
    }
}
