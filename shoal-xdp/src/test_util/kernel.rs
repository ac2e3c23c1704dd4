//! Recording stand-ins for the BPF maps and the XDP program.
//!
//! Each fake is split into the half handed to the code under test and a
//! handle the test keeps to inspect or steer the "kernel" side.

use crate::addr::MacAddr;
use crate::ebpf_loader::{
    Datapath, EbpfError, LoadedProgram, MirrorBlock, MirrorStore, ProgramLoader, RemoteAddr,
    RemoteTable, Result,
};
use std::collections::BTreeMap;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

fn injected(call: &'static str) -> EbpfError {
    EbpfError::Syscall {
        call,
        io_error: io::Error::other("injected failure"),
    }
}

// === MIRROR ===

#[derive(Default)]
struct MirrorShared {
    block: MirrorBlock,
    stores: usize,
    fail_next: bool,
}

/// In-memory `MIRROR` map.
#[derive(Clone, Default)]
pub struct RecordingMirror {
    shared: Arc<Mutex<MirrorShared>>,
}

/// Test-side view of a [`RecordingMirror`].
#[derive(Clone)]
pub struct MirrorHandle {
    shared: Arc<Mutex<MirrorShared>>,
}

impl RecordingMirror {
    pub fn new() -> (Self, MirrorHandle) {
        let store = Self::default();
        let handle = store.handle();
        (store, handle)
    }

    pub fn handle(&self) -> MirrorHandle {
        MirrorHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl MirrorStore for RecordingMirror {
    fn load(&self) -> Result<MirrorBlock> {
        Ok(self.shared.lock().unwrap().block)
    }

    fn store(&mut self, block: &MirrorBlock) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        if std::mem::take(&mut shared.fail_next) {
            return Err(injected("bpf_map_update_elem"));
        }
        shared.block = *block;
        shared.stores += 1;
        Ok(())
    }
}

impl MirrorHandle {
    /// The block as the XDP program would see it.
    pub fn block(&self) -> MirrorBlock {
        self.shared.lock().unwrap().block
    }

    /// Rewrite the switch fields the way the XDP program does when it learns
    /// the switch from traffic. Not counted as a store.
    pub fn learn_switch(&self, mac: MacAddr, ip: Ipv4Addr) {
        let mut shared = self.shared.lock().unwrap();
        shared.block.switch_mac = mac.octets();
        shared.block.switch_ip = ip.octets();
    }

    /// Number of successful userspace stores.
    pub fn store_count(&self) -> usize {
        self.shared.lock().unwrap().stores
    }

    pub fn fail_next_store(&self) {
        self.shared.lock().unwrap().fail_next = true;
    }
}

// === REMOTE_ADDRS ===

#[derive(Default)]
struct TableShared {
    entries: BTreeMap<Ipv4Addr, RemoteAddr>,
    pushes: usize,
    removes: usize,
    fail_next: bool,
}

/// In-memory `REMOTE_ADDRS` map.
#[derive(Clone, Default)]
pub struct RecordingTable {
    shared: Arc<Mutex<TableShared>>,
}

/// Test-side view of a [`RecordingTable`].
#[derive(Clone)]
pub struct TableHandle {
    shared: Arc<Mutex<TableShared>>,
}

impl RecordingTable {
    pub fn new() -> (Self, TableHandle) {
        let table = Self::default();
        let handle = table.handle();
        (table, handle)
    }

    pub fn handle(&self) -> TableHandle {
        TableHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl RemoteTable for RecordingTable {
    fn insert(&mut self, local_ip: Ipv4Addr, remote: RemoteAddr) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        if std::mem::take(&mut shared.fail_next) {
            return Err(injected("bpf_map_update_elem"));
        }
        shared.entries.insert(local_ip, remote);
        shared.pushes += 1;
        Ok(())
    }

    fn remove(&mut self, local_ip: Ipv4Addr) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        if std::mem::take(&mut shared.fail_next) {
            return Err(injected("bpf_map_delete_elem"));
        }
        shared.entries.remove(&local_ip);
        shared.removes += 1;
        Ok(())
    }
}

impl TableHandle {
    pub fn entries(&self) -> BTreeMap<Ipv4Addr, RemoteAddr> {
        self.shared.lock().unwrap().entries.clone()
    }

    /// Number of successful inserts.
    pub fn push_count(&self) -> usize {
        self.shared.lock().unwrap().pushes
    }

    /// Number of successful deletes.
    pub fn remove_count(&self) -> usize {
        self.shared.lock().unwrap().removes
    }

    pub fn fail_next(&self) {
        self.shared.lock().unwrap().fail_next = true;
    }
}

// === Program and XSKS_MAP ===

/// Kernel-visible operation on the packet path, in the order performed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatapathEvent {
    Attach(String),
    Detach,
    Register(u32, RawFd),
    ClearDispatch,
    Release,
    /// A socket was closed (recorded by the fake sockets).
    Close(u32),
}

/// Ordered log of [`DatapathEvent`]s shared by the fakes of one test.
#[derive(Clone, Default)]
pub struct Journal {
    events: Arc<Mutex<Vec<DatapathEvent>>>,
}

impl Journal {
    pub fn record(&self, event: DatapathEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<DatapathEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Position of the first occurrence of `event`.
    pub fn position(&self, event: &DatapathEvent) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    pub fn count(&self, matches: impl Fn(&DatapathEvent) -> bool) -> usize {
        self.events().iter().filter(|e| matches(e)).count()
    }
}

/// Datapath that only records what it is asked to do.
pub struct RecordingDatapath {
    journal: Journal,
    fail_attach: bool,
}

impl Datapath for RecordingDatapath {
    fn attach(&mut self, if_name: &str) -> Result<()> {
        self.journal.record(DatapathEvent::Attach(if_name.to_string()));
        if self.fail_attach {
            return Err(injected("bpf_link_create"));
        }
        Ok(())
    }

    fn detach(&mut self) -> Result<()> {
        self.journal.record(DatapathEvent::Detach);
        Ok(())
    }

    fn register_socket(&mut self, queue: u32, fd: RawFd) -> Result<()> {
        self.journal.record(DatapathEvent::Register(queue, fd));
        Ok(())
    }

    fn clear_dispatch(&mut self) -> Result<()> {
        self.journal.record(DatapathEvent::ClearDispatch);
        Ok(())
    }

    fn release(&mut self) {
        self.journal.record(DatapathEvent::Release);
    }
}

/// Test-side handles of everything a [`RecordingLoader`] hands out.
#[derive(Clone)]
pub struct ProgramHandles {
    pub journal: Journal,
    pub mirror: MirrorHandle,
    pub table: TableHandle,
}

/// Loader producing recording fakes instead of touching the kernel.
pub struct RecordingLoader {
    journal: Journal,
    mirror: RecordingMirror,
    table: RecordingTable,
    fail_load: AtomicBool,
    fail_attach: AtomicBool,
}

impl RecordingLoader {
    pub fn new() -> (Self, ProgramHandles) {
        let loader = Self {
            journal: Journal::default(),
            mirror: RecordingMirror::default(),
            table: RecordingTable::default(),
            fail_load: AtomicBool::new(false),
            fail_attach: AtomicBool::new(false),
        };
        let handles = ProgramHandles {
            journal: loader.journal.clone(),
            mirror: loader.mirror.handle(),
            table: loader.table.handle(),
        };
        (loader, handles)
    }

    pub fn fail_load(&self) {
        self.fail_load.store(true, Ordering::SeqCst);
    }

    pub fn fail_attach(&self) {
        self.fail_attach.store(true, Ordering::SeqCst);
    }
}

impl ProgramLoader for RecordingLoader {
    fn load(&self) -> Result<LoadedProgram> {
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(EbpfError::ProgramNotFound("xdp_prog".to_string()));
        }
        Ok(LoadedProgram {
            datapath: Box::new(RecordingDatapath {
                journal: self.journal.clone(),
                fail_attach: self.fail_attach.load(Ordering::SeqCst),
            }),
            mirror: Box::new(self.mirror.clone()),
            remotes: Box::new(self.table.clone()),
        })
    }
}
