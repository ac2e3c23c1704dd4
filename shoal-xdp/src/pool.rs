//! Socket pool manager.
//!
//! Brings the XDP packet path up in stages and tears it down in reverse:
//!
//! ```text
//! Unloaded -> ProgramLoaded -> ProgramAttached -> SocketsRegistered -> Running
//!
//! teardown: stop receive threads -> detach -> clear XSKS_MAP -> release -> close sockets
//! ```
//!
//! Teardown inspects the stage reached, so it is safe after a partial startup,
//! runs at most once per bring-up and is also run on drop.

use crate::audit::AuditLogger;
use crate::ebpf_loader::{Datapath, EbpfError, MAX_XSKS, ProgramLoader};
use crate::fatal::FatalSignal;
use crate::mirror::StaticIdentity;
use crate::remote::RemoteRegistry;
use crate::switch::SwitchTracker;
use crate::xsk::XskError;
use smoltcp::wire::EthernetFrame;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// A kernel-bypass receive socket bound to one hardware queue.
pub trait KernelBypassSocket: Send {
    /// Descriptor registered into the dispatch table.
    fn raw_fd(&self) -> RawFd;

    fn queue(&self) -> u32;

    /// Deliver frames to `on_frame` until `stop` is set.
    fn run(
        &mut self,
        stop: &AtomicBool,
        on_frame: &mut dyn FnMut(&[u8]),
    ) -> std::result::Result<(), XskError>;
}

/// Opens one [`KernelBypassSocket`] per queue.
pub trait SocketOpener {
    fn open(&self, if_name: &str, queue: u32) -> std::result::Result<Box<dyn KernelBypassSocket>, XskError>;
}

/// Bring-up stage of the packet path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PoolStage {
    Unloaded,
    ProgramLoaded,
    ProgramAttached,
    SocketsRegistered,
    Running,
}

/// Socket pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Ebpf(#[from] EbpfError),

    #[error("No AF_XDP socket could be opened on {if_name}: {source}")]
    FirstSlot {
        if_name: String,
        #[source]
        source: XskError,
    },

    #[error("Socket pool is {actual:?}, expected {expected:?}")]
    Stage {
        expected: PoolStage,
        actual: PoolStage,
    },

    #[error("Failed to spawn receive thread: {0}")]
    Spawn(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// Per-frame work of every receive thread.
pub struct ReceivePath {
    switch: Arc<SwitchTracker>,
    registry: Arc<RemoteRegistry>,
}

impl ReceivePath {
    pub fn new(switch: Arc<SwitchTracker>, registry: Arc<RemoteRegistry>) -> Self {
        Self { switch, registry }
    }

    /// Reconcile the switch identity, then broadcast the frame without its
    /// Ethernet header. Returns the number of remotes reached.
    pub fn on_frame(&self, frame: &[u8]) -> std::result::Result<usize, EbpfError> {
        self.switch.reconcile_from_kernel()?;

        let header_len = EthernetFrame::<&[u8]>::header_len();
        if frame.len() <= header_len {
            debug!(len = frame.len(), "Discarding runt frame");
            return Ok(0);
        }
        Ok(self.registry.broadcast(&frame[header_len..]))
    }
}

/// Owner of the XDP attachment and the AF_XDP sockets.
pub struct SocketPool {
    if_name: String,
    stage: PoolStage,
    datapath: Option<Box<dyn Datapath>>,
    sockets: Vec<Box<dyn KernelBypassSocket>>,
    workers: Vec<JoinHandle<Box<dyn KernelBypassSocket>>>,
    queues: Vec<u32>,
    stop: Arc<AtomicBool>,
    audit: Arc<AuditLogger>,
    fatal: Arc<FatalSignal>,
}

impl SocketPool {
    pub fn new(if_name: &str, audit: Arc<AuditLogger>, fatal: Arc<FatalSignal>) -> Self {
        Self {
            if_name: if_name.to_string(),
            stage: PoolStage::Unloaded,
            datapath: None,
            sockets: Vec::new(),
            workers: Vec::new(),
            queues: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            audit,
            fatal,
        }
    }

    pub fn stage(&self) -> PoolStage {
        self.stage
    }

    /// Queue indices with a registered socket.
    pub fn queues(&self) -> &[u32] {
        &self.queues
    }

    fn expect_stage(&self, expected: PoolStage) -> Result<()> {
        if self.stage != expected {
            return Err(PoolError::Stage {
                expected,
                actual: self.stage,
            });
        }
        Ok(())
    }

    /// Load the program, push the initial mirror and table, attach.
    pub fn load_and_attach(
        &mut self,
        loader: &dyn ProgramLoader,
        switch: &SwitchTracker,
        registry: &RemoteRegistry,
        host: StaticIdentity,
    ) -> Result<()> {
        self.expect_stage(PoolStage::Unloaded)?;

        let program = loader.load()?;
        let datapath = self.datapath.insert(program.datapath);
        self.stop.store(false, Ordering::Release);
        self.stage = PoolStage::ProgramLoaded;

        switch.install_mirror(program.mirror, host)?;
        registry.install_table(program.remotes)?;

        datapath.attach(&self.if_name)?;
        self.stage = PoolStage::ProgramAttached;
        self.audit.program_attached(&self.if_name);
        Ok(())
    }

    /// Open and register one socket per queue, up to `max_slots`.
    ///
    /// Stops at the first queue that fails once at least one slot is open.
    /// Returns the number of slots.
    pub fn open_socket_pool(&mut self, opener: &dyn SocketOpener, max_slots: u32) -> Result<usize> {
        self.expect_stage(PoolStage::ProgramAttached)?;
        let Some(datapath) = self.datapath.as_mut() else {
            return Err(EbpfError::Released.into());
        };

        let max_slots = max_slots.clamp(1, MAX_XSKS);
        for queue in 0..max_slots {
            let socket = match opener.open(&self.if_name, queue) {
                Ok(socket) => socket,
                Err(e) if self.sockets.is_empty() => {
                    return Err(PoolError::FirstSlot {
                        if_name: self.if_name.clone(),
                        source: e,
                    });
                }
                Err(e) => {
                    warn!(queue, error = %e, "Socket slot unavailable");
                    self.audit
                        .socket_slot_degraded(queue, self.sockets.len(), &e.to_string());
                    break;
                }
            };

            datapath.register_socket(queue, socket.raw_fd())?;
            info!(queue, fd = socket.raw_fd(), "Socket slot registered");
            self.queues.push(queue);
            self.sockets.push(socket);
        }

        self.stage = PoolStage::SocketsRegistered;
        Ok(self.sockets.len())
    }

    /// Move every socket onto its own receive thread.
    pub fn start(&mut self, path: Arc<ReceivePath>) -> Result<()> {
        self.expect_stage(PoolStage::SocketsRegistered)?;

        for mut socket in self.sockets.drain(..) {
            let queue = socket.queue();
            let stop = Arc::clone(&self.stop);
            let fatal = Arc::clone(&self.fatal);
            let path = Arc::clone(&path);

            let worker = thread::Builder::new()
                .name(format!("xsk-rx-{queue}"))
                .spawn(move || {
                    let mut on_frame = |frame: &[u8]| {
                        if let Err(e) = path.on_frame(frame) {
                            fatal.raise("Reconcile switch identity", &e);
                            stop.store(true, Ordering::Release);
                        }
                    };
                    if let Err(e) = socket.run(&stop, &mut on_frame) {
                        fatal.raise("AF_XDP receive loop", &e);
                    }
                    socket
                })
                .map_err(PoolError::Spawn)?;
            self.workers.push(worker);
        }

        self.stage = PoolStage::Running;
        info!(slots = self.workers.len(), "Receive threads started");
        Ok(())
    }

    /// Stop, detach, clear the dispatch table, release, close. Idempotent.
    pub fn teardown(&mut self) {
        if self.datapath.is_none() && self.sockets.is_empty() && self.workers.is_empty() {
            return;
        }
        info!(stage = ?self.stage, "Tearing down socket pool");

        self.stop.store(true, Ordering::Release);
        for worker in self.workers.drain(..) {
            match worker.join() {
                Ok(socket) => self.sockets.push(socket),
                Err(_) => error!("Receive thread panicked"),
            }
        }

        if let Some(mut datapath) = self.datapath.take() {
            if self.stage >= PoolStage::ProgramAttached {
                match datapath.detach() {
                    Ok(()) => self.audit.program_detached(&self.if_name),
                    Err(e) => error!(error = %e, "Failed to detach XDP program"),
                }
            }
            if let Err(e) = datapath.clear_dispatch() {
                error!(error = %e, "Failed to clear dispatch table");
            }
            datapath.release();
        }

        // Sockets close last so no dispatch slot points at a closed socket.
        self.sockets.clear();
        self.queues.clear();
        self.stage = PoolStage::Unloaded;
    }
}

impl Drop for SocketPool {
    fn drop(&mut self) {
        self.teardown();
    }
}
