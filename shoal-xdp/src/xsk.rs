//! AF_XDP receive sockets.
//!
//! One socket per hardware queue, each with its own UMEM, fill ring and RX
//! ring. The XDP program redirects frames into a socket through `XSKS_MAP`;
//! the receive loop hands every frame to the receive path and returns the
//! UMEM frame to the fill ring.
//!
//! Receive only: no TX or completion-ring traffic is generated, the completion
//! ring exists because the kernel requires it to bind.

use crate::pool::{KernelBypassSocket, SocketOpener};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Descriptors per ring (power of two).
const RING_SIZE: u32 = 2048;

/// UMEM frame size; one frame holds one packet.
const FRAME_SIZE: u32 = 2048;

/// Twice the ring size so the fill ring can be refilled while RX holds frames.
const NUM_FRAMES: u32 = RING_SIZE * 2;

const UMEM_SIZE: usize = (NUM_FRAMES * FRAME_SIZE) as usize;

/// Frames handled per poll wakeup.
const RX_BATCH: u32 = 64;

/// Poll timeout so the stop flag is checked regularly.
const POLL_TIMEOUT_MS: u16 = 100;

// <linux/if_xdp.h>
const SOL_XDP: libc::c_int = 283;
const XDP_MMAP_OFFSETS: libc::c_int = 1;
const XDP_RX_RING: libc::c_int = 2;
const XDP_UMEM_REG: libc::c_int = 4;
const XDP_UMEM_FILL_RING: libc::c_int = 5;
const XDP_UMEM_COMPLETION_RING: libc::c_int = 6;
const XDP_PGOFF_RX_RING: libc::off_t = 0;
const XDP_UMEM_PGOFF_FILL_RING: libc::off_t = 0x100000000;
const XDP_COPY: u16 = 1 << 1;

/// AF_XDP socket errors.
#[derive(Debug, Error)]
pub enum XskError {
    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("{call} failed: {source}")]
    Syscall {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Poll failed: {0}")]
    Poll(#[from] nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, XskError>;

fn last_error(call: &'static str) -> XskError {
    XskError::Syscall {
        call,
        source: io::Error::last_os_error(),
    }
}

#[repr(C)]
struct XdpUmemReg {
    addr: u64,
    len: u64,
    chunk_size: u32,
    headroom: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct XdpRingOffset {
    producer: u64,
    consumer: u64,
    desc: u64,
    flags: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct XdpMmapOffsets {
    rx: XdpRingOffset,
    tx: XdpRingOffset,
    fr: XdpRingOffset,
    cr: XdpRingOffset,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct XdpDesc {
    addr: u64,
    len: u32,
    options: u32,
}

#[repr(C)]
struct SockaddrXdp {
    sxdp_family: u16,
    sxdp_flags: u16,
    sxdp_ifindex: u32,
    sxdp_queue_id: u32,
    sxdp_shared_umem_fd: u32,
}

/// An owned memory mapping.
struct Mapping {
    ptr: *mut u8,
    len: usize,
}

impl Mapping {
    fn anonymous(len: usize) -> Result<Self> {
        Self::map(len, -1, 0, libc::MAP_PRIVATE | libc::MAP_ANONYMOUS)
    }

    fn shared(fd: RawFd, len: usize, offset: libc::off_t) -> Result<Self> {
        Self::map(len, fd, offset, libc::MAP_SHARED)
    }

    fn map(len: usize, fd: RawFd, offset: libc::off_t, flags: libc::c_int) -> Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags | libc::MAP_POPULATE,
                fd,
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(last_error("mmap"));
        }
        Ok(Self {
            ptr: ptr as *mut u8,
            len,
        })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// A mmap'd producer/consumer ring shared with the kernel.
struct Ring {
    producer: *const AtomicU32,
    consumer: *const AtomicU32,
    desc: *mut u8,
    mask: u32,
    _map: Mapping,
}

impl Ring {
    fn new(map: Mapping, off: &XdpRingOffset) -> Self {
        unsafe {
            Self {
                producer: map.ptr.add(off.producer as usize) as *const AtomicU32,
                consumer: map.ptr.add(off.consumer as usize) as *const AtomicU32,
                desc: map.ptr.add(off.desc as usize),
                mask: RING_SIZE - 1,
                _map: map,
            }
        }
    }

    fn producer(&self) -> &AtomicU32 {
        unsafe { &*self.producer }
    }

    fn consumer(&self) -> &AtomicU32 {
        unsafe { &*self.consumer }
    }

    fn slot<T>(&self, idx: u32) -> *mut T {
        unsafe { (self.desc as *mut T).add((idx & self.mask) as usize) }
    }
}

/// AF_XDP socket bound to one queue of one interface.
pub struct XskSocket {
    rx: Ring,
    fill: Ring,
    umem: Mapping,
    fd: OwnedFd,
    queue: u32,
}

// The raw pointers reference mappings owned by the socket itself.
unsafe impl Send for XskSocket {}

impl XskSocket {
    /// Create a socket for `(ifindex, queue)` and pre-fill its fill ring.
    pub fn open(ifindex: u32, queue: u32) -> Result<Self> {
        let raw = unsafe { libc::socket(libc::AF_XDP, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
        if raw < 0 {
            return Err(last_error("socket(AF_XDP)"));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let umem = Mapping::anonymous(UMEM_SIZE)?;
        let reg = XdpUmemReg {
            addr: umem.ptr as u64,
            len: UMEM_SIZE as u64,
            chunk_size: FRAME_SIZE,
            headroom: 0,
            flags: 0,
        };
        set_opt(&fd, XDP_UMEM_REG, &reg, "setsockopt(XDP_UMEM_REG)")?;
        for opt in [XDP_UMEM_FILL_RING, XDP_UMEM_COMPLETION_RING, XDP_RX_RING] {
            set_opt(&fd, opt, &RING_SIZE, "setsockopt(ring size)")?;
        }

        let offsets = mmap_offsets(&fd)?;
        debug!(?offsets, queue, "XDP mmap offsets");

        let fill_len = offsets.fr.desc as usize + RING_SIZE as usize * size_of::<u64>();
        let fill = Ring::new(
            Mapping::shared(fd.as_raw_fd(), fill_len, XDP_UMEM_PGOFF_FILL_RING)?,
            &offsets.fr,
        );
        let rx_len = offsets.rx.desc as usize + RING_SIZE as usize * size_of::<XdpDesc>();
        let rx = Ring::new(
            Mapping::shared(fd.as_raw_fd(), rx_len, XDP_PGOFF_RX_RING)?,
            &offsets.rx,
        );

        bind(&fd, ifindex, queue)?;

        let socket = Self {
            rx,
            fill,
            umem,
            fd,
            queue,
        };
        socket.prefill();
        info!(ifindex, queue, fd = socket.fd.as_raw_fd(), "AF_XDP socket bound");
        Ok(socket)
    }

    /// Hand the first `RING_SIZE` UMEM frames to the kernel.
    fn prefill(&self) {
        for i in 0..RING_SIZE {
            unsafe { *self.fill.slot::<u64>(i) = i as u64 * FRAME_SIZE as u64 };
        }
        self.fill.producer().store(RING_SIZE, Ordering::Release);
    }

    /// Collect up to `RX_BATCH` descriptors from the RX ring.
    fn poll_rx(&self, batch: &mut Vec<XdpDesc>) {
        batch.clear();
        let prod = self.rx.producer().load(Ordering::Acquire);
        let cons = self.rx.consumer().load(Ordering::Relaxed);
        let available = prod.wrapping_sub(cons).min(RX_BATCH);
        for i in 0..available {
            batch.push(unsafe { *self.rx.slot::<XdpDesc>(cons.wrapping_add(i)) });
        }
        self.rx
            .consumer()
            .store(cons.wrapping_add(available), Ordering::Release);
    }

    /// Return consumed frames to the fill ring.
    fn refill(&self, batch: &[XdpDesc]) {
        let prod = self.fill.producer().load(Ordering::Relaxed);
        let cons = self.fill.consumer().load(Ordering::Acquire);
        let free = RING_SIZE - prod.wrapping_sub(cons);
        if (batch.len() as u32) > free {
            warn!(queue = self.queue, need = batch.len(), free, "Fill ring full");
            return;
        }
        for (i, desc) in batch.iter().enumerate() {
            // Strip the in-frame offset; the fill ring takes frame base addresses.
            let base = desc.addr - desc.addr % FRAME_SIZE as u64;
            unsafe { *self.fill.slot::<u64>(prod.wrapping_add(i as u32)) = base };
        }
        self.fill
            .producer()
            .store(prod.wrapping_add(batch.len() as u32), Ordering::Release);
    }

    fn frame(&self, desc: &XdpDesc) -> &[u8] {
        let start = desc.addr as usize;
        let len = (desc.len as usize).min(self.umem.len.saturating_sub(start));
        unsafe { std::slice::from_raw_parts(self.umem.ptr.add(start), len) }
    }
}

impl KernelBypassSocket for XskSocket {
    fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn queue(&self) -> u32 {
        self.queue
    }

    fn run(&mut self, stop: &AtomicBool, on_frame: &mut dyn FnMut(&[u8])) -> Result<()> {
        let mut batch = Vec::with_capacity(RX_BATCH as usize);
        info!(queue = self.queue, "Entering AF_XDP receive loop");

        while !stop.load(Ordering::Acquire) {
            let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }

            self.poll_rx(&mut batch);
            for desc in &batch {
                on_frame(self.frame(desc));
            }
            self.refill(&batch);
        }

        info!(queue = self.queue, "AF_XDP receive loop exited");
        Ok(())
    }
}

fn set_opt<T>(fd: &OwnedFd, opt: libc::c_int, value: &T, call: &'static str) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            SOL_XDP,
            opt,
            value as *const T as *const libc::c_void,
            size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(last_error(call));
    }
    Ok(())
}

fn mmap_offsets(fd: &OwnedFd) -> Result<XdpMmapOffsets> {
    let mut offsets = XdpMmapOffsets::default();
    let mut len = size_of::<XdpMmapOffsets>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            SOL_XDP,
            XDP_MMAP_OFFSETS,
            &mut offsets as *mut XdpMmapOffsets as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(last_error("getsockopt(XDP_MMAP_OFFSETS)"));
    }
    Ok(offsets)
}

/// Bind in copy mode, falling back to letting the kernel choose.
fn bind(fd: &OwnedFd, ifindex: u32, queue: u32) -> Result<()> {
    let mut addr = SockaddrXdp {
        sxdp_family: libc::AF_XDP as u16,
        sxdp_flags: XDP_COPY,
        sxdp_ifindex: ifindex,
        sxdp_queue_id: queue,
        sxdp_shared_umem_fd: 0,
    };
    for flags in [XDP_COPY, 0] {
        addr.sxdp_flags = flags;
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const SockaddrXdp as *const libc::sockaddr,
                size_of::<SockaddrXdp>() as libc::socklen_t,
            )
        };
        if ret == 0 {
            return Ok(());
        }
    }
    Err(last_error("bind(AF_XDP)"))
}

/// Opens [`XskSocket`]s on a named interface.
pub struct XskOpener;

impl SocketOpener for XskOpener {
    fn open(&self, if_name: &str, queue: u32) -> Result<Box<dyn KernelBypassSocket>> {
        let ifindex = nix::net::if_::if_nametoindex(if_name)
            .map_err(|_| XskError::InterfaceNotFound(if_name.to_string()))?;
        Ok(Box::new(XskSocket::open(ifindex, queue)?))
    }
}
