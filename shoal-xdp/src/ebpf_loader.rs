//! XDP program loading and BPF map management.
//!
//! The kernel side is an opaque XDP object compiled out of tree. Userspace only
//! knows its program name and the layout of three maps:
//!
//! - `MIRROR`: single-slot array holding the [`MirrorBlock`] the program consults
//!   (and may update itself when it learns the switch from traffic).
//! - `XSKS_MAP`: queue index -> AF_XDP socket, used for `bpf_redirect_map`.
//! - `REMOTE_ADDRS`: local IPv4 -> [`RemoteAddr`], the tunnel targets.
//!
//! The control plane talks to these through the [`MirrorStore`], [`RemoteTable`]
//! and [`Datapath`] traits so that each map is owned by exactly one component.

use aya::maps::{Array, HashMap, Map, MapData, MapError, XskMap};
use aya::programs::xdp::XdpLinkId;
use aya::programs::{ProgramError, Xdp, XdpFlags};
use aya::{Bpf, BpfLoader};
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Name of the XDP entry point in the object file.
pub const XDP_PROGRAM: &str = "xdp_prog";

/// Shared mirror block map.
pub const MIRROR_MAP: &str = "MIRROR";

/// Dispatch table (queue index -> AF_XDP socket).
pub const XSKS_MAP: &str = "XSKS_MAP";

/// Tunnel target table (local IP -> remote rendezvous point).
pub const REMOTE_ADDRS_MAP: &str = "REMOTE_ADDRS";

/// Capacity of `XSKS_MAP`. Must match the eBPF definition.
pub const MAX_XSKS: u32 = 64;

/// Default install location of the XDP object.
pub const DEFAULT_PROGRAM_PATH: &str = "/usr/lib/shoal/xdp-kern";

const BPF_MAP_DELETE_ELEM: libc::c_long = 3;

/// Fields the XDP program consults on every frame.
/// Must match the eBPF struct exactly. Addresses are in network byte order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MirrorBlock {
    pub switch_mac: [u8; 6],
    pub host_mac: [u8; 6],
    pub gateway_mac: [u8; 6],
    pub(crate) _padding: [u8; 2],
    pub switch_ip: [u8; 4],
    pub fake_gateway_ip: [u8; 4],
    pub subnet_mask: [u8; 4],
    pub public_host_ip: [u8; 4],
    /// Local UDP port of the rendezvous endpoint, host byte order.
    pub vpn_port: u16,
    pub(crate) _padding2: [u8; 2],
}

unsafe impl aya::Pod for MirrorBlock {}

/// Tunnel target as stored in `REMOTE_ADDRS`.
/// Must match the eBPF struct exactly.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemoteAddr {
    /// Remote IPv4 address, network byte order
    pub ip: [u8; 4],
    /// Remote UDP port, host byte order
    pub port: u16,
    _padding: [u8; 2],
}

impl RemoteAddr {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            ip: ip.octets(),
            port,
            _padding: [0; 2],
        }
    }
}

unsafe impl aya::Pod for RemoteAddr {}

/// eBPF loader errors.
#[derive(Debug, Error)]
pub enum EbpfError {
    #[error("Failed to load eBPF object: {0}")]
    Load(#[from] aya::BpfError),

    #[error("eBPF program error: {0}")]
    Program(#[from] ProgramError),

    #[error("Failed to access map: {0}")]
    Map(#[from] MapError),

    #[error("Program not found: {0}")]
    ProgramNotFound(String),

    #[error("Map not found: {0}")]
    MapNotFound(String),

    #[error("Program is not attached")]
    NotAttached,

    #[error("Program already released")]
    Released,

    #[error("{call} failed: {io_error}")]
    Syscall {
        call: &'static str,
        #[source]
        io_error: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, EbpfError>;

/// Kernel-resident copy of the [`MirrorBlock`].
pub trait MirrorStore: Send {
    /// Read the block as the XDP program currently sees it.
    fn load(&self) -> Result<MirrorBlock>;

    /// Overwrite the kernel copy.
    fn store(&mut self, block: &MirrorBlock) -> Result<()>;
}

/// Kernel-resident tunnel target table.
pub trait RemoteTable: Send {
    fn insert(&mut self, local_ip: Ipv4Addr, remote: RemoteAddr) -> Result<()>;

    /// Delete the entry for `local_ip`. A missing entry is not an error.
    fn remove(&mut self, local_ip: Ipv4Addr) -> Result<()>;
}

/// The loaded program itself: interface attachment and the socket dispatch table.
pub trait Datapath: Send {
    fn attach(&mut self, if_name: &str) -> Result<()>;

    fn detach(&mut self) -> Result<()>;

    /// Point dispatch slot `queue` at the AF_XDP socket `fd`.
    fn register_socket(&mut self, queue: u32, fd: RawFd) -> Result<()>;

    /// Delete every dispatch slot.
    fn clear_dispatch(&mut self) -> Result<()>;

    /// Drop the program and the maps still owned by it.
    fn release(&mut self);
}

/// A freshly loaded program, split by owner.
pub struct LoadedProgram {
    pub datapath: Box<dyn Datapath>,
    pub mirror: Box<dyn MirrorStore>,
    pub remotes: Box<dyn RemoteTable>,
}

/// Something that can produce a [`LoadedProgram`].
pub trait ProgramLoader {
    fn load(&self) -> Result<LoadedProgram>;
}

/// Loads the XDP object from disk with aya.
pub struct EbpfLoader {
    path: PathBuf,
}

impl EbpfLoader {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ProgramLoader for EbpfLoader {
    fn load(&self) -> Result<LoadedProgram> {
        let mut bpf = BpfLoader::new().load_file(&self.path)?;

        if let Err(e) = aya_log::BpfLogger::init(&mut bpf) {
            debug!(error = %e, "eBPF logger not initialized (program has no log statements)");
        }

        let prog: &mut Xdp = bpf
            .program_mut(XDP_PROGRAM)
            .ok_or_else(|| EbpfError::ProgramNotFound(XDP_PROGRAM.to_string()))?
            .try_into()?;
        prog.load()?;

        let mirror: Array<MapData, MirrorBlock> = bpf
            .take_map(MIRROR_MAP)
            .ok_or_else(|| EbpfError::MapNotFound(MIRROR_MAP.to_string()))?
            .try_into()?;

        let remotes: HashMap<MapData, [u8; 4], RemoteAddr> = bpf
            .take_map(REMOTE_ADDRS_MAP)
            .ok_or_else(|| EbpfError::MapNotFound(REMOTE_ADDRS_MAP.to_string()))?
            .try_into()?;

        if bpf.map(XSKS_MAP).is_none() {
            return Err(EbpfError::MapNotFound(XSKS_MAP.to_string()));
        }

        info!(path = %self.path.display(), "XDP program loaded");

        Ok(LoadedProgram {
            datapath: Box::new(EbpfDatapath {
                bpf: Some(bpf),
                link: None,
            }),
            mirror: Box::new(MirrorMap(mirror)),
            remotes: Box::new(RemoteAddrMap(remotes)),
        })
    }
}

/// `MIRROR` array map.
pub struct MirrorMap(Array<MapData, MirrorBlock>);

impl MirrorStore for MirrorMap {
    fn load(&self) -> Result<MirrorBlock> {
        Ok(self.0.get(&0, 0)?)
    }

    fn store(&mut self, block: &MirrorBlock) -> Result<()> {
        self.0.set(0, *block, 0)?;
        Ok(())
    }
}

/// `REMOTE_ADDRS` hash map.
pub struct RemoteAddrMap(HashMap<MapData, [u8; 4], RemoteAddr>);

impl RemoteTable for RemoteAddrMap {
    fn insert(&mut self, local_ip: Ipv4Addr, remote: RemoteAddr) -> Result<()> {
        self.0.insert(local_ip.octets(), remote, 0)?;
        Ok(())
    }

    fn remove(&mut self, local_ip: Ipv4Addr) -> Result<()> {
        match self.0.remove(&local_ip.octets()) {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// The XDP program plus the dispatch map, which stays inside the `Bpf` object.
pub struct EbpfDatapath {
    bpf: Option<Bpf>,
    link: Option<XdpLinkId>,
}

impl EbpfDatapath {
    fn bpf_mut(&mut self) -> Result<&mut Bpf> {
        self.bpf.as_mut().ok_or(EbpfError::Released)
    }

    fn program_mut(&mut self) -> Result<&mut Xdp> {
        let prog: &mut Xdp = self
            .bpf_mut()?
            .program_mut(XDP_PROGRAM)
            .ok_or_else(|| EbpfError::ProgramNotFound(XDP_PROGRAM.to_string()))?
            .try_into()?;
        Ok(prog)
    }
}

impl Datapath for EbpfDatapath {
    fn attach(&mut self, if_name: &str) -> Result<()> {
        let link = self.program_mut()?.attach(if_name, XdpFlags::default())?;
        self.link = Some(link);
        info!(if_name, "XDP program attached");
        Ok(())
    }

    fn detach(&mut self) -> Result<()> {
        let link = self.link.take().ok_or(EbpfError::NotAttached)?;
        self.program_mut()?.detach(link)?;
        info!("XDP program detached");
        Ok(())
    }

    fn register_socket(&mut self, queue: u32, fd: RawFd) -> Result<()> {
        let mut xsks: XskMap<&mut MapData> = self
            .bpf_mut()?
            .map_mut(XSKS_MAP)
            .ok_or_else(|| EbpfError::MapNotFound(XSKS_MAP.to_string()))?
            .try_into()?;
        xsks.set(queue, fd, 0)?;
        Ok(())
    }

    fn clear_dispatch(&mut self) -> Result<()> {
        let data = match self.bpf_mut()?.map(XSKS_MAP) {
            Some(Map::XskMap(data)) => data,
            _ => return Err(EbpfError::MapNotFound(XSKS_MAP.to_string())),
        };
        let fd = data.fd().as_fd().as_raw_fd();
        for queue in 0..MAX_XSKS {
            // Slots that were never populated report ENOENT.
            if let Err(e) = map_delete_elem(fd, &queue)
                && e.raw_os_error() != Some(libc::ENOENT)
            {
                return Err(EbpfError::Syscall {
                    call: "bpf_map_delete_elem",
                    io_error: e,
                });
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.bpf.take().is_some() {
            info!("XDP program released");
        }
    }
}

/// Whether a map error means "no such key".
fn is_not_found(err: &MapError) -> bool {
    if matches!(err, MapError::KeyNotFound) {
        return true;
    }
    let mut source = std::error::Error::source(err);
    while let Some(e) = source {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return io_err.raw_os_error() == Some(libc::ENOENT);
        }
        source = e.source();
    }
    false
}

/// `bpf_attr` layout for the map element commands.
#[repr(C)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

/// BPF_MAP_DELETE_ELEM on a raw map fd.
///
/// aya's `XskMap` has no delete, so the dispatch table is cleared here.
fn map_delete_elem(map_fd: RawFd, key: &u32) -> io::Result<()> {
    let attr = MapElemAttr {
        map_fd: map_fd as u32,
        _pad: 0,
        key: key as *const u32 as u64,
        value: 0,
        flags: 0,
    };
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            BPF_MAP_DELETE_ELEM,
            &attr as *const MapElemAttr,
            std::mem::size_of::<MapElemAttr>() as u32,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
