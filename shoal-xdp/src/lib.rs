//! shoal-xdp: virtual LAN switch over UDP tunnels, backed by XDP.
//!
//! An XDP program on the uplink handles tunneled traffic in the kernel. This
//! crate is its control plane: it owns the switch identity, the table of
//! remote rendezvous endpoints and the AF_XDP sockets that hand frames the
//! kernel cannot forward (broadcasts) to userspace.
//!
//! # Architecture
//!
//! ```text
//! uplink --> XDP program (Kernel) --+--> redirect/encapsulate via REMOTE_ADDRS
//!               |      ^            |
//!               |      | MIRROR     +--> XSKS_MAP --> AF_XDP socket (per queue)
//!               |      |                                  |
//!               |   SwitchTracker <-- reconcile ----------+
//!               |                                         |
//!               +-- RemoteRegistry <-- broadcast ---------+
//!                        |
//!                        +--> UDP endpoint --> remotes
//! ```

pub mod addr;
pub mod audit;
pub mod config;
pub mod ebpf_loader;
pub mod endpoint;
pub mod fatal;
pub mod grpc;
pub mod ifinfo;
pub mod mirror;
pub mod pool;
pub mod remote;
pub mod stun;
pub mod switch;
pub mod xsk;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

// Re-export commonly used types
pub use addr::MacAddr;
pub use audit::{AuditLogger, create_audit_logger};
pub use ebpf_loader::{EbpfError, EbpfLoader, MirrorBlock, RemoteAddr};
pub use endpoint::Endpoint;
pub use fatal::{FatalSignal, fatal};
pub use grpc::ShoalServiceImpl;
pub use mirror::{ForwardingMirror, StaticIdentity};
pub use pool::{PoolStage, ReceivePath, SocketPool};
pub use remote::{RegistryChange, RemoteEndpoint, RemoteRegistry};
pub use switch::{ForwardingPolicy, SwitchIdentity, SwitchTracker};
pub use xsk::XskOpener;
