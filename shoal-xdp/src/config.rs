//! Command-line configuration.

use crate::addr::MacAddr;
use crate::ebpf_loader::{DEFAULT_PROGRAM_PATH, MAX_XSKS};
use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Virtual LAN switch over UDP tunnels, backed by XDP.
#[derive(Parser, Debug, Clone)]
#[command(name = "shoal-xdp")]
#[command(version)]
#[command(about = "Virtual LAN switch over UDP tunnels, backed by XDP")]
pub struct Args {
    /// Uplink interface to attach to
    pub interface: String,

    /// Compiled XDP object
    #[arg(long, default_value = DEFAULT_PROGRAM_PATH)]
    pub program: PathBuf,

    /// gRPC listen address
    #[arg(long, default_value = "[::1]:50060")]
    pub grpc_addr: SocketAddr,

    /// Structural log of endpoint and remote events
    #[arg(long, default_value = "/var/log/shoal/remotes.log")]
    pub log_file: PathBuf,

    /// Upper bound on AF_XDP sockets (one per queue)
    #[arg(long, default_value_t = MAX_XSKS)]
    pub max_queues: u32,

    /// STUN server used to log the public endpoint; empty disables
    #[arg(long, default_value = "stun.l.google.com:19302")]
    pub stun_server: String,

    /// Initial switch IP
    #[arg(long)]
    pub switch_ip: Option<Ipv4Addr>,

    /// Initial switch MAC
    #[arg(long)]
    pub switch_mac: Option<MacAddr>,

    /// Initial fake gateway IP
    #[arg(long)]
    pub fake_gateway: Option<Ipv4Addr>,
}

impl Args {
    /// Number of socket slots to try, within the dispatch table capacity.
    pub fn socket_slots(&self) -> u32 {
        self.max_queues.clamp(1, MAX_XSKS)
    }

    pub fn stun_server(&self) -> Option<&str> {
        let server = self.stun_server.trim();
        (!server.is_empty()).then_some(server)
    }
}
