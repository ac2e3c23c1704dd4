//! Rendezvous endpoint.
//!
//! The UDP socket every tunnel uses. It is bound to the uplink interface on
//! an ephemeral port; that port is the `vpn_port` the XDP program matches
//! tunneled traffic against. Broadcast frames to remotes leave through it,
//! and a STUN binding request over the same socket reveals the public
//! address a NAT maps it to.

use crate::remote::Transmit;
use crate::stun::{self, TransactionId};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Binding requests sent before giving up.
pub const STUN_ATTEMPTS: u32 = 3;

/// Read timeout per attempt.
pub const STUN_TIMEOUT: Duration = Duration::from_secs(1);

/// Endpoint socket errors.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Endpoint socket error: {0}")]
    Io(#[from] io::Error),

    #[error("STUN server {0} has no IPv4 address")]
    Resolve(String),

    #[error("No STUN response from {server} after {attempts} attempts")]
    NoResponse { server: String, attempts: u32 },
}

pub type Result<T> = std::result::Result<T, EndpointError>;

/// The bound rendezvous socket.
pub struct Endpoint {
    socket: UdpSocket,
    port: u16,
}

impl Endpoint {
    /// Bind to `if_name` on `local_ip` with a kernel-chosen port.
    pub fn bind(if_name: &str, local_ip: Ipv4Addr) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.bind_device(Some(if_name.as_bytes()))?;
        socket.bind(&SocketAddrV4::new(local_ip, 0).into())?;
        let endpoint = Self::from_socket(socket.into())?;
        info!(if_name, %local_ip, port = endpoint.port, "Endpoint socket bound");
        Ok(endpoint)
    }

    /// Wrap an already bound socket.
    pub fn from_socket(socket: UdpSocket) -> Result<Self> {
        let port = socket.local_addr()?.port();
        Ok(Self { socket, port })
    }

    /// Local UDP port (`vpn_port`).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Ask `server` for our public address.
    ///
    /// Runs before the packet path starts, while nothing else reads from the
    /// socket. Datagrams that are not the matching response are skipped.
    pub fn discover_public_addr(&self, server: &str) -> Result<SocketAddrV4> {
        let target = server
            .to_socket_addrs()?
            .find_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(v4),
                SocketAddr::V6(_) => None,
            })
            .ok_or_else(|| EndpointError::Resolve(server.to_string()))?;

        let previous_timeout = self.socket.read_timeout()?;
        self.socket.set_read_timeout(Some(STUN_TIMEOUT))?;
        let result = self.stun_exchange(target);
        self.socket.set_read_timeout(previous_timeout)?;

        result.ok_or_else(|| EndpointError::NoResponse {
            server: server.to_string(),
            attempts: STUN_ATTEMPTS,
        })
    }

    fn stun_exchange(&self, target: SocketAddrV4) -> Option<SocketAddrV4> {
        let mut buf = [0u8; 512];
        for attempt in 1..=STUN_ATTEMPTS {
            let txid: TransactionId = rand::random();
            if let Err(e) = self.socket.send_to(&stun::binding_request(&txid), target) {
                warn!(%target, attempt, error = %e, "STUN request failed");
                continue;
            }

            loop {
                let (len, from) = match self.socket.recv_from(&mut buf) {
                    Ok(received) => received,
                    Err(e) => {
                        debug!(%target, attempt, error = %e, "No STUN response");
                        break;
                    }
                };
                if from != SocketAddr::V4(target) {
                    continue;
                }
                match stun::parse_binding_response(&buf[..len], &txid) {
                    Ok(mapped) => return Some(mapped),
                    Err(e) => debug!(%from, error = %e, "Ignoring datagram"),
                }
            }
        }
        None
    }
}

impl Transmit for Endpoint {
    fn send_to(&self, frame: &[u8], target: SocketAddrV4) -> io::Result<usize> {
        self.socket.send_to(frame, target)
    }
}
