//! Uplink interface discovery.
//!
//! Addresses come from `getifaddrs`; the default gateway and its MAC come from
//! the kernel routing and neighbour tables over rtnetlink.

use crate::addr::MacAddr;
use crate::mirror::StaticIdentity;
use futures::TryStreamExt;
use ipnet::Ipv4Net;
use netlink_packet_route::neighbour::{NeighbourAddress, NeighbourAttribute};
use netlink_packet_route::route::{RouteAddress, RouteAttribute};
use rtnetlink::{Handle, IpVersion};
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Neighbour table lookups before giving up on the gateway MAC.
const NEIGHBOUR_ATTEMPTS: u32 = 5;
const NEIGHBOUR_RETRY: Duration = Duration::from_millis(200);

/// Interface discovery errors.
#[derive(Debug, Error)]
pub enum IfInfoError {
    #[error("Interface not found: {0}")]
    NotFound(String),

    #[error("Interface {0} has no IPv4 address")]
    NoIpv4(String),

    #[error("Interface {0} has no MAC address")]
    NoMac(String),

    #[error("No IPv4 default route via {0}")]
    NoGateway(String),

    #[error("Gateway {0} did not show up in the neighbour table")]
    GatewayMac(Ipv4Addr),

    #[error("Netlink error: {0}")]
    Netlink(String),

    #[error("getifaddrs failed: {0}")]
    Sys(#[from] nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, IfInfoError>;

/// Facts about the uplink the XDP program is attached to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub index: u32,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
    pub gateway_mac: MacAddr,
}

impl InterfaceInfo {
    /// The directly attached IPv4 network.
    pub fn network(&self) -> Ipv4Net {
        Ipv4Net::with_netmask(self.ip, self.subnet_mask)
            .map(|net| net.trunc())
            .unwrap_or_else(|_| Ipv4Net::from(self.ip))
    }

    /// Host fields of the forwarding mirror.
    pub fn static_identity(&self, vpn_port: u16) -> StaticIdentity {
        StaticIdentity {
            public_host_ip: self.ip,
            host_mac: self.mac,
            gateway_mac: self.gateway_mac,
            vpn_port,
        }
    }
}

/// Addresses of one interface as reported by `getifaddrs`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterfaceAddrs {
    pub mac: Option<MacAddr>,
    pub ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
}

/// First IPv4 address, its mask and the link-layer address of `if_name`.
pub fn interface_addrs(if_name: &str) -> Result<InterfaceAddrs> {
    let mut found = false;
    let mut mac = None;
    let mut ipv4 = None;

    for ifaddr in nix::ifaddrs::getifaddrs()? {
        if ifaddr.interface_name != if_name {
            continue;
        }
        found = true;
        let Some(address) = ifaddr.address else {
            continue;
        };

        if let Some(link) = address.as_link_addr() {
            mac = mac.or(link.addr().map(MacAddr::new));
        } else if let Some(sin) = address.as_sockaddr_in()
            && ipv4.is_none()
        {
            let ip = *SocketAddrV4::from(*sin).ip();
            let mask = ifaddr
                .netmask
                .as_ref()
                .and_then(|m| m.as_sockaddr_in())
                .map(|m| *SocketAddrV4::from(*m).ip())
                .unwrap_or(Ipv4Addr::BROADCAST);
            ipv4 = Some((ip, mask));
        }
    }

    if !found {
        return Err(IfInfoError::NotFound(if_name.to_string()));
    }
    let (ip, subnet_mask) = ipv4.ok_or_else(|| IfInfoError::NoIpv4(if_name.to_string()))?;
    Ok(InterfaceAddrs {
        mac,
        ip,
        subnet_mask,
    })
}

/// Gateway of the IPv4 default route leaving through `index`.
pub async fn default_gateway(handle: &Handle, index: u32) -> Result<Option<Ipv4Addr>> {
    let mut routes = handle.route().get(IpVersion::V4).execute();
    while let Some(route) = routes
        .try_next()
        .await
        .map_err(|e| IfInfoError::Netlink(e.to_string()))?
    {
        if route.header.destination_prefix_length != 0 {
            continue;
        }
        let mut oif = None;
        let mut gateway = None;
        for attr in &route.attributes {
            match attr {
                RouteAttribute::Oif(i) => oif = Some(*i),
                RouteAttribute::Gateway(RouteAddress::Inet(ip)) => gateway = Some(*ip),
                _ => {}
            }
        }
        if oif == Some(index) && gateway.is_some() {
            return Ok(gateway);
        }
    }
    Ok(None)
}

/// Link-layer address the neighbour table holds for `ip` on `index`.
pub async fn neighbour_mac(handle: &Handle, index: u32, ip: Ipv4Addr) -> Result<Option<MacAddr>> {
    let mut neighbours = handle.neighbours().get().execute();
    while let Some(neigh) = neighbours
        .try_next()
        .await
        .map_err(|e| IfInfoError::Netlink(e.to_string()))?
    {
        if neigh.header.ifindex != index {
            continue;
        }
        let mut dst = None;
        let mut lladdr = None;
        for attr in &neigh.attributes {
            match attr {
                NeighbourAttribute::Destination(NeighbourAddress::Inet(addr)) => dst = Some(*addr),
                NeighbourAttribute::LinkLocalAddress(bytes) => {
                    lladdr = <[u8; 6]>::try_from(bytes.as_slice()).ok().map(MacAddr::new);
                }
                _ => {}
            }
        }
        if dst == Some(ip)
            && let Some(mac) = lladdr.filter(|mac| !mac.is_zero())
        {
            return Ok(Some(mac));
        }
    }
    Ok(None)
}

/// Send one datagram to the gateway so the kernel resolves its MAC.
fn prime_neighbour(local_ip: Ipv4Addr, gateway: Ipv4Addr) {
    let sent = UdpSocket::bind(SocketAddrV4::new(local_ip, 0))
        .and_then(|socket| socket.send_to(&[0], SocketAddrV4::new(gateway, 9)));
    if let Err(e) = sent {
        debug!(%gateway, error = %e, "Failed to prime neighbour entry");
    }
}

/// Discover everything the control plane needs to know about `if_name`.
pub async fn discover(if_name: &str) -> Result<InterfaceInfo> {
    let index = nix::net::if_::if_nametoindex(if_name)
        .map_err(|_| IfInfoError::NotFound(if_name.to_string()))?;
    let addrs = interface_addrs(if_name)?;
    let mac = addrs
        .mac
        .filter(|mac| !mac.is_zero())
        .ok_or_else(|| IfInfoError::NoMac(if_name.to_string()))?;

    let (connection, handle, _) =
        rtnetlink::new_connection().map_err(|e| IfInfoError::Netlink(e.to_string()))?;
    tokio::spawn(connection);

    let gateway_ip = default_gateway(&handle, index)
        .await?
        .ok_or_else(|| IfInfoError::NoGateway(if_name.to_string()))?;

    let mut gateway_mac = None;
    for attempt in 0..NEIGHBOUR_ATTEMPTS {
        gateway_mac = neighbour_mac(&handle, index, gateway_ip).await?;
        if gateway_mac.is_some() {
            break;
        }
        if attempt == 0 {
            prime_neighbour(addrs.ip, gateway_ip);
        }
        tokio::time::sleep(NEIGHBOUR_RETRY).await;
    }
    let gateway_mac = gateway_mac.ok_or(IfInfoError::GatewayMac(gateway_ip))?;

    let info = InterfaceInfo {
        name: if_name.to_string(),
        index,
        mac,
        ip: addrs.ip,
        subnet_mask: addrs.subnet_mask,
        gateway_ip,
        gateway_mac,
    };
    info!(
        if_name,
        index,
        mac = %info.mac,
        network = %info.network(),
        gateway = %info.gateway_ip,
        gateway_mac = %info.gateway_mac,
        "Interface discovered"
    );
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> InterfaceInfo {
        InterfaceInfo {
            name: "eth0".to_string(),
            index: 2,
            mac: MacAddr::new([2, 0, 0, 0, 0, 2]),
            ip: Ipv4Addr::new(192, 168, 1, 20),
            subnet_mask: Ipv4Addr::new(255, 255, 252, 0),
            gateway_ip: Ipv4Addr::new(192, 168, 1, 1),
            gateway_mac: MacAddr::new([2, 0, 0, 0, 0, 1]),
        }
    }

    #[test]
    fn test_network_from_mask() {
        assert_eq!(info().network(), "192.168.0.0/22".parse::<Ipv4Net>().unwrap());
    }

    #[test]
    fn test_static_identity() {
        let host = info().static_identity(41000);
        assert_eq!(host.public_host_ip, Ipv4Addr::new(192, 168, 1, 20));
        assert_eq!(host.gateway_mac, MacAddr::new([2, 0, 0, 0, 0, 1]));
        assert_eq!(host.vpn_port, 41000);
    }

    #[test]
    fn test_loopback_addrs() {
        let addrs = interface_addrs("lo").unwrap();
        assert_eq!(addrs.ip, Ipv4Addr::LOCALHOST);
        assert_eq!(addrs.subnet_mask, Ipv4Addr::new(255, 0, 0, 0));
    }

    #[test]
    fn test_unknown_interface() {
        assert!(matches!(
            interface_addrs("shoal-missing0"),
            Err(IfInfoError::NotFound(_))
        ));
    }
}
