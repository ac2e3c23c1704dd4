//! Forwarding-plane mirror.
//!
//! Userspace copy of the [`MirrorBlock`] plus the push into the kernel copy.
//! The kernel value is a single array slot written as a whole, and the XDP
//! program may rewrite the switch fields on its own, so every push reads the
//! kernel block, overlays only the fields being changed and writes it back.
//!
//! Before the program is loaded there is no kernel copy; [`ForwardingMirror::install`]
//! pushes the complete local block once it exists.

use crate::addr::MacAddr;
use crate::ebpf_loader::{MirrorBlock, MirrorStore, Result};
use std::net::Ipv4Addr;

/// Mask used while a fake gateway is configured.
pub const FAKE_GATEWAY_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Host identity pushed once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StaticIdentity {
    pub public_host_ip: Ipv4Addr,
    pub host_mac: MacAddr,
    pub gateway_mac: MacAddr,
    pub vpn_port: u16,
}

/// Subnet mask the XDP program should use.
pub fn derive_subnet_mask(fake_gateway: Option<Ipv4Addr>, real_mask: Ipv4Addr) -> Ipv4Addr {
    match fake_gateway {
        Some(gw) if !gw.is_unspecified() => FAKE_GATEWAY_MASK,
        _ => real_mask,
    }
}

/// Local mirror of the kernel block.
pub struct ForwardingMirror {
    block: MirrorBlock,
    real_subnet_mask: Ipv4Addr,
    store: Option<Box<dyn MirrorStore>>,
}

impl ForwardingMirror {
    /// Create a local-only mirror for an interface with the given subnet mask.
    pub fn new(real_subnet_mask: Ipv4Addr) -> Self {
        let block = MirrorBlock {
            subnet_mask: real_subnet_mask.octets(),
            ..Default::default()
        };
        Self {
            block,
            real_subnet_mask,
            store: None,
        }
    }

    /// Attach the kernel copy and push every field to it.
    pub fn install(&mut self, store: Box<dyn MirrorStore>) -> Result<()> {
        let store = self.store.insert(store);
        store.store(&self.block)
    }

    pub fn is_installed(&self) -> bool {
        self.store.is_some()
    }

    pub fn block(&self) -> &MirrorBlock {
        &self.block
    }

    pub fn set_switch(&mut self, mac: MacAddr, ip: Ipv4Addr) -> Result<()> {
        self.block.switch_mac = mac.octets();
        self.block.switch_ip = ip.octets();
        self.push(|local, kernel| {
            kernel.switch_mac = local.switch_mac;
            kernel.switch_ip = local.switch_ip;
        })
    }

    /// Set or clear the fake gateway; `0.0.0.0` clears. Recomputes the subnet mask.
    pub fn set_fake_gateway(&mut self, ip: Option<Ipv4Addr>) -> Result<()> {
        let ip = ip.filter(|ip| !ip.is_unspecified());
        self.block.fake_gateway_ip = ip.unwrap_or(Ipv4Addr::UNSPECIFIED).octets();
        self.block.subnet_mask = derive_subnet_mask(ip, self.real_subnet_mask).octets();
        self.push(|local, kernel| {
            kernel.fake_gateway_ip = local.fake_gateway_ip;
            kernel.subnet_mask = local.subnet_mask;
        })
    }

    pub fn set_static_identity(&mut self, identity: StaticIdentity) -> Result<()> {
        self.block.public_host_ip = identity.public_host_ip.octets();
        self.block.host_mac = identity.host_mac.octets();
        self.block.gateway_mac = identity.gateway_mac.octets();
        self.block.vpn_port = identity.vpn_port;
        self.push(|local, kernel| {
            kernel.public_host_ip = local.public_host_ip;
            kernel.host_mac = local.host_mac;
            kernel.gateway_mac = local.gateway_mac;
            kernel.vpn_port = local.vpn_port;
        })
    }

    /// Switch fields as the kernel currently holds them, if installed.
    pub fn observe_switch(&self) -> Result<Option<(MacAddr, Ipv4Addr)>> {
        match &self.store {
            Some(store) => {
                let kernel = store.load()?;
                Ok(Some((
                    MacAddr::new(kernel.switch_mac),
                    Ipv4Addr::from(kernel.switch_ip),
                )))
            }
            None => Ok(None),
        }
    }

    /// Adopt switch fields observed in the kernel without pushing them back.
    pub fn adopt_switch(&mut self, mac: MacAddr, ip: Ipv4Addr) {
        self.block.switch_mac = mac.octets();
        self.block.switch_ip = ip.octets();
    }

    pub fn fake_gateway(&self) -> Option<Ipv4Addr> {
        let ip = Ipv4Addr::from(self.block.fake_gateway_ip);
        (!ip.is_unspecified()).then_some(ip)
    }

    pub fn subnet_mask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.block.subnet_mask)
    }

    pub fn vpn_port(&self) -> u16 {
        self.block.vpn_port
    }

    fn push(&mut self, apply: impl FnOnce(&MirrorBlock, &mut MirrorBlock)) -> Result<()> {
        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };
        let mut kernel = store.load()?;
        apply(&self.block, &mut kernel);
        store.store(&kernel)
    }
}
