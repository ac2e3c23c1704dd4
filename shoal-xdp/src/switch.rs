//! Switch identity tracking.
//!
//! One mutex guards the identity, the forwarding mirror it pushes into and the
//! observer list, so explicit commands and per-frame reconciliation are totally
//! ordered and observers for one change finish before the next change starts.
//!
//! The identity is also published through an [`ArcSwap`] so readers (the remote
//! registry, the command surface, observers themselves) never take the lock.

use crate::addr::MacAddr;
use crate::ebpf_loader::{MirrorStore, Result};
use crate::mirror::{ForwardingMirror, StaticIdentity};
use arc_swap::ArcSwap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use tracing::info;

/// The emulated switch every tunneled peer addresses relative to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwitchIdentity {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
}

impl Default for SwitchIdentity {
    fn default() -> Self {
        Self {
            mac: MacAddr::ZERO,
            ip: Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl fmt::Display for SwitchIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.mac, self.ip)
    }
}

/// Gateway policy currently pushed to the XDP program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForwardingPolicy {
    pub fake_gateway_ip: Option<Ipv4Addr>,
    pub subnet_mask: Ipv4Addr,
    pub vpn_port: u16,
}

/// Callback run on every switch identity change.
pub type ChangeObserver = Box<dyn Fn() + Send + Sync>;

struct IdentityState {
    identity: SwitchIdentity,
    mirror: ForwardingMirror,
    observers: Vec<ChangeObserver>,
}

/// Authoritative holder of the switch identity.
pub struct SwitchTracker {
    state: Mutex<IdentityState>,
    published: ArcSwap<SwitchIdentity>,
}

impl SwitchTracker {
    /// Create a tracker with the all-zero identity.
    pub fn new(mirror: ForwardingMirror) -> Self {
        Self::with_identity(mirror, SwitchIdentity::default())
    }

    /// Create a tracker starting from a configured identity.
    pub fn with_identity(mut mirror: ForwardingMirror, identity: SwitchIdentity) -> Self {
        // Not installed yet, so this only touches the local block.
        mirror.adopt_switch(identity.mac, identity.ip);
        Self {
            state: Mutex::new(IdentityState {
                identity,
                mirror,
                observers: Vec::new(),
            }),
            published: ArcSwap::from_pointee(identity),
        }
    }

    /// Lock-free snapshot of the current identity.
    pub fn current(&self) -> SwitchIdentity {
        **self.published.load()
    }

    pub fn switch_ip(&self) -> Ipv4Addr {
        self.published.load().ip
    }

    /// Register a change observer. Observers are never removed.
    ///
    /// Observers run with the identity lock held, in registration order. They
    /// must be short and must not call the mutating methods of this tracker;
    /// [`SwitchTracker::current`] is safe to call.
    pub fn register_change_observer(&self, observer: impl Fn() + Send + Sync + 'static) {
        let mut state = self.state.lock().unwrap();
        state.observers.push(Box::new(observer));
    }

    /// Set the switch IP. Returns whether the identity changed.
    pub fn set_switch_ip(&self, ip: Ipv4Addr) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.identity.ip == ip {
            return Ok(false);
        }
        let identity = SwitchIdentity {
            ip,
            ..state.identity
        };
        self.commit(&mut state, identity)?;
        info!(switch = %identity, "Switch IP set");
        Ok(true)
    }

    /// Set the switch MAC. Returns whether the identity changed.
    pub fn set_switch_mac(&self, mac: MacAddr) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.identity.mac == mac {
            return Ok(false);
        }
        let identity = SwitchIdentity {
            mac,
            ..state.identity
        };
        self.commit(&mut state, identity)?;
        info!(switch = %identity, "Switch MAC set");
        Ok(true)
    }

    /// Adopt the switch fields the XDP program holds if they differ from ours.
    ///
    /// Called once per received frame. The kernel value wins; nothing is pushed.
    pub fn reconcile_from_kernel(&self) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some((mac, ip)) = state.mirror.observe_switch()? else {
            return Ok(false);
        };
        if state.identity.mac == mac && state.identity.ip == ip {
            return Ok(false);
        }

        let identity = SwitchIdentity { mac, ip };
        state.mirror.adopt_switch(mac, ip);
        state.identity = identity;
        self.published.store(Arc::new(identity));
        Self::notify(&state);

        info!(switch = %identity, "Switch identity learned from XDP program");
        Ok(true)
    }

    /// Set or clear the fake gateway. Returns whether the policy changed.
    pub fn set_fake_gateway_ip(&self, ip: Option<Ipv4Addr>) -> Result<bool> {
        let ip = ip.filter(|ip| !ip.is_unspecified());
        let mut state = self.state.lock().unwrap();
        if state.mirror.fake_gateway() == ip {
            return Ok(false);
        }
        state.mirror.set_fake_gateway(ip)?;
        info!(
            fake_gateway = ?ip,
            subnet_mask = %state.mirror.subnet_mask(),
            "Fake gateway set"
        );
        Ok(true)
    }

    /// Push the host identity and attach the kernel copy of the mirror.
    ///
    /// The whole local block, including the switch and gateway policy, reaches
    /// the kernel in one store.
    pub fn install_mirror(
        &self,
        store: Box<dyn MirrorStore>,
        host: StaticIdentity,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mirror.set_static_identity(host)?;
        state.mirror.install(store)
    }

    pub fn policy(&self) -> ForwardingPolicy {
        let state = self.state.lock().unwrap();
        ForwardingPolicy {
            fake_gateway_ip: state.mirror.fake_gateway(),
            subnet_mask: state.mirror.subnet_mask(),
            vpn_port: state.mirror.vpn_port(),
        }
    }

    fn commit(&self, state: &mut IdentityState, identity: SwitchIdentity) -> Result<()> {
        state.identity = identity;
        state.mirror.set_switch(identity.mac, identity.ip)?;
        self.published.store(Arc::new(identity));
        Self::notify(state);
        Ok(())
    }

    fn notify(state: &IdentityState) {
        for observer in &state.observers {
            observer();
        }
    }
}
