//! Test utilities for shoal-xdp unit and integration tests.
//!
//! Provides recording fakes for the kernel seams (BPF maps, XDP program,
//! AF_XDP sockets, UDP transmit) so the control plane can be exercised
//! without privileges.

pub mod kernel;
pub mod sockets;

pub use kernel::{
    DatapathEvent, Journal, MirrorHandle, ProgramHandles, RecordingDatapath, RecordingLoader,
    RecordingMirror, RecordingTable, TableHandle,
};
pub use sockets::{CapturingTransmit, FAKE_FD_BASE, FakeSocket, ScriptedOpener};

use crate::addr::MacAddr;
use crate::mirror::StaticIdentity;
use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// Default timeout for waiting on receive threads in tests
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Host identity used by tests that install a mirror.
pub fn test_static_identity() -> StaticIdentity {
    StaticIdentity {
        public_host_ip: Ipv4Addr::new(192, 168, 1, 20),
        host_mac: MacAddr::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]),
        gateway_mac: MacAddr::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
        vpn_port: 41000,
    }
}

/// Build a frame of exactly `len` bytes.
///
/// Frames long enough to carry an Ethernet header get a broadcast IPv4 header
/// and a counting payload; shorter ones are filler bytes.
pub fn test_frame(len: usize) -> Vec<u8> {
    let header_len = EthernetFrame::<&[u8]>::header_len();
    if len < header_len {
        return vec![0xab; len];
    }

    let mut buf = vec![0u8; len];
    let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);
    frame.set_dst_addr(EthernetAddress::BROADCAST);
    frame.set_src_addr(EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x05]));
    frame.set_ethertype(EthernetProtocol::Ipv4);
    for (i, byte) in frame.payload_mut().iter_mut().enumerate() {
        *byte = i as u8;
    }
    buf
}

/// Poll `condition` until it holds or [`DEFAULT_TIMEOUT`] passes.
pub fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + DEFAULT_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_lengths() {
        assert_eq!(test_frame(10).len(), 10);
        let frame = test_frame(64);
        assert_eq!(frame.len(), 64);
        assert_eq!(&frame[..6], &[0xff; 6]);
        assert_eq!(&frame[12..14], &[0x08, 0x00]);
        assert_eq!(frame[14], 0);
        assert_eq!(frame[15], 1);
    }
}
