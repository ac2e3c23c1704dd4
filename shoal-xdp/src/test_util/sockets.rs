//! Fake AF_XDP sockets and a capturing UDP transmitter.

use super::kernel::{DatapathEvent, Journal};
use crate::pool::{KernelBypassSocket, SocketOpener};
use crate::remote::Transmit;
use crate::xsk::XskError;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddrV4;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Descriptor numbers handed out by fake sockets start here.
pub const FAKE_FD_BASE: RawFd = 100;

/// Socket that replays queued frames, then idles until stopped.
pub struct FakeSocket {
    queue: u32,
    frames: VecDeque<Vec<u8>>,
    journal: Journal,
}

impl KernelBypassSocket for FakeSocket {
    fn raw_fd(&self) -> RawFd {
        FAKE_FD_BASE + self.queue as RawFd
    }

    fn queue(&self) -> u32 {
        self.queue
    }

    fn run(
        &mut self,
        stop: &AtomicBool,
        on_frame: &mut dyn FnMut(&[u8]),
    ) -> Result<(), XskError> {
        while !stop.load(Ordering::Acquire) {
            match self.frames.pop_front() {
                Some(frame) => on_frame(&frame),
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        }
        Ok(())
    }
}

impl Drop for FakeSocket {
    fn drop(&mut self) {
        self.journal.record(DatapathEvent::Close(self.queue));
    }
}

/// Opener where queues `0..usable` succeed and every other queue fails.
pub struct ScriptedOpener {
    journal: Journal,
    usable: u32,
    frames: Mutex<HashMap<u32, VecDeque<Vec<u8>>>>,
}

impl ScriptedOpener {
    pub fn new(journal: Journal, usable: u32) -> Self {
        Self {
            journal,
            usable,
            frames: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a frame for delivery by the socket opened on `queue`.
    pub fn queue_frame(&self, queue: u32, frame: Vec<u8>) {
        self.frames
            .lock()
            .unwrap()
            .entry(queue)
            .or_default()
            .push_back(frame);
    }
}

impl SocketOpener for ScriptedOpener {
    fn open(&self, _if_name: &str, queue: u32) -> Result<Box<dyn KernelBypassSocket>, XskError> {
        if queue >= self.usable {
            return Err(XskError::Syscall {
                call: "bind(AF_XDP)",
                source: io::Error::from_raw_os_error(libc::EINVAL),
            });
        }
        let frames = self
            .frames
            .lock()
            .unwrap()
            .remove(&queue)
            .unwrap_or_default();
        Ok(Box::new(FakeSocket {
            queue,
            frames,
            journal: self.journal.clone(),
        }))
    }
}

/// Transmitter that records every datagram instead of sending it.
#[derive(Default)]
pub struct CapturingTransmit {
    sent: Mutex<Vec<(SocketAddrV4, Vec<u8>)>>,
    unreachable: Mutex<HashSet<SocketAddrV4>>,
}

impl CapturingTransmit {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Datagrams sent so far, in send order.
    pub fn sent(&self) -> Vec<(SocketAddrV4, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    /// Make every send to `target` fail.
    pub fn fail_to(&self, target: SocketAddrV4) {
        self.unreachable.lock().unwrap().insert(target);
    }
}

impl Transmit for CapturingTransmit {
    fn send_to(&self, frame: &[u8], target: SocketAddrV4) -> io::Result<usize> {
        if self.unreachable.lock().unwrap().contains(&target) {
            return Err(io::Error::from(io::ErrorKind::HostUnreachable));
        }
        self.sent.lock().unwrap().push((target, frame.to_vec()));
        Ok(frame.len())
    }
}
