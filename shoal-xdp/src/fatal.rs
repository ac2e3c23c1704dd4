//! Abort policy for unrecoverable errors.
//!
//! A failed kernel push, program load or attach leaves the forwarding plane in
//! an unknown state, so the daemon stops. On the lifecycle thread that is
//! [`fatal`]. Elsewhere (receive threads, command handlers) the error is
//! raised on a [`FatalSignal`]; the lifecycle thread waits on it, tears the
//! socket pool down and exits non-zero.

use std::fmt;
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::error;

/// Log the failing operation and exit with status 1.
pub fn fatal(operation: &str, err: &dyn fmt::Display) -> ! {
    error!(error = %err, "{} failed, aborting", operation);
    std::process::exit(1)
}

/// One-shot fatal error raised off the lifecycle thread.
#[derive(Default)]
pub struct FatalSignal {
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl FatalSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the first fatal error and wake the lifecycle thread.
    pub fn raise(&self, operation: &str, err: &dyn fmt::Display) {
        error!(error = %err, "{} failed", operation);
        let mut reason = self.reason.lock().unwrap();
        if reason.is_none() {
            *reason = Some(format!("{operation}: {err}"));
            self.notify.notify_one();
        }
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap().clone()
    }

    /// Wait until [`FatalSignal::raise`] has been called.
    pub async fn wait(&self) -> String {
        loop {
            if let Some(reason) = self.reason() {
                return reason;
            }
            self.notify.notified().await;
        }
    }
}
