//! Structural log.
//!
//! Append-only, human-readable record of endpoint resolution, remote
//! add/remove and degraded packet-path events. Each event is one timestamped
//! line in the log file and is mirrored to `tracing` under the `audit` target.
//! Writes are synchronous and short; callers never hold a control-plane lock
//! while logging.

use chrono::{SecondsFormat, Utc};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Severity of a structural event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Audit,
    Warn,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Audit => write!(f, "AUDIT"),
            LogLevel::Warn => write!(f, "WARN"),
        }
    }
}

/// One recorded event, as kept by the in-memory logger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditRecord {
    pub level: LogLevel,
    pub message: String,
}

enum Sink {
    File(Mutex<File>),
    Noop,
    #[cfg(any(test, feature = "test-util"))]
    Memory(Arc<Mutex<Vec<AuditRecord>>>),
}

/// Structural logger with domain-specific methods.
pub struct AuditLogger {
    sink: Sink,
}

impl AuditLogger {
    /// Open (or create) the log file in append mode.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            sink: Sink::File(Mutex::new(file)),
        })
    }

    /// Create a noop audit logger (for testing)
    pub fn new_noop() -> Self {
        Self { sink: Sink::Noop }
    }

    /// Logger that keeps every record in memory.
    #[cfg(any(test, feature = "test-util"))]
    pub fn new_memory() -> (Self, AuditJournal) {
        let records = Arc::new(Mutex::new(Vec::new()));
        let logger = Self {
            sink: Sink::Memory(Arc::clone(&records)),
        };
        (logger, AuditJournal { records })
    }

    fn log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Warn => warn!(target: "audit", "{}", message),
            _ => info!(target: "audit", "{}", message),
        }

        match &self.sink {
            Sink::File(file) => {
                let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
                let mut file = file.lock().unwrap();
                if let Err(e) = writeln!(file, "{ts} [{level}] {message}") {
                    warn!(error = %e, "Failed to write structural log");
                }
            }
            Sink::Noop => {}
            #[cfg(any(test, feature = "test-util"))]
            Sink::Memory(records) => records.lock().unwrap().push(AuditRecord { level, message }),
        }
    }

    // === Endpoint Events ===

    /// The public port is only reported when NAT rewrote it.
    pub fn endpoint_resolved(&self, port: u16, public_port: Option<u16>) {
        let message = match public_port {
            Some(public) if public != port => {
                format!("Endpoint UDP port: {port}, STUN resolved to: {public}")
            }
            _ => format!("Endpoint UDP port: {port}"),
        };
        self.log(LogLevel::Info, message);
    }

    // === Remote Events ===

    pub fn remote_added(&self, local_ip: Ipv4Addr, remote: SocketAddrV4) {
        self.log(
            LogLevel::Audit,
            format!("Remote added: {local_ip} -> {remote}"),
        );
    }

    pub fn remote_removed(&self, local_ip: Ipv4Addr) {
        self.log(LogLevel::Audit, format!("Remote removed: {local_ip}"));
    }

    // === Packet Path Events ===

    pub fn socket_slot_degraded(&self, queue: u32, opened: usize, reason: &str) {
        self.log(
            LogLevel::Warn,
            format!("Socket slot {queue} unavailable ({reason}), continuing with {opened} slot(s)"),
        );
    }

    pub fn program_attached(&self, if_name: &str) {
        self.log(LogLevel::Info, format!("XDP program attached to {if_name}"));
    }

    pub fn program_detached(&self, if_name: &str) {
        self.log(LogLevel::Info, format!("XDP program detached from {if_name}"));
    }
}

/// Read side of [`AuditLogger::new_memory`].
#[cfg(any(test, feature = "test-util"))]
#[derive(Clone)]
pub struct AuditJournal {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

#[cfg(any(test, feature = "test-util"))]
impl AuditJournal {
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.message).collect()
    }
}

/// Create a shared structural logger writing to `path`.
pub fn create_audit_logger(path: &Path) -> io::Result<Arc<AuditLogger>> {
    Ok(Arc::new(AuditLogger::open(path)?))
}
