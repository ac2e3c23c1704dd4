//! gRPC command surface.

pub mod service;
pub mod validation;

/// Generated proto types.
pub mod proto {
    tonic::include_proto!("shoal");
}

pub use service::{ShoalServiceImpl, watch_switch_changes};
