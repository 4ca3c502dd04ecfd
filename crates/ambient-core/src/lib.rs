//! Ambient control plane core
//!
//! Mirrors the Ambient API into local caches through a watch-backed informer
//! and reconciles each change against either Kubernetes (cluster mode) or
//! locally supervised runner processes (local mode).

pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod informer;
pub mod paths;
pub mod ports;
pub mod process;
pub mod reconciler;
pub mod resources;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ControlPlaneConfig, ExecutionMode};
pub use informer::Informer;
pub use process::ProcessManager;
pub use watch::WatchManager;
