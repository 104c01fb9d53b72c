//! Background services

pub mod health_monitor;
pub mod refresh;
pub mod source;

pub use health_monitor::{HealthMonitor, HealthMonitorConfig};
pub use refresh::{RefreshConfig, RefreshService};
pub use source::{DescriptorSource, SourceKind};

use tokio::sync::watch;

/// Shared shutdown signal for the server and background services
pub struct ShutdownHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    /// Another receiver for one more task
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new().0
    }
}
