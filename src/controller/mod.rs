//! GitOps reconciliation controller.
//!
//! This module contains the controller façade, the command dispatcher that
//! serializes lifecycle mutations, the per-application reconciliation
//! loops, and the cluster health checker.

use std::time::Duration;

mod core;
mod health;
mod reconciler;

pub use self::core::{Controller, ControllerDeps, ControllerSettings};
pub use self::reconciler::effective_interval;

/// Maximum number of consecutive failures factored into the backoff cap.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Base duration for exponential backoff after a failed sync.
pub const BASE_BACKOFF: Duration = Duration::from_secs(5);

/// Timeout for Git operations like clone/pull.
pub const GIT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for applying Kubernetes manifests.
pub const K8S_APPLY_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for establishing connectivity to a Kubernetes cluster.
pub const K8S_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the command channels. Senders may block when the channel is
/// full; commands are never dropped.
pub(crate) const COMMAND_CHANNEL_CAPACITY: usize = 10;

/// A lifecycle command for a specific application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppCommand {
    /// Start (or restart) the application's reconciliation loop.
    Start { name: String },
    /// Gracefully stop the application's reconciliation loop.
    Stop { name: String },
    /// Trigger an immediate sync of the application.
    Sync { name: String },
}

/// A command for a specific cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterCommand {
    /// Run a connectivity health check against the cluster.
    Check { name: String },
}
