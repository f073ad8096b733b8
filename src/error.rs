//! Crate-wide error type.
//!
//! Worker-local failures never propagate out of a reconciliation loop; they
//! are folded into the application or cluster record instead. This type
//! covers everything else: registry I/O, client construction, validation.

use std::time::Duration;

use thiserror::Error;

use crate::git::GitError;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Git repository resolution failed
    #[error("Git error: {0}")]
    GitError(#[from] GitError),

    /// Invalid or missing configuration (bad kubeconfig, unknown cluster, ...)
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// A user-supplied field failed validation
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Local filesystem error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Registry (de)serialization error
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// A bounded operation exceeded its deadline
    #[error("operation timed out after {0:?}")]
    TimeoutError(Duration),
}

impl Error {
    /// Whether retrying the failed operation may succeed without operator
    /// intervention.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_)
            | Error::GitError(_)
            | Error::IoError(_)
            | Error::TimeoutError(_) => true,
            Error::ConfigError(_) | Error::ValidationError(_) | Error::SerializationError(_) => {
                false
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
