//! gitopsctl: a GitOps reconciliation engine for Kubernetes.
//!
//! For each registered application the controller periodically resolves the
//! desired state from a Git repository (a branch on a remote) and converges
//! the target cluster toward it by applying a directory of YAML manifests.
//! Cluster connectivity is checked by a companion health worker sharing the
//! same command-driven pattern.

pub mod controller;
pub mod error;
pub mod git;
pub mod k8s;
pub mod registry;

pub use crate::error::{Error, Result};
