//! Cluster records and their durable store.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::registry::app::save_snapshot;

/// Default path to store registered clusters.
pub const DEFAULT_CLUSTER_CONFIG_FILE: &str = "configs/clusters.json";

/// Default interval between periodic cluster health sweeps.
pub const DEFAULT_CLUSTER_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Health state of a registered cluster.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterStatus {
    /// Registered but not yet checked.
    #[default]
    Pending,
    /// Last connectivity probe succeeded.
    Active,
    /// Last connectivity probe failed.
    Unreachable,
    /// The client could not be built from the stored credentials.
    Error,
    /// An on-demand health check is awaiting the controller.
    CheckRequested,
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterStatus::Pending => write!(f, "Pending"),
            ClusterStatus::Active => write!(f, "Active"),
            ClusterStatus::Unreachable => write!(f, "Unreachable"),
            ClusterStatus::Error => write!(f, "Error"),
            ClusterStatus::CheckRequested => write!(f, "CheckRequested"),
        }
    }
}

/// A registered Kubernetes cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// Unique identifier for the cluster.
    pub name: String,

    /// Path to the kubeconfig file for this cluster. Empty means "infer"
    /// (default kubeconfig, falling back to in-cluster configuration).
    pub kubeconfig_path: String,

    /// When the cluster was registered.
    pub registered_at: DateTime<Utc>,

    /// Current health state.
    #[serde(default)]
    pub status: ClusterStatus,

    /// Detail of the last health outcome.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// When the cluster was last probed, if ever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl Cluster {
    /// Builds a cluster record in its registration-time state.
    pub fn new(name: &str, kubeconfig_path: &str) -> Result<Self> {
        super::validate_name(name)?;
        Ok(Cluster {
            name: name.to_string(),
            kubeconfig_path: kubeconfig_path.to_string(),
            registered_at: Utc::now(),
            status: ClusterStatus::Pending,
            message: "Cluster registered, awaiting first health check.".to_string(),
            last_checked_at: None,
        })
    }
}

/// Name-keyed store of [`Cluster`] records.
#[derive(Default)]
pub struct Clusters {
    inner: RwLock<HashMap<String, Cluster>>,
}

impl Clusters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads clusters from the given JSON file; an absent file yields an
    /// empty store.
    pub async fn load(path: &Path) -> Result<Self> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(Error::IoError(e)),
        };

        let records: Vec<Cluster> = serde_json::from_slice(&data)?;
        let mut map = HashMap::with_capacity(records.len());
        for cluster in records {
            map.insert(cluster.name.clone(), cluster);
        }
        Ok(Self { inner: RwLock::new(map) })
    }

    pub async fn insert(&self, cluster: Cluster) {
        self.inner.write().await.insert(cluster.name.clone(), cluster);
    }

    pub async fn get(&self, name: &str) -> Option<Cluster> {
        self.inner.read().await.get(name).cloned()
    }

    /// Returns snapshots of all records, sorted by name.
    pub async fn list(&self) -> Vec<Cluster> {
        let guard = self.inner.read().await;
        let mut list: Vec<Cluster> = guard.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub async fn remove(&self, name: &str) -> Option<Cluster> {
        self.inner.write().await.remove(name)
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Persists the whole collection to `path`.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let guard = self.inner.read().await;
        persist_locked(&guard, path).await
    }

    /// Folds a health-check outcome back into the store and persists the
    /// registry under the write lock. Health checks always carry a fresh
    /// `last_checked_at`, so the write is unconditional.
    pub async fn commit_health(&self, cluster: &Cluster, path: &Path) {
        let mut guard = self.inner.write().await;
        let Some(stored) = guard.get_mut(&cluster.name) else {
            error!("Attempted to save status for unknown cluster '{}'", cluster.name);
            return;
        };

        stored.status = cluster.status;
        stored.message = cluster.message.clone();
        stored.last_checked_at = cluster.last_checked_at;

        if let Err(e) = persist_locked(&guard, path).await {
            error!("Failed to save cluster registry to {}: {e}", path.display());
        } else {
            debug!("Cluster status saved: '{}' is {}", cluster.name, cluster.status);
        }
    }
}

/// Serializes a locked cluster map, sorted by name for stable output.
async fn persist_locked(map: &HashMap<String, Cluster>, path: &Path) -> Result<()> {
    let mut list: Vec<&Cluster> = map.values().collect();
    list.sort_by(|a, b| a.name.cmp(&b.name));
    save_snapshot(list.into_iter(), path).await
}
