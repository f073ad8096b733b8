//! Cluster health checker.
//!
//! A single worker probes connectivity of every registered cluster on a
//! periodic ticker and services on-demand check requests from the command
//! channel. Outcomes are written back to the cluster registry.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::registry::{Cluster, ClusterStatus, DEFAULT_CLUSTER_HEALTH_CHECK_INTERVAL};

use super::core::ControllerShared;
use super::{ClusterCommand, K8S_CONNECT_TIMEOUT};

pub(super) async fn run_cluster_health_checker(
    shared: Arc<ControllerShared>,
    mut rx: mpsc::Receiver<ClusterCommand>,
) {
    info!("Cluster health checker started.");

    let mut ticker = tokio::time::interval(DEFAULT_CLUSTER_HEALTH_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Startup checks arrive as explicit commands; swallow the immediate
    // first tick so the sweep starts one full interval in.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shared.root.cancelled() => {
                info!("Controller cancelled, cluster health checker exiting.");
                return;
            }

            _ = ticker.tick() => {
                // Snapshot first; probing must not hold the registry lock.
                let clusters = shared.clusters.list().await;
                debug!("Running periodic health sweep over {} cluster(s)", clusters.len());
                join_all(
                    clusters
                        .into_iter()
                        .map(|cluster| perform_cluster_health_check(&shared, cluster)),
                )
                .await;
            }

            command = rx.recv() => match command {
                None => {
                    info!("Cluster command channel closed, health checker exiting.");
                    return;
                }
                Some(ClusterCommand::Check { name }) => {
                    match shared.clusters.get(&name).await {
                        Some(cluster) => {
                            info!("Manual health check triggered for cluster '{name}'");
                            perform_cluster_health_check(&shared, cluster).await;
                        }
                        None => warn!("Attempted manual health check for non-existent cluster '{name}'"),
                    }
                }
            }
        }
    }
}

/// Probes one cluster and persists the outcome. Client build failures are
/// configuration errors; probe failures mean the cluster is unreachable.
pub(super) async fn perform_cluster_health_check(shared: &ControllerShared, mut cluster: Cluster) {
    debug!("Performing health check for cluster '{}'", cluster.name);

    match shared.deps.factory.connect(&cluster.kubeconfig_path).await {
        Err(e) => {
            error!("Failed to create K8s client for cluster '{}': {e}", cluster.name);
            cluster.status = ClusterStatus::Error;
            cluster.message = format!("Failed to create K8s client: {e}");
        }
        Ok(access) => {
            match tokio::time::timeout(K8S_CONNECT_TIMEOUT, access.check_connectivity()).await {
                Ok(Ok(())) => {
                    debug!("Cluster '{}' connectivity check successful.", cluster.name);
                    cluster.status = ClusterStatus::Active;
                    cluster.message = "Connectivity successful.".to_string();
                }
                Ok(Err(e)) => {
                    warn!("Cluster '{}' connectivity check failed: {e}", cluster.name);
                    cluster.status = ClusterStatus::Unreachable;
                    cluster.message = format!("Connectivity failed: {e}");
                }
                Err(_) => {
                    warn!("Cluster '{}' connectivity check timed out", cluster.name);
                    cluster.status = ClusterStatus::Unreachable;
                    cluster.message = format!(
                        "Connectivity failed: timed out after {}s",
                        K8S_CONNECT_TIMEOUT.as_secs()
                    );
                }
            }
        }
    }

    cluster.last_checked_at = Some(Utc::now());
    shared
        .clusters
        .commit_health(&cluster, &shared.settings.cluster_config_path)
        .await;
}
