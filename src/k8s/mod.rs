//! Kubernetes cluster access.
//!
//! The controller needs five capabilities from the orchestrator: build a
//! client from a credentials path, probe connectivity, map a kind to its
//! API endpoint, and read/create/update resources. [`ClusterAccess`] and
//! [`ClusterAccessFactory`] are those seams; [`KubeClusterClient`] is the
//! kube-rs implementation.

mod apply;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::{debug, info};

use crate::error::{Error, Result};

pub use apply::ApplyError;

/// A connected cluster: connectivity probing plus manifest application.
#[async_trait]
pub trait ClusterAccess: Send + Sync {
    /// Probes the cluster with a lightweight server-identity request.
    async fn check_connectivity(&self) -> Result<()>;

    /// Applies every YAML manifest under `dir`, accumulating per-document
    /// errors instead of aborting on the first failure.
    async fn apply_manifests(&self, dir: &Path) -> Vec<ApplyError>;
}

/// Builds [`ClusterAccess`] handles from a kubeconfig path.
#[async_trait]
pub trait ClusterAccessFactory: Send + Sync {
    async fn connect(&self, kubeconfig_path: &str) -> Result<Arc<dyn ClusterAccess>>;
}

/// kube-rs client wrapper implementing [`ClusterAccess`].
pub struct KubeClusterClient {
    client: kube::Client,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient").finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    /// Wraps an already-built client (used by tests and in-cluster callers).
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    /// Builds a client from the given kubeconfig path. An empty path infers
    /// the configuration: default kubeconfig first, in-cluster environment
    /// as the fallback.
    pub async fn connect(kubeconfig_path: &str) -> Result<Self> {
        let config = if kubeconfig_path.is_empty() {
            info!("No kubeconfig path provided, inferring Kubernetes configuration");
            kube::Config::infer().await.map_err(|e| {
                Error::ConfigError(format!("could not infer Kubernetes configuration: {e}"))
            })?
        } else {
            debug!("Using kubeconfig {}", kubeconfig_path);
            let kubeconfig = Kubeconfig::read_from(kubeconfig_path).map_err(|e| {
                Error::ConfigError(format!("failed to read kubeconfig {kubeconfig_path}: {e}"))
            })?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::ConfigError(format!(
                        "failed to build configuration from kubeconfig {kubeconfig_path}: {e}"
                    ))
                })?
        };

        let client = kube::Client::try_from(config)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ClusterAccess for KubeClusterClient {
    async fn check_connectivity(&self) -> Result<()> {
        let version = self.client.apiserver_version().await?;
        debug!("Kubernetes API server reachable (version {})", version.git_version);
        Ok(())
    }

    async fn apply_manifests(&self, dir: &Path) -> Vec<ApplyError> {
        apply::apply_manifests(&self.client, dir).await
    }
}

/// Production factory building [`KubeClusterClient`]s.
pub struct KubeAccessFactory;

#[async_trait]
impl ClusterAccessFactory for KubeAccessFactory {
    async fn connect(&self, kubeconfig_path: &str) -> Result<Arc<dyn ClusterAccess>> {
        let client = KubeClusterClient::connect(kubeconfig_path).await?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_check_connectivity_probes_server_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "major": "1",
                "minor": "29",
                "gitVersion": "v1.29.0",
                "gitCommit": "abcdef",
                "gitTreeState": "clean",
                "buildDate": "2024-01-01T00:00:00Z",
                "goVersion": "go1.21.5",
                "compiler": "gc",
                "platform": "linux/amd64"
            })))
            .mount(&server)
            .await;

        let config = kube::Config::new(server.uri().parse().unwrap());
        let client = kube::Client::try_from(config).unwrap();
        KubeClusterClient::new(client)
            .check_connectivity()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_check_connectivity_unreachable_server_is_retriable() {
        let server = MockServer::start().await;
        let uri = server.uri();
        drop(server);

        let config = kube::Config::new(uri.parse().unwrap());
        let client = kube::Client::try_from(config).unwrap();
        let err = KubeClusterClient::new(client)
            .check_connectivity()
            .await
            .unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_connect_with_missing_kubeconfig_is_config_error() {
        let err = KubeClusterClient::connect("/nonexistent/kubeconfig.yaml")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }
}
