//! Per-application reconciliation loop.
//!
//! Each running application owns one worker: an isolated working
//! directory, a cluster client, a poll timer and a manual-sync inbox. The
//! worker converges the cluster toward the tracked Git reference and
//! records every outcome in the application registry.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::git;
use crate::k8s::{ApplyError, ClusterAccess};
use crate::registry::{AppStatus, Application};

use super::core::ControllerShared;
use super::{
    BASE_BACKOFF, GIT_OPERATION_TIMEOUT, K8S_APPLY_TIMEOUT, K8S_CONNECT_TIMEOUT,
    MAX_CONSECUTIVE_FAILURES,
};

/// Entry point for one worker. Runs the reconciliation loop to completion,
/// then removes this worker's live-map entry, but only if the entry still
/// belongs to it, so a successor started under the same name is untouched.
pub(super) async fn run(
    shared: Arc<ControllerShared>,
    app: Application,
    runtime_id: u64,
    cancel: CancellationToken,
    sync_rx: mpsc::Receiver<()>,
) {
    let name = app.name.clone();

    reconcile_loop(&shared, app, &cancel, sync_rx).await;

    let mut running = shared.running.lock().await;
    if running.get(&name).map(|rt| rt.id) == Some(runtime_id) {
        running.remove(&name);
        debug!("Removed application '{name}' from the live runtime map");
    }
    drop(running);
    cancel.cancel();
}

async fn reconcile_loop(
    shared: &ControllerShared,
    mut app: Application,
    cancel: &CancellationToken,
    mut sync_rx: mpsc::Receiver<()>,
) {
    let config_path = shared.settings.app_config_path.clone();
    info!(
        "Starting reconciliation loop for application '{}' (repo {}, branch {}, path {}, interval {})",
        app.name, app.repo_url, app.branch, app.path, app.interval
    );

    let Some(cluster) = shared.clusters.get(&app.cluster_name).await else {
        error!(
            "Cluster configuration not found for application '{}': '{}'",
            app.name, app.cluster_name
        );
        app.status = AppStatus::Error;
        app.message = format!("Cluster '{}' does not exist", app.cluster_name);
        app.consecutive_failures = 0;
        shared.apps.commit_status(&app, &config_path, true).await;
        return;
    };

    // The workdir handle doubles as the cleanup guard: dropping it removes
    // the directory on every exit path below.
    let workdir = match git::create_workdir() {
        Ok(dir) => dir,
        Err(e) => {
            error!("Failed to create working directory for application '{}': {e}", app.name);
            app.status = AppStatus::Error;
            app.message = format!("Failed to create temp dir: {e}");
            shared.apps.commit_status(&app, &config_path, true).await;
            return;
        }
    };

    let access = match shared.deps.factory.connect(&cluster.kubeconfig_path).await {
        Ok(access) => access,
        Err(e) => {
            error!("Failed to create Kubernetes client for application '{}': {e}", app.name);
            app.status = AppStatus::Error;
            app.message = format!("Failed to create K8s client: {e}");
            shared.apps.commit_status(&app, &config_path, true).await;
            return;
        }
    };

    info!(
        "Checking connectivity to Kubernetes cluster '{}' for application '{}'",
        cluster.name, app.name
    );
    let probe = tokio::time::timeout(K8S_CONNECT_TIMEOUT, access.check_connectivity()).await;
    let probe_error = match probe {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(format!("timed out after {}s", K8S_CONNECT_TIMEOUT.as_secs())),
    };
    if let Some(detail) = probe_error {
        error!(
            "Failed to connect to Kubernetes cluster for application '{}': {detail}",
            app.name
        );
        app.status = AppStatus::Error;
        app.message = format!("K8s connectivity error: {detail}");
        shared.apps.commit_status(&app, &config_path, true).await;
        return;
    }

    // Initial sync attempt immediately, then settle into the poll loop.
    perform_sync(shared, &mut app, workdir.path(), &access).await;

    let timer = tokio::time::sleep(effective_interval(app.polling_interval, app.consecutive_failures));
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Reconciliation loop stopping for application '{}'", app.name);
                if app.status != AppStatus::Stopped && app.status != AppStatus::Error {
                    app.status = AppStatus::Stopped;
                    app.message = "Controller shut down: reconciliation loop cancelled".to_string();
                    shared.apps.commit_status(&app, &config_path, true).await;
                }
                return;
            }

            () = &mut timer => {
                perform_sync(shared, &mut app, workdir.path(), &access).await;

                let next = effective_interval(app.polling_interval, app.consecutive_failures);
                if app.consecutive_failures > 0 {
                    warn!(
                        "Applying backoff for application '{}' after {} consecutive failure(s), next poll in {:?}",
                        app.name, app.consecutive_failures, next
                    );
                }
                timer.as_mut().reset(tokio::time::Instant::now() + next);
            }

            Some(()) = sync_rx.recv() => {
                info!("Manual sync triggered for application '{}'", app.name);
                // The poll timer is deliberately left untouched.
                perform_sync(shared, &mut app, workdir.path(), &access).await;
            }
        }
    }
}

/// Computes the next poll gap. With no failures this is the configured
/// polling interval; after k failures it is
/// `min(BASE_BACKOFF * 2^(k-1), polling_interval * MAX_CONSECUTIVE_FAILURES)`.
pub fn effective_interval(polling_interval: Duration, failures: u32) -> Duration {
    if failures == 0 {
        return polling_interval;
    }
    let exponent = failures.saturating_sub(1).min(31);
    let backoff = BASE_BACKOFF.saturating_mul(1u32 << exponent);
    backoff.min(polling_interval.saturating_mul(MAX_CONSECUTIVE_FAILURES))
}

/// One reconciliation pass: resolve the remote, detect change, apply
/// manifests, record the outcome. Persistence happens only when status,
/// commit or failure count actually moved.
pub(super) async fn perform_sync(
    shared: &ControllerShared,
    app: &mut Application,
    workdir: &Path,
    access: &Arc<dyn ClusterAccess>,
) {
    let prev_status = app.status;
    let config_path = shared.settings.app_config_path.clone();

    debug!("Polling Git repository for application '{}'", app.name);
    let resolved = tokio::time::timeout(
        GIT_OPERATION_TIMEOUT,
        shared.deps.resolver.resolve(&app.repo_url, &app.branch, workdir),
    )
    .await;
    let current_commit = match resolved {
        Ok(Ok(commit)) => commit,
        Ok(Err(e)) => {
            error!("Failed to pull Git repository for application '{}': {e}", app.name);
            app.status = AppStatus::Error;
            app.message = format!("Git pull error: {e}");
            app.consecutive_failures += 1;
            shared.apps.commit_status(app, &config_path, false).await;
            return;
        }
        Err(_) => {
            error!("Git operation timed out for application '{}'", app.name);
            app.status = AppStatus::Error;
            app.message = format!(
                "Git pull error: operation timed out after {}s",
                GIT_OPERATION_TIMEOUT.as_secs()
            );
            app.consecutive_failures += 1;
            shared.apps.commit_status(app, &config_path, false).await;
            return;
        }
    };

    if current_commit == app.last_synced_commit {
        debug!(
            "No new changes for application '{}' at {current_commit}",
            app.name
        );
        app.message = format!("Up to date at {current_commit}");
        // Recover from a transient or pre-sync state without a tree change.
        if matches!(
            prev_status,
            AppStatus::Error | AppStatus::Pending | AppStatus::SyncRequested
        ) {
            app.status = AppStatus::Synced;
            app.consecutive_failures = 0;
            shared.apps.commit_status(app, &config_path, false).await;
        }
        return;
    }

    info!(
        "New changes detected for application '{}': '{}' -> '{}'",
        app.name, app.last_synced_commit, current_commit
    );

    let manifests_dir = workdir.join(&app.path);
    if !manifests_dir.is_dir() {
        error!(
            "Manifests path '{}' does not exist in repository for application '{}'",
            app.path, app.name
        );
        app.status = AppStatus::Error;
        app.message = format!(
            "Manifests path '{}' not found in repo after cloning. Check 'path' in config or repo structure.",
            app.path
        );
        app.consecutive_failures += 1;
        shared.apps.commit_status(app, &config_path, false).await;
        return;
    }

    info!(
        "Applying Kubernetes manifests for application '{}' from {}",
        app.name,
        manifests_dir.display()
    );
    let apply_errors =
        match tokio::time::timeout(K8S_APPLY_TIMEOUT, access.apply_manifests(&manifests_dir)).await
        {
            Ok(errors) => errors,
            Err(_) => vec![ApplyError::Timeout { after: K8S_APPLY_TIMEOUT }],
        };
    if !apply_errors.is_empty() {
        let details = apply_errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        let message = format!("Failed to apply {} manifest(s): {details}", apply_errors.len());
        error!("Manifest apply failed for application '{}': {message}", app.name);
        app.status = AppStatus::Error;
        app.message = message;
        app.consecutive_failures += 1;
        shared.apps.commit_status(app, &config_path, false).await;
        return;
    }

    app.last_synced_commit = current_commit.clone();
    app.status = AppStatus::Synced;
    app.message = format!("Successfully synced to {current_commit}");
    app.consecutive_failures = 0;
    info!(
        "Successfully applied manifests for application '{}' at {current_commit}",
        app.name
    );
    shared.apps.commit_status(app, &config_path, false).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::core::{ControllerDeps, ControllerSettings};
    use crate::git::GitError;
    use crate::k8s::ClusterAccessFactory;
    use crate::registry::{Applications, Cluster, Clusters};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex as StdMutex;

    // ── backoff schedule ───────────────────────────────────────────────────

    #[test]
    fn test_effective_interval_schedule() {
        let interval = Duration::from_secs(30);
        assert_eq!(effective_interval(interval, 0), Duration::from_secs(30));
        assert_eq!(effective_interval(interval, 1), Duration::from_secs(5));
        assert_eq!(effective_interval(interval, 2), Duration::from_secs(10));
        assert_eq!(effective_interval(interval, 3), Duration::from_secs(20));
        assert_eq!(effective_interval(interval, 4), Duration::from_secs(40));
        assert_eq!(effective_interval(interval, 5), Duration::from_secs(80));
        // capped at polling_interval * 5 = 150s
        assert_eq!(effective_interval(interval, 6), Duration::from_secs(150));
        assert_eq!(effective_interval(interval, 60), Duration::from_secs(150));
    }

    #[test]
    fn test_effective_interval_small_interval_cap() {
        // min interval: cap = 50s, backoff reaches it at 5 failures
        let interval = Duration::from_secs(10);
        assert_eq!(effective_interval(interval, 4), Duration::from_secs(40));
        assert_eq!(effective_interval(interval, 5), Duration::from_secs(50));
        assert_eq!(effective_interval(interval, 10), Duration::from_secs(50));
    }

    // ── perform_sync with scripted collaborators ───────────────────────────

    /// Resolver returning a scripted sequence of results; on success it
    /// materializes a `k8s/prod` tree in the workdir.
    struct ScriptedResolver {
        script: StdMutex<VecDeque<Result<String, String>>>,
    }

    impl ScriptedResolver {
        fn new(script: Vec<Result<String, String>>) -> Self {
            Self { script: StdMutex::new(script.into_iter().collect()) }
        }
    }

    #[async_trait]
    impl crate::git::RepoResolver for ScriptedResolver {
        async fn resolve(
            &self,
            _repo_url: &str,
            _branch: &str,
            target_dir: &Path,
        ) -> Result<String, GitError> {
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("resolver called more times than scripted");
            match next {
                Ok(commit) => {
                    std::fs::create_dir_all(target_dir.join("k8s/prod")).unwrap();
                    std::fs::write(
                        target_dir.join("k8s/prod/cm.yaml"),
                        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n",
                    )
                    .unwrap();
                    Ok(commit)
                }
                Err(detail) => Err(GitError::Clone("https://example.com/r.git".to_string(), {
                    git2::Error::from_str(&detail)
                })),
            }
        }
    }

    /// Cluster access returning scripted apply errors per call.
    struct ScriptedCluster {
        results: StdMutex<VecDeque<Vec<ApplyError>>>,
        applies: AtomicU64,
    }

    impl ScriptedCluster {
        fn ok() -> Self {
            Self { results: StdMutex::new(VecDeque::new()), applies: AtomicU64::new(0) }
        }

        fn with_results(results: Vec<Vec<ApplyError>>) -> Self {
            Self {
                results: StdMutex::new(results.into_iter().collect()),
                applies: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl ClusterAccess for ScriptedCluster {
        async fn check_connectivity(&self) -> crate::Result<()> {
            Ok(())
        }

        async fn apply_manifests(&self, _dir: &Path) -> Vec<ApplyError> {
            self.applies.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.results.lock().unwrap().pop_front().unwrap_or_default()
        }
    }

    struct NoFactory;

    #[async_trait]
    impl ClusterAccessFactory for NoFactory {
        async fn connect(&self, _kubeconfig_path: &str) -> crate::Result<Arc<dyn ClusterAccess>> {
            Ok(Arc::new(ScriptedCluster::ok()))
        }
    }

    struct Harness {
        shared: Arc<ControllerShared>,
        app: Application,
        workdir: tempfile::TempDir,
        config_path: std::path::PathBuf,
        _dir: tempfile::TempDir,
    }

    async fn harness(resolver: Arc<dyn crate::git::RepoResolver>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("applications.json");
        let apps = Arc::new(Applications::new());
        let clusters = Arc::new(Clusters::new());
        clusters.insert(Cluster::new("c1", "").unwrap()).await;

        let app = Application::new(
            "a1",
            "https://example.com/r.git",
            "main",
            "k8s/prod",
            "c1",
            "30s",
        )
        .unwrap();
        apps.insert(app.clone()).await;

        let shared = ControllerShared::for_tests(
            apps,
            clusters,
            ControllerDeps { resolver, factory: Arc::new(NoFactory) },
            ControllerSettings {
                app_config_path: config_path.clone(),
                cluster_config_path: dir.path().join("clusters.json"),
            },
        );

        Harness { shared, app, workdir: tempfile::tempdir().unwrap(), config_path, _dir: dir }
    }

    fn apply_error(detail: &str) -> ApplyError {
        ApplyError::Decode {
            path: std::path::PathBuf::from("cm.yaml"),
            index: 0,
            message: detail.to_string(),
        }
    }

    #[tokio::test]
    async fn test_healthy_sync_records_commit_and_persists() {
        let resolver = Arc::new(ScriptedResolver::new(vec![Ok("abc123".to_string())]));
        let mut h = harness(resolver).await;
        let access: Arc<dyn ClusterAccess> = Arc::new(ScriptedCluster::ok());

        perform_sync(&h.shared, &mut h.app, h.workdir.path(), &access).await;

        assert_eq!(h.app.status, AppStatus::Synced);
        assert_eq!(h.app.last_synced_commit, "abc123");
        assert_eq!(h.app.consecutive_failures, 0);
        assert_eq!(h.app.message, "Successfully synced to abc123");

        let stored = h.shared.apps.get("a1").await.unwrap();
        assert_eq!(stored.status, AppStatus::Synced);
        assert!(h.config_path.exists());
    }

    #[tokio::test]
    async fn test_git_failure_increments_failures_each_pass() {
        let resolver = Arc::new(ScriptedResolver::new(vec![
            Err("unreachable".to_string()),
            Err("unreachable".to_string()),
            Err("unreachable".to_string()),
        ]));
        let mut h = harness(resolver).await;
        let access: Arc<dyn ClusterAccess> = Arc::new(ScriptedCluster::ok());

        for expected in 1..=3u32 {
            perform_sync(&h.shared, &mut h.app, h.workdir.path(), &access).await;
            assert_eq!(h.app.status, AppStatus::Error);
            assert_eq!(h.app.consecutive_failures, expected);
            assert!(h.app.message.starts_with("Git pull error:"));
        }
        // Scenario: after 3 failures on a 30s interval the next gap is 20s.
        assert_eq!(
            effective_interval(h.app.polling_interval, h.app.consecutive_failures),
            Duration::from_secs(20)
        );
    }

    #[tokio::test]
    async fn test_recovery_resets_failures() {
        let resolver = Arc::new(ScriptedResolver::new(vec![
            Err("unreachable".to_string()),
            Ok("abc123".to_string()),
        ]));
        let mut h = harness(resolver).await;
        let access: Arc<dyn ClusterAccess> = Arc::new(ScriptedCluster::ok());

        perform_sync(&h.shared, &mut h.app, h.workdir.path(), &access).await;
        assert_eq!(h.app.consecutive_failures, 1);

        perform_sync(&h.shared, &mut h.app, h.workdir.path(), &access).await;
        assert_eq!(h.app.status, AppStatus::Synced);
        assert_eq!(h.app.consecutive_failures, 0);
        assert_eq!(
            effective_interval(h.app.polling_interval, h.app.consecutive_failures),
            Duration::from_secs(30)
        );
    }

    #[tokio::test]
    async fn test_unchanged_commit_is_idempotent_and_skips_persistence() {
        let resolver = Arc::new(ScriptedResolver::new(vec![
            Ok("abc123".to_string()),
            Ok("abc123".to_string()),
            Ok("abc123".to_string()),
        ]));
        let mut h = harness(resolver).await;
        let access: Arc<dyn ClusterAccess> = Arc::new(ScriptedCluster::ok());

        perform_sync(&h.shared, &mut h.app, h.workdir.path(), &access).await;
        assert_eq!(h.app.status, AppStatus::Synced);
        let after_first = h.app.clone();

        // Repeated ticks against an unchanged remote do not rewrite the
        // registry file.
        tokio::fs::remove_file(&h.config_path).await.unwrap();
        perform_sync(&h.shared, &mut h.app, h.workdir.path(), &access).await;
        perform_sync(&h.shared, &mut h.app, h.workdir.path(), &access).await;
        assert!(!h.config_path.exists());

        assert_eq!(h.app.status, after_first.status);
        assert_eq!(h.app.last_synced_commit, after_first.last_synced_commit);
        assert_eq!(h.app.consecutive_failures, after_first.consecutive_failures);
        assert_eq!(h.app.message, "Up to date at abc123");
    }

    #[tokio::test]
    async fn test_unchanged_commit_recovers_from_error() {
        let resolver = Arc::new(ScriptedResolver::new(vec![
            Ok("abc123".to_string()),
            Err("blip".to_string()),
            Ok("abc123".to_string()),
        ]));
        let mut h = harness(resolver).await;
        let access: Arc<dyn ClusterAccess> = Arc::new(ScriptedCluster::ok());

        perform_sync(&h.shared, &mut h.app, h.workdir.path(), &access).await;
        perform_sync(&h.shared, &mut h.app, h.workdir.path(), &access).await;
        assert_eq!(h.app.status, AppStatus::Error);

        // The commit has not moved, but the error state clears.
        perform_sync(&h.shared, &mut h.app, h.workdir.path(), &access).await;
        assert_eq!(h.app.status, AppStatus::Synced);
        assert_eq!(h.app.consecutive_failures, 0);
        assert_eq!(h.app.message, "Up to date at abc123");
    }

    #[tokio::test]
    async fn test_missing_manifests_path_is_an_error() {
        let resolver = Arc::new(ScriptedResolver::new(vec![Ok("abc123".to_string())]));
        let mut h = harness(resolver).await;
        h.app.path = "missing/dir".to_string();
        let access: Arc<dyn ClusterAccess> = Arc::new(ScriptedCluster::ok());

        perform_sync(&h.shared, &mut h.app, h.workdir.path(), &access).await;

        assert_eq!(h.app.status, AppStatus::Error);
        assert_eq!(h.app.consecutive_failures, 1);
        assert!(h.app.message.contains("Manifests path 'missing/dir' not found"));
    }

    #[tokio::test]
    async fn test_partial_apply_failure_counts_once_and_enumerates() {
        let resolver = Arc::new(ScriptedResolver::new(vec![Ok("abc123".to_string())]));
        let mut h = harness(resolver).await;
        let cluster = Arc::new(ScriptedCluster::with_results(vec![vec![
            apply_error("bad doc one"),
            apply_error("bad doc two"),
        ]]));
        let access: Arc<dyn ClusterAccess> = cluster.clone();

        perform_sync(&h.shared, &mut h.app, h.workdir.path(), &access).await;

        // One pass with M failing documents costs exactly one failure
        // increment and reports every error.
        assert_eq!(h.app.status, AppStatus::Error);
        assert_eq!(h.app.consecutive_failures, 1);
        assert!(h.app.message.starts_with("Failed to apply 2 manifest(s):"));
        assert!(h.app.message.contains("bad doc one"));
        assert!(h.app.message.contains("bad doc two"));
        // The commit is not recorded as synced.
        assert_eq!(h.app.last_synced_commit, "");
    }
}
