//! Controller façade and command dispatcher.
//!
//! All lifecycle mutations (start/stop/sync per application, health check
//! per cluster) flow through bounded command channels into two long-lived
//! tasks. The dispatcher is the only task that mutates the live-runtime
//! map, which removes any need for fine-grained locking around start/stop
//! races and gives commands for one application a total order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::git::{GitResolver, RepoResolver};
use crate::k8s::{ClusterAccessFactory, KubeAccessFactory};
use crate::registry::{
    AppStatus, Applications, Clusters, DEFAULT_APP_CONFIG_FILE, DEFAULT_CLUSTER_CONFIG_FILE,
};

use super::{health, reconciler, AppCommand, ClusterCommand, COMMAND_CHANNEL_CAPACITY};

/// External collaborators the controller drives: the Git resolver and the
/// cluster-access factory. Swappable for testing.
#[derive(Clone)]
pub struct ControllerDeps {
    pub resolver: Arc<dyn RepoResolver>,
    pub factory: Arc<dyn ClusterAccessFactory>,
}

impl ControllerDeps {
    /// The production wiring: libgit2 and kube-rs.
    pub fn production() -> Self {
        Self {
            resolver: Arc::new(GitResolver),
            factory: Arc::new(KubeAccessFactory),
        }
    }
}

/// Locations of the durable registry files.
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    pub app_config_path: PathBuf,
    pub cluster_config_path: PathBuf,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            app_config_path: PathBuf::from(DEFAULT_APP_CONFIG_FILE),
            cluster_config_path: PathBuf::from(DEFAULT_CLUSTER_CONFIG_FILE),
        }
    }
}

/// In-memory handle for one running reconciliation loop.
pub(super) struct AppRuntime {
    /// Generation id distinguishing this runtime from any successor under
    /// the same name.
    pub id: u64,
    /// One-shot cancellation for this worker, derived from the root token.
    pub cancel: CancellationToken,
    /// Capacity-1 manual-sync signal channel; a full channel means a sync
    /// is already pending and further requests coalesce into it.
    pub sync_tx: mpsc::Sender<()>,
}

/// State shared between the façade, the dispatcher and the workers.
pub(super) struct ControllerShared {
    pub apps: Arc<Applications>,
    pub clusters: Arc<Clusters>,
    pub deps: ControllerDeps,
    pub settings: ControllerSettings,
    pub root: CancellationToken,
    pub running: Mutex<HashMap<String, AppRuntime>>,
    next_runtime_id: AtomicU64,
}

impl ControllerShared {
    pub fn next_runtime_id(&self) -> u64 {
        self.next_runtime_id.fetch_add(1, Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(super) fn for_tests(
        apps: Arc<Applications>,
        clusters: Arc<Clusters>,
        deps: ControllerDeps,
        settings: ControllerSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            apps,
            clusters,
            deps,
            settings,
            root: CancellationToken::new(),
            running: Mutex::new(HashMap::new()),
            next_runtime_id: AtomicU64::new(1),
        })
    }
}

/// The public controller object. External collaborators mutate the
/// registries, then enqueue commands here; real errors surface
/// asynchronously through the persisted status fields.
pub struct Controller {
    shared: Arc<ControllerShared>,
    tracker: TaskTracker,
    app_tx: mpsc::Sender<AppCommand>,
    cluster_tx: mpsc::Sender<ClusterCommand>,
    app_rx: Mutex<Option<mpsc::Receiver<AppCommand>>>,
    cluster_rx: Mutex<Option<mpsc::Receiver<ClusterCommand>>>,
}

impl Controller {
    pub fn new(
        apps: Arc<Applications>,
        clusters: Arc<Clusters>,
        deps: ControllerDeps,
        settings: ControllerSettings,
    ) -> Self {
        let (app_tx, app_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (cluster_tx, cluster_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        Self {
            shared: Arc::new(ControllerShared {
                apps,
                clusters,
                deps,
                settings,
                root: CancellationToken::new(),
                running: Mutex::new(HashMap::new()),
                next_runtime_id: AtomicU64::new(1),
            }),
            tracker: TaskTracker::new(),
            app_tx,
            cluster_tx,
            app_rx: Mutex::new(Some(app_rx)),
            cluster_rx: Mutex::new(Some(cluster_rx)),
        }
    }

    /// Spawns the dispatcher and health-checker tasks, then enqueues a
    /// `Start` for every registered application and a `Check` for every
    /// registered cluster. Returns once the commands are enqueued; actual
    /// startup is asynchronous.
    pub async fn start(&self) -> crate::Result<()> {
        info!("Starting GitOps controller...");

        if let Some(rx) = self.app_rx.lock().await.take() {
            self.tracker
                .spawn(run_dispatcher(self.shared.clone(), self.tracker.clone(), rx));
        }
        if let Some(rx) = self.cluster_rx.lock().await.take() {
            self.tracker
                .spawn(health::run_cluster_health_checker(self.shared.clone(), rx));
        }

        let apps = self.shared.apps.list().await;
        if apps.is_empty() {
            info!("No existing applications found to launch at startup.");
        } else {
            info!(
                "Launching {} existing application reconciliation loop(s)...",
                apps.len()
            );
            for app in apps {
                self.start_app(&app.name).await;
            }
        }

        let clusters = self.shared.clusters.list().await;
        if clusters.is_empty() {
            info!("No existing clusters found to check at startup.");
        } else {
            info!("Triggering initial health checks for {} cluster(s)...", clusters.len());
            for cluster in clusters {
                self.trigger_cluster_health_check(&cluster.name).await;
            }
        }

        info!("Initial reconciliation commands dispatched.");
        Ok(())
    }

    /// Cancels the root token and waits for every worker to exit.
    /// Idempotent; safe to call after partial startup.
    pub async fn stop(&self) {
        info!("Stopping GitOps controller...");
        self.shared.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("GitOps controller stopped.");
    }

    /// Enqueues a command to start (or restart) an application's loop.
    pub async fn start_app(&self, name: &str) {
        self.send_app_command(AppCommand::Start { name: name.to_string() }).await;
    }

    /// Enqueues a command to stop an application's loop.
    pub async fn stop_app(&self, name: &str) {
        self.send_app_command(AppCommand::Stop { name: name.to_string() }).await;
    }

    /// Enqueues a command to sync an application immediately.
    pub async fn trigger_sync(&self, name: &str) {
        self.send_app_command(AppCommand::Sync { name: name.to_string() }).await;
    }

    /// Enqueues an on-demand health check for a cluster.
    pub async fn trigger_cluster_health_check(&self, name: &str) {
        if self
            .cluster_tx
            .send(ClusterCommand::Check { name: name.to_string() })
            .await
            .is_err()
        {
            warn!("Cluster command channel closed, dropping health check for '{name}'");
        }
    }

    async fn send_app_command(&self, command: AppCommand) {
        if let Err(e) = self.app_tx.send(command).await {
            warn!("Command channel closed, dropping command {:?}", e.0);
        }
    }
}

/// The central task processing application commands. It is the sole owner
/// of the live-runtime map mutations apart from worker self-removal.
async fn run_dispatcher(
    shared: Arc<ControllerShared>,
    tracker: TaskTracker,
    mut rx: mpsc::Receiver<AppCommand>,
) {
    info!("Controller command dispatcher started.");
    loop {
        tokio::select! {
            _ = shared.root.cancelled() => {
                info!("Controller cancelled, dispatcher exiting.");
                break;
            }
            command = rx.recv() => match command {
                None => {
                    info!("Command channel closed, dispatcher exiting.");
                    break;
                }
                Some(command) => handle_app_command(&shared, &tracker, command).await,
            }
        }
    }
    stop_all_runtimes(&shared).await;
}

async fn handle_app_command(
    shared: &Arc<ControllerShared>,
    tracker: &TaskTracker,
    command: AppCommand,
) {
    match command {
        AppCommand::Start { name } => {
            let Some(app) = shared.apps.get(&name).await else {
                error!("Attempted to start non-existent application '{name}'");
                return;
            };

            if shared.clusters.get(&app.cluster_name).await.is_none() {
                error!(
                    "Attempted to start application '{name}' with non-existent cluster '{}'",
                    app.cluster_name
                );
                let mut app = app;
                app.status = AppStatus::Error;
                app.message = format!("Cluster '{}' does not exist", app.cluster_name);
                app.consecutive_failures = 0;
                shared
                    .apps
                    .commit_status(&app, &shared.settings.app_config_path, true)
                    .await;
                return;
            }

            let mut running = shared.running.lock().await;
            if let Some(incumbent) = running.get(&name) {
                // The incumbent reaps its own map entry; the generation id
                // keeps it from removing ours.
                info!("Restarting reconciliation loop for application '{name}'");
                incumbent.cancel.cancel();
            }

            let id = shared.next_runtime_id();
            let cancel = shared.root.child_token();
            let (sync_tx, sync_rx) = mpsc::channel(1);
            running.insert(
                name.clone(),
                AppRuntime { id, cancel: cancel.clone(), sync_tx },
            );
            drop(running);

            tracker.spawn(reconciler::run(shared.clone(), app, id, cancel, sync_rx));
        }

        AppCommand::Stop { name } => {
            let running = shared.running.lock().await;
            match running.get(&name) {
                Some(runtime) => {
                    info!("Stopping reconciliation loop for application '{name}'");
                    runtime.cancel.cancel();
                }
                None => warn!("Attempted to stop non-running application '{name}'"),
            }
        }

        AppCommand::Sync { name } => {
            let running = shared.running.lock().await;
            match running.get(&name) {
                Some(runtime) => match runtime.sync_tx.try_send(()) {
                    Ok(()) => info!("Manual sync signal sent to application '{name}'"),
                    Err(_) => warn!(
                        "Sync already pending for application '{name}', coalescing request"
                    ),
                },
                None => {
                    warn!("Attempted to trigger sync for non-running application '{name}'");
                    drop(running);
                    // The API layer flips records to SyncRequested before the
                    // command reaches us; without a worker nothing would ever
                    // clear it, so fold it back here.
                    if let Some(mut app) = shared.apps.get(&name).await {
                        if app.status == AppStatus::SyncRequested {
                            app.status = AppStatus::Stopped;
                            app.message =
                                "Sync requested while the application is not running".to_string();
                            shared
                                .apps
                                .commit_status(&app, &shared.settings.app_config_path, true)
                                .await;
                        }
                    }
                }
            }
        }
    }
}

async fn stop_all_runtimes(shared: &ControllerShared) {
    let running = shared.running.lock().await;
    for (name, runtime) in running.iter() {
        info!("Stopping reconciliation loop for application '{name}' during shutdown");
        runtime.cancel.cancel();
    }
}
