//! Application records and their durable store.
//!
//! An [`Application`] describes one Git-tracked workload: where its
//! manifests live, which cluster they are applied to, and the current
//! reconciliation outcome. The [`Applications`] store keeps all records
//! behind a read/write lock and persists them as a JSON array, writing the
//! file only when a field that matters actually changed.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

/// Default path to store registered applications.
pub const DEFAULT_APP_CONFIG_FILE: &str = "configs/applications.json";

/// Lower bound for the polling interval.
pub const MIN_POLLING_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound for the polling interval.
pub const MAX_POLLING_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Operational state of an application, as persisted in the registry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppStatus {
    /// Registered but not yet synced.
    #[default]
    Pending,
    /// Last sync applied the tracked commit successfully.
    Synced,
    /// Last sync (or startup) failed; see `message`.
    Error,
    /// Reconciliation loop is not running.
    Stopped,
    /// A manual sync was requested and is awaiting the controller.
    SyncRequested,
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppStatus::Pending => write!(f, "Pending"),
            AppStatus::Synced => write!(f, "Synced"),
            AppStatus::Error => write!(f, "Error"),
            AppStatus::Stopped => write!(f, "Stopped"),
            AppStatus::SyncRequested => write!(f, "SyncRequested"),
        }
    }
}

/// A single GitOps application managed by the controller.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    /// Unique identifier, DNS subdomain shaped for compatibility with
    /// Kubernetes resource names.
    pub name: String,

    /// URL of the Git repository holding the manifests (HTTPS or SSH).
    #[serde(rename = "repoURL")]
    pub repo_url: String,

    /// Branch tracked for changes.
    pub branch: String,

    /// Subdirectory within the repository containing the manifests.
    pub path: String,

    /// Name of the registered cluster the manifests are applied to.
    pub cluster_name: String,

    /// Polling interval as supplied by the operator (e.g. "30s", "5m").
    pub interval: String,

    /// Parsed form of `interval`. Rebuilt on load, never serialized.
    #[serde(skip)]
    pub polling_interval: Duration,

    /// Commit id of the last successfully applied revision, empty until the
    /// first successful sync.
    #[serde(rename = "lastSyncedGitHash", default, skip_serializing_if = "String::is_empty")]
    pub last_synced_commit: String,

    /// Current operational state.
    #[serde(default)]
    pub status: AppStatus,

    /// Human-readable detail of the last outcome.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Number of consecutive failed syncs; drives exponential backoff.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub consecutive_failures: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Application {
    /// Builds a validated application record in its registration-time state.
    pub fn new(
        name: &str,
        repo_url: &str,
        branch: &str,
        path: &str,
        cluster_name: &str,
        interval: &str,
    ) -> Result<Self> {
        validate_name(name)?;
        validate_git_url(repo_url)?;
        let path = normalize_path(path)?;
        if branch.is_empty() {
            return Err(Error::ValidationError("branch must not be empty".to_string()));
        }
        let polling_interval = parse_interval(interval)?;

        Ok(Application {
            name: name.to_string(),
            repo_url: repo_url.to_string(),
            branch: branch.to_string(),
            path,
            cluster_name: cluster_name.to_string(),
            interval: interval.to_string(),
            polling_interval,
            last_synced_commit: String::new(),
            status: AppStatus::Pending,
            message: "Application registered, awaiting first sync.".to_string(),
            consecutive_failures: 0,
        })
    }
}

/// Validates an application name: DNS subdomain shape, at most 63
/// characters, alphanumeric at both ends, interior alphanumeric or `-`.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(Error::ValidationError(format!(
            "invalid name '{name}': must be a DNS subdomain of at most 63 characters, \
             starting and ending with an alphanumeric character"
        )))
    }
}

/// Validates that a string looks like a Git remote URL (SSH or HTTP(S)).
pub fn validate_git_url(url: &str) -> Result<()> {
    let ssh = (url.starts_with("git@") && url.contains(':')) || url.starts_with("ssh://");
    let http = url.starts_with("http://") || url.starts_with("https://");
    if ssh || http {
        Ok(())
    } else {
        Err(Error::ValidationError(format!(
            "invalid Git repository URL '{url}': expected an SSH (git@host:repo) or HTTP(S) URL"
        )))
    }
}

/// Strips leading/trailing separators from a repository subdirectory and
/// rejects paths that are empty afterwards.
pub fn normalize_path(path: &str) -> Result<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(Error::ValidationError(format!(
            "invalid manifests path '{path}': must name a directory inside the repository"
        )));
    }
    Ok(trimmed.to_string())
}

/// Parses a human-readable interval ("30s", "5m") and enforces the
/// [10 s, 24 h] bounds.
pub fn parse_interval(interval: &str) -> Result<Duration> {
    let parsed = humantime::parse_duration(interval).map_err(|e| {
        Error::ValidationError(format!("invalid polling interval '{interval}': {e}"))
    })?;
    if parsed < MIN_POLLING_INTERVAL || parsed > MAX_POLLING_INTERVAL {
        return Err(Error::ValidationError(format!(
            "invalid polling interval '{interval}': must be between {}s and 24h",
            MIN_POLLING_INTERVAL.as_secs()
        )));
    }
    Ok(parsed)
}

/// Name-keyed store of [`Application`] records.
#[derive(Default)]
pub struct Applications {
    inner: RwLock<HashMap<String, Application>>,
}

impl Applications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads applications from the given JSON file. An absent file yields an
    /// empty store; `polling_interval` is rebuilt from the stored `interval`.
    pub async fn load(path: &Path) -> Result<Self> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(Error::IoError(e)),
        };

        let records: Vec<Application> = serde_json::from_slice(&data)?;
        let mut map = HashMap::with_capacity(records.len());
        for mut app in records {
            app.polling_interval = parse_interval(&app.interval).map_err(|e| {
                Error::ConfigError(format!("invalid polling interval for app {}: {e}", app.name))
            })?;
            map.insert(app.name.clone(), app);
        }
        Ok(Self { inner: RwLock::new(map) })
    }

    /// Inserts or replaces a record.
    pub async fn insert(&self, app: Application) {
        self.inner.write().await.insert(app.name.clone(), app);
    }

    /// Returns a snapshot of the named record.
    pub async fn get(&self, name: &str) -> Option<Application> {
        self.inner.read().await.get(name).cloned()
    }

    /// Returns snapshots of all records, sorted by name.
    pub async fn list(&self) -> Vec<Application> {
        let guard = self.inner.read().await;
        let mut list: Vec<Application> = guard.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Removes and returns the named record.
    pub async fn remove(&self, name: &str) -> Option<Application> {
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

    /// Folds a worker's copy of an application back into the store and
    /// persists the registry, but only when `status`, `last_synced_commit`
    /// or `consecutive_failures` actually differ from the stored copy, or
    /// when the caller forces the write. Returns whether a write happened.
    ///
    /// A failed save is logged and swallowed: the controller keeps
    /// operating on in-memory state.
    pub async fn commit_status(&self, app: &Application, path: &Path, force: bool) -> bool {
        let mut guard = self.inner.write().await;
        let Some(stored) = guard.get_mut(&app.name) else {
            error!("Attempted to save status for unknown application '{}'", app.name);
            return false;
        };

        let changed = stored.status != app.status
            || stored.last_synced_commit != app.last_synced_commit
            || stored.consecutive_failures != app.consecutive_failures;
        if !force && !changed {
            debug!(
                "No significant change for application '{}', skipping save (status {}, failures {})",
                app.name, app.status, app.consecutive_failures
            );
            return false;
        }

        stored.status = app.status;
        stored.message = app.message.clone();
        stored.last_synced_commit = app.last_synced_commit.clone();
        stored.consecutive_failures = app.consecutive_failures;

        if let Err(e) = persist_locked(&guard, path).await {
            error!("Failed to save application registry to {}: {e}", path.display());
        } else {
            debug!("Application status saved: '{}' is {}", app.name, app.status);
        }
        true
    }
}

/// Serializes a locked application map, sorted by name for stable output.
async fn persist_locked(map: &HashMap<String, Application>, path: &Path) -> Result<()> {
    let mut list: Vec<&Application> = map.values().collect();
    list.sort_by(|a, b| a.name.cmp(&b.name));
    save_snapshot(list.into_iter(), path).await
}

/// Serializes a locked snapshot to `path`, creating the parent directory if
/// missing and writing via a temporary file followed by a rename.
pub(crate) async fn save_snapshot<'a, T, I>(records: I, path: &Path) -> Result<()>
where
    T: Serialize + 'a,
    I: Iterator<Item = &'a T>,
{
    let list: Vec<&T> = records.collect();
    let data = serde_json::to_vec_pretty(&list)?;

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            tokio::fs::create_dir_all(dir).await?;
        }
    }

    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &data).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        warn!("Failed to move registry file into place at {}: {e}", path.display());
        return Err(Error::IoError(e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_app(name: &str) -> Application {
        Application::new(
            name,
            "https://example.com/repo.git",
            "main",
            "k8s/prod",
            "c1",
            "30s",
        )
        .unwrap()
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("a1").is_ok());
        assert!(validate_name("my-app").is_ok());
        assert!(validate_name("a").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("-app").is_err());
        assert!(validate_name("app-").is_err());
        assert!(validate_name("my_app").is_err());
        assert!(validate_name(&"a".repeat(63)).is_ok());
        assert!(validate_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_validate_git_url() {
        assert!(validate_git_url("https://github.com/org/repo.git").is_ok());
        assert!(validate_git_url("http://git.local/repo").is_ok());
        assert!(validate_git_url("git@github.com:org/repo.git").is_ok());
        assert!(validate_git_url("ssh://git@host/repo.git").is_ok());
        assert!(validate_git_url("ftp://host/repo").is_err());
        assert!(validate_git_url("not a url").is_err());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("k8s/prod").unwrap(), "k8s/prod");
        assert_eq!(normalize_path("/k8s/prod/").unwrap(), "k8s/prod");
        assert!(normalize_path("/").is_err());
        assert!(normalize_path("").is_err());
    }

    #[test]
    fn test_parse_interval_bounds() {
        assert_eq!(parse_interval("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_interval("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_interval("10s").unwrap(), MIN_POLLING_INTERVAL);
        assert_eq!(parse_interval("24h").unwrap(), MAX_POLLING_INTERVAL);
        // below the floor, above the ceiling, unparseable
        assert!(parse_interval("5s").is_err());
        assert!(parse_interval("25h").is_err());
        assert!(parse_interval("soon").is_err());
    }

    #[test]
    fn test_status_wire_strings() {
        for (status, expected) in [
            (AppStatus::Pending, "\"Pending\""),
            (AppStatus::Synced, "\"Synced\""),
            (AppStatus::Error, "\"Error\""),
            (AppStatus::Stopped, "\"Stopped\""),
            (AppStatus::SyncRequested, "\"SyncRequested\""),
        ] {
            assert_eq!(serde_json::to_string(&status).unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_load_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let apps = Applications::load(&dir.path().join("applications.json"))
            .await
            .unwrap();
        assert!(apps.is_empty().await);
    }

    #[tokio::test]
    async fn test_save_load_roundtrip_rebuilds_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("applications.json");

        let apps = Applications::new();
        apps.insert(test_app("a1")).await;
        apps.save(&path).await.unwrap();

        let loaded = Applications::load(&path).await.unwrap();
        let a1 = loaded.get("a1").await.unwrap();
        assert_eq!(a1.repo_url, "https://example.com/repo.git");
        assert_eq!(a1.polling_interval, Duration::from_secs(30));
        assert_eq!(a1.status, AppStatus::Pending);
    }

    #[tokio::test]
    async fn test_load_ignores_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("applications.json");
        tokio::fs::write(
            &path,
            r#"[{"name":"a1","repoURL":"https://example.com/r.git","branch":"main",
                "path":"k8s","clusterName":"c1","interval":"30s",
                "lastSyncedGitHash":"abc123","futureField":42}]"#,
        )
        .await
        .unwrap();

        let loaded = Applications::load(&path).await.unwrap();
        let a1 = loaded.get("a1").await.unwrap();
        assert_eq!(a1.last_synced_commit, "abc123");
        assert_eq!(a1.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_commit_status_skips_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("applications.json");

        let apps = Applications::new();
        apps.insert(test_app("a1")).await;

        let mut copy = apps.get("a1").await.unwrap();
        copy.status = AppStatus::Synced;
        copy.last_synced_commit = "deadbeef".to_string();
        assert!(apps.commit_status(&copy, &path, false).await);
        assert!(path.exists());

        // Same status/commit/failures again: only the message differs, so no
        // write must happen.
        tokio::fs::remove_file(&path).await.unwrap();
        copy.message = "a different message".to_string();
        assert!(!apps.commit_status(&copy, &path, false).await);
        assert!(!path.exists());

        // A forced commit writes regardless.
        assert!(apps.commit_status(&copy, &path, true).await);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_commit_status_tracks_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("applications.json");

        let apps = Applications::new();
        apps.insert(test_app("a1")).await;

        let mut copy = apps.get("a1").await.unwrap();
        copy.status = AppStatus::Error;
        copy.consecutive_failures = 1;
        assert!(apps.commit_status(&copy, &path, false).await);

        // Failure count change alone is enough to trigger a write.
        copy.consecutive_failures = 2;
        assert!(apps.commit_status(&copy, &path, false).await);

        let loaded = Applications::load(&path).await.unwrap();
        assert_eq!(loaded.get("a1").await.unwrap().consecutive_failures, 2);
    }
}
