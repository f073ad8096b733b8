//! Git repository resolution.
//!
//! The controller only needs one capability from Git: materialize the
//! current tree of `branch` on `repo_url` into a local working directory
//! and report the commit id it corresponds to. [`RepoResolver`] is that
//! contract; [`GitResolver`] implements it with libgit2, cloning on first
//! use and fetch + hard-reset afterwards.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};

/// Errors from resolving a remote repository into a working directory.
#[derive(Error, Debug)]
pub enum GitError {
    #[error("failed to open repository at {}: {}", .0.display(), .1)]
    Open(PathBuf, #[source] git2::Error),

    #[error("failed to clone repository {0}: {1}")]
    Clone(String, #[source] git2::Error),

    #[error("failed to fetch from origin: {0}")]
    Fetch(#[source] git2::Error),

    #[error("remote branch '{0}' not found: {1}")]
    RemoteBranch(String, #[source] git2::Error),

    #[error("failed to check out fetched tree: {0}")]
    Checkout(#[source] git2::Error),

    #[error("failed to resolve HEAD after Git operation: {0}")]
    Head(#[source] git2::Error),

    #[error("git task aborted before completion")]
    Aborted,
}

/// Resolves a remote reference into a local working directory.
///
/// On success the directory contains the fully materialized tree of the
/// returned commit id. Authentication is the resolver's concern.
#[async_trait]
pub trait RepoResolver: Send + Sync {
    async fn resolve(
        &self,
        repo_url: &str,
        branch: &str,
        target_dir: &Path,
    ) -> Result<String, GitError>;
}

/// libgit2-backed resolver. SSH remotes authenticate through the ssh-agent;
/// HTTP(S) remotes are accessed anonymously.
pub struct GitResolver;

#[async_trait]
impl RepoResolver for GitResolver {
    async fn resolve(
        &self,
        repo_url: &str,
        branch: &str,
        target_dir: &Path,
    ) -> Result<String, GitError> {
        let repo_url = repo_url.to_string();
        let branch = branch.to_string();
        let target_dir = target_dir.to_path_buf();

        // libgit2 is blocking; keep it off the runtime's worker threads.
        tokio::task::spawn_blocking(move || clone_or_pull(&repo_url, &branch, &target_dir))
            .await
            .map_err(|_| GitError::Aborted)?
    }
}

/// Clones the repository if `target_dir` does not hold one yet, otherwise
/// fetches and hard-resets to `origin/<branch>`. Returns the HEAD commit id.
fn clone_or_pull(repo_url: &str, branch: &str, target_dir: &Path) -> Result<String, GitError> {
    let repo = match git2::Repository::open(target_dir) {
        Ok(repo) => {
            debug!(
                "Pulling repository {} (branch {}) into {}",
                repo_url,
                branch,
                target_dir.display()
            );
            fetch_and_reset(&repo, repo_url, branch)?;
            repo
        }
        Err(e) if e.code() == git2::ErrorCode::NotFound => {
            info!(
                "Cloning repository {} (branch {}) into {}",
                repo_url,
                branch,
                target_dir.display()
            );
            clone_repo(repo_url, branch, target_dir)?
        }
        Err(e) => return Err(GitError::Open(target_dir.to_path_buf(), e)),
    };

    let head = repo
        .head()
        .and_then(|h| h.peel_to_commit())
        .map_err(GitError::Head)?;
    Ok(head.id().to_string())
}

fn clone_repo(repo_url: &str, branch: &str, target_dir: &Path) -> Result<git2::Repository, GitError> {
    let mut builder = git2::build::RepoBuilder::new();
    builder.branch(branch);
    builder.fetch_options(fetch_options(repo_url));
    builder
        .clone(repo_url, target_dir)
        .map_err(|e| GitError::Clone(repo_url.to_string(), e))
}

fn fetch_and_reset(repo: &git2::Repository, repo_url: &str, branch: &str) -> Result<(), GitError> {
    let mut remote = repo.find_remote("origin").map_err(GitError::Fetch)?;
    let mut options = fetch_options(repo_url);
    remote
        .fetch(&[branch], Some(&mut options), None)
        .map_err(GitError::Fetch)?;
    drop(remote);

    let remote_ref = format!("refs/remotes/origin/{branch}");
    let commit_id = repo
        .find_reference(&remote_ref)
        .and_then(|r| r.peel_to_commit())
        .map_err(|e| GitError::RemoteBranch(branch.to_string(), e))?
        .id();

    // Fast-forward the local branch and force the worktree to match. Local
    // state is disposable; the remote is the source of truth.
    let local_ref = format!("refs/heads/{branch}");
    repo.reference(&local_ref, commit_id, true, "gitopsctl: fast-forward")
        .map_err(GitError::Checkout)?;
    repo.set_head(&local_ref).map_err(GitError::Checkout)?;
    let mut checkout = git2::build::CheckoutBuilder::new();
    checkout.force();
    repo.checkout_head(Some(&mut checkout))
        .map_err(GitError::Checkout)?;
    Ok(())
}

fn fetch_options(repo_url: &str) -> git2::FetchOptions<'static> {
    let mut callbacks = git2::RemoteCallbacks::new();
    if repo_url.starts_with("git@") || repo_url.starts_with("ssh://") {
        callbacks.credentials(|_url, username_from_url, _allowed| {
            git2::Cred::ssh_key_from_agent(username_from_url.unwrap_or("git"))
        });
    }
    let mut options = git2::FetchOptions::new();
    options.remote_callbacks(callbacks);
    options
}

/// Creates an isolated working directory for one reconciler. The directory
/// is removed when the returned handle is dropped, on every exit path.
pub fn create_workdir() -> crate::Result<TempDir> {
    let dir = tempfile::Builder::new()
        .prefix("gitopsctl-repo-")
        .tempdir()?;
    Ok(dir)
}
