//! Manifest application: decode multi-document YAML files and create or
//! update the resources they describe through the dynamic API.
//!
//! The applier never aborts on a single failure; every defective document
//! is recorded and the walk continues, so one sync pass surfaces all
//! problems at once.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kube::api::{Api, DynamicObject, GroupVersionKind, PostParams};
use kube::discovery::{self, Scope};
use thiserror::Error;
use tracing::{debug, info, warn};

/// One per-document (or per-file) failure during an apply pass.
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("filesystem error walking {}: {}", .path.display(), .source)]
    Walk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read file {}: {}", .path.display(), .source)]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode YAML from {} (doc {}): {}", .path.display(), .index, .message)]
    Decode {
        path: PathBuf,
        index: usize,
        message: String,
    },

    #[error("skipping unnamed resource in {} (doc {}) of kind {}", .path.display(), .index, .kind)]
    UnnamedResource {
        path: PathBuf,
        index: usize,
        kind: String,
    },

    #[error("failed to resolve API mapping for {} in {}: {}", .gvk, .path.display(), .message)]
    Mapping {
        gvk: String,
        path: PathBuf,
        message: String,
    },

    #[error("failed to create {} {}/{} from {}: {}", .kind, .namespace, .name, .path.display(), .source)]
    Create {
        kind: String,
        namespace: String,
        name: String,
        path: PathBuf,
        #[source]
        source: kube::Error,
    },

    #[error("failed to update {} {}/{} from {}: {}", .kind, .namespace, .name, .path.display(), .source)]
    Update {
        kind: String,
        namespace: String,
        name: String,
        path: PathBuf,
        #[source]
        source: kube::Error,
    },

    #[error("apply operation timed out after {}s", .after.as_secs())]
    Timeout { after: Duration },
}

enum AppliedAction {
    Created,
    Updated,
}

/// Applies every `.yaml`/`.yml` file under `dir` and returns the
/// accumulated errors (empty on full success).
pub async fn apply_manifests(client: &kube::Client, dir: &Path) -> Vec<ApplyError> {
    info!("Applying manifests from {}", dir.display());
    let mut errors = Vec::new();

    for file in collect_manifest_files(dir, &mut errors) {
        debug!("Processing manifest file {}", file.display());
        let text = match tokio::fs::read_to_string(&file).await {
            Ok(text) => text,
            Err(e) => {
                errors.push(ApplyError::Read { path: file, source: e });
                continue;
            }
        };

        for (index, document) in split_documents(&text).into_iter().enumerate() {
            match apply_document(client, &document, &file, index).await {
                Ok((action, kind, namespace, name)) => {
                    let verb = match action {
                        AppliedAction::Created => "Created",
                        AppliedAction::Updated => "Updated",
                    };
                    info!("{verb} resource {kind} {namespace}/{name}");
                }
                Err(e) => {
                    warn!("Manifest apply error: {e}");
                    errors.push(e);
                }
            }
        }
    }

    errors
}

/// Recursively collects manifest files under `root`, sorted for stable
/// ordering. Walk failures for single entries are recorded and skipped.
fn collect_manifest_files(root: &Path, errors: &mut Vec<ApplyError>) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                errors.push(ApplyError::Walk { path: dir, source: e });
                continue;
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    errors.push(ApplyError::Walk { path: dir.clone(), source: e });
                    continue;
                }
            };
            let path = entry.path();
            match entry.file_type() {
                Ok(file_type) if file_type.is_dir() => pending.push(path),
                Ok(_) => {
                    let is_manifest = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.ends_with(".yaml") || n.ends_with(".yml"));
                    if is_manifest {
                        files.push(path);
                    }
                }
                Err(e) => errors.push(ApplyError::Walk { path, source: e }),
            }
        }
    }

    files.sort();
    files
}

/// Splits multi-document YAML on separator lines, trimming each document
/// and dropping empty ones.
fn split_documents(text: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.trim_end() == "---" {
            documents.push(std::mem::take(&mut current));
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    documents.push(current);

    documents
        .into_iter()
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .collect()
}

/// Decodes one document and performs the get-then-create-or-update round
/// trip. Returns what happened for logging, or the per-document error.
async fn apply_document(
    client: &kube::Client,
    document: &str,
    path: &Path,
    index: usize,
) -> Result<(AppliedAction, String, String, String), ApplyError> {
    let mut object: DynamicObject =
        serde_yaml::from_str(document).map_err(|e| ApplyError::Decode {
            path: path.to_path_buf(),
            index,
            message: e.to_string(),
        })?;

    let types = object.types.clone().ok_or_else(|| ApplyError::Decode {
        path: path.to_path_buf(),
        index,
        message: "document has no apiVersion/kind".to_string(),
    })?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };
    let gvk = GroupVersionKind::gvk(group, version, &types.kind);

    let name = match object.metadata.name.clone() {
        Some(name) if !name.is_empty() => name,
        _ => {
            return Err(ApplyError::UnnamedResource {
                path: path.to_path_buf(),
                index,
                kind: types.kind,
            })
        }
    };

    let (api_resource, capabilities) = discovery::oneshot::pinned_kind(client, &gvk)
        .await
        .map_err(|e| ApplyError::Mapping {
            gvk: format!("{}/{}, Kind={}", gvk.group, gvk.version, gvk.kind),
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    let (api, namespace): (Api<DynamicObject>, String) =
        if matches!(capabilities.scope, Scope::Namespaced) {
            let namespace = match object.metadata.namespace.clone() {
                Some(ns) if !ns.is_empty() => ns,
                _ => {
                    debug!(
                        "Namespace not specified for namespaced resource {} '{}', defaulting to 'default'",
                        types.kind, name
                    );
                    "default".to_string()
                }
            };
            object.metadata.namespace = Some(namespace.clone());
            (
                Api::namespaced_with(client.clone(), &namespace, &api_resource),
                namespace,
            )
        } else {
            (Api::all_with(client.clone(), &api_resource), String::new())
        };

    // Get-then-create-or-update: any read failure is treated as "absent".
    // This tolerates the benign race of concurrent creation at the cost of
    // occasionally attempting a doomed create.
    match api.get(&name).await {
        Ok(existing) => {
            object.metadata.resource_version = existing.metadata.resource_version.clone();
            api.replace(&name, &PostParams::default(), &object)
                .await
                .map_err(|e| ApplyError::Update {
                    kind: types.kind.clone(),
                    namespace: namespace.clone(),
                    name: name.clone(),
                    path: path.to_path_buf(),
                    source: e,
                })?;
            Ok((AppliedAction::Updated, types.kind, namespace, name))
        }
        Err(_) => {
            api.create(&PostParams::default(), &object)
                .await
                .map_err(|e| ApplyError::Create {
                    kind: types.kind.clone(),
                    namespace: namespace.clone(),
                    name: name.clone(),
                    path: path.to_path_buf(),
                    source: e,
                })?;
            Ok((AppliedAction::Created, types.kind, namespace, name))
        }
    }
}
