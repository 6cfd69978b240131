// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::artifact::{ArtifactState, ArtifactTable, StateDir, UpdateOutcome, persist_state};
use crate::error::{DeployError, ResolveError};
use crate::fixup;
use crate::resolver::{ArtifactResolver, fingerprint_file, fingerprint_tree, is_vcs_dir};
use crate::service::{Fixup, ServiceDescriptor};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::time::timeout;
use walkdir::WalkDir;

/// Converges the installed artifact of each service with what its resolver
/// reports. An install is all-or-nothing: the artifact is staged, fixed up
/// and synced in a private staging directory, then renamed into place.
/// A running instance keeps its own image, and a tree deployment keeps the
/// generation it was launched from.
pub struct DeploymentController {
    dir: StateDir,
    table: Arc<ArtifactTable>,
    resolver: Arc<dyn ArtifactResolver>,
    resolve_timeout: Duration,
    install_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeploymentController {
    pub fn new(
        dir: StateDir,
        table: Arc<ArtifactTable>,
        resolver: Arc<dyn ArtifactResolver>,
        resolve_timeout: Duration,
    ) -> Self {
        Self {
            dir,
            table,
            resolver,
            resolve_timeout,
            install_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn table(&self) -> &Arc<ArtifactTable> {
        &self.table
    }

    fn install_lock(&self, service: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.install_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(service.to_string())
            .or_default()
            .clone()
    }

    pub async fn reconcile(&self, service: &ServiceDescriptor) -> UpdateOutcome {
        let name = service.name.as_str();
        let lock = self.install_lock(name);
        let _guard = lock.lock().await;

        let resolved = match timeout(self.resolve_timeout, self.resolver.resolve(name)).await {
            Ok(Ok(resolved)) => resolved,
            Ok(Err(e)) => return UpdateOutcome::Failed(e.to_string()),
            Err(_) => {
                return UpdateOutcome::Failed(
                    ResolveError::Timeout(self.resolve_timeout).to_string(),
                );
            }
        };

        let now = SystemTime::now();
        let current = self.table.get(name);
        if let Some(current) = &current
            && current.installed_fingerprint == resolved.fingerprint
            && resolved
                .entry
                .as_ref()
                .is_none_or(|entry| current.installed_path.ends_with(entry))
        {
            if current.installed_path.is_file() {
                let mut checked = ArtifactState::clone(current);
                checked.last_checked_at = Some(now);
                self.table.publish(name, checked);
                debug!("[{name}] artifact unchanged ({})", resolved.fingerprint);
                return UpdateOutcome::Unchanged;
            }
            warn!(
                "[{name}] installed artifact {} is missing, reinstalling",
                current.installed_path.display()
            );
        }

        let job = Install {
            service: name.to_string(),
            source: resolved.path.clone(),
            staging_root: self.dir.staging_root(),
            fixup: service.fixup.clone(),
            rehash: resolved.content_addressed,
        };
        let target = match resolved.entry.clone() {
            None => Target::File(self.dir.artifact_path(name)),
            Some(entry) => {
                let root = self.dir.tree_root(name);
                let previous = current
                    .as_ref()
                    .and_then(|c| generation_of(&c.installed_path, &root));
                Target::Tree {
                    root,
                    entry,
                    previous,
                }
            }
        };
        let staged = tokio::task::spawn_blocking(move || match target {
            Target::File(path) => install_file(&job, &path),
            Target::Tree {
                root,
                entry,
                previous,
            } => install_tree(&job, &root, &entry, previous.as_deref()),
        })
        .await;

        let installed = match staged {
            Ok(Ok(installed)) => installed,
            Ok(Err(e)) => return UpdateOutcome::Failed(e.to_string()),
            Err(e) => return UpdateOutcome::Failed(format!("install task failed: {e}")),
        };

        let fingerprint = match installed.fingerprint {
            Some(staged) if staged != resolved.fingerprint => {
                debug!(
                    "[{name}] {} changed while staging, recording {staged}",
                    resolved.path.display()
                );
                staged
            }
            _ => resolved.fingerprint,
        };
        let state = ArtifactState {
            installed_path: installed.path,
            installed_fingerprint: fingerprint.clone(),
            last_checked_at: Some(now),
        };
        // The new bytes are already in place, so the table follows the disk
        // even if the record cannot be written; a restart re-stages once.
        if let Err(e) = persist_state(&self.dir.state_path(name), &state) {
            warn!("[{name}] {e}");
        }
        self.table.publish(name, state);
        info!("[{name}] installed {fingerprint}");
        UpdateOutcome::Installed(fingerprint)
    }
}

/// What one install copies and how it prepares the copy.
struct Install {
    service: String,
    source: PathBuf,
    staging_root: PathBuf,
    fixup: Fixup,
    /// Hash the staged bytes, which is what ends up installed, rather than
    /// trusting a hash taken from a source that may have moved on since.
    rehash: bool,
}

enum Target {
    /// A single file renamed over `artifacts/<name>`.
    File(PathBuf),
    /// A whole tree installed as a fresh generation under `root`. The
    /// generation the current instance runs from is kept.
    Tree {
        root: PathBuf,
        entry: PathBuf,
        previous: Option<PathBuf>,
    },
}

struct Installed {
    /// The file to launch.
    path: PathBuf,
    fingerprint: Option<String>,
}

fn stage_err(path: &Path) -> impl FnOnce(std::io::Error) -> DeployError + use<> {
    let path = path.to_path_buf();
    move |source| DeployError::Stage { path, source }
}

impl Install {
    fn staging_dir(&self) -> Result<tempfile::TempDir, DeployError> {
        fs::create_dir_all(&self.staging_root).map_err(stage_err(&self.staging_root))?;
        tempfile::Builder::new()
            .prefix(&format!("{}-", self.service))
            .tempdir_in(&self.staging_root)
            .map_err(stage_err(&self.staging_root))
    }
}

/// Copy the source file into a fresh staging directory, apply fix-ups, sync,
/// and rename into `target`. On any error `target` is untouched and the
/// staging directory is removed.
fn install_file(job: &Install, target: &Path) -> Result<Installed, DeployError> {
    let staging = job.staging_dir()?;
    let staged = staging.path().join(&job.service);

    copy_file(&job.source, &staged)?;
    let fingerprint = if job.rehash {
        Some(fingerprint_file(&staged).map_err(stage_err(&staged))?)
    } else {
        None
    };
    fixup::apply(&job.service, &staged, &job.fixup)?;
    sync_file(&staged)?;

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(stage_err(parent))?;
    }
    fs::rename(&staged, target).map_err(stage_err(target))?;
    if let Some(parent) = target.parent() {
        sync_dir(parent);
    }
    Ok(Installed {
        path: target.to_path_buf(),
        fingerprint,
    })
}

/// Copy the source tree into staging, fix up the entry file, then rename the
/// whole tree into a new generation directory. Earlier generations other
/// than `previous` are removed once the new one is in place.
fn install_tree(
    job: &Install,
    root: &Path,
    entry: &Path,
    previous: Option<&Path>,
) -> Result<Installed, DeployError> {
    let staging = job.staging_dir()?;
    let tree = staging.path().join("tree");

    copy_tree(&job.source, &tree)?;
    let fingerprint = if job.rehash {
        Some(fingerprint_tree(&tree).map_err(stage_err(&tree))?)
    } else {
        None
    };
    let launched = tree.join(entry);
    if !launched.is_file() {
        return Err(DeployError::Stage {
            path: launched,
            source: std::io::Error::from(ErrorKind::NotFound),
        });
    }
    fixup::apply(&job.service, &launched, &job.fixup)?;
    sync_file(&launched)?;

    let Some(name) = staging.path().file_name() else {
        return Err(DeployError::Stage {
            path: staging.path().to_path_buf(),
            source: std::io::Error::from(ErrorKind::InvalidInput),
        });
    };
    let generation = root.join(name);
    fs::create_dir_all(root).map_err(stage_err(root))?;
    fs::rename(&tree, &generation).map_err(stage_err(&generation))?;
    sync_dir(root);

    prune_generations(&job.service, root, &generation, previous);
    Ok(Installed {
        path: generation.join(entry),
        fingerprint,
    })
}

/// The generation directory under `root` that `installed` lives in.
fn generation_of(installed: &Path, root: &Path) -> Option<PathBuf> {
    let relative = installed.strip_prefix(root).ok()?;
    let first = relative.components().next()?;
    Some(root.join(first))
}

fn prune_generations(service: &str, root: &Path, current: &Path, previous: Option<&Path>) {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("[{service}] cannot list {}: {e}", root.display());
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path == current || previous == Some(path.as_path()) {
            continue;
        }
        match fs::remove_dir_all(&path) {
            Ok(()) => debug!("[{service}] removed old generation {}", path.display()),
            Err(e) => warn!("[{service}] failed to remove {}: {e}", path.display()),
        }
    }
}

fn copy_file(from: &Path, to: &Path) -> Result<(), DeployError> {
    let copied = fs::copy(from, to).map_err(stage_err(from))?;
    let expected = fs::metadata(from).map_err(stage_err(from))?.len();
    if copied != expected {
        return Err(DeployError::Stage {
            path: to.to_path_buf(),
            source: std::io::Error::other(format!(
                "short copy: {copied} of {expected} bytes"
            )),
        });
    }
    Ok(())
}

fn copy_tree(source: &Path, dest: &Path) -> Result<(), DeployError> {
    let walker = WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_vcs_dir(e));
    for entry in walker {
        let entry = entry.map_err(|e| DeployError::Stage {
            path: source.to_path_buf(),
            source: e.into(),
        })?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let to = dest.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&to).map_err(stage_err(&to))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).map_err(stage_err(entry.path()))?;
            symlink(&link, &to).map_err(stage_err(&to))?;
        } else if file_type.is_file() {
            copy_file(entry.path(), &to)?;
            sync_file(&to)?;
        }
    }
    Ok(())
}

fn sync_file(path: &Path) -> Result<(), DeployError> {
    File::open(path)
        .and_then(|f| f.sync_all())
        .map_err(stage_err(path))
}

fn sync_dir(dir: &Path) {
    if let Ok(dir) = File::open(dir) {
        let _ = dir.sync_all();
    }
}
