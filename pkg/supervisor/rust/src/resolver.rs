// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Artifact resolvers: where the latest artifact for a service lives and
//! what its fingerprint is. Resolvers never touch installed artifacts.

use crate::error::ResolveError;
use crate::service::{ArtifactRef, ServiceDescriptor};
use async_trait::async_trait;
use log::debug;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use walkdir::{DirEntry, WalkDir};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    /// A single file, or the root of a source tree when `entry` is set.
    pub path: PathBuf,
    /// File launched from inside the tree, relative to `path`.
    pub entry: Option<PathBuf>,
    pub fingerprint: String,
    /// The fingerprint is a hash of the bytes at `path`, so it can be
    /// recomputed over an installed copy.
    pub content_addressed: bool,
}

#[async_trait]
pub trait ArtifactResolver: Send + Sync {
    async fn resolve(&self, service: &str) -> Result<ResolvedArtifact, ResolveError>;
}

/// Hex SHA-256 of a file's contents.
pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Version-control metadata is neither hashed nor installed.
pub(crate) fn is_vcs_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_type().is_dir() && entry.file_name() == ".git"
}

/// Hex SHA-256 over a source tree: every regular file and symlink, in path
/// order, keyed by its path relative to `root`.
pub fn fingerprint_tree(root: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_vcs_dir(e));
    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            hasher.update(b"l\0");
            hasher.update(relative.as_os_str().as_bytes());
            hasher.update(b"\0");
            hasher.update(fs::read_link(entry.path())?.as_os_str().as_bytes());
        } else if file_type.is_file() {
            hasher.update(b"f\0");
            hasher.update(relative.as_os_str().as_bytes());
            hasher.update(b"\0");
            hasher.update(fingerprint_file(entry.path())?.as_bytes());
        }
        hasher.update(b"\0");
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Content hash of a file, or of a whole tree when `path` is a directory.
pub fn fingerprint_path(path: &Path) -> io::Result<String> {
    if fs::metadata(path)?.is_dir() {
        fingerprint_tree(path)
    } else {
        fingerprint_file(path)
    }
}

async fn hash_artifact(path: &Path) -> Result<String, ResolveError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || fingerprint_path(&owned))
        .await
        .map_err(|e| ResolveError::Unavailable(format!("hashing task failed: {e}")))?
        .map_err(|e| ResolveError::Unavailable(format!("{}: {e}", path.display())))
}

/// Artifact already placed on disk by an external fetcher (release archive,
/// package build output). Fingerprint is the content hash.
pub struct LocalFileResolver {
    path: PathBuf,
}

impl LocalFileResolver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ArtifactResolver for LocalFileResolver {
    async fn resolve(&self, service: &str) -> Result<ResolvedArtifact, ResolveError> {
        let fingerprint = hash_artifact(&self.path).await?;
        debug!("[{service}] {} has fingerprint {fingerprint}", self.path.display());
        Ok(ResolvedArtifact {
            path: self.path.clone(),
            entry: None,
            fingerprint,
            content_addressed: true,
        })
    }
}

/// Runs an acquisition command (download, build, repository checkout) and
/// then reports the artifact it produced.
pub struct CommandResolver {
    fetch: Vec<String>,
    path: PathBuf,
    entry: Option<PathBuf>,
    fingerprint: Option<Vec<String>>,
}

impl CommandResolver {
    pub fn new(fetch: Vec<String>, path: PathBuf, fingerprint: Option<Vec<String>>) -> Self {
        Self {
            fetch,
            path,
            entry: None,
            fingerprint,
        }
    }

    /// Treat `path` as a source tree launched through `entry`.
    pub fn with_entry(mut self, entry: Option<PathBuf>) -> Self {
        // `./src/app.py` and `src/app.py` name the same installed file.
        self.entry = entry.map(|e| {
            e.components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .collect()
        });
        self
    }

    fn check_produced(&self) -> Result<(), ResolveError> {
        let missing = |what: &Path| {
            ResolveError::Unavailable(format!("{} missing after fetch", what.display()))
        };
        match &self.entry {
            None if self.path.is_file() => Ok(()),
            None => Err(missing(&self.path)),
            Some(_) if !self.path.is_dir() => Err(missing(&self.path)),
            Some(entry) => {
                let launched = self.path.join(entry);
                if launched.is_file() {
                    Ok(())
                } else {
                    Err(missing(&launched))
                }
            }
        }
    }
}

async fn run_capture(service: &str, argv: &[String]) -> Result<String, ResolveError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| ResolveError::Unavailable("empty command".to_string()))?;
    debug!("[{service}] running {argv:?}");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ResolveError::Unavailable(format!("{program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ResolveError::Unavailable(format!(
            "{program} failed with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[async_trait]
impl ArtifactResolver for CommandResolver {
    async fn resolve(&self, service: &str) -> Result<ResolvedArtifact, ResolveError> {
        run_capture(service, &self.fetch).await?;
        self.check_produced()?;

        let fingerprint = match &self.fingerprint {
            Some(argv) => {
                let revision = run_capture(service, argv).await?;
                if revision.is_empty() {
                    return Err(ResolveError::Unavailable(
                        "fingerprint command printed nothing".to_string(),
                    ));
                }
                revision
            }
            None => hash_artifact(&self.path).await?,
        };

        Ok(ResolvedArtifact {
            path: self.path.clone(),
            entry: self.entry.clone(),
            fingerprint,
            content_addressed: self.fingerprint.is_none(),
        })
    }
}

/// Dispatches each service to the strategy named by its `artifact` entry.
#[derive(Default)]
pub struct StrategyResolver {
    strategies: HashMap<String, Box<dyn ArtifactResolver>>,
}

impl StrategyResolver {
    pub fn from_services(services: &[ServiceDescriptor]) -> Self {
        let mut resolver = Self::default();
        for svc in services {
            let strategy: Box<dyn ArtifactResolver> = match &svc.artifact {
                ArtifactRef::File { path } => Box::new(LocalFileResolver::new(path.clone())),
                ArtifactRef::Command {
                    fetch,
                    path,
                    entry,
                    fingerprint,
                } => Box::new(
                    CommandResolver::new(fetch.clone(), path.clone(), fingerprint.clone())
                        .with_entry(entry.clone()),
                ),
            };
            resolver.insert(&svc.name, strategy);
        }
        resolver
    }

    pub fn insert(&mut self, service: &str, strategy: Box<dyn ArtifactResolver>) {
        self.strategies.insert(service.to_string(), strategy);
    }
}

#[async_trait]
impl ArtifactResolver for StrategyResolver {
    async fn resolve(&self, service: &str) -> Result<ResolvedArtifact, ResolveError> {
        match self.strategies.get(service) {
            Some(strategy) => strategy.resolve(service).await,
            None => Err(ResolveError::UnknownService(service.to_string())),
        }
    }
}
