// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::DeployError;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

/// Per-deployment directory layout under `state_dir`.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, service: &str) -> PathBuf {
        self.root.join("artifacts").join(service)
    }

    /// Installed generations of a service deployed as a source tree.
    pub fn tree_root(&self, service: &str) -> PathBuf {
        self.root.join("trees").join(service)
    }

    pub fn state_path(&self, service: &str) -> PathBuf {
        self.root.join("state").join(format!("{service}.json"))
    }

    pub fn pid_path(&self, service: &str) -> PathBuf {
        self.root.join("run").join(format!("{service}.pid"))
    }

    pub fn staging_root(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn create_all(&self) -> std::io::Result<()> {
        for sub in ["artifacts", "trees", "state", "run", "staging"] {
            fs::create_dir_all(self.root.join(sub))?;
        }
        Ok(())
    }
}

/// What is installed for one service. Instances are never mutated in place:
/// a new value is built and published whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactState {
    pub installed_path: PathBuf,
    pub installed_fingerprint: String,
    #[serde(skip)]
    pub last_checked_at: Option<SystemTime>,
}

/// Result of one reconciliation pass for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Unchanged,
    Installed(String),
    Failed(String),
}

/// Installed artifact per service. Written only by the deployment
/// controller, read by supervisors at launch time.
#[derive(Debug, Default)]
pub struct ArtifactTable {
    entries: RwLock<HashMap<String, Arc<ArtifactState>>>,
}

impl ArtifactTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the persisted state of every named service. Missing or
    /// unreadable records simply mean "nothing installed yet".
    pub fn load<'a>(dir: &StateDir, services: impl IntoIterator<Item = &'a str>) -> Self {
        let table = Self::new();
        for name in services {
            match read_state(&dir.state_path(name)) {
                Ok(Some(state)) => {
                    debug!(
                        "[{name}] restored installed fingerprint {}",
                        state.installed_fingerprint
                    );
                    table.publish(name, state);
                }
                Ok(None) => {}
                Err(e) => warn!("[{name}] ignoring unreadable artifact state: {e:#}"),
            }
        }
        table
    }

    pub fn get(&self, service: &str) -> Option<Arc<ArtifactState>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(service)
            .cloned()
    }

    pub fn publish(&self, service: &str, state: ArtifactState) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(service.to_string(), Arc::new(state));
    }
}

fn read_state(path: &Path) -> anyhow::Result<Option<ArtifactState>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&contents)?))
}

/// Write the state record next to its final location, then rename it over.
pub fn persist_state(path: &Path, state: &ArtifactState) -> Result<(), DeployError> {
    let persist_err = |source: std::io::Error| DeployError::Persist {
        path: path.to_path_buf(),
        source,
    };
    let dir = path
        .parent()
        .ok_or_else(|| persist_err(std::io::Error::from(ErrorKind::InvalidInput)))?;
    fs::create_dir_all(dir).map_err(persist_err)?;

    let body = serde_json::to_vec_pretty(state).map_err(|e| persist_err(e.into()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(persist_err)?;
    tmp.write_all(&body).map_err(persist_err)?;
    tmp.as_file().sync_all().map_err(persist_err)?;
    tmp.persist(path).map_err(|e| persist_err(e.error))?;
    Ok(())
}
