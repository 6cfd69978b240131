// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// When a service is relaunched after its process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    Never,
}

impl RestartPolicy {
    /// `exit_code` is `None` when the process was killed by a signal or
    /// could not be launched, both of which count as failures.
    pub fn should_restart(self, exit_code: Option<i32>) -> bool {
        match self {
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure => exit_code != Some(0),
            RestartPolicy::Never => false,
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::OnFailure => write!(f, "on-failure"),
            RestartPolicy::Never => write!(f, "never"),
        }
    }
}

/// What the scheduler does with a running instance once a new artifact is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdatePolicy {
    /// Gracefully terminate the running instance so the relaunch picks up the new artifact.
    #[default]
    Retire,
    /// Leave the running instance alone; the next natural relaunch uses the new artifact.
    Wait,
}

/// Opaque handle the artifact resolver understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactRef {
    /// A pre-built artifact dropped on disk by an external fetcher.
    File { path: PathBuf },
    /// Run `fetch` (download, build, `git pull`, ...) and take the artifact at `path`.
    /// The fingerprint is the stdout of `fingerprint` when set, otherwise a content hash.
    ///
    /// With `entry`, `path` is a source tree that is installed as a whole and
    /// `entry` (relative to it) is the file that gets launched, so modules
    /// next to the entry point stay importable.
    Command {
        fetch: Vec<String>,
        path: PathBuf,
        #[serde(default)]
        entry: Option<PathBuf>,
        #[serde(default)]
        fingerprint: Option<Vec<String>>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fixup {
    /// ELF program interpreter to write into the staged binary.
    #[serde(default)]
    pub loader: Option<String>,
}

/// Static description of one supervised service. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub artifact: ArtifactRef,
    pub interpreter: Option<PathBuf>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub restart: RestartPolicy,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub stable_after: Duration,
    pub depends_on: Vec<String>,
    pub auto_start: bool,
    pub on_update: UpdatePolicy,
    pub stop_timeout: Duration,
    pub fixup: Fixup,
}

impl ServiceDescriptor {
    /// A descriptor with default tunables, mostly useful to build test tables.
    pub fn new(name: impl Into<String>, artifact: ArtifactRef) -> Self {
        Self {
            name: name.into(),
            artifact,
            interpreter: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            restart: RestartPolicy::default(),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            stable_after: Duration::from_secs(30),
            depends_on: Vec::new(),
            auto_start: true,
            on_update: UpdatePolicy::default(),
            stop_timeout: Duration::from_secs(10),
            fixup: Fixup::default(),
        }
    }

    /// Delay before the next launch after `consecutive_failures` failed generations.
    pub fn backoff_delay(&self, consecutive_failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(consecutive_failures.min(31));
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

/// Check a service table for duplicate names, dangling or cyclic
/// dependencies and nonsensical tunables.
pub fn validate(services: &[ServiceDescriptor]) -> Result<(), String> {
    let mut names = HashSet::new();
    for svc in services {
        if svc.name.is_empty()
            || !svc
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(format!("invalid service name '{}'", svc.name));
        }
        if !names.insert(svc.name.as_str()) {
            return Err(format!("duplicate service name '{}'", svc.name));
        }
        if let ArtifactRef::Command {
            fetch,
            entry,
            fingerprint,
            ..
        } = &svc.artifact
        {
            if fetch.is_empty() {
                return Err(format!("[{}] artifact fetch command is empty", svc.name));
            }
            if fingerprint.as_ref().is_some_and(Vec::is_empty) {
                return Err(format!("[{}] fingerprint command is empty", svc.name));
            }
            if let Some(entry) = entry
                && !is_contained(entry)
            {
                return Err(format!(
                    "[{}] artifact entry {} must be a relative path inside the tree",
                    svc.name,
                    entry.display()
                ));
            }
        }
        if svc.backoff_base.is_zero() {
            return Err(format!("[{}] backoff_base_secs must be > 0", svc.name));
        }
        if svc.backoff_max < svc.backoff_base {
            return Err(format!(
                "[{}] backoff_max_secs must be >= backoff_base_secs",
                svc.name
            ));
        }
    }

    for svc in services {
        for dep in &svc.depends_on {
            if dep == &svc.name {
                return Err(format!("[{}] depends on itself", svc.name));
            }
            if !names.contains(dep.as_str()) {
                return Err(format!("[{}] depends on unknown service '{dep}'", svc.name));
            }
        }
    }

    start_order(services).map(|_| ())
}

fn is_contained(entry: &Path) -> bool {
    entry.file_name().is_some()
        && entry
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Order services so that every service comes after its dependencies.
/// Ties keep configuration order.
pub fn start_order(services: &[ServiceDescriptor]) -> Result<Vec<&ServiceDescriptor>, String> {
    let by_name: HashMap<&str, &ServiceDescriptor> =
        services.iter().map(|s| (s.name.as_str(), s)).collect();
    let mut ordered = Vec::with_capacity(services.len());
    let mut done: HashSet<&str> = HashSet::new();
    let mut visiting: HashSet<&str> = HashSet::new();

    fn visit<'a>(
        svc: &'a ServiceDescriptor,
        by_name: &HashMap<&str, &'a ServiceDescriptor>,
        done: &mut HashSet<&'a str>,
        visiting: &mut HashSet<&'a str>,
        ordered: &mut Vec<&'a ServiceDescriptor>,
    ) -> Result<(), String> {
        if done.contains(svc.name.as_str()) {
            return Ok(());
        }
        if !visiting.insert(svc.name.as_str()) {
            return Err(format!("dependency cycle through '{}'", svc.name));
        }
        for dep in &svc.depends_on {
            if let Some(d) = by_name.get(dep.as_str()) {
                visit(d, by_name, done, visiting, ordered)?;
            }
        }
        visiting.remove(svc.name.as_str());
        done.insert(svc.name.as_str());
        ordered.push(svc);
        Ok(())
    }

    for svc in services {
        visit(svc, &by_name, &mut done, &mut visiting, &mut ordered)?;
    }
    Ok(ordered)
}
