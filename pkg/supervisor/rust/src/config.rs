// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::service::{self, ArtifactRef, Fixup, RestartPolicy, ServiceDescriptor, UpdatePolicy};
use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/etc/dl-supervisor/supervisor.yaml";

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/dl-supervisor")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/dl-supervisor")
}

fn default_control_socket() -> PathBuf {
    PathBuf::from("/run/dl-supervisor.sock")
}

fn default_initial_delay() -> u64 {
    5
}

fn default_interval() -> u64 {
    300
}

fn default_resolve_timeout() -> u64 {
    120
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_backoff_base() -> f64 {
    1.0
}

fn default_backoff_max() -> f64 {
    60.0
}

fn default_stable_after() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// The daemon configuration file as written by operators.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,
    #[serde(default = "default_initial_delay")]
    pub reconcile_initial_delay_secs: u64,
    #[serde(default = "default_interval")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_secs: u64,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    #[serde(default)]
    pub on_update: UpdatePolicy,
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,
    pub artifact: ArtifactRef,
    pub interpreter: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: f64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: f64,
    #[serde(default = "default_stable_after")]
    pub stable_after_secs: u64,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    pub on_update: Option<UpdatePolicy>,
    pub stop_timeout_secs: Option<u64>,
    #[serde(default)]
    pub fixup: Fixup,
}

impl SupervisorConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.reconcile_initial_delay_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    /// Build the validated service table, applying daemon-wide defaults.
    pub fn descriptors(&self) -> Result<Vec<ServiceDescriptor>> {
        let services = self
            .services
            .iter()
            .map(|svc| self.descriptor(svc))
            .collect::<Result<Vec<_>>>()?;
        service::validate(&services).map_err(|e| anyhow!(e))?;
        Ok(services)
    }

    fn descriptor(&self, svc: &ServiceConfig) -> Result<ServiceDescriptor> {
        let secs = |key: &str, value: f64| {
            Duration::try_from_secs_f64(value)
                .with_context(|| format!("[{}] invalid {key}: {value}", svc.name))
        };
        Ok(ServiceDescriptor {
            name: svc.name.clone(),
            artifact: svc.artifact.clone(),
            interpreter: svc.interpreter.clone(),
            args: svc.args.clone(),
            env: svc.env.clone(),
            working_dir: svc.working_dir.clone(),
            restart: svc.restart,
            backoff_base: secs("backoff_base_secs", svc.backoff_base_secs)?,
            backoff_max: secs("backoff_max_secs", svc.backoff_max_secs)?,
            stable_after: Duration::from_secs(svc.stable_after_secs),
            depends_on: svc.depends_on.clone(),
            auto_start: svc.auto_start,
            on_update: svc.on_update.unwrap_or(self.on_update),
            stop_timeout: Duration::from_secs(svc.stop_timeout_secs.unwrap_or(self.stop_timeout_secs)),
            fixup: svc.fixup.clone(),
        })
    }
}

/// Daemon log level from `DL_SUP_LOG_LEVEL`, `info` when unset or invalid.
pub fn log_level() -> log::Level {
    std::env::var("DL_SUP_LOG_LEVEL")
        .ok()
        .and_then(|v| parse_log_level(&v))
        .unwrap_or(log::Level::Info)
}

fn parse_log_level(value: &str) -> Option<log::Level> {
    value.trim().parse().ok()
}

pub fn config_path() -> PathBuf {
    std::env::var("DL_SUP_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Parse the configuration file and build its service table.
pub fn load(path: &Path) -> Result<(SupervisorConfig, Vec<ServiceDescriptor>)> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config = parse(&contents).with_context(|| format!("parsing {}", path.display()))?;
    let services = config
        .descriptors()
        .with_context(|| format!("invalid service table in {}", path.display()))?;
    Ok((config, services))
}

fn parse(contents: &str) -> Result<SupervisorConfig> {
    let config: SupervisorConfig = serde_yaml::from_str(contents)?;
    if config.services.is_empty() {
        bail!("no services configured");
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, yaml: &str) -> PathBuf {
        let path = dir.join("supervisor.yaml");
        fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn test_parse_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
state_dir: /srv/sup
log_dir: /srv/sup/log
control_socket: /srv/sup/ctl.sock
reconcile_initial_delay_secs: 1
reconcile_interval_secs: 60
resolve_timeout_secs: 30
stop_timeout_secs: 4
on_update: wait
services:
  - name: modbus-datalogger
    artifact:
      kind: command
      fetch: [git, -C, /srv/src/datalogger, pull, --ff-only]
      path: /srv/src/datalogger
      entry: modules/modbus_datalogger/src/modbus.py
      fingerprint: [git, -C, /srv/src/datalogger, rev-parse, HEAD]
    interpreter: /usr/bin/python3
    args: ["--verbose"]
    env:
      PYTHONUNBUFFERED: "1"
    working_dir: /srv/src/datalogger
    restart: on-failure
    backoff_base_secs: 0.5
    backoff_max_secs: 20
    stable_after_secs: 10
    on_update: retire
    stop_timeout_secs: 2
  - name: publisher
    artifact:
      kind: file
      path: /srv/releases/publisher
    depends_on: [modbus-datalogger]
    auto_start: false
    fixup:
      loader: /opt/sysroot/lib/ld-linux-aarch64.so.1
"#;
        let (config, services) = load(&write(dir.path(), yaml)).unwrap();

        assert_eq!(config.state_dir, PathBuf::from("/srv/sup"));
        assert_eq!(config.control_socket, PathBuf::from("/srv/sup/ctl.sock"));
        assert_eq!(config.initial_delay(), Duration::from_secs(1));
        assert_eq!(config.interval(), Duration::from_secs(60));
        assert_eq!(config.resolve_timeout(), Duration::from_secs(30));

        let logger = &services[0];
        assert_eq!(logger.name, "modbus-datalogger");
        match &logger.artifact {
            ArtifactRef::Command {
                path,
                entry,
                fingerprint,
                ..
            } => {
                assert_eq!(path, &PathBuf::from("/srv/src/datalogger"));
                assert_eq!(
                    entry.as_deref(),
                    Some(Path::new("modules/modbus_datalogger/src/modbus.py"))
                );
                assert!(fingerprint.is_some());
            }
            other => panic!("unexpected artifact {other:?}"),
        }
        assert_eq!(logger.interpreter, Some(PathBuf::from("/usr/bin/python3")));
        assert_eq!(logger.env.get("PYTHONUNBUFFERED").unwrap(), "1");
        assert_eq!(logger.restart, RestartPolicy::OnFailure);
        assert_eq!(logger.backoff_base, Duration::from_millis(500));
        assert_eq!(logger.backoff_max, Duration::from_secs(20));
        assert_eq!(logger.stable_after, Duration::from_secs(10));
        assert_eq!(logger.on_update, UpdatePolicy::Retire);
        assert_eq!(logger.stop_timeout, Duration::from_secs(2));

        let publisher = &services[1];
        assert_eq!(publisher.depends_on, vec!["modbus-datalogger"]);
        assert!(!publisher.auto_start);
        assert_eq!(publisher.on_update, UpdatePolicy::Wait, "inherits top-level");
        assert_eq!(publisher.stop_timeout, Duration::from_secs(4));
        assert_eq!(
            publisher.fixup.loader.as_deref(),
            Some("/opt/sysroot/lib/ld-linux-aarch64.so.1")
        );
    }

    #[test]
    fn test_parse_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "services:\n  - name: a\n    artifact: {kind: file, path: /bin/a}\n";
        let (config, services) = load(&write(dir.path(), yaml)).unwrap();

        assert_eq!(config.state_dir, default_state_dir());
        assert_eq!(config.interval(), Duration::from_secs(300));
        assert_eq!(config.initial_delay(), Duration::from_secs(5));
        assert_eq!(config.on_update, UpdatePolicy::Retire);

        let svc = &services[0];
        assert_eq!(svc.restart, RestartPolicy::Always);
        assert_eq!(svc.backoff_base, Duration::from_secs(1));
        assert_eq!(svc.backoff_max, Duration::from_secs(60));
        assert_eq!(svc.stop_timeout, Duration::from_secs(10));
        assert!(svc.auto_start);
        assert!(svc.depends_on.is_empty());
        assert!(svc.interpreter.is_none());
    }

    #[test]
    fn test_missing_file_names_path() {
        let err = load(Path::new("/nonexistent/supervisor.yaml")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/supervisor.yaml"));
    }

    #[test]
    fn test_invalid_yaml() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&write(dir.path(), "services: [")).is_err());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "services:\n  - name: a\n    artifact: {kind: file, path: /a}\n    restrat: never\n";
        assert!(load(&write(dir.path(), yaml)).is_err());
    }

    #[test]
    fn test_unknown_artifact_kind_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "services:\n  - name: a\n    artifact: {kind: ftp, path: /a}\n";
        assert!(load(&write(dir.path(), yaml)).is_err());
    }

    #[test]
    fn test_empty_service_list_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&write(dir.path(), "services: []\n")).unwrap_err();
        assert!(format!("{err:#}").contains("no services"));
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
services:
  - name: a
    artifact: {kind: file, path: /a}
    depends_on: [b]
  - name: b
    artifact: {kind: file, path: /b}
    depends_on: [a]
"#;
        let err = load(&write(dir.path(), yaml)).unwrap_err();
        assert!(format!("{err:#}").contains("cycle"), "{err:#}");
    }

    #[test]
    fn test_negative_backoff_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "services:\n  - name: a\n    artifact: {kind: file, path: /a}\n    backoff_base_secs: -1\n";
        let err = load(&write(dir.path(), yaml)).unwrap_err();
        assert!(format!("{err:#}").contains("backoff_base_secs"), "{err:#}");
    }

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug"), Some(log::Level::Debug));
        assert_eq!(parse_log_level(" WARN "), Some(log::Level::Warn));
        assert_eq!(parse_log_level("chatty"), None);
    }

    #[test]
    fn test_demo_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/supervisor.yaml");
        let (_, services) = load(&path).unwrap();
        let names: Vec<&str> = services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["modbus-datalogger", "publisher"]);
        for svc in &services {
            let ArtifactRef::Command { entry, .. } = &svc.artifact else {
                panic!("[{}] expected a checkout", svc.name);
            };
            let entry = entry.as_ref().unwrap();
            assert!(entry.starts_with("modules/modbus_datalogger/src"), "{entry:?}");
        }
    }
}
