// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::ExitStatus;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Stale-process guard and spawn in progress.
    Starting,
    /// Child process is alive.
    Running,
    /// Child has exited or was asked to terminate and is being reaped.
    Exiting,
    /// Waiting out a restart delay, or waiting for dependencies.
    Backoff,
    /// Not running and not scheduled to run.
    Stopped,
}

impl ProcessState {
    pub(crate) fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Backoff)
                | (Starting, Stopped)
                | (Running, Exiting)
                | (Exiting, Backoff)
                | (Exiting, Stopped)
                | (Backoff, Starting)
                | (Backoff, Stopped)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exiting => write!(f, "exiting"),
            ProcessState::Backoff => write!(f, "backoff"),
            ProcessState::Stopped => write!(f, "stopped"),
        }
    }
}

/// How a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    CleanExit,
    CrashExit(i32),
    Signaled(i32),
    LaunchFailed,
}

impl ExitKind {
    pub fn from_status(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match status.code() {
            Some(0) => ExitKind::CleanExit,
            Some(code) => ExitKind::CrashExit(code),
            None => ExitKind::Signaled(status.signal().unwrap_or(0)),
        }
    }

    /// Exit code as seen by restart policies; signals and launch failures have none.
    pub fn code(self) -> Option<i32> {
        match self {
            ExitKind::CleanExit => Some(0),
            ExitKind::CrashExit(code) => Some(code),
            ExitKind::Signaled(_) | ExitKind::LaunchFailed => None,
        }
    }

    pub fn is_failure(self) -> bool {
        self != ExitKind::CleanExit
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitKind::CleanExit => write!(f, "exit code 0"),
            ExitKind::CrashExit(code) => write!(f, "exit code {code}"),
            ExitKind::Signaled(sig) => write!(f, "signal {sig}"),
            ExitKind::LaunchFailed => write!(f, "launch failure"),
        }
    }
}

/// One running generation of a service. A fresh record is created for every
/// launch and dropped once the process has been reaped.
#[derive(Debug)]
pub struct ProcessRecord {
    pub pid: u32,
    pub started_at: SystemTime,
    pub(crate) started: Instant,
    /// Fingerprint of the artifact this generation was launched from.
    pub fingerprint: String,
    state: ProcessState,
}

impl ProcessRecord {
    pub fn new(pid: u32, fingerprint: String) -> Self {
        Self {
            pid,
            fingerprint,
            started_at: SystemTime::now(),
            started: Instant::now(),
            state: ProcessState::Running,
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn mark_exiting(&mut self) {
        self.state = ProcessState::Exiting;
    }
}

/// Point-in-time view of one service, published by its monitoring loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub last_exit_code: Option<i32>,
    /// Seconds since the Unix epoch.
    pub started_at: Option<u64>,
    pub installed_fingerprint: Option<String>,
    /// What the live generation runs, which lags `installed_fingerprint`
    /// until the instance is retired or relaunched.
    #[serde(default)]
    pub running_fingerprint: Option<String>,
}

impl ServiceStatus {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: ProcessState::Stopped,
            pid: None,
            restart_count: 0,
            last_exit_code: None,
            started_at: None,
            installed_fingerprint: None,
            running_fingerprint: None,
        }
    }
}

pub(crate) fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
