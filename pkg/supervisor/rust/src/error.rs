// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by an artifact resolver. Always transient from the
/// deployment controller's point of view.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("artifact unavailable: {0}")]
    Unavailable(String),

    #[error("resolver timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("no artifact strategy configured for '{0}'")]
    UnknownService(String),
}

/// Failure while staging or installing an artifact. The previously
/// installed artifact stays authoritative.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("staging {} failed: {source}", path.display())]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fix-up failed: {0}")]
    Fixup(String),

    #[error("persisting artifact state to {} failed: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("no installed artifact")]
    NotInstalled,

    #[error("failed to open log sink {}: {source}", path.display())]
    LogSink {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A terminated child could not be reaped even after SIGKILL. This
    /// points at a host-level leak and stops the daemon.
    #[error("[{service}] pid {pid} was not reaped after SIGKILL")]
    Unreaped { service: String, pid: u32 },

    #[error("waiting on [{service}] failed: {source}")]
    Wait {
        service: String,
        #[source]
        source: std::io::Error,
    },
}
