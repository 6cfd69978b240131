// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::artifact::{ArtifactTable, StateDir};
use crate::config::SupervisorConfig;
use crate::control::{self, ControlServer};
use crate::deploy::DeploymentController;
use crate::resolver::StrategyResolver;
use crate::scheduler::ReconciliationScheduler;
use crate::service::ServiceDescriptor;
use crate::supervisor::{LoopContext, Supervisor};
use anyhow::{Context, Result, anyhow, bail};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Run the supervisor until SIGTERM/SIGINT, or until a child cannot be
/// reaped. Every child is reaped before this returns.
pub async fn run(config: SupervisorConfig, services: Vec<ServiceDescriptor>) -> Result<()> {
    let state_dir = StateDir::new(&config.state_dir);
    state_dir
        .create_all()
        .with_context(|| format!("failed to create state dir {}", state_dir.root().display()))?;
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("failed to create log dir {}", config.log_dir.display()))?;

    let artifacts = Arc::new(ArtifactTable::load(
        &state_dir,
        services.iter().map(|s| s.name.as_str()),
    ));
    let controller = Arc::new(DeploymentController::new(
        state_dir.clone(),
        Arc::clone(&artifacts),
        Arc::new(StrategyResolver::from_services(&services)),
        config.resolve_timeout(),
    ));

    let mut sigterm = signal(SignalKind::terminate()).context("failed to set up SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to set up SIGINT handler")?;

    let listener = control::bind(&config.control_socket)?;
    let cancel = CancellationToken::new();
    let ctx = LoopContext {
        state_dir,
        log_dir: config.log_dir.clone(),
        artifacts,
    };
    let mut supervisor =
        Supervisor::start(&services, ctx, cancel.child_token()).map_err(|e| anyhow!(e))?;
    info!("supervising {} service(s)", supervisor.handles().len());

    let control_task = tokio::spawn(
        ControlServer::new(supervisor.handles()).serve(listener, cancel.child_token()),
    );
    let scheduler = ReconciliationScheduler::new(
        controller,
        &services,
        supervisor.handles(),
        config.initial_delay(),
        config.interval(),
    );
    let scheduler_task = tokio::spawn(scheduler.run(cancel.child_token()));

    let fatal = loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                break None;
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
                break None;
            }
            exit = supervisor.next_exit() => match exit {
                Some((_, Err(e))) => {
                    error!("fatal: {e}");
                    break Some(e);
                }
                Some((name, Ok(()))) => warn!("[{name}] monitoring loop ended unexpectedly"),
                None => break None,
            },
        }
    };

    info!("stopping all services");
    cancel.cancel();
    let mut errors = supervisor.shutdown().await;
    if let Err(e) = scheduler_task.await {
        warn!("reconciliation scheduler task failed: {e}");
    }
    if let Err(e) = control_task.await {
        warn!("control server task failed: {e}");
    }
    if let Err(e) = std::fs::remove_file(&config.control_socket) {
        warn!("failed to remove {}: {e}", config.control_socket.display());
    }

    errors.extend(fatal);
    match errors.first() {
        Some(e) => bail!("{e}"),
        None => Ok(()),
    }
}
