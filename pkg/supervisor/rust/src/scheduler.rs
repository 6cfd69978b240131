// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::artifact::UpdateOutcome;
use crate::deploy::DeploymentController;
use crate::service::{ServiceDescriptor, UpdatePolicy};
use crate::state::ProcessState;
use crate::supervisor::{Control, ServiceHandle};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

/// Periodically converges every service's installed artifact and hands
/// fresh installs to the monitoring loops.
pub struct ReconciliationScheduler {
    controller: Arc<DeploymentController>,
    services: Vec<Arc<ServiceDescriptor>>,
    handles: HashMap<String, ServiceHandle>,
    initial_delay: Duration,
    interval: Duration,
}

impl ReconciliationScheduler {
    pub fn new(
        controller: Arc<DeploymentController>,
        services: &[ServiceDescriptor],
        handles: &[ServiceHandle],
        initial_delay: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            controller,
            services: services.iter().cloned().map(Arc::new).collect(),
            handles: handles
                .iter()
                .map(|h| (h.name().to_string(), h.clone()))
                .collect(),
            initial_delay,
            interval,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.initial_delay, self.interval);
        // A slow tick pushes the next one back rather than firing a burst.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.tick() => {}
                    }
                }
            }
        }
        debug!("reconciliation scheduler stopped");
    }

    /// One reconciliation pass over every service. Services are reconciled
    /// concurrently; a failure is logged and left for the next tick.
    pub async fn tick(&self) -> Vec<(String, UpdateOutcome)> {
        let mut set = JoinSet::new();
        for svc in &self.services {
            let controller = Arc::clone(&self.controller);
            let svc = Arc::clone(svc);
            set.spawn(async move {
                let outcome = controller.reconcile(&svc).await;
                (svc, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(self.services.len());
        while let Some(joined) = set.join_next().await {
            let (svc, outcome) = match joined {
                Ok(res) => res,
                Err(e) => {
                    warn!("reconcile task failed: {e}");
                    continue;
                }
            };
            match &outcome {
                UpdateOutcome::Unchanged => {}
                UpdateOutcome::Failed(reason) => {
                    warn!("reconcile of [{}] failed: {reason}", svc.name);
                }
                UpdateOutcome::Installed(_) => self.hand_over(&svc).await,
            }
            outcomes.push((svc.name.clone(), outcome));
        }
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        outcomes
    }

    async fn hand_over(&self, svc: &ServiceDescriptor) {
        let Some(handle) = self.handles.get(&svc.name) else {
            return;
        };
        match handle.status().state {
            // A Starting instance may have read the table just before the
            // install; the loop drops the retire if it launched the new one.
            ProcessState::Running | ProcessState::Starting => match svc.on_update {
                UpdatePolicy::Retire => {
                    info!("[{}] requesting retire of running instance", svc.name);
                    handle.send(Control::Retire).await;
                }
                UpdatePolicy::Wait => {
                    info!(
                        "[{}] new artifact will be used on the next natural restart",
                        svc.name
                    );
                }
            },
            ProcessState::Backoff => {
                handle.send(Control::Start).await;
            }
            // Exiting relaunches from the fresh table; Stopped waits for an operator.
            ProcessState::Exiting | ProcessState::Stopped => {}
        }
    }
}
