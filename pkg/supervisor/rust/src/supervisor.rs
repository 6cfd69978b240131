// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Per-service monitoring loops.
//!
//! Each service gets one task running the state machine
//! `Stopped -> Starting -> Running -> Exiting -> {Backoff -> Starting | Stopped}`.
//! The task exclusively owns the child and its [`ProcessRecord`]; everything
//! else talks to it through a [`ServiceHandle`].

use crate::artifact::{ArtifactTable, StateDir};
use crate::error::{LaunchError, SupervisorError};
use crate::host::{self, ChildHandle, LaunchSpec, ServiceIdentity};
use crate::service::{self, ServiceDescriptor};
use crate::state::{ExitKind, ProcessRecord, ProcessState, ServiceStatus, unix_secs};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;

const CONTROL_QUEUE: usize = 16;

/// Requests accepted by a monitoring loop.
#[derive(Debug)]
pub enum Control {
    /// Operator start: leave `Stopped`, or skip the rest of a backoff delay.
    Start,
    /// Operator stop: terminate the current generation and stay stopped.
    Stop,
    /// Gracefully terminate the running instance so the next launch picks
    /// up a freshly installed artifact.
    Retire,
}

/// Handle to one service's monitoring loop.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    name: String,
    control: mpsc::Sender<Control>,
    status: watch::Receiver<ServiceStatus>,
}

impl ServiceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ServiceStatus {
        self.status.borrow().clone()
    }

    pub async fn send(&self, request: Control) -> bool {
        self.control.send(request).await.is_ok()
    }

    /// Wait until the published status satisfies `pred`.
    pub async fn wait_for(&self, pred: impl Fn(&ServiceStatus) -> bool) -> ServiceStatus {
        let mut rx = self.status.clone();
        if let Ok(status) = rx.wait_for(|s| pred(s)).await {
            return status.clone();
        }
        rx.borrow().clone()
    }
}

/// Settings shared by every loop, passed in at construction time.
#[derive(Debug, Clone)]
pub struct LoopContext {
    pub state_dir: StateDir,
    pub log_dir: PathBuf,
    pub artifacts: Arc<ArtifactTable>,
}

/// Why a running generation ended.
enum Ending {
    Exited(ExitKind),
    /// Terminated on request; the exit code is not a policy input.
    Retired(ExitKind),
    Stopped(ExitKind),
    Shutdown,
}

/// The monitoring loop of one service.
pub struct ServiceLoop {
    svc: Arc<ServiceDescriptor>,
    ctx: LoopContext,
    control: mpsc::Receiver<Control>,
    status: watch::Sender<ServiceStatus>,
    dependencies: Vec<watch::Receiver<ServiceStatus>>,
    cancel: CancellationToken,
    restart_count: u32,
    consecutive_failures: u32,
    last_exit_code: Option<i32>,
    launched_once: bool,
}

impl ServiceLoop {
    fn publish(&self, state: ProcessState, record: Option<&ProcessRecord>) {
        let installed_fingerprint = self
            .ctx
            .artifacts
            .get(&self.svc.name)
            .map(|a| a.installed_fingerprint.clone());
        self.status.send_modify(|s| {
            debug_assert!(
                s.state == state || s.state.can_transition_to(state),
                "[{}] invalid transition {} -> {state}",
                self.svc.name,
                s.state
            );
            s.state = state;
            s.pid = record.map(|r| r.pid);
            s.started_at = record.map(|r| unix_secs(r.started_at));
            s.restart_count = self.restart_count;
            s.last_exit_code = self.last_exit_code;
            s.installed_fingerprint = installed_fingerprint;
            s.running_fingerprint = record.map(|r| r.fingerprint.clone());
        });
    }

    /// Run until shutdown. Returns an error only when a child could not be
    /// reaped, which leaves the host in an unknown state.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        let name = self.svc.name.clone();
        let mut state = if self.svc.auto_start {
            ProcessState::Starting
        } else {
            info!("[{name}] auto_start=false, waiting for start request");
            ProcessState::Stopped
        };
        let mut delay = Duration::ZERO;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            state = match state {
                ProcessState::Stopped => {
                    self.publish(ProcessState::Stopped, None);
                    if !self.wait_for_start().await {
                        break;
                    }
                    ProcessState::Starting
                }
                ProcessState::Backoff => {
                    self.publish(ProcessState::Backoff, None);
                    match self.backoff(delay).await {
                        Some(next) => next,
                        None => break,
                    }
                }
                ProcessState::Starting => {
                    self.publish(ProcessState::Starting, None);
                    match self.start().await {
                        Ok((child, fingerprint)) => match self.supervise(child, fingerprint).await? {
                            (ProcessState::Backoff, d) => {
                                delay = d;
                                ProcessState::Backoff
                            }
                            (next, _) => next,
                        },
                        Err(next) => {
                            delay = next;
                            ProcessState::Backoff
                        }
                    }
                }
                // Running and Exiting only exist inside `supervise`.
                ProcessState::Running | ProcessState::Exiting => ProcessState::Backoff,
            };
        }

        self.publish(ProcessState::Stopped, None);
        debug!("[{name}] monitoring loop finished");
        Ok(())
    }

    /// Block in `Stopped` until an operator start or shutdown.
    async fn wait_for_start(&mut self) -> bool {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                request = self.control.recv() => match request {
                    Some(Control::Start) => {
                        info!("[{}] start requested", self.svc.name);
                        // A fresh operator start gets a fresh backoff.
                        self.consecutive_failures = 0;
                        return true;
                    }
                    Some(other) => debug!("[{}] ignoring {other:?} while stopped", self.svc.name),
                    None => return false,
                },
            }
        }
    }

    /// Wait out `delay`, waking early for an operator start, or for a
    /// dependency status change. Returns the next state, `None` on shutdown.
    async fn backoff(&mut self, delay: Duration) -> Option<ProcessState> {
        let deadline = Instant::now() + delay;
        let mut deps_changed = Box::pin(dependencies_changed(&self.dependencies));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = sleep_until(deadline) => return Some(ProcessState::Starting),
                _ = &mut deps_changed, if !self.dependencies.is_empty() => {
                    deps_changed = Box::pin(dependencies_changed(&self.dependencies));
                    if self.dependencies_running() {
                        return Some(ProcessState::Starting);
                    }
                }
                request = self.control.recv() => match request {
                    Some(Control::Start) => {
                        info!("[{}] start requested, skipping backoff", self.svc.name);
                        return Some(ProcessState::Starting);
                    }
                    Some(Control::Stop) => {
                        info!("[{}] stop requested", self.svc.name);
                        return Some(ProcessState::Stopped);
                    }
                    Some(Control::Retire) => {
                        debug!("[{}] nothing to retire while backing off", self.svc.name);
                    }
                    None => return None,
                },
            }
        }
    }

    fn runs_installed(&self, record: &ProcessRecord) -> bool {
        self.ctx
            .artifacts
            .get(&self.svc.name)
            .is_some_and(|a| a.installed_fingerprint == record.fingerprint)
    }

    fn dependencies_running(&self) -> bool {
        self.dependencies
            .iter()
            .all(|rx| rx.borrow().state == ProcessState::Running)
    }

    /// `Starting` entry: dependency gate, stale-process guard, spawn.
    /// On failure returns the backoff delay to apply.
    async fn start(&mut self) -> Result<(ChildHandle, String), Duration> {
        let name = self.svc.name.clone();

        if !self.dependencies_running() {
            let waiting: Vec<String> = self
                .dependencies
                .iter()
                .map(|rx| rx.borrow().clone())
                .filter(|s| s.state != ProcessState::Running)
                .map(|s| s.name)
                .collect();
            info!("[{name}] waiting for dependencies: {}", waiting.join(", "));
            return Err(self.svc.backoff_base);
        }

        let Some(artifact) = self.ctx.artifacts.get(&name) else {
            warn!("[{name}] {}", LaunchError::NotInstalled);
            return Err(self.fail(ExitKind::LaunchFailed));
        };

        let identity = ServiceIdentity {
            service: name.clone(),
            state_dir: self.ctx.state_dir.root().to_path_buf(),
            artifact_path: artifact.installed_path.clone(),
            interpreter: self.svc.interpreter.clone(),
        };
        let stale = host::find_instances(&identity);
        if !stale.is_empty() {
            warn!("[{name}] found {} stale process(es): {stale:?}", stale.len());
            let survivors = host::terminate_pids(&name, &stale, self.svc.stop_timeout).await;
            if !survivors.is_empty() {
                error!("[{name}] stale process(es) {survivors:?} survived SIGKILL, not launching");
                return Err(self.svc.backoff_max);
            }
        }

        let spec = LaunchSpec {
            identity,
            args: self.svc.args.clone(),
            env: self.svc.env.clone(),
            working_dir: self.svc.working_dir.clone(),
            log_path: self.ctx.log_dir.join(format!("{name}.log")),
        };
        if self.launched_once {
            self.restart_count += 1;
        }
        self.launched_once = true;

        match host::spawn(&spec) {
            Ok(child) => {
                info!(
                    "[{name}] spawned (pid={}, path={}, restart={})",
                    child.pid(),
                    spec.identity.artifact_path.display(),
                    self.restart_count
                );
                if let Err(e) = host::write_pidfile(&self.ctx.state_dir.pid_path(&name), child.pid()) {
                    warn!("[{name}] failed to write pid file: {e}");
                }
                Ok((child, artifact.installed_fingerprint.clone()))
            }
            Err(e) => {
                error!("[{name}] {e}");
                Err(self.fail(ExitKind::LaunchFailed))
            }
        }
    }

    /// Record a failed generation and return the delay before the next attempt.
    fn fail(&mut self, kind: ExitKind) -> Duration {
        self.last_exit_code = kind.code();
        let delay = self.svc.backoff_delay(self.consecutive_failures);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        delay
    }

    /// `Running` and `Exiting`: own the child until it is reaped, then pick
    /// the next state and backoff delay.
    async fn supervise(
        &mut self,
        mut child: ChildHandle,
        fingerprint: String,
    ) -> Result<(ProcessState, Duration), SupervisorError> {
        let name = self.svc.name.clone();
        let mut record = ProcessRecord::new(child.pid(), fingerprint);
        self.publish(ProcessState::Running, Some(&record));

        let mut control_open = true;
        let ending = loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status.map_err(|source| SupervisorError::Wait {
                        service: name.clone(),
                        source,
                    })?;
                    break Ending::Exited(ExitKind::from_status(status));
                }
                _ = self.cancel.cancelled() => {
                    record.mark_exiting();
                    self.publish(ProcessState::Exiting, Some(&record));
                    self.terminate(&mut child).await?;
                    break Ending::Shutdown;
                }
                request = self.control.recv(), if control_open => match request {
                    Some(Control::Retire) if !self.runs_installed(&record) => {
                        info!("[{name}] retiring (pid={}) for updated artifact", record.pid);
                        record.mark_exiting();
                        self.publish(ProcessState::Exiting, Some(&record));
                        break Ending::Retired(self.terminate(&mut child).await?);
                    }
                    Some(Control::Stop) => {
                        info!("[{name}] stop requested (pid={})", record.pid);
                        record.mark_exiting();
                        self.publish(ProcessState::Exiting, Some(&record));
                        break Ending::Stopped(self.terminate(&mut child).await?);
                    }
                    Some(Control::Retire) => {
                        debug!("[{name}] pid {} already runs the installed artifact", record.pid);
                    }
                    Some(Control::Start) => debug!("[{name}] already running"),
                    None => control_open = false,
                },
            }
        };

        host::remove_pidfile(&self.ctx.state_dir.pid_path(&name));
        if record.state() != ProcessState::Exiting {
            record.mark_exiting();
            self.publish(ProcessState::Exiting, Some(&record));
        }
        let ran_for = record.started.elapsed();
        drop(record);

        let next = match ending {
            Ending::Shutdown => (ProcessState::Stopped, Duration::ZERO),
            Ending::Stopped(kind) => {
                info!("[{name}] stopped ({kind})");
                self.last_exit_code = kind.code();
                (ProcessState::Stopped, Duration::ZERO)
            }
            Ending::Retired(kind) => {
                info!("[{name}] retired ({kind})");
                self.last_exit_code = kind.code();
                self.consecutive_failures = 0;
                (ProcessState::Backoff, self.svc.backoff_base)
            }
            Ending::Exited(kind) => {
                info!("[{name}] exited with {kind}");
                if ran_for >= self.svc.stable_after || !kind.is_failure() {
                    self.consecutive_failures = 0;
                }
                if !self.svc.restart.should_restart(kind.code()) {
                    info!(
                        "[{name}] restart policy '{}' does not relaunch after {kind}",
                        self.svc.restart
                    );
                    self.last_exit_code = kind.code();
                    (ProcessState::Stopped, Duration::ZERO)
                } else if kind.is_failure() {
                    (ProcessState::Backoff, self.fail(kind))
                } else {
                    self.last_exit_code = kind.code();
                    (
                        ProcessState::Backoff,
                        self.svc.backoff_delay(self.consecutive_failures),
                    )
                }
            }
        };
        if next.0 == ProcessState::Backoff {
            info!(
                "[{name}] backing off {:.1}s (restart #{})",
                next.1.as_secs_f64(),
                self.restart_count + 1
            );
        }
        Ok(next)
    }

    /// Graceful termination, forced after the grace window. Does not return
    /// until the child is reaped.
    async fn terminate(&self, child: &mut ChildHandle) -> Result<ExitKind, SupervisorError> {
        let name = &self.svc.name;
        let pid = child.pid();
        info!("[{name}] sending SIGTERM (pid={pid})");
        child.terminate();

        let wait_err = |source: std::io::Error| SupervisorError::Wait {
            service: name.clone(),
            source,
        };
        match timeout(self.svc.stop_timeout, child.wait()).await {
            Ok(status) => return Ok(ExitKind::from_status(status.map_err(wait_err)?)),
            Err(_) => warn!(
                "[{name}] stop timeout ({}s) reached, sending SIGKILL",
                self.svc.stop_timeout.as_secs_f64()
            ),
        }

        child.kill();
        match timeout(host::SIGKILL_TIMEOUT, child.wait()).await {
            Ok(status) => Ok(ExitKind::from_status(status.map_err(wait_err)?)),
            Err(_) => Err(SupervisorError::Unreaped {
                service: name.clone(),
                pid,
            }),
        }
    }
}

/// Resolves once any dependency publishes a status newer than the one
/// current at call time.
fn dependencies_changed(
    deps: &[watch::Receiver<ServiceStatus>],
) -> impl Future<Output = ()> + Send + 'static {
    let mut deps = deps.to_vec();
    for rx in &mut deps {
        rx.borrow_and_update();
    }
    async move {
        if deps.is_empty() {
            return std::future::pending().await;
        }
        let mut set = JoinSet::new();
        for mut rx in deps {
            set.spawn(async move {
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            });
        }
        let _ = set.join_next().await;
    }
}

/// Owns every monitoring loop.
pub struct Supervisor {
    handles: Vec<ServiceHandle>,
    tasks: JoinSet<(String, Result<(), SupervisorError>)>,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Start one loop per service, dependencies first.
    pub fn start(
        services: &[ServiceDescriptor],
        ctx: LoopContext,
        cancel: CancellationToken,
    ) -> Result<Self, String> {
        let ordered = service::start_order(services)?;

        let mut channels = HashMap::new();
        for svc in &ordered {
            let (status_tx, status_rx) = watch::channel(ServiceStatus::new(&svc.name));
            let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
            channels.insert(svc.name.clone(), (status_tx, status_rx, control_tx, control_rx));
        }
        let receivers: HashMap<String, watch::Receiver<ServiceStatus>> = channels
            .iter()
            .map(|(name, (_, rx, _, _))| (name.clone(), rx.clone()))
            .collect();

        let mut handles = Vec::with_capacity(ordered.len());
        let mut tasks = JoinSet::new();
        for svc in ordered {
            let Some((status_tx, status_rx, control_tx, control_rx)) = channels.remove(&svc.name)
            else {
                continue;
            };
            let dependencies = svc
                .depends_on
                .iter()
                .filter_map(|dep| receivers.get(dep).cloned())
                .collect();

            handles.push(ServiceHandle {
                name: svc.name.clone(),
                control: control_tx,
                status: status_rx,
            });

            let service_loop = ServiceLoop {
                svc: Arc::new(svc.clone()),
                ctx: ctx.clone(),
                control: control_rx,
                status: status_tx,
                dependencies,
                cancel: cancel.child_token(),
                restart_count: 0,
                consecutive_failures: 0,
                last_exit_code: None,
                launched_once: false,
            };
            let name = svc.name.clone();
            tasks.spawn(async move { (name, service_loop.run().await) });
        }

        Ok(Self {
            handles,
            tasks,
            cancel,
        })
    }

    pub fn handles(&self) -> &[ServiceHandle] {
        &self.handles
    }

    pub fn handle(&self, name: &str) -> Option<&ServiceHandle> {
        self.handles.iter().find(|h| h.name == name)
    }

    /// Resolves when a loop ends on its own, which only happens on a fatal
    /// error or after shutdown has begun.
    pub async fn next_exit(&mut self) -> Option<(String, Result<(), SupervisorError>)> {
        match self.tasks.join_next().await? {
            Ok(res) => Some(res),
            Err(e) => {
                error!("monitoring task panicked: {e}");
                Some(("<unknown>".to_string(), Ok(())))
            }
        }
    }

    /// Cancel every loop and wait until each child has been reaped.
    /// Returns the fatal errors encountered.
    pub async fn shutdown(mut self) -> Vec<SupervisorError> {
        self.cancel.cancel();
        let mut errors = Vec::new();
        while let Some((name, result)) = self.next_exit().await {
            match result {
                Ok(()) => debug!("[{name}] stopped"),
                Err(e) => {
                    error!("{e}");
                    errors.push(e);
                }
            }
        }
        errors
    }
}
