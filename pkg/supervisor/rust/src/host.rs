// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Host process boundary: launching children, signalling them and finding
//! processes left behind by an earlier supervisor.

use crate::error::LaunchError;
use log::{debug, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tokio::time::{Duration, Instant, sleep};

/// Environment variable naming the service a child belongs to.
pub const SERVICE_ENV: &str = "DL_SUPERVISOR_SERVICE";
/// Environment variable naming the state directory of the owning supervisor.
pub const STATE_DIR_ENV: &str = "DL_SUPERVISOR_STATE_DIR";

const PROC_ROOT: &str = "/proc";
const POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const SIGKILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to recognise a process as an instance of a service.
#[derive(Debug, Clone)]
pub struct ServiceIdentity {
    pub service: String,
    pub state_dir: PathBuf,
    pub artifact_path: PathBuf,
    /// Program the artifact is run under, if it is not executed directly.
    pub interpreter: Option<PathBuf>,
}

impl ServiceIdentity {
    fn env_markers(&self) -> [Vec<u8>; 2] {
        let mut service = format!("{SERVICE_ENV}=").into_bytes();
        service.extend_from_slice(self.service.as_bytes());
        let mut state_dir = format!("{STATE_DIR_ENV}=").into_bytes();
        state_dir.extend_from_slice(self.state_dir.as_os_str().as_bytes());
        [service, state_dir]
    }

    /// `cmdline` and `environ` are the raw NUL-separated contents of the
    /// matching `/proc/<pid>` files.
    pub fn matches(&self, cmdline: &[u8], environ: Option<&[u8]>) -> bool {
        let artifact = self.artifact_path.as_os_str().as_bytes();
        let mut argv = cmdline.split(|&b| b == 0);
        let argv0 = argv.next().unwrap_or_default();
        if argv0 == artifact {
            return true;
        }
        // Only the configured interpreter may carry the artifact as argv[1];
        // an editor or pager opened on it is not an instance.
        if let Some(interpreter) = &self.interpreter
            && argv0 == interpreter.as_os_str().as_bytes()
            && argv.next() == Some(artifact)
        {
            return true;
        }

        let Some(environ) = environ else {
            return false;
        };
        let markers = self.env_markers();
        markers
            .iter()
            .all(|marker| environ.split(|&b| b == 0).any(|var| var == marker.as_slice()))
    }
}

/// How to launch one generation of a service.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub identity: ServiceIdentity,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub log_path: PathBuf,
}

/// A spawned child. The child runs in its own process group so signals
/// reach anything it forked.
pub struct ChildHandle {
    pid: u32,
    child: Child,
}

impl ChildHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn terminate(&self) {
        signal_group(self.pid, Signal::SIGTERM);
    }

    pub fn kill(&self) {
        signal_group(self.pid, Signal::SIGKILL);
    }

    /// Wait for the child to exit and reap it.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }
}

fn signal_group(pid: u32, sig: Signal) {
    let target = Pid::from_raw(pid as i32);
    if let Err(e) = signal::killpg(target, sig) {
        debug!("killpg({pid}, {sig}) failed ({e}), signalling pid only");
        if let Err(e) = signal::kill(target, sig) {
            warn!("failed to send {sig} to pid {pid}: {e}");
        }
    }
}

/// Spawn the installed artifact described by `spec`, with stdout and stderr
/// appended to the service's log sink.
pub fn spawn(spec: &LaunchSpec) -> Result<ChildHandle, LaunchError> {
    let artifact = &spec.identity.artifact_path;
    let mut cmd = match spec.identity.interpreter {
        Some(ref interpreter) => {
            let mut cmd = Command::new(interpreter);
            cmd.arg(artifact);
            cmd
        }
        None => Command::new(artifact),
    };
    cmd.args(&spec.args);
    cmd.envs(&spec.env);
    cmd.env(SERVICE_ENV, &spec.identity.service);
    cmd.env(STATE_DIR_ENV, &spec.identity.state_dir);
    if let Some(ref dir) = spec.working_dir {
        cmd.current_dir(dir);
    }

    let sink_err = |source: io::Error| LaunchError::LogSink {
        path: spec.log_path.clone(),
        source,
    };
    if let Some(parent) = spec.log_path.parent() {
        fs::create_dir_all(parent).map_err(sink_err)?;
    }
    let sink = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&spec.log_path)
        .map_err(sink_err)?;
    let sink_err_clone = sink.try_clone().map_err(sink_err)?;

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::from(sink));
    cmd.stderr(Stdio::from(sink_err_clone));
    cmd.process_group(0);

    let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
        path: artifact.clone(),
        source,
    })?;
    let pid = child.id().unwrap_or(0);
    Ok(ChildHandle { pid, child })
}

/// True when `pid` exists and is not a zombie.
pub fn is_alive(pid: u32) -> bool {
    let stat = match fs::read_to_string(Path::new(PROC_ROOT).join(pid.to_string()).join("stat")) {
        Ok(s) => s,
        Err(_) => return false,
    };
    // The state field follows the parenthesised command name, which may itself contain ')'.
    match stat.rfind(')').and_then(|i| stat.get(i + 1..)) {
        Some(rest) => !matches!(rest.trim_start().chars().next(), Some('Z') | Some('X') | None),
        None => false,
    }
}

/// Every live process on the host that belongs to the service, excluding
/// the supervisor itself.
pub fn find_instances(identity: &ServiceIdentity) -> Vec<u32> {
    let own = std::process::id();
    let entries = match fs::read_dir(PROC_ROOT) {
        Ok(e) => e,
        Err(e) => {
            warn!("cannot scan {PROC_ROOT}: {e}");
            return Vec::new();
        }
    };

    let mut pids: Vec<u32> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|&pid| pid != own)
        .filter(|&pid| {
            let dir = Path::new(PROC_ROOT).join(pid.to_string());
            let Ok(cmdline) = fs::read(dir.join("cmdline")) else {
                return false;
            };
            // environ is unreadable for other users' processes; cmdline still counts.
            let environ = fs::read(dir.join("environ")).ok();
            identity.matches(&cmdline, environ.as_deref())
        })
        .filter(|&pid| is_alive(pid))
        .collect();
    pids.sort_unstable();
    pids
}

/// Terminate `pids` gracefully, then forcibly once `grace` has elapsed.
/// Returns the pids still alive after SIGKILL.
pub async fn terminate_pids(service: &str, pids: &[u32], grace: Duration) -> Vec<u32> {
    for &pid in pids {
        info!("[{service}] terminating stale process (pid={pid})");
        signal_pid(pid, Signal::SIGTERM);
    }

    let mut alive = wait_gone(pids, grace).await;
    if alive.is_empty() {
        return alive;
    }

    for &pid in &alive {
        warn!("[{service}] stale process (pid={pid}) ignored SIGTERM, sending SIGKILL");
        signal_pid(pid, Signal::SIGKILL);
    }
    alive = wait_gone(&alive, SIGKILL_TIMEOUT).await;
    alive
}

fn signal_pid(pid: u32, sig: Signal) {
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig) {
        debug!("failed to send {sig} to pid {pid}: {e}");
    }
}

async fn wait_gone(pids: &[u32], timeout: Duration) -> Vec<u32> {
    let deadline = Instant::now() + timeout;
    loop {
        let alive: Vec<u32> = pids.iter().copied().filter(|&p| is_alive(p)).collect();
        if alive.is_empty() || Instant::now() >= deadline {
            return alive;
        }
        sleep(POLL_INTERVAL).await;
    }
}

pub fn write_pidfile(path: &Path, pid: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, pid.to_string())
}

pub fn remove_pidfile(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != ErrorKind::NotFound
    {
        warn!("failed to remove pid file {}: {e}", path.display());
    }
}
