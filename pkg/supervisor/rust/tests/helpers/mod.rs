// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

#![allow(dead_code)]

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Scratch deployment: config file, state dir, log dir, control socket and
/// a releases dir where tests drop artifacts for the resolver to pick up.
pub struct Deployment {
    pub dir: tempfile::TempDir,
}

impl Deployment {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        std::fs::create_dir_all(dir.path().join("releases")).unwrap();
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.path().join("supervisor.yaml")
    }

    pub fn socket(&self) -> PathBuf {
        self.path().join("ctl.sock")
    }

    pub fn release(&self, name: &str) -> PathBuf {
        self.path().join("releases").join(name)
    }

    pub fn service_log(&self, name: &str) -> PathBuf {
        self.path().join("log").join(format!("{name}.log"))
    }

    pub fn marker(&self, name: &str) -> PathBuf {
        self.path().join(name)
    }

    /// Publish a new release of `name`, replacing the previous one atomically.
    pub fn publish(&self, name: &str, script: &str) {
        let target = self.release(name);
        let tmp = target.with_extension("tmp");
        std::fs::write(&tmp, script).unwrap();
        std::fs::rename(&tmp, &target).unwrap();
    }

    /// Write the daemon config. `services` is the YAML body of the
    /// `services:` list; the daemon-level keys point into the scratch dir.
    pub fn write_config(&self, services: &str) {
        let yaml = format!(
            "state_dir: {root}/state\n\
             log_dir: {root}/log\n\
             control_socket: {socket}\n\
             reconcile_initial_delay_secs: 0\n\
             reconcile_interval_secs: 1\n\
             stop_timeout_secs: 2\n\
             services:\n{services}",
            root = self.path().display(),
            socket = self.socket().display(),
        );
        std::fs::write(self.config_path(), yaml).unwrap();
    }

    /// A shell-script service whose release lives in `releases/<name>`.
    pub fn script_service(&self, name: &str, extra: &str) -> String {
        let mut entry = format!(
            "  - name: {name}\n    \
                 artifact: {{kind: file, path: {path}}}\n    \
                 interpreter: /bin/sh\n    \
                 backoff_base_secs: 0.1\n    \
                 backoff_max_secs: 1\n",
            path = self.release(name).display(),
        );
        for line in extra.lines().filter(|l| !l.trim().is_empty()) {
            entry.push_str("    ");
            entry.push_str(line.trim());
            entry.push('\n');
        }
        entry
    }

    /// Run the operator CLI against this deployment's daemon.
    pub fn cli(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_dl-supervisor"))
            .arg("--socket")
            .arg(self.socket())
            .args(args)
            .output()
            .expect("failed to run dl-supervisor")
    }
}

/// Handle to a running dl-supervisord daemon process.
pub struct DaemonHandle {
    child: Child,
    log_lines: Arc<Mutex<Vec<String>>>,
    _reader_thread: std::thread::JoinHandle<()>,
    _stderr_thread: std::thread::JoinHandle<()>,
}

impl DaemonHandle {
    /// Start the daemon with `DL_SUP_CONFIG` pointing at the deployment's config.
    pub fn start(deployment: &Deployment) -> Self {
        let bin = env!("CARGO_BIN_EXE_dl-supervisord");
        let mut child = Command::new(bin)
            .env("DL_SUP_CONFIG", deployment.config_path())
            .env("DL_SUP_LOG_LEVEL", "debug")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("failed to start dl-supervisord");

        let stdout = child.stdout.take().expect("failed to capture stdout");
        let stderr = child.stderr.take().expect("failed to capture stderr");
        let log_lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let lines_clone = Arc::clone(&log_lines);
        let lines_clone2 = Arc::clone(&log_lines);

        // simple_logger writes INFO to stdout, WARN/ERROR to stderr.
        let reader_thread = std::thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                match line {
                    Ok(l) => {
                        eprintln!("[daemon] {l}");
                        lines_clone.lock().unwrap().push(l);
                    }
                    Err(_) => break,
                }
            }
        });

        let _stderr_thread = std::thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                match line {
                    Ok(l) => {
                        eprintln!("[daemon:err] {l}");
                        lines_clone2.lock().unwrap().push(l);
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            child,
            log_lines,
            _reader_thread: reader_thread,
            _stderr_thread,
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Wait until a log line containing `pattern` appears, or timeout.
    pub fn wait_for_log(&self, pattern: &str, timeout: Duration) -> bool {
        self.wait_for_log_count(pattern, 1, timeout)
    }

    /// Wait until a log line containing `pattern` appears using the default timeout.
    pub fn wait_for_log_default(&self, pattern: &str) -> bool {
        self.wait_for_log(pattern, DEFAULT_TIMEOUT)
    }

    /// Count how many log lines contain `pattern`.
    pub fn count_log_matches(&self, pattern: &str) -> usize {
        let lines = self.log_lines.lock().unwrap();
        lines.iter().filter(|l| l.contains(pattern)).count()
    }

    /// Wait until the count of log lines matching `pattern` reaches at least `n`.
    pub fn wait_for_log_count(&self, pattern: &str, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.count_log_matches(pattern) >= n {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Send a signal to the daemon process.
    pub fn send_signal(&self, sig: Signal) {
        let pid = self.child.id() as i32;
        signal::kill(Pid::from_raw(pid), sig).expect("failed to send signal to daemon");
    }

    /// Send SIGTERM and wait for the daemon to exit. Returns the exit status.
    pub fn stop(&mut self) -> std::process::ExitStatus {
        self.send_signal(Signal::SIGTERM);
        self.wait_with_timeout(DEFAULT_TIMEOUT)
    }

    /// Kill the daemon without giving it a chance to stop its children.
    pub fn crash(&mut self) {
        self.send_signal(Signal::SIGKILL);
        self.child.wait().expect("failed to wait on killed daemon");
    }

    /// Wait for the daemon to exit within the given timeout.
    pub fn wait_with_timeout(&mut self, timeout: Duration) -> std::process::ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            match self
                .child
                .try_wait()
                .expect("failed to check daemon status")
            {
                Some(status) => return status,
                None => {
                    if Instant::now() >= deadline {
                        self.child.kill().ok();
                        return self.child.wait().expect("failed to wait on killed daemon");
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    /// Extract PIDs from "spawned (pid=NNN" log lines.
    pub fn spawned_pids(&self) -> Vec<u32> {
        let lines = self.log_lines.lock().unwrap();
        lines
            .iter()
            .filter_map(|l| {
                let marker = "spawned (pid=";
                let start = l.find(marker)? + marker.len();
                let end = l[start..].find(|c: char| !c.is_ascii_digit())? + start;
                l[start..end].parse().ok()
            })
            .collect()
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// True when `pid` exists and is not a zombie. Orphans of a crashed daemon
/// are reparented away from the test, so their zombies may linger.
pub fn pid_is_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rfind(')')
            .and_then(|i| stat[i + 1..].trim_start().chars().next())
            .is_some_and(|state| state != 'Z' && state != 'X'),
        Err(_) => false,
    }
}

/// Wait until a PID is no longer alive, or timeout.
pub fn wait_for_pid_gone(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !pid_is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Wait until `path` exists and has at least `n` lines.
pub fn wait_for_lines(path: &Path, n: usize, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let count = std::fs::read_to_string(path)
            .map(|s| s.lines().count())
            .unwrap_or(0);
        if count >= n {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
