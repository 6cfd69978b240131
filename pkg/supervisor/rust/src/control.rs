// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Operator control protocol: one JSON request per line over a Unix
//! socket, answered by one JSON response line.
//!
//! ```text
//! -> {"cmd":"status"}
//! <- {"ok":true,"services":[{"name":"logger","state":"running",...}]}
//! -> {"cmd":"stop","name":"logger"}
//! <- {"ok":true,"services":[...]}
//! ```

use crate::state::ServiceStatus;
use crate::supervisor::{Control, ServiceHandle};
use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::Permissions;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

const SOCKET_MODE: u32 = 0o660;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum Request {
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Start {
        name: String,
    },
    Stop {
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceStatus>,
}

impl Response {
    fn ok(services: Vec<ServiceStatus>) -> Self {
        Self {
            ok: true,
            error: None,
            services,
        }
    }

    fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(msg.into()),
            services: Vec::new(),
        }
    }
}

/// Bind the control socket, replacing a leftover one from a previous run.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::remove_file(path)
        .or_else(|error| {
            if error.kind() == ErrorKind::NotFound {
                Ok(())
            } else {
                Err(error)
            }
        })
        .context("failed to remove existing control socket")?;

    let listener = UnixListener::bind(path)
        .with_context(|| format!("could not create control socket {}", path.display()))?;
    std::fs::set_permissions(path, Permissions::from_mode(SOCKET_MODE))
        .context("could not set control socket permissions")?;
    Ok(listener)
}

/// Answers operator requests by forwarding them to the monitoring loops.
pub struct ControlServer {
    handles: Arc<BTreeMap<String, ServiceHandle>>,
}

impl ControlServer {
    pub fn new(handles: &[ServiceHandle]) -> Self {
        Self {
            handles: Arc::new(
                handles
                    .iter()
                    .map(|h| (h.name().to_string(), h.clone()))
                    .collect(),
            ),
        }
    }

    pub async fn serve(self, listener: UnixListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handles = Arc::clone(&self.handles);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, &handles).await {
                                debug!("control connection ended: {e:#}");
                            }
                        });
                    }
                    Err(e) => warn!("control socket accept failed: {e}"),
                },
            }
        }
        debug!("control server stopped");
    }
}

async fn serve_connection(
    stream: UnixStream,
    handles: &BTreeMap<String, ServiceHandle>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle(request, handles).await,
            Err(e) => Response::error(format!("bad request: {e}")),
        };
        let mut body = serde_json::to_vec(&response)?;
        body.push(b'\n');
        writer.write_all(&body).await?;
    }
    Ok(())
}

async fn handle(request: Request, handles: &BTreeMap<String, ServiceHandle>) -> Response {
    match request {
        Request::Status { name: None } => {
            Response::ok(handles.values().map(ServiceHandle::status).collect())
        }
        Request::Status { name: Some(name) } => match handles.get(&name) {
            Some(h) => Response::ok(vec![h.status()]),
            None => Response::error(format!("unknown service '{name}'")),
        },
        Request::Start { name } => forward(handles, &name, Control::Start).await,
        Request::Stop { name } => forward(handles, &name, Control::Stop).await,
    }
}

async fn forward(
    handles: &BTreeMap<String, ServiceHandle>,
    name: &str,
    request: Control,
) -> Response {
    let Some(handle) = handles.get(name) else {
        return Response::error(format!("unknown service '{name}'"));
    };
    info!("[{name}] operator requested {request:?}");
    if !handle.send(request).await {
        return Response::error(format!("service '{name}' is shutting down"));
    }
    Response::ok(vec![handle.status()])
}

/// Send one request to the daemon and wait for its answer.
pub async fn request(socket: &Path, request: &Request) -> Result<Response> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("could not connect to {}", socket.display()))?;
    let (reader, mut writer) = stream.into_split();

    let mut body = serde_json::to_vec(request)?;
    body.push(b'\n');
    writer.write_all(&body).await?;
    writer.shutdown().await?;

    let mut lines = BufReader::new(reader).lines();
    let Some(line) = lines.next_line().await? else {
        bail!("daemon closed the connection without answering");
    };
    serde_json::from_str(&line).context("malformed response from daemon")
}

/// Render statuses the way `dl-supervisor status` prints them.
pub fn format_status_table(services: &[ServiceStatus]) -> String {
    let dash = || "-".to_string();
    let rows: Vec<[String; 6]> = services
        .iter()
        .map(|s| {
            [
                s.name.clone(),
                s.state.to_string(),
                s.pid.map_or_else(dash, |p| p.to_string()),
                s.restart_count.to_string(),
                s.last_exit_code.map_or_else(dash, |c| c.to_string()),
                s.installed_fingerprint
                    .as_deref()
                    .map_or_else(dash, |f| f.chars().take(12).collect()),
            ]
        })
        .collect();

    let header = ["NAME", "STATE", "PID", "RESTARTS", "LAST EXIT", "ARTIFACT"];
    let mut widths = header.map(str::len);
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }

    let mut out = String::new();
    let header = header.map(String::from);
    for row in std::iter::once(&header).chain(&rows) {
        let line: Vec<String> = row
            .iter()
            .zip(widths)
            .map(|(cell, w)| format!("{cell:<w$}"))
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactState, ArtifactTable, StateDir};
    use crate::service::{ArtifactRef, ServiceDescriptor};
    use crate::state::ProcessState;
    use crate::supervisor::{LoopContext, Supervisor};
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_string(&Request::Stop {
            name: "logger".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"cmd":"stop","name":"logger"}"#);

        let parsed: Request = serde_json::from_str(r#"{"cmd":"status"}"#).unwrap();
        assert_eq!(parsed, Request::Status { name: None });
        assert!(serde_json::from_str::<Request>(r#"{"cmd":"reboot"}"#).is_err());
    }

    #[test]
    fn test_format_status_table() {
        let mut running = ServiceStatus::new("modbus-datalogger");
        running.state = ProcessState::Running;
        running.pid = Some(4242);
        running.restart_count = 3;
        running.last_exit_code = Some(1);
        running.installed_fingerprint = Some("0123456789abcdef0123".into());
        let stopped = ServiceStatus::new("publisher");

        let table = format_status_table(&[running, stopped]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("NAME"));
        assert!(lines[1].contains("running"));
        assert!(lines[1].contains("4242"));
        assert!(lines[1].contains("0123456789ab"));
        assert!(!lines[1].contains("0123456789abc"));
        assert!(lines[2].starts_with("publisher"));
        assert!(lines[2].contains("stopped"));
        // Columns line up.
        assert_eq!(lines[1].find("running"), lines[2].find("stopped"));
    }

    #[test]
    fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        std::fs::write(&path, "").unwrap();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            bind(&path).unwrap();
        });
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, SOCKET_MODE);
    }

    #[tokio::test]
    async fn test_status_start_stop_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let state_dir = StateDir::new(tmp.path().join("state"));
        state_dir.create_all().unwrap();
        let installed = state_dir.artifact_path("svc");
        std::fs::write(&installed, "exec sleep 60\n").unwrap();
        let artifacts = Arc::new(ArtifactTable::new());
        artifacts.publish(
            "svc",
            ArtifactState {
                installed_path: installed,
                installed_fingerprint: "abc".into(),
                last_checked_at: None,
            },
        );

        let mut svc = ServiceDescriptor::new(
            "svc",
            ArtifactRef::File {
                path: "/unused".into(),
            },
        );
        svc.interpreter = Some(PathBuf::from("/bin/sh"));
        svc.auto_start = false;
        svc.stop_timeout = Duration::from_secs(2);

        let ctx = LoopContext {
            state_dir,
            log_dir: tmp.path().join("log"),
            artifacts,
        };
        let sup = Supervisor::start(&[svc], ctx, CancellationToken::new()).unwrap();
        let socket = tmp.path().join("ctl.sock");
        let listener = bind(&socket).unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(ControlServer::new(sup.handles()).serve(listener, cancel.clone()));

        let status = request(&socket, &Request::Status { name: None }).await.unwrap();
        assert!(status.ok);
        assert_eq!(status.services.len(), 1);
        assert_eq!(status.services[0].state, ProcessState::Stopped);

        let started = request(&socket, &Request::Start { name: "svc".into() }).await.unwrap();
        assert!(started.ok);
        let running = sup
            .handle("svc")
            .unwrap()
            .wait_for(|s| s.state == ProcessState::Running)
            .await;
        assert_eq!(running.installed_fingerprint.as_deref(), Some("abc"));

        let stopped = request(&socket, &Request::Stop { name: "svc".into() }).await.unwrap();
        assert!(stopped.ok);
        sup.handle("svc")
            .unwrap()
            .wait_for(|s| s.state == ProcessState::Stopped)
            .await;

        let unknown = request(&socket, &Request::Start { name: "nope".into() }).await.unwrap();
        assert!(!unknown.ok);
        assert!(unknown.error.unwrap().contains("nope"));

        cancel.cancel();
        server.await.unwrap();
        sup.shutdown().await;
    }
}
