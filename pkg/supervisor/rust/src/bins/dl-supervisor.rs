// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use dl_supervisor::control::{self, Request};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dl-supervisor", version, about = "Control a running dl-supervisord")]
struct Cli {
    /// Control socket of the daemon
    #[arg(long, default_value = "/run/dl-supervisor.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the state of one or all services
    Status { name: Option<String> },
    /// Start a stopped service, or skip its remaining backoff
    Start { name: String },
    /// Gracefully stop a service until it is started again
    Stop { name: String },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let request = match cli.command {
        Command::Status { name } => Request::Status { name },
        Command::Start { name } => Request::Start { name },
        Command::Stop { name } => Request::Stop { name },
    };

    let response = control::request(&cli.socket, &request).await?;
    if !response.ok {
        bail!(
            "{}",
            response.error.unwrap_or_else(|| "request failed".to_string())
        );
    }
    print!("{}", control::format_status_table(&response.services));
    Ok(())
}
