// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::Result;
use dl_supervisor::{config, daemon};
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    simple_logger::init_with_level(config::log_level())?;
    info!(
        "dl-supervisord starting (version {})",
        env!("CARGO_PKG_VERSION")
    );

    let path = config::config_path();
    let (config, services) = config::load(&path)?;
    info!("loaded {} service(s) from {}", services.len(), path.display());

    daemon::run(config, services).await?;
    info!("dl-supervisord shutting down");
    Ok(())
}
