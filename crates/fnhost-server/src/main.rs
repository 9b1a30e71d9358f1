// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fnhost - build, run and route to single-binary HTTP functions
//!
//! `fnhost serve` runs the router; `fnhost upload` bundles a directory and
//! deploys it to a running router.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use fnhost_client::UploadClient;
use fnhost_server::config::Config;
use fnhost_server::runtime::ServerRuntime;

#[derive(Debug, Parser)]
#[command(name = "fnhost")]
#[command(about = "Function host: build, run and route to HTTP functions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Start the router")]
    Serve {
        #[arg(long, env = "FNHOST_BIND_ADDR", help = "listen address")]
        addr: Option<IpAddr>,

        #[arg(short, long, env = "FNHOST_PORT", help = "listen port")]
        port: Option<u16>,

        #[arg(long, env = "FNHOST_BASE_DIR", help = "directory for sources and binaries")]
        base_dir: Option<PathBuf>,
    },
    #[command(about = "Bundle a directory and deploy it as a function")]
    Upload {
        #[arg(short, long, default_value = ".", help = "function source directory")]
        dir: PathBuf,

        #[arg(short, long, help = "function name")]
        name: String,

        #[arg(long, default_value = "http://127.0.0.1:9000", help = "router address")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fnhost_server=info,fnhost_core=info,tower_http=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    match Cli::parse().command {
        Commands::Serve {
            addr,
            port,
            base_dir,
        } => serve(addr, port, base_dir).await,
        Commands::Upload { dir, name, addr } => upload(&addr, &name, dir).await,
    }
}

async fn serve(addr: Option<IpAddr>, port: Option<u16>, base_dir: Option<PathBuf>) -> Result<()> {
    let mut config = Config::from_env()?;
    if let Some(addr) = addr {
        config.listen_addr.set_ip(addr);
    }
    if let Some(port) = port {
        config.listen_addr.set_port(port);
    }
    if let Some(base_dir) = base_dir {
        config.base_dir = base_dir;
    }

    info!(
        addr = %config.listen_addr,
        base_dir = %config.base_dir.display(),
        "Starting fnhost"
    );

    let runtime = ServerRuntime::builder().config(config).build()?.start().await?;

    info!(addr = %runtime.local_addr(), "fnhost ready");

    shutdown_signal().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("fnhost shut down");

    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

async fn upload(addr: &str, name: &str, dir: PathBuf) -> Result<()> {
    let client = UploadClient::new(addr)?;
    let response = client.upload(name, &dir).await?;
    info!(function = %response.func_name, status = %response.status, "Function deployed");
    println!("{} deployed", response.func_name);
    Ok(())
}
