// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! TEADFS policy daemon
//!
//! Attaches to a mount host's control socket, answers access verdicts and
//! runs the byte transforms for decrypt-mode opens.

mod policy;

use anyhow::{Context, Result};
use clap::Parser;
use policy::{PolicyConfig, XorPolicy};
use std::path::PathBuf;
use teadfs_client::PolicyClient;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "teadfs-daemon", about = "TEADFS policy daemon")]
struct Args {
    /// Policy configuration (JSON).
    #[arg(long, env = "TEADFS_POLICY_CONFIG")]
    config: PathBuf,

    /// Override the control socket from the configuration file.
    #[arg(long)]
    socket: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<PolicyConfig> {
    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading config {}", args.config.display()))?;
    let mut config: PolicyConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parsing config {}", args.config.display()))?;
    if let Some(socket) = &args.socket {
        config.control_socket = socket.clone();
    }
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    info!(socket = %config.control_socket.display(), "starting policy daemon");

    let mut client = PolicyClient::connect(&config.control_socket)?;
    let mut handler = XorPolicy::new(config);
    client.serve(&mut handler)?;
    info!("mount host went away, exiting");
    Ok(())
}
