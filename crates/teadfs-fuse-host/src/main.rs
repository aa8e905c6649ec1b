// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! TEADFS FUSE Host — Linux filesystem adapter
//!
//! Mounts a transparent-encryption view over a lower directory and runs
//! the control socket the policy daemon attaches to.

#[cfg(all(feature = "fuse", target_os = "linux"))]
mod adapter;

use anyhow::{bail, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use teadfs_core::{spawn_control_server, FsConfig, TeadFs};
use tracing::info;
#[cfg(not(all(feature = "fuse", target_os = "linux")))]
use tracing::warn;

#[derive(Parser)]
struct Args {
    /// Mount point for the filesystem
    mount_point: PathBuf,

    /// Lower directory holding the real (possibly encrypted) files
    #[arg(long)]
    lower_root: Option<PathBuf>,

    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Allow other users to access the filesystem
    #[arg(long)]
    allow_other: bool,

    /// Auto unmount on process exit
    #[arg(long)]
    auto_unmount: bool,
}

fn load_config(args: &Args) -> Result<FsConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let content = fs::read_to_string(path)?;
            serde_json::from_str::<FsConfig>(&content)?
        }
        None => match &args.lower_root {
            Some(lower_root) => FsConfig::new(lower_root.clone(), args.mount_point.clone()),
            None => bail!("either --config or --lower-root is required"),
        },
    };
    if let Some(lower_root) = &args.lower_root {
        config.lower_root = lower_root.clone();
    }
    config.mount_point = args.mount_point.clone();
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    info!("Starting TEADFS FUSE host");
    info!("Mount point: {}", args.mount_point.display());

    let config = load_config(&args)?;
    info!("Configuration loaded: {:?}", config);

    let fs = Arc::new(TeadFs::new(config.clone()));
    spawn_control_server(&config.control_socket, Arc::clone(fs.bus()))?;

    #[cfg(all(feature = "fuse", target_os = "linux"))]
    {
        let filesystem = adapter::TeadFsFuse::new(Arc::clone(&fs));

        let mut mount_options = vec![
            fuser::MountOption::FSName("teadfs".to_string()),
            fuser::MountOption::Subtype("teadfs".to_string()),
            fuser::MountOption::DefaultPermissions,
        ];
        if args.allow_other {
            mount_options.push(fuser::MountOption::AllowOther);
        }
        if args.auto_unmount {
            mount_options.push(fuser::MountOption::AutoUnmount);
        }

        info!("Mounting filesystem...");
        fuser::mount2(filesystem, &args.mount_point, &mount_options)?;
        fs.bus().detach();
    }

    #[cfg(not(all(feature = "fuse", target_os = "linux")))]
    {
        warn!("FUSE support not compiled in. This binary is for testing only.");
        info!("To enable FUSE support, compile with: cargo build --features fuse");
    }

    Ok(())
}
