// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Host configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_control_socket() -> PathBuf {
    PathBuf::from("/run/teadfs/control.sock")
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Configuration of one TEADFS mount host, loadable from JSON.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FsConfig {
    /// Directory holding the real (possibly encrypted) files.
    pub lower_root: PathBuf,
    /// Where the stacked view is presented. File-path blobs sent to the
    /// daemon are absolute under this prefix.
    pub mount_point: PathBuf,
    /// Control socket the policy daemon attaches to.
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,
    /// How long a single daemon round-trip may block before the caller
    /// observes a timeout.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl FsConfig {
    pub fn new(lower_root: impl Into<PathBuf>, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            lower_root: lower_root.into(),
            mount_point: mount_point.into(),
            control_socket: default_control_socket(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
