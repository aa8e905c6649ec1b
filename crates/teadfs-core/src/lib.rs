// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! TEADFS core
//!
//! Host-side engine of the stacked transparent-encryption filesystem: the
//! daemon-presence gate, the correlated request engine and its control
//! socket transport, the per-inode open coordinator, the access decision
//! state machine and the transforming I/O adapter. The FUSE host binary is
//! a thin shell over [`TeadFs`].

pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod gate;
pub mod inode;
pub mod io;
pub mod transport;
pub mod vfs;

pub use config::FsConfig;
pub use decision::{normalize_flags, AccessMode};
pub use engine::{RequestEngine, Transport};
pub use error::{FsError, FsResult};
pub use gate::DaemonGate;
pub use inode::{InodeState, InodeTable};
pub use transport::{spawn_control_server, Bus, DaemonLink};
pub use vfs::{OpenFile, TeadFs};
