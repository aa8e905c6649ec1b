// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Inode open coordinator
//!
//! Each lower inode gets exactly one shared lower file handle, no matter
//! how many opens stack on top of it. The 0-to-1 transition is the only
//! opener that performs the real open; the N-to-0 transition flushes and
//! runs the release hook before the handle is dropped. Both transitions
//! are covered by the per-inode mutex; daemon-reentrant opens bypass the
//! whole coordinator and never touch the refcount.

use crate::error::{FsError, FsResult};
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Shared state of one lower inode.
pub struct InodeState {
    pub file_id: u64,
    /// Path relative to the mount root, shared by every open of this inode.
    pub rel_path: PathBuf,
    lower: Mutex<Option<Arc<File>>>,
    count: AtomicI64,
    /// Set when any open on this inode received a DECRYPT verdict. Getattr
    /// consults it to decide whether to re-ask the daemon about the path.
    decrypt_marked: AtomicBool,
}

impl InodeState {
    fn new(file_id: u64, rel_path: PathBuf) -> Self {
        Self {
            file_id,
            rel_path,
            lower: Mutex::new(None),
            count: AtomicI64::new(0),
            decrypt_marked: AtomicBool::new(false),
        }
    }

    /// Acquire the shared lower handle, opening it via `open` on the
    /// 0-to-1 transition only.
    pub fn get_lower_file(&self, open: impl FnOnce() -> FsResult<File>) -> FsResult<Arc<File>> {
        let mut slot = self.lower.lock().unwrap();
        let previous = self.count.fetch_add(1, Ordering::AcqRel);
        if previous < 0 {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return Err(FsError::Invalid);
        }
        if previous == 0 {
            debug_assert!(slot.is_none());
            match open() {
                Ok(file) => *slot = Some(Arc::new(file)),
                Err(err) => {
                    self.count.fetch_sub(1, Ordering::AcqRel);
                    return Err(err);
                }
            }
        }
        match slot.as_ref() {
            Some(file) => Ok(Arc::clone(file)),
            // previous > 0 with an empty slot means the refcount was
            // corrupted somewhere.
            None => {
                self.count.fetch_sub(1, Ordering::AcqRel);
                Err(FsError::Invalid)
            }
        }
    }

    /// Drop one reference. On the N-to-0 transition the handle is flushed
    /// and `release` runs with the mutex held, before the handle goes away.
    pub fn put_lower_file(
        &self,
        release: impl FnOnce(&File) -> FsResult<()>,
    ) -> FsResult<()> {
        let previous = self.count.fetch_sub(1, Ordering::AcqRel);
        if previous <= 0 {
            self.count.fetch_add(1, Ordering::AcqRel);
            return Err(FsError::Invalid);
        }
        if previous > 1 {
            return Ok(());
        }

        let mut slot = self.lower.lock().unwrap();
        // Another open may have raced in between the decrement and the
        // lock; the handle then stays alive for it.
        if self.count.load(Ordering::Acquire) != 0 {
            return Ok(());
        }
        if let Some(file) = slot.take() {
            file.sync_all()?;
            release(&file)?;
        }
        Ok(())
    }

    pub fn open_count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn mark_decrypt(&self) {
        self.decrypt_marked.store(true, Ordering::Release);
    }

    pub fn is_decrypt_marked(&self) -> bool {
        self.decrypt_marked.load(Ordering::Acquire)
    }
}

/// Table of live inode states, keyed by the lower inode number.
pub struct InodeTable {
    entries: Mutex<HashMap<u64, Arc<InodeState>>>,
}

impl InodeTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the state for `file_id`.
    pub fn entry(&self, file_id: u64, rel_path: &std::path::Path) -> Arc<InodeState> {
        let mut entries = self.entries.lock().unwrap();
        Arc::clone(
            entries
                .entry(file_id)
                .or_insert_with(|| Arc::new(InodeState::new(file_id, rel_path.to_path_buf()))),
        )
    }

    pub fn lookup(&self, file_id: u64) -> Option<Arc<InodeState>> {
        self.entries.lock().unwrap().get(&file_id).cloned()
    }

    /// Drop the state for `file_id` if nothing holds it open. Returns the
    /// evicted state so the caller can emit the one-way CLEANUP notice.
    pub fn evict(&self, file_id: u64) -> Option<Arc<InodeState>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&file_id) {
            Some(state) if state.open_count() == 0 => {
                debug!(file_id, "evicting idle inode state");
                entries.remove(&file_id)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
