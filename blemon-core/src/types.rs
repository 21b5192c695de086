//! Shared error enum and lock helpers for blemon-core.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

/// All errors produced by blemon-core.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("export failed for {path}: {reason}")]
    Export { path: String, reason: String },
}

pub type Result<T> = std::result::Result<T, MonitorError>;

// ---------------------------------------------------------------------------
// Lock helpers
// ---------------------------------------------------------------------------

// A writer that panicked mid-update leaves plain data behind (counters, flags,
// sample buffers); every reader can keep going with it.

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
