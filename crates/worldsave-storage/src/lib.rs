#![forbid(unsafe_code)]
//! File-backed persistence for the worldsave record stores.
//!
//! Provides:
//! - A coalescing, per-key single-flight save queue (`SaveQueue`)
//! - Crash-atomic JSON writes (temp sibling + rename, bounded rename retry)
//! - A resettable directory existence cache
//! - One-file-per-record entity stores and the `World` bundle of all five

pub mod atomic;
pub mod dir_cache;
pub mod save_queue;
pub mod store;

use std::path::PathBuf;

use thiserror::Error;

pub use atomic::{
    RenameRetryPolicy, TEMP_SUFFIX, is_transient_rename_error, sweep_stale_temp_files,
    temp_path_for, write_atomic, write_atomic_with, write_json_atomic,
};
pub use dir_cache::{DirCache, DirCacheHandle, ensure_dir, global_dir_cache};
pub use save_queue::{Phase, SaveQueue, SaveQueueBuilder, SaveQueueStats, SaveTicket};
pub use store::{EntityStore, StoreOptions, World, WorldStats};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rename into {} failed after {attempts} attempts: {source}", path.display())]
    RenameExhausted {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid record id: {0:?}")]
    InvalidKey(String),

    #[error("{kind} record not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} record already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("save function panicked: {0}")]
    SavePanicked(String),
}

impl StorageError {
    /// Stable, machine-readable name for logs and CLI output.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::RenameExhausted { .. } => "RENAME_EXHAUSTED",
            Self::InvalidKey(_) => "INVALID_KEY",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::SavePanicked(_) => "SAVE_PANICKED",
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
