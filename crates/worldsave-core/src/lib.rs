//! Core types, configuration, and records for worldsave
//!
//! This crate provides:
//! - Configuration management (`Config`, environment parsing)
//! - Persisted record models (`Agent`, `User`, `Location`, `Inventory`, `Gimmick`)
//! - Lock ordering helpers and lock-free metrics shared by the storage layer
//! - Common error types

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod lock_order;
pub mod metrics;
pub mod models;

// Re-export key types for convenience
pub use config::Config;
pub use error::{Error as CoreError, Result as CoreResult};
pub use lock_order::{LockLevel, OrderedMutex, OrderedRwLock};
pub use metrics::{
    Counter, GaugeU64, GlobalMetricsSnapshot, StorageMetricsSnapshot, global_metrics,
};
pub use models::{
    Agent, Gimmick, Inventory, Item, Location, RECORD_KINDS, Record, User, validate_kind,
    validate_record_id,
};
