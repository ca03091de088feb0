//! Forkpool Engine - storage engine capability interface and backends
//!
//! This crate provides:
//! - The `StorageEngine` trait the orchestration core calls into
//! - `ZfsStorageEngine`, driving the `zfs` command line tool
//! - `MockStorageEngine`, an in-memory copy-on-write model for tests
//! - Command execution helpers with kill-on-drop semantics

pub mod command;
pub mod storage;

// Re-export storage types
pub use storage::{MockStorageEngine, StorageEngine, ZfsConfig, ZfsStorageEngine};
