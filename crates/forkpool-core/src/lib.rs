//! Forkpool Core - naming, versioning and error types for copy-on-write
//! caches and branches
//!
//! This crate provides:
//! - Error types with miette diagnostics
//! - Typed dataset paths and the naming scheme that builds them
//! - Snapshot generation sequencing
//! - Parsing of the storage engine's dataset listings

pub mod error;
pub mod listing;
pub mod naming;
pub mod sequencer;
pub mod types;

// Re-export commonly used types
pub use error::{ForkpoolError, Result};
pub use listing::{find_row, parse_table};
pub use naming::{snapshot_path, validate_identifier, DatasetPath, NamingScheme};
pub use sequencer::{next_generation, next_generation_for};
pub use types::{DatasetRow, EngineOp, Generation, ListOptions, PromotionPhase};
