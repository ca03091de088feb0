// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use crate::types::{EngineOp, PromotionPhase};
use miette::Diagnostic;
use std::time::Duration;
use thiserror::Error;

/// Core error type for Forkpool operations
#[derive(Error, Debug, Diagnostic)]
pub enum ForkpoolError {
    /// Bad or missing input
    #[error("Validation failed: {message}")]
    #[diagnostic(
        code(forkpool::validation),
        help("Cache names and branch identifiers may only contain letters, digits, '-', '_', '.' and ':'")
    )]
    Validation {
        #[allow(unused)]
        message: String,
    },

    /// Cache, branch or snapshot absent
    #[error("{what} not found: {path}")]
    #[diagnostic(
        code(forkpool::not_found),
        help("List existing datasets with `zfs list -r {path}` or GET /caches")
    )]
    NotFound {
        #[allow(unused)]
        what: String,
        #[allow(unused)]
        path: String,
    },

    /// Target dataset already exists
    #[error("Already exists: {path}")]
    #[diagnostic(
        code(forkpool::already_exists),
        help("Choose a different name, or destroy the existing dataset first")
    )]
    AlreadyExists {
        #[allow(unused)]
        path: String,
    },

    /// Cache destroy rejected because branches still exist under it
    #[error("Cache '{cache}' still has {count} branch(es)")]
    #[diagnostic(
        code(forkpool::branches_exist),
        help("Destroy the branches first, or run with --destroy-policy cascade")
    )]
    BranchesExist {
        #[allow(unused)]
        cache: String,
        #[allow(unused)]
        count: usize,
    },

    /// The storage engine reported a failure
    #[error("Storage engine {operation} failed on '{path}' (exit code {exit_code}): {stderr}")]
    #[diagnostic(
        code(forkpool::engine),
        help("Inspect the dataset with `zfs list -t all -r {path}` before retrying")
    )]
    Engine {
        #[allow(unused)]
        operation: EngineOp,
        #[allow(unused)]
        path: String,
        #[allow(unused)]
        exit_code: i32,
        #[allow(unused)]
        stderr: String,
    },

    /// A storage engine call exceeded its time limit
    #[error("Storage engine {operation} on '{path}' timed out after {limit:?}")]
    #[diagnostic(
        code(forkpool::timeout),
        help("The engine may still complete the call. Check the dataset state before retrying")
    )]
    Timeout {
        #[allow(unused)]
        operation: EngineOp,
        #[allow(unused)]
        path: String,
        #[allow(unused)]
        limit: Duration,
    },

    /// Engine output or a dataset path could not be parsed
    #[error("Parse error for '{input}': {message}")]
    #[diagnostic(code(forkpool::parse))]
    Parse {
        #[allow(unused)]
        input: String,
        #[allow(unused)]
        message: String,
    },

    /// A promotion stopped after the old cache was destroyed
    #[error(
        "Promotion of '{branch_path}' into cache '{cache}' stopped at phase {phase}: {message}"
    )]
    #[diagnostic(
        code(forkpool::inconsistent_state),
        help("Operator intervention required. Retry the rename with POST /caches/{cache}/branches/<sha>/promote/resume, or run `zfs rename {branch_path} <cache path>`")
    )]
    InconsistentState {
        #[allow(unused)]
        cache: String,
        #[allow(unused)]
        branch_path: String,
        #[allow(unused)]
        phase: PromotionPhase,
        #[allow(unused)]
        message: String,
    },

    /// Promotion journal could not be read or written
    #[error("Promotion journal error: {message}")]
    #[diagnostic(
        code(forkpool::journal),
        help("Check that the journal directory exists and is writable")
    )]
    Journal {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(forkpool::internal),
        help("This is likely a bug. Please report it with the full error details")
    )]
    Internal {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for Forkpool operations
pub type Result<T> = std::result::Result<T, ForkpoolError>;

impl ForkpoolError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>, path: impl Into<String>) -> Self {
        Self::NotFound {
            what: what.into(),
            path: path.into(),
        }
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists { path: path.into() }
    }

    pub fn branches_exist(cache: impl Into<String>, count: usize) -> Self {
        Self::BranchesExist {
            cache: cache.into(),
            count,
        }
    }

    pub fn engine(
        operation: EngineOp,
        path: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        Self::Engine {
            operation,
            path: path.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    pub fn timeout(operation: EngineOp, path: impl Into<String>, limit: Duration) -> Self {
        Self::Timeout {
            operation,
            path: path.into(),
            limit,
        }
    }

    pub fn parse(input: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            input: input.into(),
            message: message.into(),
        }
    }

    pub fn inconsistent_state(
        cache: impl Into<String>,
        branch_path: impl Into<String>,
        phase: PromotionPhase,
        message: impl Into<String>,
    ) -> Self {
        Self::InconsistentState {
            cache: cache.into(),
            branch_path: branch_path.into(),
            phase,
            message: message.into(),
        }
    }

    pub fn journal(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Journal {
            message: message.into(),
            source,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Machine-readable error kind, stable across releases
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ValidationError",
            Self::NotFound { .. } => "NotFoundError",
            Self::AlreadyExists { .. } => "AlreadyExistsError",
            Self::BranchesExist { .. } => "BranchesExistError",
            Self::Engine { .. } => "EngineError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Parse { .. } => "ParseError",
            Self::InconsistentState { .. } => "InconsistentStateError",
            Self::Journal { .. } => "JournalError",
            Self::Internal { .. } => "InternalError",
        }
    }

    /// The storage engine operation that failed, if any
    pub fn operation(&self) -> Option<EngineOp> {
        match self {
            Self::Engine { operation, .. } | Self::Timeout { operation, .. } => Some(*operation),
            Self::InconsistentState { .. } => Some(EngineOp::Rename),
            _ => None,
        }
    }

    /// The storage path involved in the failure, if any
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::NotFound { path, .. }
            | Self::AlreadyExists { path }
            | Self::Engine { path, .. }
            | Self::Timeout { path, .. } => Some(path),
            Self::InconsistentState { branch_path, .. } => Some(branch_path),
            _ => None,
        }
    }

    /// Whether a failed call may be repeated without changing the outcome
    /// of a call that already succeeded
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Engine { .. })
    }
}

impl From<serde_json::Error> for ForkpoolError {
    fn from(err: serde_json::Error) -> Self {
        ForkpoolError::journal(format!("JSON error: {}", err), Some(Box::new(err)))
    }
}

impl From<std::io::Error> for ForkpoolError {
    fn from(err: std::io::Error) -> Self {
        ForkpoolError::journal(format!("I/O error: {}", err), Some(Box::new(err)))
    }
}
