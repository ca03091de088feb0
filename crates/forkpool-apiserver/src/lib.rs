//! Forkpool API server
//!
//! HTTP surface over [`forkpool_manager::CacheBranchManager`]:
//! - cache lifecycle under `/caches`
//! - branch creation, promotion, export and destruction under
//!   `/caches/{name}/branches`
//! - JSON failure bodies carrying the error kind, operation and path

pub mod error;
pub mod handlers;
pub mod response;
pub mod server;
pub mod state;
pub mod validation;

pub use error::{ApiError, Result};
pub use server::{ApiServer, Config};
pub use state::AppState;
