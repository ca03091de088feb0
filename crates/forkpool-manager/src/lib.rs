pub mod config;
pub mod journal;
pub mod locks;
pub mod manager;

pub use config::{DestroyPolicy, ManagerConfig, RetryPolicy, SiblingPolicy};
pub use journal::{Checkpoint, PromotionJournal, PromotionRecord};
pub use locks::KeyedLocks;
pub use manager::{BranchCreated, CacheBranchManager, PromotionOutcome};
