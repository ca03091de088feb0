use forkpool_core::{ForkpoolError, Result};
use std::str::FromStr;
use std::time::Duration;

/// What happens to the other branches of a cache when one is promoted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SiblingPolicy {
    /// Destroy every other branch (and the promoted branch's own nested
    /// branches) so the new cache starts clean
    #[default]
    Destroy,
    /// Leave other branches in place; promotion fails at the destroy step
    /// if one still depends on a snapshot the old cache keeps
    Retain,
}

/// What `destroy_cache` does when branches still exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DestroyPolicy {
    #[default]
    Reject,
    Cascade,
}

impl FromStr for SiblingPolicy {
    type Err = ForkpoolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "destroy" => Ok(SiblingPolicy::Destroy),
            "retain" => Ok(SiblingPolicy::Retain),
            other => Err(ForkpoolError::validation(format!(
                "unknown sibling policy '{}', expected destroy or retain",
                other
            ))),
        }
    }
}

impl FromStr for DestroyPolicy {
    type Err = ForkpoolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reject" => Ok(DestroyPolicy::Reject),
            "cascade" => Ok(DestroyPolicy::Cascade),
            other => Err(ForkpoolError::validation(format!(
                "unknown destroy policy '{}', expected reject or cascade",
                other
            ))),
        }
    }
}

/// Bounded retry of non-destructive engine calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; 1 disables retries
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Configuration for the cache/branch manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Upper bound for every single storage engine call
    pub command_timeout: Duration,
    pub retry: RetryPolicy,
    pub sibling_policy: SiblingPolicy,
    pub destroy_policy: DestroyPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            sibling_policy: SiblingPolicy::default(),
            destroy_policy: DestroyPolicy::default(),
        }
    }
}
