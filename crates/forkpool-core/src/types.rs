use crate::naming::DatasetPath;
use serde::{Deserialize, Serialize};

/// Primitive storage engine operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineOp {
    Create,
    Destroy,
    List,
    Snapshot,
    Clone,
    Promote,
    Rename,
    SetExport,
}

impl EngineOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineOp::Create => "create",
            EngineOp::Destroy => "destroy",
            EngineOp::List => "list",
            EngineOp::Snapshot => "snapshot",
            EngineOp::Clone => "clone",
            EngineOp::Promote => "promote",
            EngineOp::Rename => "rename",
            EngineOp::SetExport => "set-export",
        }
    }

    /// Calls that can be repeated after an engine error without touching
    /// anything a previous attempt may have changed
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineOp::List | EngineOp::Snapshot | EngineOp::Clone)
    }
}

impl std::fmt::Display for EngineOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot generation number, unique per target
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(u64);

impl Generation {
    pub const FIRST: Generation = Generation(1);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// `None` once the counter is exhausted
    pub fn next(&self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One data row of a dataset listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRow {
    pub path: DatasetPath,
    pub used: String,
    pub avail: String,
    pub refer: String,
    /// Filesystem mount path; `None` for snapshots and unmounted datasets
    pub mountpoint: Option<String>,
    /// Snapshot this dataset was cloned from
    pub origin: Option<DatasetPath>,
}

impl DatasetRow {
    /// Row with placeholder sizes, used by in-memory engines
    pub fn bare(path: DatasetPath) -> Self {
        Self {
            path,
            used: "-".to_string(),
            avail: "-".to_string(),
            refer: "-".to_string(),
            mountpoint: None,
            origin: None,
        }
    }
}

/// Options for listing datasets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Restrict the listing to this dataset and its descendants
    pub recurse_from: Option<DatasetPath>,
    /// List snapshots instead of filesystems
    pub snapshots_only: bool,
    /// Maximum depth below `recurse_from`
    pub depth: Option<u32>,
}

impl ListOptions {
    pub fn datasets_under(root: &DatasetPath) -> Self {
        Self {
            recurse_from: Some(root.clone()),
            snapshots_only: false,
            depth: None,
        }
    }

    pub fn snapshots_of(target: &DatasetPath) -> Self {
        Self {
            recurse_from: Some(target.clone()),
            snapshots_only: true,
            depth: Some(1),
        }
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }
}

/// Checkpoints of the promote workflow, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PromotionPhase {
    Pending,
    BranchPruned,
    Promoted,
    SiblingsDestroyed,
    OldCacheDestroyed,
    Renamed,
    /// Stopped before the old cache was touched; nothing to recover
    Aborted,
}

impl PromotionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromotionPhase::Pending => "Pending",
            PromotionPhase::BranchPruned => "BranchPruned",
            PromotionPhase::Promoted => "Promoted",
            PromotionPhase::SiblingsDestroyed => "SiblingsDestroyed",
            PromotionPhase::OldCacheDestroyed => "OldCacheDestroyed",
            PromotionPhase::Renamed => "Renamed",
            PromotionPhase::Aborted => "Aborted",
        }
    }

    /// Check whether `next` may follow this phase
    ///
    /// Pruning and sibling destruction are skipped when there is nothing
    /// to remove or the sibling policy retains them.
    pub fn can_transition_to(&self, next: PromotionPhase) -> bool {
        use PromotionPhase::*;
        matches!(
            (self, next),
            (Pending, BranchPruned)
                | (Pending, Promoted)
                | (BranchPruned, Promoted)
                | (Promoted, SiblingsDestroyed)
                | (Promoted, OldCacheDestroyed)
                | (SiblingsDestroyed, OldCacheDestroyed)
                | (OldCacheDestroyed, Renamed)
                | (Pending | BranchPruned | Promoted | SiblingsDestroyed, Aborted)
        )
    }

    /// The old cache is gone but the branch has not taken its place
    pub fn is_inconsistent(&self) -> bool {
        *self == PromotionPhase::OldCacheDestroyed
    }

    /// No further phase follows
    pub fn is_done(&self) -> bool {
        matches!(self, PromotionPhase::Renamed | PromotionPhase::Aborted)
    }
}

impl std::fmt::Display for PromotionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
