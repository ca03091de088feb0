mod mock;
mod zfs;

pub use mock::MockStorageEngine;
pub use zfs::{ZfsConfig, ZfsStorageEngine};

use async_trait::async_trait;
use forkpool_core::{DatasetPath, DatasetRow, Generation, ListOptions, Result};

/// Capability interface over a copy-on-write storage engine
///
/// Each call is atomic on its own; nothing spans calls. `ZfsStorageEngine`
/// drives the `zfs` CLI, `MockStorageEngine` models the same semantics in
/// memory for tests and development.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Create a filesystem. Fails with AlreadyExists if present and NotFound
    /// if its parent is missing.
    async fn create_dataset(&self, path: &DatasetPath) -> Result<()>;

    /// Destroy a filesystem or snapshot. `recursive` also removes child
    /// filesystems and snapshots; dependent clones elsewhere still block it.
    async fn destroy_dataset(&self, path: &DatasetPath, recursive: bool) -> Result<()>;

    /// List filesystems or snapshots. Rows never include a header.
    async fn list_datasets(&self, opts: &ListOptions) -> Result<Vec<DatasetRow>>;

    /// Snapshot `target` as `{target}@{generation}` and return that path
    async fn snapshot(&self, target: &DatasetPath, generation: Generation)
        -> Result<DatasetPath>;

    /// Create a writable clone of `snapshot` at `destination`
    async fn clone_snapshot(
        &self,
        snapshot: &DatasetPath,
        destination: &DatasetPath,
    ) -> Result<DatasetPath>;

    /// Reverse the clone dependency between `branch` and its origin
    async fn promote(&self, branch: &DatasetPath) -> Result<()>;

    /// Move a filesystem, its children and its snapshots
    async fn rename(&self, from: &DatasetPath, to: &DatasetPath) -> Result<()>;

    /// Toggle the network share of a filesystem
    async fn set_export(&self, path: &DatasetPath, enabled: bool) -> Result<()>;
}
