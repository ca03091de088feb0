//! Cache and branch workflows
//!
//! Every workflow is a short sequence of storage engine calls built from
//! [`NamingScheme`] paths. Each call is bounded by the configured timeout;
//! listing, snapshot and clone calls are retried on engine errors, destroy
//! and rename never are. Mutating workflows hold the cache's lock, and the
//! ones that issue destroy or rename run on their own task so a dropped
//! request cannot stop them between two destructive calls.

use crate::config::{DestroyPolicy, ManagerConfig, SiblingPolicy};
use crate::journal::{PromotionJournal, PromotionRecord};
use crate::locks::KeyedLocks;
use forkpool_core::{
    find_row, next_generation_for, validate_identifier, DatasetPath, DatasetRow, EngineOp,
    ForkpoolError, Generation, ListOptions, NamingScheme, PromotionPhase, Result,
};
use forkpool_engine::StorageEngine;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of a branch creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchCreated {
    pub path: DatasetPath,
    pub snapshot: DatasetPath,
    pub generation: Generation,
}

/// Result of a completed promotion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromotionOutcome {
    pub id: Uuid,
    pub cache: DatasetPath,
    pub promoted_from: DatasetPath,
    pub siblings_destroyed: Vec<DatasetPath>,
}

/// Orchestrates cache and branch lifecycles against a storage engine
#[derive(Clone)]
pub struct CacheBranchManager {
    engine: Arc<dyn StorageEngine>,
    naming: NamingScheme,
    config: ManagerConfig,
    locks: Arc<KeyedLocks>,
    journal: PromotionJournal,
}

impl CacheBranchManager {
    pub fn new(engine: Arc<dyn StorageEngine>, naming: NamingScheme, config: ManagerConfig) -> Self {
        Self {
            engine,
            naming,
            config,
            locks: Arc::new(KeyedLocks::new()),
            journal: PromotionJournal::disabled(),
        }
    }

    /// Persist promotion checkpoints to `journal`
    pub fn with_journal(mut self, journal: PromotionJournal) -> Self {
        self.journal = journal;
        self
    }

    pub fn naming(&self) -> &NamingScheme {
        &self.naming
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Promotions that stopped before their final rename
    pub async fn pending_promotions(&self) -> Result<Vec<PromotionRecord>> {
        self.journal.pending().await
    }

    /// Create the caches and branches roots if missing
    pub async fn initialize(&self) -> Result<()> {
        self.ensure_dataset(self.naming.caches_root()).await?;
        self.ensure_dataset(self.naming.branches_root()).await?;
        info!(
            "Initialized {} and {}",
            self.naming.caches_root(),
            self.naming.branches_root()
        );
        Ok(())
    }

    /// Paths of all caches
    pub async fn list_caches(&self) -> Result<Vec<DatasetPath>> {
        let root = self.naming.caches_root();
        let rows = self
            .list_or_empty(&ListOptions::datasets_under(root).with_depth(1))
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| row.path)
            .filter(|path| path != root)
            .collect())
    }

    pub async fn create_cache(&self, name: &str) -> Result<DatasetPath> {
        let path = self.naming.cache_path(name)?;
        let _guard = self.locks.lock(name).await;

        self.ensure_dataset(self.naming.caches_root()).await?;
        self.create(&path).await?;
        info!("Created cache {}", path);
        Ok(path)
    }

    /// Listing row of a cache, `None` if it does not exist
    pub async fn exists_cache(&self, name: &str) -> Result<Option<DatasetRow>> {
        let path = self.naming.cache_path(name)?;
        let rows = self
            .list_or_empty(&ListOptions::datasets_under(self.naming.caches_root()).with_depth(1))
            .await?;
        Ok(find_row(&rows, &path).cloned())
    }

    /// Destroy a cache, its snapshots and its branch root
    ///
    /// Existing branches are rejected or destroyed with it, depending on
    /// the configured [`DestroyPolicy`].
    pub async fn destroy_cache(&self, name: &str) -> Result<()> {
        self.naming.cache_path(name)?;
        let cache = name.to_string();
        self.exclusive(name, move |m| async move { m.destroy_cache_locked(&cache).await })
            .await
    }

    /// All branches of a cache, nested ones included, parents first
    pub async fn list_branches(&self, cache: &str) -> Result<Vec<DatasetRow>> {
        let cache_path = self.naming.cache_path(cache)?;
        if self.exists_cache(cache).await?.is_none() {
            return Err(ForkpoolError::not_found("Cache", cache_path.as_str()));
        }
        self.branches_of(cache).await
    }

    /// Listing row of a branch anywhere in the cache's branch tree
    pub async fn exists_branch(&self, cache: &str, id: &str) -> Result<Option<DatasetRow>> {
        validate_identifier("branch identifier", id)?;
        let rows = self.branches_of(cache).await?;
        Ok(rows
            .into_iter()
            .find(|row| self.branch_id(&row.path) == Some(id)))
    }

    /// Snapshot the target and clone the new snapshot into a branch
    ///
    /// The target is the cache, or the branch `parent` when given; nested
    /// branches are placed below their parent.
    pub async fn create_branch(
        &self,
        cache: &str,
        id: &str,
        parent: Option<&str>,
    ) -> Result<BranchCreated> {
        let cache_path = self.naming.cache_path(cache)?;
        validate_identifier("branch identifier", id)?;
        if let Some(parent) = parent {
            validate_identifier("parent branch identifier", parent)?;
            if parent == id {
                return Err(ForkpoolError::validation(format!(
                    "branch '{}' cannot be its own parent",
                    id
                )));
            }
        }

        let _guard = self.locks.lock(cache).await;

        if self.exists_cache(cache).await?.is_none() {
            return Err(ForkpoolError::not_found("Cache", cache_path.as_str()));
        }
        let branch_root = self.ensure_branch_root(cache).await?;
        if let Some(existing) = self.exists_branch(cache, id).await? {
            return Err(ForkpoolError::already_exists(existing.path.as_str()));
        }

        let (target, destination) = match parent {
            None => (cache_path, self.naming.branch_path(&branch_root, id)?),
            Some(parent) => {
                let parent_row = self.exists_branch(cache, parent).await?.ok_or_else(|| {
                    ForkpoolError::not_found(
                        "Parent branch",
                        format!("{}/.../{}", branch_root, parent),
                    )
                })?;
                let destination = self.naming.branch_path(&parent_row.path, id)?;
                (parent_row.path, destination)
            }
        };

        let existing: Vec<DatasetPath> = self
            .list(&ListOptions::snapshots_of(&target))
            .await?
            .into_iter()
            .map(|row| row.path)
            .collect();
        let generation = next_generation_for(&target, &existing)?;
        debug!("Next generation for {} is {}", target, generation);

        let engine = &self.engine;
        let target_ref = &target;
        let snapshot = self
            .run_step(EngineOp::Snapshot, target.as_str(), move || {
                engine.snapshot(target_ref, generation)
            })
            .await?;

        let (snap_ref, dest_ref) = (&snapshot, &destination);
        self.run_step(EngineOp::Clone, destination.as_str(), move || {
            engine.clone_snapshot(snap_ref, dest_ref)
        })
        .await?;

        info!("Created branch {} from {}", destination, snapshot);
        Ok(BranchCreated {
            path: destination,
            snapshot,
            generation,
        })
    }

    /// Replace the cache with one of its branches
    ///
    /// Only branches cloned directly from the cache can be promoted. If the
    /// final rename fails the cache path is left empty and an
    /// `InconsistentState` error is returned; [`Self::resume_promotion`]
    /// retries the rename.
    pub async fn promote_branch(&self, cache: &str, id: &str) -> Result<PromotionOutcome> {
        self.naming.cache_path(cache)?;
        validate_identifier("branch identifier", id)?;
        let (cache_name, branch) = (cache.to_string(), id.to_string());
        self.exclusive(cache, move |m| async move {
            m.promote_locked(&cache_name, &branch).await
        })
        .await
    }

    /// Finish a promotion that stopped after the old cache was destroyed
    pub async fn resume_promotion(&self, cache: &str, id: &str) -> Result<DatasetPath> {
        self.naming.cache_path(cache)?;
        validate_identifier("branch identifier", id)?;
        let (cache_name, branch) = (cache.to_string(), id.to_string());
        self.exclusive(cache, move |m| async move {
            m.resume_locked(&cache_name, &branch).await
        })
        .await
    }

    /// Destroy a branch and every branch nested below it
    pub async fn destroy_branch(&self, cache: &str, id: &str) -> Result<()> {
        self.naming.cache_path(cache)?;
        validate_identifier("branch identifier", id)?;
        let (cache_name, branch) = (cache.to_string(), id.to_string());
        self.exclusive(cache, move |m| async move {
            let row = m.require_branch(&cache_name, &branch).await?;
            m.destroy(&row.path, true).await?;
            info!("Destroyed branch {}", row.path);
            Ok(())
        })
        .await
    }

    /// Toggle the network export of a branch
    pub async fn set_export(&self, cache: &str, id: &str, enabled: bool) -> Result<DatasetPath> {
        self.naming.cache_path(cache)?;
        validate_identifier("branch identifier", id)?;
        let _guard = self.locks.lock(cache).await;

        let row = self.require_branch(cache, id).await?;
        let engine = &self.engine;
        let path = &row.path;
        self.run_step(EngineOp::SetExport, path.as_str(), move || {
            engine.set_export(path, enabled)
        })
        .await?;
        info!("Export of {} set to {}", row.path, enabled);
        Ok(row.path)
    }

    async fn destroy_cache_locked(&self, name: &str) -> Result<()> {
        let cache_path = self.naming.cache_path(name)?;
        let branch_root = self.naming.branch_root(name)?;

        if self.exists_cache(name).await?.is_none() {
            return Err(ForkpoolError::not_found("Cache", cache_path.as_str()));
        }

        let branches = self.branches_of(name).await?;
        if !branches.is_empty() {
            match self.config.destroy_policy {
                DestroyPolicy::Reject => {
                    return Err(ForkpoolError::branches_exist(name, branches.len()));
                }
                DestroyPolicy::Cascade => {
                    info!(
                        "Destroying {} branches of cache {}",
                        branches.len(),
                        cache_path
                    );
                    self.destroy(&branch_root, true).await?;
                }
            }
        }

        self.destroy(&cache_path, true).await?;
        if self.root_exists(&branch_root).await? {
            self.destroy(&branch_root, true).await?;
        }
        info!("Destroyed cache {}", cache_path);
        Ok(())
    }

    async fn promote_locked(&self, cache: &str, id: &str) -> Result<PromotionOutcome> {
        let cache_path = self.naming.cache_path(cache)?;
        let branch_root = self.naming.branch_root(cache)?;

        if self.exists_cache(cache).await?.is_none() {
            return Err(ForkpoolError::not_found("Cache", cache_path.as_str()));
        }
        let branch = self.require_branch(cache, id).await?.path;
        if branch.parent().as_ref() != Some(&branch_root) {
            return Err(ForkpoolError::validation(format!(
                "branch '{}' is nested at {}; only branches cloned from the cache can be promoted",
                id, branch
            )));
        }
        let origin = self
            .list(&ListOptions::datasets_under(&branch).with_depth(0))
            .await?
            .into_iter()
            .next()
            .and_then(|row| row.origin);
        if origin.as_ref().map(|o| o.dataset()).as_ref() != Some(&cache_path) {
            return Err(ForkpoolError::validation(format!(
                "branch {} is not a clone of cache {}",
                branch, cache_path
            )));
        }

        let mut record = self.journal.begin(cache, id, &branch, &cache_path).await?;

        let siblings_destroyed = match self
            .detach_branch(&mut record, &branch, &branch_root)
            .await
        {
            Ok(siblings) => siblings,
            Err(e) => {
                self.abort(&mut record, &e).await;
                return Err(e);
            }
        };

        if let Err(e) = self.destroy(&cache_path, true).await {
            // A destroy that timed out or lost its reply may still have run
            match self.exists_cache(cache).await {
                Ok(Some(_)) => {
                    self.abort(&mut record, &e).await;
                    return Err(e);
                }
                Ok(None) => {
                    self.checkpoint(&mut record, PromotionPhase::OldCacheDestroyed)
                        .await;
                    error!(
                        promotion = %record.id,
                        "Destroy of cache {} reported failure but the cache is gone; {} still holds its data: {}",
                        cache_path,
                        branch,
                        e
                    );
                    return Err(ForkpoolError::inconsistent_state(
                        cache,
                        branch.as_str(),
                        PromotionPhase::OldCacheDestroyed,
                        e.to_string(),
                    ));
                }
                Err(check) => {
                    error!(
                        promotion = %record.id,
                        "Destroy of cache {} failed ({}) and its state cannot be read: {}",
                        cache_path,
                        e,
                        check
                    );
                    return Err(e);
                }
            }
        }
        self.checkpoint(&mut record, PromotionPhase::OldCacheDestroyed)
            .await;

        if let Err(e) = self.rename(&branch, &cache_path).await {
            error!(
                promotion = %record.id,
                "Cache {} was destroyed but {} could not take its place: {}",
                cache_path,
                branch,
                e
            );
            return Err(ForkpoolError::inconsistent_state(
                cache,
                branch.as_str(),
                PromotionPhase::OldCacheDestroyed,
                e.to_string(),
            ));
        }
        self.checkpoint(&mut record, PromotionPhase::Renamed).await;

        info!("Promoted {} to cache {}", branch, cache_path);
        Ok(PromotionOutcome {
            id: record.id,
            cache: cache_path,
            promoted_from: branch,
            siblings_destroyed,
        })
    }

    async fn resume_locked(&self, cache: &str, id: &str) -> Result<DatasetPath> {
        let cache_path = self.naming.cache_path(cache)?;
        let branch_root = self.naming.branch_root(cache)?;

        if self.exists_cache(cache).await?.is_some() {
            return Err(ForkpoolError::already_exists(cache_path.as_str()));
        }
        let branch = self.require_branch(cache, id).await?.path;
        if branch.parent().as_ref() != Some(&branch_root) {
            return Err(ForkpoolError::validation(format!(
                "branch '{}' is nested at {} and cannot replace the cache",
                id, branch
            )));
        }

        self.rename(&branch, &cache_path).await?;
        info!("Resumed promotion: {} renamed to {}", branch, cache_path);

        match self.journal.pending().await {
            Ok(records) => {
                for mut record in records.into_iter().filter(|r| {
                    r.cache == cache && r.branch == id && r.phase.is_inconsistent()
                }) {
                    self.checkpoint(&mut record, PromotionPhase::Renamed).await;
                }
            }
            Err(e) => warn!("Could not read promotion journal: {}", e),
        }
        Ok(cache_path)
    }

    /// Steps of a promotion that leave the old cache in place: prune the
    /// branch, promote it, then destroy its siblings under the destroy policy
    async fn detach_branch(
        &self,
        record: &mut PromotionRecord,
        branch: &DatasetPath,
        branch_root: &DatasetPath,
    ) -> Result<Vec<DatasetPath>> {
        if self.config.sibling_policy == SiblingPolicy::Destroy {
            // Leftover snapshots of the branch would collide with the cache
            // snapshots it takes over
            let pruned = self.prune_branch(branch).await?;
            if pruned > 0 {
                self.checkpoint(record, PromotionPhase::BranchPruned).await;
            }
        }

        let engine = &self.engine;
        self.run_step(EngineOp::Promote, branch.as_str(), move || {
            engine.promote(branch)
        })
        .await?;
        self.checkpoint(record, PromotionPhase::Promoted).await;

        let mut siblings_destroyed = Vec::new();
        if self.config.sibling_policy == SiblingPolicy::Destroy {
            let siblings: Vec<DatasetPath> = self
                .list(&ListOptions::datasets_under(branch_root).with_depth(1))
                .await?
                .into_iter()
                .map(|row| row.path)
                .filter(|p| p != branch_root && p != branch)
                .collect();
            for sibling in siblings {
                self.destroy(&sibling, true).await?;
                siblings_destroyed.push(sibling);
            }
            if !siblings_destroyed.is_empty() {
                self.checkpoint(record, PromotionPhase::SiblingsDestroyed)
                    .await;
            }
        }
        Ok(siblings_destroyed)
    }

    async fn abort(&self, record: &mut PromotionRecord, cause: &ForkpoolError) {
        warn!(
            promotion = %record.id,
            "Promotion of {} stopped at {}, cache {} left in place: {}",
            record.branch_path,
            record.phase,
            record.cache_path,
            cause
        );
        self.checkpoint(record, PromotionPhase::Aborted).await;
    }

    /// Remove the nested branches and snapshots of `branch`, returning how
    /// many datasets were destroyed
    async fn prune_branch(&self, branch: &DatasetPath) -> Result<usize> {
        let children: Vec<DatasetPath> = self
            .list(&ListOptions::datasets_under(branch).with_depth(1))
            .await?
            .into_iter()
            .map(|row| row.path)
            .filter(|p| p != branch)
            .collect();
        let snapshots: Vec<DatasetPath> = self
            .list(&ListOptions::snapshots_of(branch))
            .await?
            .into_iter()
            .map(|row| row.path)
            .collect();

        for path in children.iter().chain(snapshots.iter()) {
            self.destroy(path, true).await?;
        }
        Ok(children.len() + snapshots.len())
    }

    async fn checkpoint(&self, record: &mut PromotionRecord, phase: PromotionPhase) {
        if let Err(e) = self.journal.advance(record, phase).await {
            warn!(
                promotion = %record.id,
                "Failed to record promotion phase {}: {}",
                phase,
                e
            );
        }
    }

    async fn require_branch(&self, cache: &str, id: &str) -> Result<DatasetRow> {
        let root = self.naming.branch_root(cache)?;
        self.exists_branch(cache, id).await?.ok_or_else(|| {
            ForkpoolError::not_found("Branch", format!("{}/{}", root, id))
        })
    }

    /// Branch rows below the cache's branch root; none if the root is missing
    async fn branches_of(&self, cache: &str) -> Result<Vec<DatasetRow>> {
        let root = self.naming.branch_root(cache)?;
        let rows = self.list_or_empty(&ListOptions::datasets_under(&root)).await?;
        Ok(rows.into_iter().filter(|row| row.path != root).collect())
    }

    fn branch_id<'a>(&self, path: &'a DatasetPath) -> Option<&'a str> {
        self.naming
            .parse_branch(path)
            .and_then(|(_, lineage)| lineage.last().copied())
    }

    async fn ensure_branch_root(&self, cache: &str) -> Result<DatasetPath> {
        let root = self.naming.branch_root(cache)?;
        self.ensure_dataset(self.naming.branches_root()).await?;
        self.ensure_dataset(&root).await?;
        Ok(root)
    }

    /// Create `path`, treating an existing dataset as success
    async fn ensure_dataset(&self, path: &DatasetPath) -> Result<()> {
        match self.create(path).await {
            Ok(()) => {
                debug!("Created {}", path);
                Ok(())
            }
            Err(ForkpoolError::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn root_exists(&self, root: &DatasetPath) -> Result<bool> {
        let rows = self
            .list_or_empty(&ListOptions::datasets_under(root).with_depth(0))
            .await?;
        Ok(find_row(&rows, root).is_some())
    }

    async fn create(&self, path: &DatasetPath) -> Result<()> {
        let engine = &self.engine;
        self.run_step(EngineOp::Create, path.as_str(), move || {
            engine.create_dataset(path)
        })
        .await
    }

    async fn destroy(&self, path: &DatasetPath, recursive: bool) -> Result<()> {
        let engine = &self.engine;
        self.run_step(EngineOp::Destroy, path.as_str(), move || {
            engine.destroy_dataset(path, recursive)
        })
        .await
    }

    async fn rename(&self, from: &DatasetPath, to: &DatasetPath) -> Result<()> {
        let engine = &self.engine;
        self.run_step(EngineOp::Rename, from.as_str(), move || {
            engine.rename(from, to)
        })
        .await
    }

    async fn list(&self, opts: &ListOptions) -> Result<Vec<DatasetRow>> {
        let engine = &self.engine;
        let label = opts
            .recurse_from
            .as_ref()
            .map_or("<all>", |root| root.as_str());
        self.run_step(EngineOp::List, label, move || engine.list_datasets(opts))
            .await
    }

    /// Listing whose missing root reads as empty
    async fn list_or_empty(&self, opts: &ListOptions) -> Result<Vec<DatasetRow>> {
        match self.list(opts).await {
            Err(ForkpoolError::NotFound { .. }) => Ok(Vec::new()),
            other => other,
        }
    }

    /// Run one engine call under the configured timeout, retrying engine
    /// errors for listing, snapshot and clone
    async fn run_step<T, F, Fut>(&self, op: EngineOp, label: &str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = if op.is_retryable() {
            self.config.retry.attempts.max(1)
        } else {
            1
        };
        let limit = self.config.command_timeout;

        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(limit, call()).await {
                Ok(result) => result,
                Err(_) => Err(ForkpoolError::timeout(op, label, limit)),
            };
            match result {
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        "{} {} failed (attempt {}/{}), retrying: {}",
                        op, label, attempt, attempts, e
                    );
                    tokio::time::sleep(self.config.retry.backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Run `work` on its own task while holding the cache's lock
    async fn exclusive<T, F, Fut>(&self, cache: &str, work: F) -> Result<T>
    where
        F: FnOnce(CacheBranchManager) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.locks.lock(cache).await;
        let task = work(self.clone());
        tokio::spawn(async move {
            let _guard = guard;
            task.await
        })
        .await
        .map_err(|e| ForkpoolError::internal(format!("workflow task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use forkpool_engine::MockStorageEngine;
    use std::time::Duration;

    fn path(s: &str) -> DatasetPath {
        DatasetPath::parse(s).unwrap()
    }

    async fn setup(config: ManagerConfig) -> (CacheBranchManager, MockStorageEngine) {
        let engine = MockStorageEngine::new(&path("P"));
        let manager = CacheBranchManager::new(
            Arc::new(engine.clone()),
            NamingScheme::new("P").unwrap(),
            config,
        );
        manager.initialize().await.unwrap();
        (manager, engine)
    }

    async fn setup_with_cache() -> (CacheBranchManager, MockStorageEngine) {
        let (manager, engine) = setup(ManagerConfig::default()).await;
        manager.create_cache("app").await.unwrap();
        (manager, engine)
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (manager, _engine) = setup(ManagerConfig::default()).await;
        manager.initialize().await.unwrap();
        assert!(manager.list_caches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concrete_scenario() {
        let (manager, _engine) = setup_with_cache().await;

        assert_eq!(manager.list_caches().await.unwrap(), vec![path("P/caches/app")]);

        let abc = manager.create_branch("app", "abc", None).await.unwrap();
        assert_eq!(abc.generation, Generation::new(1));
        assert_eq!(abc.snapshot.as_str(), "P/caches/app@1");
        assert_eq!(abc.path.as_str(), "P/branches/app/abc");

        let def = manager.create_branch("app", "def", None).await.unwrap();
        assert_eq!(def.generation, Generation::new(2));
        assert_eq!(def.path.as_str(), "P/branches/app/def");
    }

    #[tokio::test]
    async fn test_serial_generations_have_no_gaps() {
        let (manager, _engine) = setup_with_cache().await;
        for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
            let created = manager.create_branch("app", id, None).await.unwrap();
            assert_eq!(created.generation, Generation::new(i as u64 + 1));
        }
    }

    #[tokio::test]
    async fn test_concurrent_creations_get_unique_generations() {
        let (manager, _engine) = setup_with_cache().await;

        let tasks = (0..6).map(|i| {
            let manager = manager.clone();
            async move {
                manager
                    .create_branch("app", &format!("b{}", i), None)
                    .await
                    .unwrap()
                    .generation
                    .value()
            }
        });
        let mut generations = futures_util::future::join_all(tasks).await;
        generations.sort_unstable();
        assert_eq!(generations, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_cache_exists_then_destroyed() {
        let (manager, _engine) = setup(ManagerConfig::default()).await;
        assert!(manager.exists_cache("x").await.unwrap().is_none());

        manager.create_cache("x").await.unwrap();
        let row = manager.exists_cache("x").await.unwrap().unwrap();
        assert_eq!(row.path.as_str(), "P/caches/x");
        assert_eq!(row.mountpoint.as_deref(), Some("/P/caches/x"));

        manager.destroy_cache("x").await.unwrap();
        assert!(manager.exists_cache("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_cache_twice_fails() {
        let (manager, _engine) = setup_with_cache().await;
        let err = manager.create_cache("app").await.unwrap_err();
        assert!(matches!(err, ForkpoolError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_invalid_names_rejected_before_engine_calls() {
        let (manager, engine) = setup(ManagerConfig::default()).await;
        let before = engine.calls().await.len();

        assert!(matches!(
            manager.create_cache("a/b").await.unwrap_err(),
            ForkpoolError::Validation { .. }
        ));
        assert!(matches!(
            manager.create_branch("app", "x@1", None).await.unwrap_err(),
            ForkpoolError::Validation { .. }
        ));
        assert!(manager.create_branch("app", "x", Some("x")).await.is_err());
        assert_eq!(engine.calls().await.len(), before);
    }

    #[tokio::test]
    async fn test_branch_on_missing_cache_is_not_found() {
        let (manager, _engine) = setup(ManagerConfig::default()).await;
        let err = manager.create_branch("nope", "abc", None).await.unwrap_err();
        assert!(matches!(err, ForkpoolError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_branch_id_rejected() {
        let (manager, _engine) = setup_with_cache().await;
        manager.create_branch("app", "abc", None).await.unwrap();
        manager.create_branch("app", "def", Some("abc")).await.unwrap();

        let err = manager.create_branch("app", "def", None).await.unwrap_err();
        assert!(matches!(err, ForkpoolError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_nested_generations_scoped_to_parent() {
        let (manager, _engine) = setup_with_cache().await;
        manager.create_branch("app", "abc", None).await.unwrap();
        manager.create_branch("app", "xyz", None).await.unwrap();

        let def = manager.create_branch("app", "def", Some("abc")).await.unwrap();
        assert_eq!(def.generation, Generation::FIRST);
        assert_eq!(def.snapshot.as_str(), "P/branches/app/abc@1");
        assert_eq!(def.path.as_str(), "P/branches/app/abc/def");

        let ghi = manager.create_branch("app", "ghi", Some("abc")).await.unwrap();
        assert_eq!(ghi.generation, Generation::new(2));

        let deeper = manager.create_branch("app", "jkl", Some("def")).await.unwrap();
        assert_eq!(deeper.path.as_str(), "P/branches/app/abc/def/jkl");
        assert_eq!(deeper.generation, Generation::FIRST);

        let top = manager.create_branch("app", "mno", None).await.unwrap();
        assert_eq!(top.generation, Generation::new(3));

        let ids: Vec<String> = manager
            .list_branches("app")
            .await
            .unwrap()
            .iter()
            .map(|row| row.path.name().to_string())
            .collect();
        assert_eq!(ids, vec!["abc", "def", "jkl", "ghi", "mno", "xyz"]);
    }

    #[tokio::test]
    async fn test_missing_parent_is_not_found() {
        let (manager, _engine) = setup_with_cache().await;
        let err = manager
            .create_branch("app", "def", Some("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, ForkpoolError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_malformed_snapshot_suffix_is_parse_error() {
        let (manager, engine) = setup_with_cache().await;
        manager.create_branch("app", "abc", None).await.unwrap();
        engine
            .insert_snapshot(&path("P/caches/app@nightly"))
            .await
            .unwrap();

        let err = manager.create_branch("app", "def", None).await.unwrap_err();
        assert!(matches!(err, ForkpoolError::Parse { .. }));
        assert!(manager.exists_branch("app", "def").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_exhausted_generation_is_parse_error() {
        let (manager, engine) = setup_with_cache().await;
        engine
            .insert_snapshot(&path("P/caches/app@18446744073709551615"))
            .await
            .unwrap();

        let err = manager.create_branch("app", "abc", None).await.unwrap_err();
        assert!(matches!(err, ForkpoolError::Parse { .. }));
        assert!(!engine
            .calls()
            .await
            .iter()
            .any(|(op, _)| *op == EngineOp::Snapshot));
    }

    #[tokio::test]
    async fn test_promotion_carries_marker_to_cache_path() {
        let (manager, engine) = setup_with_cache().await;
        let cache = path("P/caches/app");
        engine.write_file(&cache, "old", b"stale").await.unwrap();

        let b1 = manager.create_branch("app", "B1", None).await.unwrap();
        engine.write_file(&b1.path, "marker", b"B1").await.unwrap();
        engine.write_file(&cache, "late", b"after-clone").await.unwrap();

        let outcome = manager.promote_branch("app", "B1").await.unwrap();
        assert_eq!(outcome.cache, cache);
        assert_eq!(outcome.promoted_from, b1.path);

        let row = manager.exists_cache("app").await.unwrap().unwrap();
        assert_eq!(row.path, cache);
        assert_eq!(engine.read_file(&cache, "marker").await, Some(b"B1".to_vec()));
        // Contents the branch inherited stay, later cache writes are gone
        assert_eq!(engine.read_file(&cache, "old").await, Some(b"stale".to_vec()));
        assert_eq!(engine.read_file(&cache, "late").await, None);
        assert!(manager.exists_branch("app", "B1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_generations_continue_after_promotion() {
        let (manager, _engine) = setup_with_cache().await;
        manager.create_branch("app", "abc", None).await.unwrap();
        manager.promote_branch("app", "abc").await.unwrap();

        let next = manager.create_branch("app", "def", None).await.unwrap();
        assert_eq!(next.generation, Generation::new(2));
    }

    #[tokio::test]
    async fn test_promotion_destroys_siblings_and_nested_branches() {
        let (manager, _engine) = setup_with_cache().await;
        manager.create_branch("app", "abc", None).await.unwrap();
        manager.create_branch("app", "nested", Some("abc")).await.unwrap();
        manager.create_branch("app", "def", None).await.unwrap();
        manager.create_branch("app", "old", None).await.unwrap();

        let outcome = manager.promote_branch("app", "abc").await.unwrap();
        assert_eq!(
            outcome.siblings_destroyed,
            vec![path("P/branches/app/def"), path("P/branches/app/old")]
        );
        assert!(manager.list_branches("app").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retain_policy_keeps_older_siblings() {
        let config = ManagerConfig {
            sibling_policy: SiblingPolicy::Retain,
            ..ManagerConfig::default()
        };
        let (manager, engine) = setup(config).await;
        manager.create_cache("app").await.unwrap();
        manager.create_branch("app", "abc", None).await.unwrap();
        let def = manager.create_branch("app", "def", None).await.unwrap();
        engine.write_file(&def.path, "marker", b"def").await.unwrap();

        manager.promote_branch("app", "def").await.unwrap();

        let branches = manager.list_branches("app").await.unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(
            branches[0].origin.as_ref().map(|o| o.as_str()),
            Some("P/caches/app@1")
        );
        assert_eq!(
            engine.read_file(&path("P/caches/app"), "marker").await,
            Some(b"def".to_vec())
        );
    }

    #[tokio::test]
    async fn test_retain_policy_fails_on_dependent_sibling() {
        let config = ManagerConfig {
            sibling_policy: SiblingPolicy::Retain,
            ..ManagerConfig::default()
        };
        let (manager, _engine) = setup(config).await;
        manager.create_cache("app").await.unwrap();
        manager.create_branch("app", "abc", None).await.unwrap();
        manager.create_branch("app", "def", None).await.unwrap();

        let err = manager.promote_branch("app", "abc").await.unwrap_err();
        assert!(matches!(err, ForkpoolError::Engine { operation: EngineOp::Destroy, .. }));
        assert!(manager.exists_cache("app").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_nested_branch_cannot_be_promoted() {
        let (manager, _engine) = setup_with_cache().await;
        manager.create_branch("app", "abc", None).await.unwrap();
        manager.create_branch("app", "def", Some("abc")).await.unwrap();

        let err = manager.promote_branch("app", "def").await.unwrap_err();
        assert!(matches!(err, ForkpoolError::Validation { .. }));
        assert!(manager.exists_branch("app", "def").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_rename_is_inconsistent_then_resumable() {
        let dir = tempfile::TempDir::new().unwrap();
        let (manager, engine) = setup_with_cache().await;
        let journal = PromotionJournal::open(dir.path()).await.unwrap();
        let manager = manager.with_journal(journal);

        let branch = manager.create_branch("app", "abc", None).await.unwrap();
        engine.write_file(&branch.path, "marker", b"m").await.unwrap();
        engine.fail_next(EngineOp::Rename, &branch.path).await;

        let err = manager.promote_branch("app", "abc").await.unwrap_err();
        match &err {
            ForkpoolError::InconsistentState { phase, branch_path, .. } => {
                assert_eq!(*phase, PromotionPhase::OldCacheDestroyed);
                assert_eq!(branch_path, "P/branches/app/abc");
            }
            other => panic!("expected InconsistentState, got {:?}", other),
        }
        assert_eq!(err.kind(), "InconsistentStateError");
        assert!(manager.exists_cache("app").await.unwrap().is_none());

        let pending = manager.pending_promotions().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].phase, PromotionPhase::OldCacheDestroyed);

        let cache = manager.resume_promotion("app", "abc").await.unwrap();
        assert_eq!(cache.as_str(), "P/caches/app");
        assert_eq!(engine.read_file(&cache, "marker").await, Some(b"m".to_vec()));
        assert!(manager.pending_promotions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_promotion_failing_before_destroy_leaves_no_record() {
        let dir = tempfile::TempDir::new().unwrap();
        let (manager, engine) = setup_with_cache().await;
        let journal = PromotionJournal::open(dir.path()).await.unwrap();
        let manager = manager.with_journal(journal);

        let branch = manager.create_branch("app", "abc", None).await.unwrap();
        engine.fail_next(EngineOp::Promote, &branch.path).await;

        let err = manager.promote_branch("app", "abc").await.unwrap_err();
        assert!(matches!(err, ForkpoolError::Engine { operation: EngineOp::Promote, .. }));
        assert!(manager.exists_cache("app").await.unwrap().is_some());
        assert!(manager.pending_promotions().await.unwrap().is_empty());

        manager.promote_branch("app", "abc").await.unwrap();
        assert!(manager.pending_promotions().await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_that_ran_despite_error_is_inconsistent() {
        let dir = tempfile::TempDir::new().unwrap();
        let (manager, engine) = setup_with_cache().await;
        let journal = PromotionJournal::open(dir.path()).await.unwrap();
        let manager = manager.with_journal(journal);

        let branch = manager.create_branch("app", "abc", None).await.unwrap();
        engine.write_file(&branch.path, "marker", b"m").await.unwrap();
        engine
            .lose_next_reply(EngineOp::Destroy, &path("P/caches/app"))
            .await;

        let err = manager.promote_branch("app", "abc").await.unwrap_err();
        match &err {
            ForkpoolError::InconsistentState { phase, branch_path, .. } => {
                assert_eq!(*phase, PromotionPhase::OldCacheDestroyed);
                assert_eq!(branch_path, "P/branches/app/abc");
            }
            other => panic!("expected InconsistentState, got {:?}", other),
        }
        let pending = manager.pending_promotions().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].phase, PromotionPhase::OldCacheDestroyed);

        let cache = manager.resume_promotion("app", "abc").await.unwrap();
        assert_eq!(engine.read_file(&cache, "marker").await, Some(b"m".to_vec()));
        assert!(manager.pending_promotions().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_promotion_still_completes() {
        let (manager, engine) = setup_with_cache().await;
        let branch = manager.create_branch("app", "abc", None).await.unwrap();
        engine.write_file(&branch.path, "marker", b"abc").await.unwrap();
        engine
            .set_delay(EngineOp::Rename, Duration::from_millis(200))
            .await;

        let dropped = tokio::time::timeout(
            Duration::from_millis(50),
            manager.promote_branch("app", "abc"),
        )
        .await;
        assert!(dropped.is_err());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(manager.exists_cache("app").await.unwrap().is_some());
        assert!(manager.exists_branch("app", "abc").await.unwrap().is_none());
        assert_eq!(
            engine.read_file(&path("P/caches/app"), "marker").await,
            Some(b"abc".to_vec())
        );
    }

    #[tokio::test]
    async fn test_resume_with_intact_cache_conflicts() {
        let (manager, _engine) = setup_with_cache().await;
        manager.create_branch("app", "abc", None).await.unwrap();

        let err = manager.resume_promotion("app", "abc").await.unwrap_err();
        assert!(matches!(err, ForkpoolError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_destroy_is_not_retried() {
        let config = ManagerConfig {
            retry: RetryPolicy {
                attempts: 3,
                backoff: Duration::from_millis(1),
            },
            ..ManagerConfig::default()
        };
        let (manager, engine) = setup(config).await;
        manager.create_cache("app").await.unwrap();
        engine.fail_next(EngineOp::Destroy, &path("P/caches/app")).await;

        assert!(manager.destroy_cache("app").await.is_err());
        let destroys = engine
            .calls()
            .await
            .iter()
            .filter(|(op, _)| *op == EngineOp::Destroy)
            .count();
        assert_eq!(destroys, 1);
    }

    #[tokio::test]
    async fn test_transient_snapshot_failure_is_retried() {
        let config = ManagerConfig {
            retry: RetryPolicy {
                attempts: 2,
                backoff: Duration::from_millis(1),
            },
            ..ManagerConfig::default()
        };
        let (manager, engine) = setup(config).await;
        manager.create_cache("app").await.unwrap();
        engine
            .fail_next(EngineOp::Snapshot, &path("P/caches/app@1"))
            .await;

        let created = manager.create_branch("app", "abc", None).await.unwrap();
        assert_eq!(created.generation, Generation::FIRST);
        let snapshots = engine
            .calls()
            .await
            .iter()
            .filter(|(op, _)| *op == EngineOp::Snapshot)
            .count();
        assert_eq!(snapshots, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_engine_call_times_out() {
        let config = ManagerConfig {
            command_timeout: Duration::from_secs(5),
            ..ManagerConfig::default()
        };
        let (manager, engine) = setup(config).await;
        manager.create_cache("app").await.unwrap();
        engine
            .set_delay(EngineOp::Snapshot, Duration::from_secs(3600))
            .await;

        let err = manager.create_branch("app", "abc", None).await.unwrap_err();
        match err {
            ForkpoolError::Timeout { operation, limit, .. } => {
                assert_eq!(operation, EngineOp::Snapshot);
                assert_eq!(limit, Duration::from_secs(5));
            }
            other => panic!("expected Timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_destroy_cache_rejects_existing_branches() {
        let (manager, _engine) = setup_with_cache().await;
        manager.create_branch("app", "abc", None).await.unwrap();

        let err = manager.destroy_cache("app").await.unwrap_err();
        assert!(matches!(err, ForkpoolError::BranchesExist { count: 1, .. }));
        assert!(manager.exists_cache("app").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_destroy_cache_cascades() {
        let config = ManagerConfig {
            destroy_policy: DestroyPolicy::Cascade,
            ..ManagerConfig::default()
        };
        let (manager, _engine) = setup(config).await;
        manager.create_cache("app").await.unwrap();
        manager.create_branch("app", "abc", None).await.unwrap();
        manager.create_branch("app", "def", Some("abc")).await.unwrap();

        manager.destroy_cache("app").await.unwrap();
        assert!(manager.exists_cache("app").await.unwrap().is_none());
        assert!(matches!(
            manager.list_branches("app").await.unwrap_err(),
            ForkpoolError::NotFound { .. }
        ));

        // Recreated cache starts its generations over
        manager.create_cache("app").await.unwrap();
        let b = manager.create_branch("app", "abc", None).await.unwrap();
        assert_eq!(b.generation, Generation::FIRST);
    }

    #[tokio::test]
    async fn test_destroy_branch_removes_nested() {
        let (manager, _engine) = setup_with_cache().await;
        manager.create_branch("app", "abc", None).await.unwrap();
        manager.create_branch("app", "def", Some("abc")).await.unwrap();

        manager.destroy_branch("app", "abc").await.unwrap();
        assert!(manager.list_branches("app").await.unwrap().is_empty());
        assert!(matches!(
            manager.destroy_branch("app", "abc").await.unwrap_err(),
            ForkpoolError::NotFound { .. }
        ));

        manager.destroy_cache("app").await.unwrap();
    }

    #[tokio::test]
    async fn test_set_export() {
        let (manager, engine) = setup_with_cache().await;
        let created = manager.create_branch("app", "abc", None).await.unwrap();

        manager.set_export("app", "abc", true).await.unwrap();
        assert!(engine.is_exported(&created.path).await);
        manager.set_export("app", "abc", false).await.unwrap();
        assert!(!engine.is_exported(&created.path).await);
    }
}
