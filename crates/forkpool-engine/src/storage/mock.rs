use crate::storage::StorageEngine;
use async_trait::async_trait;
use forkpool_core::{
    snapshot_path, DatasetPath, DatasetRow, EngineOp, ForkpoolError, Generation, ListOptions,
    Result,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

type Files = BTreeMap<String, Vec<u8>>;

/// Most recent calls kept by [`MockStorageEngine::calls`]
const CALL_HISTORY: usize = 1024;

#[derive(Debug, Clone, Default)]
struct MockFilesystem {
    origin: Option<DatasetPath>,
    files: Files,
    exported: bool,
}

#[derive(Debug, Clone)]
struct MockSnapshot {
    files: Files,
    /// Creation order across the whole pool
    seq: u64,
}

#[derive(Debug, Default)]
struct MockState {
    filesystems: BTreeMap<DatasetPath, MockFilesystem>,
    snapshots: BTreeMap<DatasetPath, MockSnapshot>,
    next_seq: u64,
    failures: Vec<(EngineOp, String)>,
    lost_replies: Vec<(EngineOp, String)>,
    delays: HashMap<EngineOp, Duration>,
    calls: VecDeque<(EngineOp, String)>,
}

impl MockState {
    fn require_filesystem(&self, op: EngineOp, path: &DatasetPath) -> Result<()> {
        if path.is_snapshot() {
            return Err(ForkpoolError::engine(
                op,
                path.as_str(),
                1,
                "operation not applicable to snapshots",
            ));
        }
        if !self.filesystems.contains_key(path) {
            return Err(ForkpoolError::not_found("Dataset", path.as_str()));
        }
        Ok(())
    }

    fn require_parent(&self, path: &DatasetPath) -> Result<()> {
        match path.parent() {
            Some(parent) if self.filesystems.contains_key(&parent) => Ok(()),
            Some(parent) => Err(ForkpoolError::not_found("Parent dataset", parent.as_str())),
            None => Err(ForkpoolError::not_found("Parent dataset", path.as_str())),
        }
    }

    fn exists(&self, path: &DatasetPath) -> bool {
        self.filesystems.contains_key(path) || self.snapshots.contains_key(path)
    }

    fn take_failure(&mut self, op: EngineOp, label: &str) -> Result<()> {
        if let Some(idx) = self
            .failures
            .iter()
            .position(|(o, p)| *o == op && p == label)
        {
            self.failures.remove(idx);
            return Err(ForkpoolError::engine(op, label, 1, "injected failure"));
        }
        Ok(())
    }

    /// Called once a change is applied; reports it as failed if asked to
    fn take_lost_reply(&mut self, op: EngineOp, label: &str) -> Result<()> {
        if let Some(idx) = self
            .lost_replies
            .iter()
            .position(|(o, p)| *o == op && p == label)
        {
            self.lost_replies.remove(idx);
            return Err(ForkpoolError::engine(
                op,
                label,
                1,
                "injected failure after the change was applied",
            ));
        }
        Ok(())
    }

    /// Point every clone of a renamed snapshot at its new name
    fn remap_origins(&mut self, renamed: &BTreeMap<DatasetPath, DatasetPath>) {
        for fs in self.filesystems.values_mut() {
            if let Some(new) = fs.origin.as_ref().and_then(|o| renamed.get(o)) {
                fs.origin = Some(new.clone());
            }
        }
    }
}

/// In-memory storage engine with copy-on-write semantics
///
/// Models filesystems, generation-numbered snapshots, clone origins,
/// promote (snapshot ownership moves to the clone), subtree rename and
/// recursive destroy that refuses to orphan dependent clones. Each
/// filesystem carries a small file map so tests can check which contents
/// survive a promotion. Failures and latency can be injected per operation.
#[derive(Clone)]
pub struct MockStorageEngine {
    state: Arc<RwLock<MockState>>,
}

impl MockStorageEngine {
    /// Create an engine whose only dataset is the pool root
    pub fn new(pool: &DatasetPath) -> Self {
        let mut state = MockState::default();
        state
            .filesystems
            .insert(pool.clone(), MockFilesystem::default());
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Make the next `op` call on `path` fail with an engine error
    pub async fn fail_next(&self, op: EngineOp, path: &DatasetPath) {
        self.state
            .write()
            .await
            .failures
            .push((op, path.to_string()));
    }

    /// Let the next destroy or rename of `path` take effect but report an
    /// engine error, like a CLI killed after it finished its work
    pub async fn lose_next_reply(&self, op: EngineOp, path: &DatasetPath) {
        self.state
            .write()
            .await
            .lost_replies
            .push((op, path.to_string()));
    }

    /// Delay every `op` call by `delay` before it runs
    pub async fn set_delay(&self, op: EngineOp, delay: Duration) {
        self.state.write().await.delays.insert(op, delay);
    }

    /// Most recent operations, oldest first, with the primary path of each
    pub async fn calls(&self) -> Vec<(EngineOp, String)> {
        self.state.read().await.calls.iter().cloned().collect()
    }

    /// Write a file into a filesystem's contents
    pub async fn write_file(&self, dataset: &DatasetPath, name: &str, contents: &[u8]) -> Result<()> {
        let mut state = self.state.write().await;
        let fs = state
            .filesystems
            .get_mut(dataset)
            .ok_or_else(|| ForkpoolError::not_found("Dataset", dataset.as_str()))?;
        fs.files.insert(name.to_string(), contents.to_vec());
        Ok(())
    }

    /// Read a file from a filesystem's contents
    pub async fn read_file(&self, dataset: &DatasetPath, name: &str) -> Option<Vec<u8>> {
        let state = self.state.read().await;
        state
            .filesystems
            .get(dataset)
            .and_then(|fs| fs.files.get(name).cloned())
    }

    /// Record a snapshot under an arbitrary name, as an operator running
    /// `zfs snapshot` by hand would
    pub async fn insert_snapshot(&self, snapshot: &DatasetPath) -> Result<()> {
        let mut state = self.state.write().await;
        let files = state
            .filesystems
            .get(&snapshot.dataset())
            .map(|fs| fs.files.clone())
            .ok_or_else(|| ForkpoolError::not_found("Dataset", snapshot.dataset().as_str()))?;
        let seq = state.next_seq;
        state.next_seq += 1;
        state
            .snapshots
            .insert(snapshot.clone(), MockSnapshot { files, seq });
        Ok(())
    }

    pub async fn is_exported(&self, dataset: &DatasetPath) -> bool {
        let state = self.state.read().await;
        state
            .filesystems
            .get(dataset)
            .is_some_and(|fs| fs.exported)
    }

    /// Record the call, apply any configured delay, then any injected failure
    async fn begin(&self, op: EngineOp, label: &str) -> Result<()> {
        let delay = {
            let mut state = self.state.write().await;
            if state.calls.len() == CALL_HISTORY {
                state.calls.pop_front();
            }
            state.calls.push_back((op, label.to_string()));
            state.delays.get(&op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.write().await.take_failure(op, label)
    }
}

#[async_trait]
impl StorageEngine for MockStorageEngine {
    async fn create_dataset(&self, path: &DatasetPath) -> Result<()> {
        self.begin(EngineOp::Create, path.as_str()).await?;
        let mut state = self.state.write().await;

        if path.is_snapshot() {
            return Err(ForkpoolError::engine(
                EngineOp::Create,
                path.as_str(),
                1,
                "use snapshot to create snapshots",
            ));
        }
        if state.exists(path) {
            return Err(ForkpoolError::already_exists(path.as_str()));
        }
        state.require_parent(path)?;

        state
            .filesystems
            .insert(path.clone(), MockFilesystem::default());
        debug!("Mock: created dataset {}", path);
        Ok(())
    }

    async fn destroy_dataset(&self, path: &DatasetPath, recursive: bool) -> Result<()> {
        self.begin(EngineOp::Destroy, path.as_str()).await?;
        let mut state = self.state.write().await;

        if path.is_snapshot() {
            if !state.snapshots.contains_key(path) {
                return Err(ForkpoolError::not_found("Snapshot", path.as_str()));
            }
            if state
                .filesystems
                .values()
                .any(|fs| fs.origin.as_ref() == Some(path))
            {
                return Err(ForkpoolError::engine(
                    EngineOp::Destroy,
                    path.as_str(),
                    1,
                    "snapshot has dependent clones",
                ));
            }
            state.snapshots.remove(path);
            debug!("Mock: destroyed snapshot {}", path);
            return state.take_lost_reply(EngineOp::Destroy, path.as_str());
        }

        state.require_filesystem(EngineOp::Destroy, path)?;

        let in_subtree = |p: &DatasetPath| p == path || p.is_descendant_of(path);
        let children: Vec<DatasetPath> = state
            .filesystems
            .keys()
            .filter(|p| *p != path && p.is_descendant_of(path))
            .cloned()
            .collect();
        let snaps: Vec<DatasetPath> = state
            .snapshots
            .keys()
            .filter(|s| in_subtree(&s.dataset()))
            .cloned()
            .collect();

        if !recursive && (!children.is_empty() || !snaps.is_empty()) {
            return Err(ForkpoolError::engine(
                EngineOp::Destroy,
                path.as_str(),
                1,
                "filesystem has children",
            ));
        }

        let dependent = state.filesystems.iter().find(|(p, fs)| {
            !in_subtree(p)
                && fs
                    .origin
                    .as_ref()
                    .is_some_and(|origin| snaps.contains(origin))
        });
        if let Some((clone, _)) = dependent {
            return Err(ForkpoolError::engine(
                EngineOp::Destroy,
                path.as_str(),
                1,
                format!("snapshot has dependent clones: {}", clone),
            ));
        }

        for snap in &snaps {
            state.snapshots.remove(snap);
        }
        for child in &children {
            state.filesystems.remove(child);
        }
        state.filesystems.remove(path);
        debug!(
            "Mock: destroyed dataset {} ({} children, {} snapshots)",
            path,
            children.len(),
            snaps.len()
        );
        state.take_lost_reply(EngineOp::Destroy, path.as_str())
    }

    async fn list_datasets(&self, opts: &ListOptions) -> Result<Vec<DatasetRow>> {
        let label = opts
            .recurse_from
            .as_ref()
            .map_or("<all>", |root| root.as_str());
        self.begin(EngineOp::List, label).await?;
        let state = self.state.read().await;

        if let Some(ref root) = opts.recurse_from {
            state.require_filesystem(EngineOp::List, root)?;
        }

        let within = |p: &DatasetPath, extra: usize| match opts.recurse_from {
            None => true,
            Some(ref root) => {
                let dataset = p.dataset();
                if dataset != *root && !dataset.is_descendant_of(root) {
                    return false;
                }
                match (opts.depth, dataset.depth_below(root)) {
                    (Some(max), Some(depth)) => depth + extra <= max as usize,
                    _ => true,
                }
            }
        };

        let rows = if opts.snapshots_only {
            state
                .snapshots
                .keys()
                .filter(|p| within(p, 1))
                .map(|p| DatasetRow::bare(p.clone()))
                .collect()
        } else {
            state
                .filesystems
                .iter()
                .filter(|(p, _)| within(p, 0))
                .map(|(p, fs)| DatasetRow {
                    mountpoint: Some(format!("/{}", p)),
                    origin: fs.origin.clone(),
                    ..DatasetRow::bare(p.clone())
                })
                .collect()
        };
        Ok(rows)
    }

    async fn snapshot(
        &self,
        target: &DatasetPath,
        generation: Generation,
    ) -> Result<DatasetPath> {
        let snap = snapshot_path(target, generation)?;
        self.begin(EngineOp::Snapshot, snap.as_str()).await?;
        let mut state = self.state.write().await;

        let files = state
            .filesystems
            .get(target)
            .map(|fs| fs.files.clone())
            .ok_or_else(|| ForkpoolError::not_found("Dataset", target.as_str()))?;
        if state.snapshots.contains_key(&snap) {
            return Err(ForkpoolError::already_exists(snap.as_str()));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.snapshots.insert(snap.clone(), MockSnapshot { files, seq });
        debug!("Mock: created snapshot {}", snap);
        Ok(snap)
    }

    async fn clone_snapshot(
        &self,
        snapshot: &DatasetPath,
        destination: &DatasetPath,
    ) -> Result<DatasetPath> {
        self.begin(EngineOp::Clone, destination.as_str()).await?;
        let mut state = self.state.write().await;

        let files = state
            .snapshots
            .get(snapshot)
            .map(|s| s.files.clone())
            .ok_or_else(|| ForkpoolError::not_found("Snapshot", snapshot.as_str()))?;
        if state.exists(destination) {
            return Err(ForkpoolError::already_exists(destination.as_str()));
        }
        state.require_parent(destination)?;

        state.filesystems.insert(
            destination.clone(),
            MockFilesystem {
                origin: Some(snapshot.clone()),
                files,
                exported: false,
            },
        );
        debug!("Mock: cloned {} -> {}", snapshot, destination);
        Ok(destination.clone())
    }

    async fn promote(&self, branch: &DatasetPath) -> Result<()> {
        self.begin(EngineOp::Promote, branch.as_str()).await?;
        let mut state = self.state.write().await;

        state.require_filesystem(EngineOp::Promote, branch)?;
        let origin = state.filesystems[branch].origin.clone().ok_or_else(|| {
            ForkpoolError::engine(
                EngineOp::Promote,
                branch.as_str(),
                1,
                "not a cloned filesystem",
            )
        })?;
        let origin_fs = origin.dataset();
        let origin_seq = state.snapshots.get(&origin).map(|s| s.seq).ok_or_else(|| {
            ForkpoolError::internal(format!("origin snapshot {} missing", origin))
        })?;
        let grandparent = state
            .filesystems
            .get(&origin_fs)
            .and_then(|fs| fs.origin.clone());

        // Snapshots of the origin up to and including the clone point move
        // to the promoted filesystem, keeping their names
        let mut moved = BTreeMap::new();
        for (snap, meta) in state.snapshots.iter() {
            if snap.dataset() == origin_fs && meta.seq <= origin_seq {
                let suffix = snap.snapshot_suffix().unwrap_or_default();
                let renamed = DatasetPath::parse(&format!("{}@{}", branch, suffix))?;
                if state.snapshots.contains_key(&renamed) {
                    return Err(ForkpoolError::engine(
                        EngineOp::Promote,
                        branch.as_str(),
                        1,
                        format!("snapshot name collision: {}", renamed),
                    ));
                }
                moved.insert(snap.clone(), renamed);
            }
        }

        for (from, to) in &moved {
            if let Some(meta) = state.snapshots.remove(from) {
                state.snapshots.insert(to.clone(), meta);
            }
        }
        state.remap_origins(&moved);

        let new_origin_of_old = moved.get(&origin).cloned();
        if let Some(fs) = state.filesystems.get_mut(branch) {
            fs.origin = grandparent;
        }
        if let Some(fs) = state.filesystems.get_mut(&origin_fs) {
            fs.origin = new_origin_of_old;
        }

        debug!(
            "Mock: promoted {} ({} snapshots taken from {})",
            branch,
            moved.len(),
            origin_fs
        );
        Ok(())
    }

    async fn rename(&self, from: &DatasetPath, to: &DatasetPath) -> Result<()> {
        self.begin(EngineOp::Rename, from.as_str()).await?;
        let mut state = self.state.write().await;

        state.require_filesystem(EngineOp::Rename, from)?;
        if state.exists(to) {
            return Err(ForkpoolError::already_exists(to.as_str()));
        }
        if to.is_descendant_of(from) {
            return Err(ForkpoolError::engine(
                EngineOp::Rename,
                from.as_str(),
                1,
                "cannot rename a dataset into itself",
            ));
        }
        state.require_parent(to)?;

        let fs_moves: Vec<(DatasetPath, DatasetPath)> = state
            .filesystems
            .keys()
            .filter_map(|p| p.rebase(from, to).map(|n| (p.clone(), n)))
            .collect();
        let snap_moves: BTreeMap<DatasetPath, DatasetPath> = state
            .snapshots
            .keys()
            .filter_map(|p| p.rebase(from, to).map(|n| (p.clone(), n)))
            .collect();

        for (old, new) in &fs_moves {
            if let Some(fs) = state.filesystems.remove(old) {
                state.filesystems.insert(new.clone(), fs);
            }
        }
        for (old, new) in &snap_moves {
            if let Some(snap) = state.snapshots.remove(old) {
                state.snapshots.insert(new.clone(), snap);
            }
        }
        state.remap_origins(&snap_moves);

        debug!("Mock: renamed {} -> {}", from, to);
        state.take_lost_reply(EngineOp::Rename, from.as_str())
    }

    async fn set_export(&self, path: &DatasetPath, enabled: bool) -> Result<()> {
        self.begin(EngineOp::SetExport, path.as_str()).await?;
        let mut state = self.state.write().await;

        state.require_filesystem(EngineOp::SetExport, path)?;
        if let Some(fs) = state.filesystems.get_mut(path) {
            fs.exported = enabled;
        }
        debug!("Mock: export of {} set to {}", path, enabled);
        Ok(())
    }
}
