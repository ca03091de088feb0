use crate::command::exec;
use crate::storage::StorageEngine;
use async_trait::async_trait;
use forkpool_core::listing::LIST_COLUMNS;
use forkpool_core::{
    parse_table, snapshot_path, DatasetPath, DatasetRow, EngineOp, Generation, ListOptions,
    Result,
};
use tracing::info;

/// ZFS CLI configuration
#[derive(Debug, Clone)]
pub struct ZfsConfig {
    /// Path to the `zfs` binary
    pub binary: String,
}

impl Default for ZfsConfig {
    fn default() -> Self {
        Self {
            binary: "zfs".to_string(),
        }
    }
}

/// ZFS-backed storage engine
///
/// Every primitive is one `zfs` invocation. Listings are requested with a
/// header and a fixed column set and parsed by `forkpool_core::listing`.
pub struct ZfsStorageEngine {
    config: ZfsConfig,
}

impl ZfsStorageEngine {
    pub fn new(config: ZfsConfig) -> Self {
        Self { config }
    }

    async fn zfs(&self, args: &[&str], op: EngineOp, path: &DatasetPath) -> Result<String> {
        self.zfs_labeled(args, op, path.as_str()).await
    }

    async fn zfs_labeled(&self, args: &[&str], op: EngineOp, label: &str) -> Result<String> {
        let output = exec(&self.config.binary, args, op, label).await?;
        Ok(output.stdout)
    }
}

/// Build the argument list for a listing
fn list_args(opts: &ListOptions) -> Vec<String> {
    let mut args = vec![
        "list".to_string(),
        "-p".to_string(),
        "-o".to_string(),
        LIST_COLUMNS.join(","),
        "-t".to_string(),
    ];
    args.push(if opts.snapshots_only {
        "snapshot".to_string()
    } else {
        "filesystem".to_string()
    });

    if let Some(depth) = opts.depth {
        args.push("-d".to_string());
        args.push(depth.to_string());
    } else if opts.recurse_from.is_some() {
        args.push("-r".to_string());
    }

    if let Some(ref root) = opts.recurse_from {
        args.push(root.to_string());
    }
    args
}

#[async_trait]
impl StorageEngine for ZfsStorageEngine {
    async fn create_dataset(&self, path: &DatasetPath) -> Result<()> {
        self.zfs(&["create", path.as_str()], EngineOp::Create, path)
            .await?;
        info!("ZFS dataset created: {}", path);
        Ok(())
    }

    async fn destroy_dataset(&self, path: &DatasetPath, recursive: bool) -> Result<()> {
        if recursive {
            self.zfs(&["destroy", "-r", path.as_str()], EngineOp::Destroy, path)
                .await?;
        } else {
            self.zfs(&["destroy", path.as_str()], EngineOp::Destroy, path)
                .await?;
        }
        info!("ZFS dataset destroyed: {}", path);
        Ok(())
    }

    async fn list_datasets(&self, opts: &ListOptions) -> Result<Vec<DatasetRow>> {
        let args = list_args(opts);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let label = opts
            .recurse_from
            .as_ref()
            .map_or("<all>", |root| root.as_str());
        let stdout = self.zfs_labeled(&args, EngineOp::List, label).await?;
        parse_table(&stdout)
    }

    async fn snapshot(
        &self,
        target: &DatasetPath,
        generation: Generation,
    ) -> Result<DatasetPath> {
        let snap = snapshot_path(target, generation)?;
        self.zfs(&["snapshot", snap.as_str()], EngineOp::Snapshot, &snap)
            .await?;
        info!("ZFS snapshot created: {}", snap);
        Ok(snap)
    }

    async fn clone_snapshot(
        &self,
        snapshot: &DatasetPath,
        destination: &DatasetPath,
    ) -> Result<DatasetPath> {
        self.zfs(
            &["clone", snapshot.as_str(), destination.as_str()],
            EngineOp::Clone,
            destination,
        )
        .await?;
        info!("ZFS clone created: {} -> {}", snapshot, destination);
        Ok(destination.clone())
    }

    async fn promote(&self, branch: &DatasetPath) -> Result<()> {
        self.zfs(&["promote", branch.as_str()], EngineOp::Promote, branch)
            .await?;
        info!("ZFS clone promoted: {}", branch);
        Ok(())
    }

    async fn rename(&self, from: &DatasetPath, to: &DatasetPath) -> Result<()> {
        self.zfs(&["rename", from.as_str(), to.as_str()], EngineOp::Rename, from)
            .await?;
        info!("ZFS dataset renamed: {} -> {}", from, to);
        Ok(())
    }

    async fn set_export(&self, path: &DatasetPath, enabled: bool) -> Result<()> {
        let property = if enabled { "sharenfs=on" } else { "sharenfs=off" };
        self.zfs(&["set", property, path.as_str()], EngineOp::SetExport, path)
            .await?;
        info!("ZFS {} set on {}", property, path);
        Ok(())
    }
}
