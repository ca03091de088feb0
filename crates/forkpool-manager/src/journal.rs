//! Promotion checkpoints
//!
//! Promotion is a chain of separate engine calls with no rollback. Every
//! phase reached is logged and, when a journal directory is configured,
//! written to `<dir>/<id>.json` (temp file, fsync, rename) before the next
//! call is issued. A crash therefore leaves a record of the last phase
//! reached, which `pending()` reports. The file is removed once the
//! promotion is renamed into place or aborted before the old cache was
//! touched.

use chrono::{DateTime, Utc};
use forkpool_core::{DatasetPath, ForkpoolError, PromotionPhase, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

/// One phase transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub phase: PromotionPhase,
    pub at: DateTime<Utc>,
}

/// State of a single promotion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionRecord {
    pub id: Uuid,
    pub cache: String,
    pub branch: String,
    pub branch_path: DatasetPath,
    pub cache_path: DatasetPath,
    pub phase: PromotionPhase,
    pub history: Vec<Checkpoint>,
}

impl PromotionRecord {
    fn new(cache: &str, branch: &str, branch_path: &DatasetPath, cache_path: &DatasetPath) -> Self {
        Self {
            id: Uuid::new_v4(),
            cache: cache.to_string(),
            branch: branch.to_string(),
            branch_path: branch_path.clone(),
            cache_path: cache_path.clone(),
            phase: PromotionPhase::Pending,
            history: vec![Checkpoint {
                phase: PromotionPhase::Pending,
                at: Utc::now(),
            }],
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.history.first().map(|c| c.at)
    }
}

/// Journal of promotion checkpoints
#[derive(Debug, Clone, Default)]
pub struct PromotionJournal {
    dir: Option<PathBuf>,
}

impl PromotionJournal {
    /// Log checkpoints only
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    /// Persist checkpoints under `dir`, creating it if needed
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            ForkpoolError::journal(
                format!("cannot create journal directory {}", dir.display()),
                Some(Box::new(e)),
            )
        })?;
        Ok(Self { dir: Some(dir) })
    }

    /// Start a record in phase `Pending`
    pub async fn begin(
        &self,
        cache: &str,
        branch: &str,
        branch_path: &DatasetPath,
        cache_path: &DatasetPath,
    ) -> Result<PromotionRecord> {
        let record = PromotionRecord::new(cache, branch, branch_path, cache_path);
        info!(
            promotion = %record.id,
            "Promotion of {} into {}: {}",
            branch_path,
            cache_path,
            record.phase
        );
        self.persist(&record).await?;
        Ok(record)
    }

    /// Move `record` to `phase` and persist it, or drop it when `phase`
    /// ends the promotion
    pub async fn advance(&self, record: &mut PromotionRecord, phase: PromotionPhase) -> Result<()> {
        if !record.phase.can_transition_to(phase) {
            return Err(ForkpoolError::internal(format!(
                "invalid promotion transition {} -> {}",
                record.phase, phase
            )));
        }
        record.phase = phase;
        record.history.push(Checkpoint {
            phase,
            at: Utc::now(),
        });
        info!(
            promotion = %record.id,
            "Promotion of {} into {}: {}",
            record.branch_path,
            record.cache_path,
            phase
        );
        if phase.is_done() {
            self.remove(record).await
        } else {
            self.persist(record).await
        }
    }

    /// Records that never reached `Renamed`, oldest first
    pub async fn pending(&self) -> Result<Vec<PromotionRecord>> {
        let Some(ref dir) = self.dir else {
            return Ok(Vec::new());
        };

        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<PromotionRecord>(&data) {
                Ok(record) if !record.phase.is_done() => records.push(record),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable journal entry {}: {}", path.display(), e),
            }
        }
        records.sort_by_key(|r| r.started_at());
        Ok(records)
    }

    async fn remove(&self, record: &PromotionRecord) -> Result<()> {
        let Some(ref dir) = self.dir else {
            return Ok(());
        };
        match tokio::fs::remove_file(dir.join(format!("{}.json", record.id))).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn persist(&self, record: &PromotionRecord) -> Result<()> {
        let Some(ref dir) = self.dir else {
            return Ok(());
        };

        let data = serde_json::to_vec_pretty(record)?;
        let target = dir.join(format!("{}.json", record.id));
        let tmp = dir.join(format!("{}.json.tmp", record.id));

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths() -> (DatasetPath, DatasetPath) {
        (
            DatasetPath::parse("P/branches/app/abc").unwrap(),
            DatasetPath::parse("P/caches/app").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_disabled_journal_accepts_transitions() {
        let journal = PromotionJournal::disabled();
        let (branch, cache) = paths();
        let mut record = journal.begin("app", "abc", &branch, &cache).await.unwrap();

        journal
            .advance(&mut record, PromotionPhase::Promoted)
            .await
            .unwrap();
        assert_eq!(record.phase, PromotionPhase::Promoted);
        assert_eq!(record.history.len(), 2);
        assert!(journal.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let journal = PromotionJournal::disabled();
        let (branch, cache) = paths();
        let mut record = journal.begin("app", "abc", &branch, &cache).await.unwrap();

        let err = journal
            .advance(&mut record, PromotionPhase::Renamed)
            .await
            .unwrap_err();
        assert!(matches!(err, ForkpoolError::Internal { .. }));
        assert_eq!(record.phase, PromotionPhase::Pending);
    }

    #[tokio::test]
    async fn test_unfinished_promotion_is_pending() {
        let dir = TempDir::new().unwrap();
        let journal = PromotionJournal::open(dir.path()).await.unwrap();
        let (branch, cache) = paths();

        let mut record = journal.begin("app", "abc", &branch, &cache).await.unwrap();
        journal
            .advance(&mut record, PromotionPhase::Promoted)
            .await
            .unwrap();
        journal
            .advance(&mut record, PromotionPhase::OldCacheDestroyed)
            .await
            .unwrap();

        let pending = journal.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, record.id);
        assert_eq!(pending[0].phase, PromotionPhase::OldCacheDestroyed);
        assert_eq!(pending[0].branch_path, branch);
    }

    #[tokio::test]
    async fn test_finished_promotion_is_not_pending() {
        let dir = TempDir::new().unwrap();
        let journal = PromotionJournal::open(dir.path().join("journal"))
            .await
            .unwrap();
        let (branch, cache) = paths();

        let mut record = journal.begin("app", "abc", &branch, &cache).await.unwrap();
        for phase in [
            PromotionPhase::Promoted,
            PromotionPhase::OldCacheDestroyed,
            PromotionPhase::Renamed,
        ] {
            journal.advance(&mut record, phase).await.unwrap();
        }

        assert!(journal.pending().await.unwrap().is_empty());
        let file = dir
            .path()
            .join("journal")
            .join(format!("{}.json", record.id));
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_aborted_promotion_is_dropped() {
        let dir = TempDir::new().unwrap();
        let journal = PromotionJournal::open(dir.path()).await.unwrap();
        let (branch, cache) = paths();

        let mut record = journal.begin("app", "abc", &branch, &cache).await.unwrap();
        journal
            .advance(&mut record, PromotionPhase::Promoted)
            .await
            .unwrap();
        assert_eq!(journal.pending().await.unwrap().len(), 1);

        journal
            .advance(&mut record, PromotionPhase::Aborted)
            .await
            .unwrap();
        assert!(journal.pending().await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
