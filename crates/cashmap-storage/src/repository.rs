//! Campaign persistence behind a trait so the merge engine never sees a concrete store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use cashmap_core::{Campaign, CanonicalKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::write_atomic;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to persist {path}: {message}")]
    Persist { path: String, message: String },
    #[error("corrupt stored record for {key}: {message}")]
    Corrupt { key: String, message: String },
    #[error("revision conflict on {key}: expected {expected}, found {found}")]
    RevisionConflict { key: String, expected: u64, found: u64 },
    #[error("no active record to deactivate for {key}")]
    NotActive { key: String },
}

/// Keyed campaign store. `upsert` is guarded by revision: a brand-new record must carry
/// revision 1 and an update must carry exactly the stored revision plus one.
#[async_trait]
pub trait CampaignRepository: Send + Sync {
    async fn upsert(&self, campaign: &Campaign) -> Result<(), StoreError>;
    async fn find_by_key(&self, key: &CanonicalKey) -> Result<Option<Campaign>, StoreError>;
    async fn find_active_by_key(&self, key: &CanonicalKey)
        -> Result<Option<Campaign>, StoreError>;
    /// Soft-delete. Returns false when the record is missing or already inactive.
    async fn deactivate(&self, key: &CanonicalKey) -> Result<bool, StoreError>;
    async fn list_active(&self) -> Result<Vec<Campaign>, StoreError>;
    async fn list_all(&self) -> Result<Vec<Campaign>, StoreError>;
    /// All-or-nothing: every `writes` upsert, then every deactivation, or none of them.
    /// A deactivation that finds no active record fails the batch with `NotActive`.
    async fn apply_batch(
        &self,
        writes: &[Campaign],
        deactivations: &[CanonicalKey],
    ) -> Result<(), StoreError>;
    async fn flush(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Clone)]
pub(crate) struct CampaignTable {
    rows: BTreeMap<CanonicalKey, Campaign>,
}

impl CampaignTable {
    pub(crate) fn from_records(records: Vec<Campaign>) -> Self {
        let rows = records.into_iter().map(|c| (c.key(), c)).collect();
        Self { rows }
    }

    pub(crate) fn upsert(&mut self, campaign: &Campaign) -> Result<(), StoreError> {
        let key = campaign.key();
        let expected = self.rows.get(&key).map_or(1, |stored| stored.revision + 1);
        if campaign.revision != expected {
            return Err(StoreError::RevisionConflict {
                key: key.to_string(),
                expected,
                found: campaign.revision,
            });
        }
        self.rows.insert(key, campaign.clone());
        Ok(())
    }

    pub(crate) fn deactivate(&mut self, key: &CanonicalKey) -> bool {
        match self.rows.get_mut(key) {
            Some(stored) if stored.active => {
                stored.active = false;
                stored.revision += 1;
                true
            }
            _ => false,
        }
    }

    /// Apply a batch to a copy; `self` is untouched when any step fails.
    pub(crate) fn staged(
        &self,
        writes: &[Campaign],
        deactivations: &[CanonicalKey],
    ) -> Result<Self, StoreError> {
        let mut next = self.clone();
        for campaign in writes {
            next.upsert(campaign)?;
        }
        for key in deactivations {
            if !next.deactivate(key) {
                return Err(StoreError::NotActive {
                    key: key.to_string(),
                });
            }
        }
        Ok(next)
    }

    pub(crate) fn get(&self, key: &CanonicalKey) -> Option<Campaign> {
        self.rows.get(key).cloned()
    }

    pub(crate) fn active(&self) -> Vec<Campaign> {
        self.rows.values().filter(|c| c.active).cloned().collect()
    }

    pub(crate) fn all(&self) -> Vec<Campaign> {
        self.rows.values().cloned().collect()
    }
}

/// Volatile store used by tests and dry runs. Counts successful writes.
#[derive(Debug, Default)]
pub struct InMemoryCampaignRepository {
    table: Mutex<CampaignTable>,
    writes: AtomicUsize,
}

impl InMemoryCampaignRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<Campaign>) -> Self {
        Self {
            table: Mutex::new(CampaignTable::from_records(records)),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CampaignRepository for InMemoryCampaignRepository {
    async fn upsert(&self, campaign: &Campaign) -> Result<(), StoreError> {
        self.table.lock().await.upsert(campaign)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn find_by_key(&self, key: &CanonicalKey) -> Result<Option<Campaign>, StoreError> {
        Ok(self.table.lock().await.get(key))
    }

    async fn find_active_by_key(
        &self,
        key: &CanonicalKey,
    ) -> Result<Option<Campaign>, StoreError> {
        Ok(self.table.lock().await.get(key).filter(|c| c.active))
    }

    async fn deactivate(&self, key: &CanonicalKey) -> Result<bool, StoreError> {
        let changed = self.table.lock().await.deactivate(key);
        if changed {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(changed)
    }

    async fn list_active(&self) -> Result<Vec<Campaign>, StoreError> {
        Ok(self.table.lock().await.active())
    }

    async fn list_all(&self) -> Result<Vec<Campaign>, StoreError> {
        Ok(self.table.lock().await.all())
    }

    async fn apply_batch(
        &self,
        writes: &[Campaign],
        deactivations: &[CanonicalKey],
    ) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        *table = table.staged(writes, deactivations)?;
        self.writes
            .fetch_add(writes.len() + deactivations.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default = "store_file_version")]
    version: u32,
    campaigns: Vec<Campaign>,
}

fn store_file_version() -> u32 {
    1
}

#[derive(Debug, Default)]
struct JsonFileState {
    table: CampaignTable,
    dirty: bool,
}

/// Single JSON document holding every record, rewritten atomically on `flush`.
#[derive(Debug)]
pub struct JsonFileCampaignRepository {
    path: PathBuf,
    state: Mutex<JsonFileState>,
}

impl JsonFileCampaignRepository {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let table = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: StoreFile = serde_json::from_slice(&bytes)?;
                info!(path = %path.display(), records = file.campaigns.len(), "loaded campaign store");
                CampaignTable::from_records(file.campaigns)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "campaign store missing; starting empty");
                CampaignTable::default()
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            state: Mutex::new(JsonFileState {
                table,
                dirty: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CampaignRepository for JsonFileCampaignRepository {
    async fn upsert(&self, campaign: &Campaign) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.table.upsert(campaign)?;
        state.dirty = true;
        Ok(())
    }

    async fn find_by_key(&self, key: &CanonicalKey) -> Result<Option<Campaign>, StoreError> {
        Ok(self.state.lock().await.table.get(key))
    }

    async fn find_active_by_key(
        &self,
        key: &CanonicalKey,
    ) -> Result<Option<Campaign>, StoreError> {
        Ok(self.state.lock().await.table.get(key).filter(|c| c.active))
    }

    async fn deactivate(&self, key: &CanonicalKey) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let changed = state.table.deactivate(key);
        state.dirty |= changed;
        Ok(changed)
    }

    async fn list_active(&self) -> Result<Vec<Campaign>, StoreError> {
        Ok(self.state.lock().await.table.active())
    }

    async fn list_all(&self) -> Result<Vec<Campaign>, StoreError> {
        Ok(self.state.lock().await.table.all())
    }

    async fn apply_batch(
        &self,
        writes: &[Campaign],
        deactivations: &[CanonicalKey],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.table = state.table.staged(writes, deactivations)?;
        state.dirty |= !(writes.is_empty() && deactivations.is_empty());
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.dirty {
            return Ok(());
        }
        let file = StoreFile {
            version: store_file_version(),
            campaigns: state.table.all(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        write_atomic(&self.path, &bytes)
            .await
            .map_err(|err| StoreError::Persist {
                path: self.path.display().to_string(),
                message: format!("{err:#}"),
            })?;
        state.dirty = false;
        info!(path = %self.path.display(), records = file.campaigns.len(), "flushed campaign store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cashmap_core::{CampaignObservation, Device, NormalizedReward, ObservationOrder, RewardUnit};
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn campaign(url: &str, device: Device) -> Campaign {
        let obs = CampaignObservation {
            source_site: "chobirich".into(),
            source_key: Some("1001".into()),
            destination_url: url.into(),
            display_name: "Travel Card".into(),
            reward_raw: "12000pt".into(),
            reward_normalized: NormalizedReward::new(12000.0, RewardUnit::Point),
            category: "card".into(),
            device,
            observed: ObservationOrder::default(),
        };
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        Campaign::from_observation(&obs, now, Uuid::nil())
    }

    #[tokio::test]
    async fn upsert_requires_sequential_revisions() {
        let repo = InMemoryCampaignRepository::new();
        let mut record = campaign("https://example.com/ad/1", Device::Pc);
        repo.upsert(&record).await.expect("insert");

        let err = repo.upsert(&record).await.expect_err("stale write must fail");
        assert!(matches!(
            err,
            StoreError::RevisionConflict { expected: 2, found: 1, .. }
        ));

        record.revision = 2;
        record.miss_streak = 1;
        repo.upsert(&record).await.expect("update");
        let stored = repo.find_by_key(&record.key()).await.unwrap().unwrap();
        assert_eq!(stored.miss_streak, 1);
        assert_eq!(repo.write_count(), 2);
    }

    #[tokio::test]
    async fn new_record_must_start_at_revision_one() {
        let repo = InMemoryCampaignRepository::new();
        let mut record = campaign("https://example.com/ad/1", Device::Pc);
        record.revision = 4;
        assert!(repo.upsert(&record).await.is_err());
    }

    #[tokio::test]
    async fn deactivate_hides_record_from_active_views() {
        let repo = InMemoryCampaignRepository::new();
        let ios = campaign("https://example.com/ad/1", Device::Ios);
        let android = campaign("https://example.com/ad/1", Device::Android);
        repo.upsert(&ios).await.unwrap();
        repo.upsert(&android).await.unwrap();

        assert!(repo.deactivate(&ios.key()).await.unwrap());
        assert!(!repo.deactivate(&ios.key()).await.unwrap());
        assert!(repo.find_active_by_key(&ios.key()).await.unwrap().is_none());
        let stored = repo.find_by_key(&ios.key()).await.unwrap().unwrap();
        assert!(!stored.active);
        assert_eq!(stored.revision, 2);

        let active = repo.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].device, Device::Android);
        assert_eq!(repo.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_batch_leaves_the_store_untouched() {
        let first = campaign("https://example.com/ad/1", Device::Pc);
        let second = campaign("https://example.com/ad/2", Device::Pc);
        let repo = InMemoryCampaignRepository::with_records(vec![first.clone(), second.clone()]);

        let mut bumped = first.clone();
        bumped.revision = 2;
        bumped.reward_raw = "15000pt".into();
        let stale_second = second.clone();
        let fresh = campaign("https://example.com/ad/3", Device::Pc);

        let err = repo
            .apply_batch(&[bumped, stale_second, fresh], &[])
            .await
            .expect_err("second write is stale");
        assert!(matches!(err, StoreError::RevisionConflict { expected: 2, found: 1, .. }));

        let all = repo.list_all().await.unwrap();
        assert_eq!(all, vec![first, second]);
        assert_eq!(repo.write_count(), 0);
    }

    #[tokio::test]
    async fn batch_deactivation_of_inactive_record_rolls_back() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("campaigns.json");
        let repo = JsonFileCampaignRepository::open(&path).await.unwrap();
        let record = campaign("https://example.com/ad/1", Device::Ios);
        let missing = campaign("https://example.com/ad/9", Device::Ios);

        let err = repo
            .apply_batch(std::slice::from_ref(&record), &[missing.key()])
            .await
            .expect_err("nothing to deactivate");
        assert!(matches!(err, StoreError::NotActive { .. }));
        assert!(repo.list_all().await.unwrap().is_empty());
        repo.flush().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn json_store_round_trips_through_flush() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data").join("campaigns.json");

        let repo = JsonFileCampaignRepository::open(&path).await.expect("open empty");
        repo.upsert(&campaign("https://example.com/ad/1", Device::Pc))
            .await
            .unwrap();
        repo.upsert(&campaign("https://example.com/ad/2", Device::Ios))
            .await
            .unwrap();
        repo.flush().await.expect("flush");

        let reopened = JsonFileCampaignRepository::open(&path).await.expect("reopen");
        let all = reopened.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].destination_url, "https://example.com/ad/1");
    }

    #[tokio::test]
    async fn clean_json_store_skips_rewrite() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("campaigns.json");
        let repo = JsonFileCampaignRepository::open(&path).await.unwrap();
        repo.flush().await.unwrap();
        assert!(!path.exists());
    }
}
