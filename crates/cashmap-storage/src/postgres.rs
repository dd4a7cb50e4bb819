use async_trait::async_trait;
use cashmap_core::{Campaign, CanonicalKey, Device, NormalizedReward, RewardUnit};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgExecutor, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::repository::{CampaignRepository, StoreError};

const SCHEMA_SQL: &str = include_str!("../../../migrations/0001_campaigns.sql");

const SELECT_COLUMNS: &str = r#"
    SELECT source_site, destination_url, device, source_key, display_name, reward_raw,
           reward_amount, reward_unit, category, active, first_seen_at, last_seen_at,
           miss_streak, revision, last_merge_run
      FROM campaigns
"#;

/// Postgres-backed store. The revision guard is enforced in SQL so concurrent writers
/// cannot silently overwrite each other.
#[derive(Debug, Clone)]
pub struct PgCampaignRepository {
    pool: PgPool,
}

impl PgCampaignRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        info!("connected to postgres campaign store");
        Ok(Self::new(pool))
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }
}

async fn current_revision<'e, E: PgExecutor<'e>>(
    executor: E,
    key: &CanonicalKey,
) -> Result<Option<u64>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT revision FROM campaigns
         WHERE source_site = $1 AND destination_url = $2 AND device = $3
        "#,
    )
    .bind(&key.source_site)
    .bind(&key.destination_url)
    .bind(key.device.as_str())
    .fetch_optional(executor)
    .await?;
    row.map(|r| r.try_get::<i64, _>("revision").map(|v| v as u64))
        .transpose()
        .map_err(StoreError::from)
}

async fn revision_conflict<'e, E: PgExecutor<'e>>(executor: E, campaign: &Campaign) -> StoreError {
    let key = campaign.key();
    let expected = match current_revision(executor, &key).await {
        Ok(Some(stored)) => stored + 1,
        Ok(None) => 1,
        Err(err) => return err,
    };
    StoreError::RevisionConflict {
        key: key.to_string(),
        expected,
        found: campaign.revision,
    }
}

/// Insert at revision 1 or update guarded by `revision - 1`; returns rows affected.
async fn write_row<'e, E: PgExecutor<'e>>(
    executor: E,
    campaign: &Campaign,
) -> Result<u64, StoreError> {
    let query = if campaign.revision == 1 {
        sqlx::query(
            r#"
            INSERT INTO campaigns (
                source_site, destination_url, device, source_key, display_name, reward_raw,
                reward_amount, reward_unit, category, active, first_seen_at, last_seen_at,
                miss_streak, revision, last_merge_run
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (source_site, destination_url, device) DO NOTHING
            "#,
        )
    } else {
        sqlx::query(
            r#"
            UPDATE campaigns
               SET source_key = $4,
                   display_name = $5,
                   reward_raw = $6,
                   reward_amount = $7,
                   reward_unit = $8,
                   category = $9,
                   active = $10,
                   first_seen_at = $11,
                   last_seen_at = $12,
                   miss_streak = $13,
                   revision = $14,
                   last_merge_run = $15
             WHERE source_site = $1
               AND destination_url = $2
               AND device = $3
               AND revision = $14 - 1
            "#,
        )
    };
    let result = query
        .bind(&campaign.source_site)
        .bind(&campaign.destination_url)
        .bind(campaign.device.as_str())
        .bind(&campaign.source_key)
        .bind(&campaign.display_name)
        .bind(&campaign.reward_raw)
        .bind(campaign.reward_normalized.amount)
        .bind(campaign.reward_normalized.unit.as_str())
        .bind(&campaign.category)
        .bind(campaign.active)
        .bind(campaign.first_seen_at)
        .bind(campaign.last_seen_at)
        .bind(campaign.miss_streak as i32)
        .bind(campaign.revision as i64)
        .bind(campaign.last_merge_run)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

async fn deactivate_row<'e, E: PgExecutor<'e>>(
    executor: E,
    key: &CanonicalKey,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE campaigns
           SET active = FALSE,
               revision = revision + 1
         WHERE source_site = $1
           AND destination_url = $2
           AND device = $3
           AND active
        "#,
    )
    .bind(&key.source_site)
    .bind(&key.destination_url)
    .bind(key.device.as_str())
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

fn campaign_from_row(row: &PgRow) -> Result<Campaign, StoreError> {
    let source_site: String = row.try_get("source_site")?;
    let destination_url: String = row.try_get("destination_url")?;
    let device_text: String = row.try_get("device")?;
    let unit_text: String = row.try_get("reward_unit")?;
    let corrupt = |message: String| StoreError::Corrupt {
        key: format!("{source_site}|{device_text}|{destination_url}"),
        message,
    };
    let device: Device = device_text.parse().map_err(corrupt)?;
    let unit: RewardUnit = unit_text.parse().map_err(corrupt)?;
    let miss_streak: i32 = row.try_get("miss_streak")?;
    let revision: i64 = row.try_get("revision")?;
    let first_seen_at: DateTime<Utc> = row.try_get("first_seen_at")?;
    let last_seen_at: DateTime<Utc> = row.try_get("last_seen_at")?;
    let last_merge_run: Option<Uuid> = row.try_get("last_merge_run")?;

    Ok(Campaign {
        source_key: row.try_get("source_key")?,
        display_name: row.try_get("display_name")?,
        reward_raw: row.try_get("reward_raw")?,
        reward_normalized: NormalizedReward {
            amount: row.try_get("reward_amount")?,
            unit,
        },
        category: row.try_get("category")?,
        active: row.try_get("active")?,
        source_site,
        destination_url,
        device,
        first_seen_at,
        last_seen_at,
        miss_streak: miss_streak.max(0) as u32,
        revision: revision.max(0) as u64,
        last_merge_run,
    })
}

#[async_trait]
impl CampaignRepository for PgCampaignRepository {
    async fn upsert(&self, campaign: &Campaign) -> Result<(), StoreError> {
        if write_row(&self.pool, campaign).await? == 0 {
            return Err(revision_conflict(&self.pool, campaign).await);
        }
        debug!(key = %campaign.key(), revision = campaign.revision, "upserted campaign");
        Ok(())
    }

    async fn find_by_key(&self, key: &CanonicalKey) -> Result<Option<Campaign>, StoreError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE source_site = $1 AND destination_url = $2 AND device = $3"
        );
        let row = sqlx::query(&sql)
            .bind(&key.source_site)
            .bind(&key.destination_url)
            .bind(key.device.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(campaign_from_row).transpose()
    }

    async fn find_active_by_key(
        &self,
        key: &CanonicalKey,
    ) -> Result<Option<Campaign>, StoreError> {
        Ok(self.find_by_key(key).await?.filter(|c| c.active))
    }

    async fn deactivate(&self, key: &CanonicalKey) -> Result<bool, StoreError> {
        deactivate_row(&self.pool, key).await
    }

    async fn list_active(&self) -> Result<Vec<Campaign>, StoreError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE active ORDER BY source_site, device, destination_url"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(campaign_from_row).collect()
    }

    async fn list_all(&self) -> Result<Vec<Campaign>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY source_site, device, destination_url");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(campaign_from_row).collect()
    }

    async fn apply_batch(
        &self,
        writes: &[Campaign],
        deactivations: &[CanonicalKey],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for campaign in writes {
            if write_row(&mut *tx, campaign).await? == 0 {
                let err = revision_conflict(&mut *tx, campaign).await;
                tx.rollback().await?;
                return Err(err);
            }
        }
        for key in deactivations {
            if !deactivate_row(&mut *tx, key).await? {
                tx.rollback().await?;
                return Err(StoreError::NotActive {
                    key: key.to_string(),
                });
            }
        }
        tx.commit().await?;
        debug!(
            writes = writes.len(),
            deactivations = deactivations.len(),
            "committed campaign batch"
        );
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
