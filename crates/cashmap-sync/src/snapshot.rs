//! Denormalized, versioned read snapshot for the search front end.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use cashmap_core::{Campaign, Device, NormalizedReward, RewardUnit, SourceRegistry};
use cashmap_storage::{sha256_hex, write_atomic, CampaignRepository};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotCampaign {
    pub source_site: String,
    pub source_site_name: String,
    pub display_name: String,
    pub reward_raw: String,
    pub reward_normalized: NormalizedReward,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward_yen: Option<f64>,
    pub category: String,
    pub category_name: String,
    pub device: Device,
    #[serde(rename = "destinationURL")]
    pub destination_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStats {
    pub by_source: BTreeMap<String, usize>,
    pub by_device: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub generated_at: DateTime<Utc>,
    pub total_campaigns: usize,
    /// `generated_at` in epoch milliseconds, for client cache busting.
    pub cache_timestamp: i64,
    /// sha256 of the serialized `campaigns` array.
    pub version: String,
    pub stats: SnapshotStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSnapshot {
    pub metadata: SnapshotMetadata,
    pub campaigns: Vec<SnapshotCampaign>,
}

fn reward_yen(reward: &NormalizedReward, point_rate: Option<f64>) -> Option<f64> {
    let amount = reward.amount?;
    let yen = match reward.unit {
        RewardUnit::Yen => amount,
        RewardUnit::Point => amount * point_rate?,
        RewardUnit::Percent | RewardUnit::Unknown => return None,
    };
    Some((yen * 100.0).round() / 100.0)
}

/// Build the snapshot from store records. Inactive records are skipped; the result
/// depends only on the records and the registry, plus `generated_at`.
pub fn build_snapshot(
    records: &[Campaign],
    registry: &SourceRegistry,
    generated_at: DateTime<Utc>,
) -> Result<SearchSnapshot> {
    let mut active = records.iter().filter(|c| c.active).collect::<Vec<_>>();
    active.sort_by_key(|c| c.key());

    let campaigns = active
        .into_iter()
        .map(|c| {
            let source = registry.find(&c.source_site);
            let category_name = source
                .and_then(|s| s.category(&c.category))
                .map(|cat| cat.display_name.clone())
                .unwrap_or_else(|| c.category.clone());
            SnapshotCampaign {
                source_site: c.source_site.clone(),
                source_site_name: source
                    .map(|s| s.display_name.clone())
                    .unwrap_or_else(|| c.source_site.clone()),
                display_name: c.display_name.clone(),
                reward_raw: c.reward_raw.clone(),
                reward_normalized: c.reward_normalized,
                reward_yen: reward_yen(&c.reward_normalized, source.and_then(|s| s.point_rate)),
                category: c.category.clone(),
                category_name,
                device: c.device,
                destination_url: c.destination_url.clone(),
            }
        })
        .collect::<Vec<_>>();

    let mut stats = SnapshotStats::default();
    for c in &campaigns {
        *stats.by_source.entry(c.source_site.clone()).or_default() += 1;
        *stats.by_device.entry(c.device.to_string()).or_default() += 1;
        *stats.by_category.entry(c.category.clone()).or_default() += 1;
    }
    let version = sha256_hex(&serde_json::to_vec(&campaigns).context("serializing snapshot campaigns")?);

    Ok(SearchSnapshot {
        metadata: SnapshotMetadata {
            generated_at,
            total_campaigns: campaigns.len(),
            cache_timestamp: generated_at.timestamp_millis(),
            version,
            stats,
        },
        campaigns,
    })
}

/// Read the store's active records and publish the snapshot atomically at `path`.
pub async fn write_snapshot(
    repository: &dyn CampaignRepository,
    registry: &SourceRegistry,
    path: &Path,
    generated_at: DateTime<Utc>,
) -> Result<SearchSnapshot> {
    let records = repository
        .list_active()
        .await
        .context("listing active campaigns for snapshot")?;
    let snapshot = build_snapshot(&records, registry, generated_at)?;
    let bytes = serde_json::to_vec_pretty(&snapshot).context("serializing snapshot")?;
    write_atomic(path, &bytes)
        .await
        .with_context(|| format!("writing snapshot {}", path.display()))?;
    info!(
        path = %path.display(),
        campaigns = snapshot.metadata.total_campaigns,
        version = %snapshot.metadata.version,
        "snapshot written"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cashmap_core::{CampaignObservation, ObservationOrder};
    use chrono::TimeZone;
    use uuid::Uuid;

    const REGISTRY_YAML: &str = r#"
sources:
  - name: chobirich
    display_name: ちょびリッチ
    base_url: https://www.chobirich.com
    point_rate: 0.5
    categories:
      - key: shopping
        display_name: ショッピング
        url: /shopping/shop/101
    pagination:
      kind: numeric
    extraction:
      item_selector: li
      name_selector: .name
      reward_selector: .pt
      link_selector: a
"#;

    fn registry() -> SourceRegistry {
        serde_yaml::from_str(REGISTRY_YAML).unwrap()
    }

    fn campaign(id: u32, device: Device, reward: NormalizedReward) -> Campaign {
        let obs = CampaignObservation {
            source_site: "chobirich".into(),
            source_key: Some(id.to_string()),
            destination_url: format!("https://www.chobirich.com/ad_details/{id}/"),
            display_name: format!("campaign {id}"),
            reward_raw: "raw".into(),
            reward_normalized: reward,
            category: "shopping".into(),
            device,
            observed: ObservationOrder::default(),
        };
        let at = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        Campaign::from_observation(&obs, at, Uuid::nil())
    }

    fn records() -> Vec<Campaign> {
        let mut gone = campaign(3, Device::Pc, NormalizedReward::unknown());
        gone.active = false;
        vec![
            campaign(2, Device::Ios, NormalizedReward::new(1000.0, RewardUnit::Point)),
            gone,
            campaign(1, Device::Pc, NormalizedReward::new(1.0, RewardUnit::Percent)),
            campaign(2, Device::Android, NormalizedReward::new(500.0, RewardUnit::Yen)),
        ]
    }

    #[test]
    fn identical_store_state_gives_identical_campaigns() {
        let t1 = Utc.with_ymd_and_hms(2026, 4, 2, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 4, 3, 12, 0, 0).unwrap();
        let mut shuffled = records();
        shuffled.reverse();

        let a = build_snapshot(&records(), &registry(), t1).unwrap();
        let b = build_snapshot(&shuffled, &registry(), t2).unwrap();
        assert_eq!(a.campaigns, b.campaigns);
        assert_eq!(a.metadata.version, b.metadata.version);
        assert_ne!(a.metadata.cache_timestamp, b.metadata.cache_timestamp);
    }

    #[test]
    fn only_active_records_are_published_with_metadata() {
        let snapshot = build_snapshot(&records(), &registry(), Utc::now()).unwrap();
        assert_eq!(snapshot.metadata.total_campaigns, 3);
        assert_eq!(snapshot.metadata.stats.by_source["chobirich"], 3);
        assert_eq!(snapshot.metadata.stats.by_device["iOS"], 1);
        assert!(snapshot.campaigns.iter().all(|c| c.source_site_name == "ちょびリッチ"));
        assert!(snapshot.campaigns.iter().all(|c| c.category_name == "ショッピング"));

        let ios = snapshot.campaigns.iter().find(|c| c.device == Device::Ios).unwrap();
        assert_eq!(ios.reward_yen, Some(500.0));
        let pct = snapshot.campaigns.iter().find(|c| c.device == Device::Pc).unwrap();
        assert_eq!(pct.reward_yen, None);
    }

    #[test]
    fn wire_format_uses_camel_case() {
        let snapshot = build_snapshot(&records(), &registry(), Utc::now()).unwrap();
        let value = serde_json::to_value(&snapshot).unwrap();
        let first = &value["campaigns"][0];
        assert!(first.get("destinationURL").is_some());
        assert!(first.get("rewardNormalized").unwrap().get("unit").is_some());
        assert!(value["metadata"].get("totalCampaigns").is_some());
        assert!(value["metadata"].get("cacheTimestamp").is_some());
    }
}
