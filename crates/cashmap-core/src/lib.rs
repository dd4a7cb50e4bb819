//! Core domain model and source configuration types for cashmap.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cashmap-core";

/// Device a campaign is available on. Part of the canonical key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Device {
    #[serde(rename = "iOS")]
    Ios,
    Android,
    #[serde(rename = "PC")]
    Pc,
    Unknown,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Ios => "iOS",
            Device::Android => "Android",
            Device::Pc => "PC",
            Device::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ios" | "iphone" => Ok(Device::Ios),
            "android" => Ok(Device::Android),
            "pc" | "web" | "desktop" => Ok(Device::Pc),
            "unknown" => Ok(Device::Unknown),
            other => Err(format!("unknown device: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewardUnit {
    Yen,
    Point,
    Percent,
    Unknown,
}

impl RewardUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardUnit::Yen => "yen",
            RewardUnit::Point => "point",
            RewardUnit::Percent => "percent",
            RewardUnit::Unknown => "unknown",
        }
    }
}

impl FromStr for RewardUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yen" => Ok(RewardUnit::Yen),
            "point" => Ok(RewardUnit::Point),
            "percent" => Ok(RewardUnit::Percent),
            "unknown" => Ok(RewardUnit::Unknown),
            other => Err(format!("unknown reward unit: {other}")),
        }
    }
}

/// Structured reward value. `unit = Unknown` is a retained state with no amount.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedReward {
    pub amount: Option<f64>,
    pub unit: RewardUnit,
}

impl NormalizedReward {
    pub fn new(amount: f64, unit: RewardUnit) -> Self {
        Self {
            amount: Some(amount),
            unit,
        }
    }

    pub fn unknown() -> Self {
        Self {
            amount: None,
            unit: RewardUnit::Unknown,
        }
    }

    pub fn is_known(&self) -> bool {
        self.unit != RewardUnit::Unknown && self.amount.is_some()
    }
}

/// `(sourceSite, destinationURL, device)`; the URL is already stripped of tracking params.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalKey {
    pub source_site: String,
    pub destination_url: String,
    pub device: Device,
}

impl CanonicalKey {
    pub fn new(source_site: impl Into<String>, destination_url: impl Into<String>, device: Device) -> Self {
        Self {
            source_site: source_site.into(),
            destination_url: destination_url.into(),
            device,
        }
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.source_site, self.device, self.destination_url)
    }
}

/// Position of an observation within a run. Assigned from configuration order, not
/// arrival order, so parallel crawling cannot change which duplicate is earliest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct ObservationOrder {
    pub unit_index: u32,
    pub profile_index: u32,
    pub page: u32,
    pub position: u32,
}

/// Untouched text pulled off one listing entry by a site adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCampaign {
    pub source_site: String,
    pub category: String,
    pub profile_device: Device,
    pub page_url: String,
    pub name_raw: String,
    pub reward_raw: String,
    pub href_raw: String,
    pub device_hint: Option<String>,
    pub source_key: Option<String>,
    pub observed: ObservationOrder,
}

/// Normalized, device-tagged observation ready for deduplication and merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignObservation {
    pub source_site: String,
    pub source_key: Option<String>,
    pub destination_url: String,
    pub display_name: String,
    pub reward_raw: String,
    pub reward_normalized: NormalizedReward,
    pub category: String,
    pub device: Device,
    pub observed: ObservationOrder,
}

impl CampaignObservation {
    pub fn key(&self) -> CanonicalKey {
        CanonicalKey::new(&self.source_site, &self.destination_url, self.device)
    }

    /// Number of non-empty normalized fields; the deduplicator keeps the highest.
    pub fn completeness(&self) -> usize {
        [
            self.source_key.as_deref().is_some_and(|s| !s.is_empty()),
            !self.display_name.is_empty(),
            !self.reward_raw.is_empty(),
            self.reward_normalized.amount.is_some(),
            self.reward_normalized.unit != RewardUnit::Unknown,
            !self.category.is_empty(),
            self.device != Device::Unknown,
        ]
        .into_iter()
        .filter(|filled| *filled)
        .count()
    }
}

/// Persisted campaign record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub source_site: String,
    pub source_key: Option<String>,
    pub destination_url: String,
    pub display_name: String,
    pub reward_raw: String,
    pub reward_normalized: NormalizedReward,
    pub category: String,
    pub device: Device,
    pub active: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub miss_streak: u32,
    /// Incremented on every write; repositories reject non-sequential revisions.
    pub revision: u64,
    #[serde(default)]
    pub last_merge_run: Option<Uuid>,
}

impl Campaign {
    pub fn from_observation(obs: &CampaignObservation, now: DateTime<Utc>, run_id: Uuid) -> Self {
        Self {
            source_site: obs.source_site.clone(),
            source_key: obs.source_key.clone(),
            destination_url: obs.destination_url.clone(),
            display_name: obs.display_name.clone(),
            reward_raw: obs.reward_raw.clone(),
            reward_normalized: obs.reward_normalized,
            category: obs.category.clone(),
            device: obs.device,
            active: true,
            first_seen_at: now,
            last_seen_at: now,
            miss_streak: 0,
            revision: 1,
            last_merge_run: Some(run_id),
        }
    }

    pub fn key(&self) -> CanonicalKey {
        CanonicalKey::new(&self.source_site, &self.destination_url, self.device)
    }

    /// True when every mutable field already equals the observation.
    pub fn content_matches(&self, obs: &CampaignObservation) -> bool {
        self.display_name == obs.display_name
            && self.reward_raw == obs.reward_raw
            && self.reward_normalized == obs.reward_normalized
            && self.category == obs.category
            && self.source_key == obs.source_key
    }

    pub fn apply_observation(&mut self, obs: &CampaignObservation) {
        self.source_key = obs.source_key.clone();
        self.display_name = obs.display_name.clone();
        self.reward_raw = obs.reward_raw.clone();
        self.reward_normalized = obs.reward_normalized;
        self.category = obs.category.clone();
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceSiteConfig>,
}

impl SourceRegistry {
    pub fn enabled(&self) -> impl Iterator<Item = &SourceSiteConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn find(&self, name: &str) -> Option<&SourceSiteConfig> {
        self.sources.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    #[default]
    Html,
    Json,
}

/// One affiliate site. Immutable for the duration of a run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceSiteConfig {
    pub name: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub base_url: String,
    #[serde(default)]
    pub format: SourceFormat,
    /// Yen per point, when the site publishes a fixed conversion.
    #[serde(default)]
    pub point_rate: Option<f64>,
    pub categories: Vec<CategoryConfig>,
    pub pagination: PaginationConfig,
    #[serde(default)]
    pub device_profiles: Vec<DeviceProfile>,
    pub extraction: ExtractionRules,
    #[serde(default)]
    pub delay: DelayRange,
}

impl SourceSiteConfig {
    pub fn category(&self, key: &str) -> Option<&CategoryConfig> {
        self.categories.iter().find(|c| c.key == key)
    }

    /// Configured profiles, or a single desktop profile when none are listed.
    pub fn profiles(&self) -> Vec<DeviceProfile> {
        if self.device_profiles.is_empty() {
            vec![DeviceProfile {
                device: Device::Pc,
                user_agent: DEFAULT_DESKTOP_USER_AGENT.to_string(),
                host: None,
            }]
        } else {
            self.device_profiles.clone()
        }
    }
}

pub const DEFAULT_DESKTOP_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CategoryConfig {
    pub key: String,
    pub display_name: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaginationConfig {
    #[serde(flatten)]
    pub strategy: PaginationStrategy,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaginationStrategy {
    /// `?<param>=<n>`; page `start` is requested without the param when `first_page_bare`.
    Numeric {
        #[serde(default = "default_page_param")]
        param: String,
        #[serde(default = "default_page_start")]
        start: u32,
        #[serde(default = "default_true")]
        first_page_bare: bool,
    },
    /// Next page is discovered from the current one. With `param` unset the token is a
    /// (possibly relative) URL; otherwise it is placed in `?<param>=<token>`.
    Continuation {
        #[serde(default)]
        param: Option<String>,
        token_selector: String,
        #[serde(default = "default_link_attr")]
        token_attr: String,
    },
}

/// Fetch identity for one device view of a source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceProfile {
    pub device: Device,
    pub user_agent: String,
    /// Host serving this view (e.g. a separate mobile host); defaults to the category URL's.
    #[serde(default)]
    pub host: Option<String>,
}

/// Selectors and markers for one source. JSON sources use dotted paths instead of
/// CSS selectors: `item_selector` points at the array, the others are relative to an item.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtractionRules {
    pub item_selector: String,
    pub name_selector: String,
    pub reward_selector: String,
    pub link_selector: String,
    #[serde(default = "default_link_attr")]
    pub link_attr: String,
    #[serde(default)]
    pub device_selector: Option<String>,
    /// Regex with one capture group run against the link, e.g. `/ad_details/(\d+)`.
    #[serde(default)]
    pub source_key_pattern: Option<String>,
    #[serde(default)]
    pub no_results_markers: Vec<String>,
    #[serde(default)]
    pub blocked_markers: Vec<String>,
    #[serde(default)]
    pub name_suffixes: Vec<String>,
    #[serde(default)]
    pub tracking_params: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for DelayRange {
    fn default() -> Self {
        Self {
            min_ms: 1000,
            max_ms: 3000,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_pages() -> u32 {
    50
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_page_start() -> u32 {
    1
}

fn default_link_attr() -> String {
    "href".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn observation(source_key: Option<&str>, reward: NormalizedReward) -> CampaignObservation {
        CampaignObservation {
            source_site: "chobirich".into(),
            source_key: source_key.map(ToString::to_string),
            destination_url: "https://www.chobirich.com/ad_details/1840652/".into(),
            display_name: "楽天カード".into(),
            reward_raw: "最大62,327pt".into(),
            reward_normalized: reward,
            category: "finance".into(),
            device: Device::Pc,
            observed: ObservationOrder::default(),
        }
    }

    #[test]
    fn device_serializes_with_display_names() {
        let json = serde_json::to_string(&[Device::Ios, Device::Android, Device::Pc, Device::Unknown]).unwrap();
        assert_eq!(json, r#"["iOS","Android","PC","Unknown"]"#);
        assert_eq!("iphone".parse::<Device>().unwrap(), Device::Ios);
        assert_eq!("Web".parse::<Device>().unwrap(), Device::Pc);
        assert!("tablet".parse::<Device>().is_err());
    }

    #[test]
    fn canonical_keys_differ_by_device() {
        let a = CanonicalKey::new("moppy", "https://pc.moppy.jp/ad/detail.php?site_id=1", Device::Ios);
        let b = CanonicalKey::new("moppy", "https://pc.moppy.jp/ad/detail.php?site_id=1", Device::Android);
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "moppy|iOS|https://pc.moppy.jp/ad/detail.php?site_id=1");
    }

    #[test]
    fn completeness_counts_filled_fields() {
        let full = observation(Some("1840652"), NormalizedReward::new(62327.0, RewardUnit::Point));
        let sparse = observation(None, NormalizedReward::unknown());
        assert_eq!(full.completeness(), 7);
        assert_eq!(sparse.completeness(), 4);
    }

    #[test]
    fn campaign_tracks_mutable_fields() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap();
        let obs = observation(Some("1840652"), NormalizedReward::new(62327.0, RewardUnit::Point));
        let mut campaign = Campaign::from_observation(&obs, now, Uuid::nil());
        assert!(campaign.active);
        assert_eq!(campaign.revision, 1);
        assert!(campaign.content_matches(&obs));

        let mut changed = obs.clone();
        changed.reward_raw = "最大70,000pt".into();
        changed.reward_normalized = NormalizedReward::new(70000.0, RewardUnit::Point);
        assert!(!campaign.content_matches(&changed));
        campaign.apply_observation(&changed);
        assert!(campaign.content_matches(&changed));
        assert_eq!(campaign.first_seen_at, now);
    }

    #[test]
    fn source_config_parses_with_defaults() {
        let yaml = r#"
name: chobirich
display_name: ちょびリッチ
base_url: https://www.chobirich.com
point_rate: 0.5
categories:
  - key: shop-101
    display_name: 総合通販
    url: https://www.chobirich.com/shopping/shop/101
pagination:
  kind: numeric
extraction:
  item_selector: li.ad-category__ad
  name_selector: a[href*="/ad_details/"]
  reward_selector: .ad-category__ad__pt
  link_selector: a[href*="/ad_details/"]
"#;
        let config: SourceSiteConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.enabled);
        assert_eq!(config.format, SourceFormat::Html);
        assert_eq!(config.pagination.max_pages, 50);
        assert_eq!(
            config.pagination.strategy,
            PaginationStrategy::Numeric {
                param: "page".into(),
                start: 1,
                first_page_bare: true,
            }
        );
        assert_eq!(config.extraction.link_attr, "href");
        assert_eq!(config.delay, DelayRange::default());
        let profiles = config.profiles();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].device, Device::Pc);
        assert!(config.category("shop-101").is_some());
    }
}
