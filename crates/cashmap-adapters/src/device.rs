use cashmap_core::{Device, RawCampaign};

use crate::normalize::fold_width;

const IOS_KEYWORDS: &[&str] = &["ios", "iphone", "ipad", "app store", "appstore"];
const ANDROID_KEYWORDS: &[&str] = &["android", "アンドロイド", "google play", "googleplay", "プレイストア"];
const PC_KEYWORDS: &[&str] = &["pc限定", "pc専用", "パソコン限定", "パソコン専用", "desktop only"];

/// Device named by a piece of text, if exactly one is named. Text mentioning both iOS
/// and Android (a cross-platform app) carries no signal.
pub fn device_signal(text: &str) -> Option<Device> {
    let lowered = fold_width(text).to_lowercase();
    let has = |keywords: &[&str]| keywords.iter().any(|k| contains_word(&lowered, k));
    match (has(IOS_KEYWORDS), has(ANDROID_KEYWORDS), has(PC_KEYWORDS)) {
        (true, false, false) => Some(Device::Ios),
        (false, true, false) => Some(Device::Android),
        (false, false, true) => Some(Device::Pc),
        _ => None,
    }
}

/// Substring match that refuses to start or end inside an ASCII word ("studios" is not iOS).
fn contains_word(haystack: &str, keyword: &str) -> bool {
    haystack.match_indices(keyword).any(|(idx, _)| {
        let before = haystack[..idx].chars().next_back();
        let after = haystack[idx + keyword.len()..].chars().next();
        !before.is_some_and(|c| c.is_ascii_alphanumeric())
            && !after.is_some_and(|c| c.is_ascii_alphanumeric())
    })
}

/// Assigns the device tag used in the canonical key. Precedence: the record's own
/// device element, then an OS named in its title, then the fetching profile.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceClassifier;

impl DeviceClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, raw: &RawCampaign) -> Device {
        raw.device_hint
            .as_deref()
            .and_then(device_signal)
            .or_else(|| device_signal(&raw.name_raw))
            .unwrap_or(raw.profile_device)
    }
}
