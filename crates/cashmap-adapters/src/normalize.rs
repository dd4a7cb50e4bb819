//! Reward text parsing, URL canonicalization and display-name cleanup.
//!
//! Reward strings are evaluated against one ordered rule table, top to bottom, first
//! match wins:
//!
//! | # | rule      | shape                                       | amount             |
//! |---|-----------|---------------------------------------------|--------------------|
//! | 1 | `up_to`   | `最大` / `up to` / `max` + number(s) + unit | largest number     |
//! | 2 | `plain`   | number + yen/point token, or `¥` number     | the number         |
//! | 3 | `percent` | number + `%`                                | the number         |
//!
//! An `up_to` match takes the unit written directly after its last number (or a `¥`
//! before its first). For the other rules the unit is the token nearest to the matched
//! number; when a prefix and a suffix token are equally close the suffix wins. Numbers
//! may carry thousands separators. Text matching no rule is `unknown` and is still
//! retained.
//!
//! Before evaluation, full-width ASCII and the ideographic space are folded to ASCII,
//! and boosted offers written as `old→new` keep only the text after the last arrow.

use cashmap_core::{
    CampaignObservation, NormalizedReward, RawCampaign, RewardUnit, SourceSiteConfig,
};
use regex::Regex;
use thiserror::Error;
use url::Url;

use crate::device::DeviceClassifier;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("reward text matched no rule: {text:?}")]
    ParseAmbiguity { text: String },
    #[error("unusable link {href:?}: {message}")]
    InvalidUrl { href: String, message: String },
}

const NUMBER: &str = r"(\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?)";
const YEN_OR_POINT: &str = r"(?:円|(?i:yen|jpy|ポイント|points?|pts?)|P)";
const UNIT_TOKENS: &str = r"円|(?i:yen|jpy|ポイント|points?|pts?)|¥|%|P";

/// Query parameters dropped from every destination URL, plus any `utm_*` key.
pub const BUILTIN_TRACKING_PARAMS: &[&str] = &[
    "gclid", "fbclid", "yclid", "msclkid", "dclid", "_ga", "_gl", "mc_cid", "mc_eid",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    UpTo,
    Plain,
    Percent,
}

#[derive(Debug, Clone)]
pub struct RewardRule {
    pub name: &'static str,
    pub kind: RuleKind,
    pattern: Regex,
}

#[derive(Debug, Clone)]
pub struct RewardRuleTable {
    rules: Vec<RewardRule>,
    unit_tokens: Regex,
}

#[derive(Debug, Clone, Copy)]
struct UnitToken {
    start: usize,
    end: usize,
    unit: RewardUnit,
}

impl RewardRuleTable {
    pub fn standard() -> Self {
        let rule = |name, kind, pattern: String| RewardRule {
            name,
            kind,
            pattern: Regex::new(&pattern).expect("built-in reward pattern compiles"),
        };
        let rules = vec![
            rule(
                "up_to",
                RuleKind::UpTo,
                format!(
                    r"(?i:最大|up\s*to|max(?:imum)?\.?)\s*[:：]?\s*(?P<prefix>¥)?\s*(?P<low>{NUMBER})(?:\s*(?:[A-Za-z%円ポイント]+)?\s*[~〜\-–]\s*¥?\s*(?P<high>{NUMBER}))?\s*(?P<unit>{UNIT_TOKENS})?"
                ),
            ),
            rule(
                "plain",
                RuleKind::Plain,
                format!(r"{NUMBER}\s*{YEN_OR_POINT}|¥\s*{NUMBER}"),
            ),
            rule("percent", RuleKind::Percent, format!(r"{NUMBER}\s*%")),
        ];
        Self {
            rules,
            unit_tokens: Regex::new(UNIT_TOKENS).expect("built-in unit pattern compiles"),
        }
    }

    pub fn rules(&self) -> &[RewardRule] {
        &self.rules
    }

    /// Strict parse. `Err(ParseAmbiguity)` when no rule produces an amount and unit.
    pub fn parse(&self, text: &str) -> Result<NormalizedReward, NormalizeError> {
        let prepared = prepare_reward_text(text);
        for rule in &self.rules {
            if let Some(reward) = self.apply(rule, &prepared) {
                return Ok(reward);
            }
        }
        Err(NormalizeError::ParseAmbiguity {
            text: text.trim().to_string(),
        })
    }

    /// Lenient parse: unmatched text becomes `unknown` rather than an error.
    pub fn normalize(&self, text: &str) -> NormalizedReward {
        self.parse(text).unwrap_or_else(|_| NormalizedReward::unknown())
    }

    fn apply(&self, rule: &RewardRule, text: &str) -> Option<NormalizedReward> {
        let caps = rule.pattern.captures(text)?;
        if rule.kind == RuleKind::UpTo {
            return Self::apply_up_to(&caps, text);
        }
        let anchor = caps.iter().skip(1).flatten().last()?;
        let amount = parse_number(anchor.as_str())?;
        let allowed: &[RewardUnit] = match rule.kind {
            RuleKind::Percent => &[RewardUnit::Percent],
            _ => &[RewardUnit::Yen, RewardUnit::Point],
        };
        let unit = self.nearest_unit(text, anchor.start(), anchor.end(), allowed)?;
        Some(NormalizedReward::new(amount, unit))
    }

    /// The unit must sit right after the last number, or be a `¥` right before the first.
    /// "最大10倍" or "最大3回" is a multiplier or a count, not a reward amount.
    fn apply_up_to(caps: &regex::Captures<'_>, text: &str) -> Option<NormalizedReward> {
        let amount = ["low", "high"]
            .into_iter()
            .filter_map(|group| caps.name(group))
            .filter_map(|m| parse_number(m.as_str()))
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))?;
        let suffix = caps
            .name("unit")
            .filter(|m| !text[m.end()..].starts_with(|c: char| c.is_ascii_alphabetic()));
        let unit = suffix
            .or_else(|| caps.name("prefix"))
            .and_then(|m| unit_for_token(m.as_str()))?;
        Some(NormalizedReward::new(amount, unit))
    }

    fn tokens(&self, text: &str) -> Vec<UnitToken> {
        self.unit_tokens
            .find_iter(text)
            .filter_map(|m| {
                let token = m.as_str();
                // Bare "P" only counts directly after a number ("500P"), never inside words.
                if token == "P" && !text[..m.start()].trim_end().ends_with(|c: char| c.is_ascii_digit())
                {
                    return None;
                }
                if token.ends_with(|c: char| c.is_ascii_alphabetic())
                    && text[m.end()..].starts_with(|c: char| c.is_ascii_alphabetic())
                {
                    return None;
                }
                Some(UnitToken {
                    start: m.start(),
                    end: m.end(),
                    unit: unit_for_token(token)?,
                })
            })
            .collect()
    }

    fn nearest_unit(
        &self,
        text: &str,
        num_start: usize,
        num_end: usize,
        allowed: &[RewardUnit],
    ) -> Option<RewardUnit> {
        // (distance in chars, prefix flag) so that a suffix wins ties.
        let mut best: Option<((usize, bool), RewardUnit)> = None;
        for token in self.tokens(text) {
            if !allowed.contains(&token.unit) {
                continue;
            }
            let rank = if token.start >= num_end {
                (text[num_end..token.start].chars().count(), false)
            } else if token.end <= num_start {
                (text[token.end..num_start].chars().count(), true)
            } else {
                continue;
            };
            if best.is_none_or(|(current, _)| rank < current) {
                best = Some((rank, token.unit));
            }
        }
        best.map(|(_, unit)| unit)
    }
}

impl Default for RewardRuleTable {
    fn default() -> Self {
        Self::standard()
    }
}

fn unit_for_token(token: &str) -> Option<RewardUnit> {
    match token.to_lowercase().as_str() {
        "円" | "yen" | "jpy" | "¥" => Some(RewardUnit::Yen),
        "ポイント" | "point" | "points" | "pt" | "pts" | "p" => Some(RewardUnit::Point),
        "%" => Some(RewardUnit::Percent),
        _ => None,
    }
}

fn parse_number(text: &str) -> Option<f64> {
    text.replace(',', "").parse::<f64>().ok()
}

/// Fold full-width ASCII (U+FF01..U+FF5E), the full-width yen sign and the ideographic
/// space to their ASCII / Latin-1 counterparts.
pub fn fold_width(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{3000}' => ' ',
            '\u{FFE5}' => '¥',
            '\u{FF5E}' => '~',
            '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
            other => other,
        })
        .collect()
}

fn prepare_reward_text(text: &str) -> String {
    let folded = fold_width(text);
    let current = match folded.rfind(['→', '⇒']) {
        Some(idx) => {
            let arrow_len = folded[idx..].chars().next().map_or(0, char::len_utf8);
            let tail = folded[idx + arrow_len..].trim();
            if tail.is_empty() {
                folded.as_str()
            } else {
                tail
            }
        }
        None => folded.as_str(),
    };
    current.trim().to_string()
}

/// Resolve `href` against `base`, drop the fragment and strip tracking parameters.
pub fn canonicalize_url(
    href: &str,
    base: &str,
    extra_tracking: &[String],
) -> Result<String, NormalizeError> {
    let invalid = |message: String| NormalizeError::InvalidUrl {
        href: href.to_string(),
        message,
    };
    let href = href.trim();
    if href.is_empty() {
        return Err(invalid("empty link".to_string()));
    }
    let base = Url::parse(base).map_err(|e| invalid(format!("bad base url: {e}")))?;
    let mut url = base.join(href).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    url.set_fragment(None);

    let is_tracking = |key: &str| {
        let key = key.to_ascii_lowercase();
        key.starts_with("utm_")
            || BUILTIN_TRACKING_PARAMS.contains(&key.as_str())
            || extra_tracking.iter().any(|p| p.eq_ignore_ascii_case(&key))
    };
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    Ok(url.to_string())
}

/// Collapse whitespace and strip configured boilerplate suffixes (repeatedly).
pub fn clean_display_name(raw: &str, suffixes: &[String]) -> String {
    let mut name = fold_width(raw)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    loop {
        let before = name.len();
        for suffix in suffixes.iter().filter(|s| !s.trim().is_empty()) {
            if let Some(stripped) = name.strip_suffix(suffix.trim()) {
                name = stripped.trim_end().to_string();
            }
        }
        if name.len() == before {
            break;
        }
    }
    name
}

/// Output of [`normalize_observation`]; `ambiguity` is set when the reward text matched
/// no rule and the observation carries `unit = unknown`.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub observation: CampaignObservation,
    pub ambiguity: Option<NormalizeError>,
}

pub fn normalize_observation(
    raw: &RawCampaign,
    source: &SourceSiteConfig,
    rules: &RewardRuleTable,
    classifier: &DeviceClassifier,
) -> Result<Normalized, NormalizeError> {
    let base = if raw.page_url.is_empty() {
        source.base_url.as_str()
    } else {
        raw.page_url.as_str()
    };
    let destination_url = canonicalize_url(&raw.href_raw, base, &source.extraction.tracking_params)?;
    let display_name = clean_display_name(&raw.name_raw, &source.extraction.name_suffixes);
    let reward_raw = raw.reward_raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let (reward_normalized, ambiguity) = match rules.parse(&reward_raw) {
        Ok(reward) => (reward, None),
        Err(err) => (NormalizedReward::unknown(), Some(err)),
    };

    Ok(Normalized {
        observation: CampaignObservation {
            source_site: raw.source_site.clone(),
            source_key: raw.source_key.clone().filter(|k| !k.is_empty()),
            destination_url,
            display_name,
            reward_raw,
            reward_normalized,
            category: raw.category.clone(),
            device: classifier.classify(raw),
            observed: raw.observed,
        },
        ambiguity,
    })
}
