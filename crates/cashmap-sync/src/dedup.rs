//! Intra-pass deduplication. Inter-pass matching against history happens in merge.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use cashmap_core::{CampaignObservation, CanonicalKey};

/// Number of non-empty normalized fields on an observation.
pub fn completeness(observation: &CampaignObservation) -> usize {
    observation.completeness()
}

/// Total order over colliding observations: most complete first, then earliest observed.
/// The trailing content comparison only matters for hand-built inputs that share an
/// observation order.
fn preference(a: &CampaignObservation, b: &CampaignObservation) -> Ordering {
    completeness(b)
        .cmp(&completeness(a))
        .then_with(|| a.observed.cmp(&b.observed))
        .then_with(|| a.display_name.cmp(&b.display_name))
        .then_with(|| a.reward_raw.cmp(&b.reward_raw))
        .then_with(|| a.category.cmp(&b.category))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupOutcome {
    /// One observation per canonical key, sorted by key.
    pub unique: Vec<CampaignObservation>,
    pub collapsed: usize,
}

/// Collapse observations sharing a canonical key. The result does not depend on input
/// order.
pub fn dedup_intra_pass(observations: Vec<CampaignObservation>) -> DedupOutcome {
    let total = observations.len();
    let mut best: BTreeMap<CanonicalKey, CampaignObservation> = BTreeMap::new();
    for observation in observations {
        let key = observation.key();
        match best.get(&key) {
            Some(current) if preference(current, &observation) != Ordering::Greater => {}
            _ => {
                best.insert(key, observation);
            }
        }
    }
    let unique = best.into_values().collect::<Vec<_>>();
    DedupOutcome {
        collapsed: total - unique.len(),
        unique,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cashmap_core::{Device, NormalizedReward, ObservationOrder, RewardUnit};

    fn obs(url: &str, device: Device, page: u32, position: u32) -> CampaignObservation {
        CampaignObservation {
            source_site: "moppy".into(),
            source_key: Some("55".into()),
            destination_url: url.into(),
            display_name: "dカード GOLD".into(),
            reward_raw: "12,000P".into(),
            reward_normalized: NormalizedReward::new(12000.0, RewardUnit::Point),
            category: "card".into(),
            device,
            observed: ObservationOrder {
                unit_index: 0,
                profile_index: 0,
                page,
                position,
            },
        }
    }

    #[test]
    fn most_complete_observation_wins() {
        let mut sparse = obs("https://pc.moppy.jp/ad/55", Device::Pc, 1, 0);
        sparse.source_key = None;
        sparse.reward_normalized = NormalizedReward::unknown();
        let full = obs("https://pc.moppy.jp/ad/55", Device::Pc, 2, 4);

        let out = dedup_intra_pass(vec![sparse, full.clone()]);
        assert_eq!(out.unique, vec![full]);
        assert_eq!(out.collapsed, 1);
    }

    #[test]
    fn ties_keep_the_earliest_observation() {
        let first = obs("https://pc.moppy.jp/ad/55", Device::Pc, 1, 3);
        let mut later = obs("https://pc.moppy.jp/ad/55", Device::Pc, 2, 0);
        later.display_name = "dカード GOLD（再掲）".into();

        let out = dedup_intra_pass(vec![later.clone(), first.clone()]);
        assert_eq!(out.unique, vec![first.clone()]);
        let reversed = dedup_intra_pass(vec![first.clone(), later]);
        assert_eq!(reversed.unique, vec![first]);
    }

    #[test]
    fn devices_are_independent() {
        let ios = obs("https://pc.moppy.jp/ad/55", Device::Ios, 1, 0);
        let android = obs("https://pc.moppy.jp/ad/55", Device::Android, 1, 1);
        let out = dedup_intra_pass(vec![ios, android]);
        assert_eq!(out.unique.len(), 2);
        assert_eq!(out.collapsed, 0);
    }

    #[test]
    fn output_order_is_independent_of_input_order() {
        let a = obs("https://pc.moppy.jp/ad/1", Device::Pc, 1, 0);
        let b = obs("https://pc.moppy.jp/ad/2", Device::Pc, 1, 1);
        let c = obs("https://pc.moppy.jp/ad/1", Device::Pc, 3, 0);
        let forward = dedup_intra_pass(vec![a.clone(), b.clone(), c.clone()]);
        let backward = dedup_intra_pass(vec![c, b, a]);
        assert_eq!(forward, backward);
        assert_eq!(forward.unique.len(), 2);
    }
}
