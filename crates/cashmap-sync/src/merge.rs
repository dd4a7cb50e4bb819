//! Three-way merge of the run's unique observations against the persisted store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cashmap_core::{Campaign, CampaignObservation, CanonicalKey};
use cashmap_storage::{CampaignRepository, StoreError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// `(sourceSite, category)` of a crawl unit.
pub type Scope = (String, String);

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("merge conflict on {key}: {reason}")]
    Conflict { key: String, reason: String },
    #[error("store failure during merge: {0}")]
    Store(#[source] StoreError),
}

impl From<StoreError> for MergeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RevisionConflict {
                key,
                expected,
                found,
            } => MergeError::Conflict {
                key,
                reason: format!("revision {found} written where {expected} was expected"),
            },
            StoreError::NotActive { key } => MergeError::Conflict {
                key,
                reason: "record vanished before deactivation".to_string(),
            },
            other => MergeError::Store(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MergePolicy {
    pub miss_threshold: u32,
    /// Unchanged records are rewritten only once their `last_seen_at` is this old.
    pub touch_interval: ChronoDuration,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            miss_threshold: 3,
            touch_interval: ChronoDuration::hours(24),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeAction {
    Insert(Campaign),
    Update(Campaign),
    Reactivate(Campaign),
    /// Absent this run; miss streak incremented but still below the threshold.
    Miss(Campaign),
    /// Absent and the incremented streak reached the threshold.
    Deactivate(Campaign),
}

impl MergeAction {
    pub fn record(&self) -> &Campaign {
        match self {
            MergeAction::Insert(c)
            | MergeAction::Update(c)
            | MergeAction::Reactivate(c)
            | MergeAction::Miss(c)
            | MergeAction::Deactivate(c) => c,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    pub actions: Vec<MergeAction>,
    pub unchanged: usize,
    /// Active records absent from a unit that did not complete; left untouched.
    pub out_of_scope: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub inserted: usize,
    pub updated: usize,
    pub reactivated: usize,
    pub miss_incremented: usize,
    pub deactivated: usize,
    pub unchanged: usize,
    pub out_of_scope: usize,
    pub writes: usize,
}

fn touched(mut record: Campaign, now: DateTime<Utc>, run_id: Uuid) -> Campaign {
    record.revision += 1;
    record.last_merge_run = Some(run_id);
    record.last_seen_at = now;
    record
}

/// Decide every store mutation for a run without performing any.
pub fn plan_merge(
    new_set: &[CampaignObservation],
    stored: &[Campaign],
    complete_scopes: &BTreeSet<Scope>,
    policy: &MergePolicy,
    now: DateTime<Utc>,
    run_id: Uuid,
) -> Result<MergePlan, MergeError> {
    let mut incoming: BTreeMap<CanonicalKey, &CampaignObservation> = BTreeMap::new();
    for observation in new_set {
        if incoming.insert(observation.key(), observation).is_some() {
            return Err(MergeError::Conflict {
                key: observation.key().to_string(),
                reason: "key occurs twice in the consolidated new set".to_string(),
            });
        }
    }
    let existing: BTreeMap<CanonicalKey, &Campaign> = stored.iter().map(|c| (c.key(), c)).collect();

    let mut plan = MergePlan::default();
    for (key, observation) in &incoming {
        let Some(current) = existing.get(key) else {
            plan.actions
                .push(MergeAction::Insert(Campaign::from_observation(observation, now, run_id)));
            continue;
        };

        if !current.active {
            let mut record = (*current).clone();
            record.apply_observation(observation);
            record.active = true;
            record.miss_streak = 0;
            plan.actions.push(MergeAction::Reactivate(touched(record, now, run_id)));
            continue;
        }

        let changed = !current.content_matches(observation) || current.miss_streak != 0;
        let stale = now - current.last_seen_at >= policy.touch_interval;
        if changed || stale {
            let mut record = (*current).clone();
            record.apply_observation(observation);
            record.miss_streak = 0;
            plan.actions.push(MergeAction::Update(touched(record, now, run_id)));
        } else {
            plan.unchanged += 1;
        }
    }

    for (key, current) in &existing {
        if !current.active || incoming.contains_key(key) {
            continue;
        }
        let scope = (current.source_site.clone(), current.category.clone());
        if !complete_scopes.contains(&scope) {
            plan.out_of_scope += 1;
            continue;
        }
        if current.last_merge_run == Some(run_id) {
            // Already counted by an earlier merge of this run.
            plan.unchanged += 1;
            continue;
        }
        let mut record = (*current).clone();
        record.miss_streak += 1;
        record.revision += 1;
        record.last_merge_run = Some(run_id);
        if record.miss_streak >= policy.miss_threshold {
            plan.actions.push(MergeAction::Deactivate(record));
        } else {
            plan.actions.push(MergeAction::Miss(record));
        }
    }

    Ok(plan)
}

/// Sole writer of the store during a run.
pub struct MergeEngine {
    repository: Arc<dyn CampaignRepository>,
    policy: MergePolicy,
}

impl MergeEngine {
    pub fn new(repository: Arc<dyn CampaignRepository>, policy: MergePolicy) -> Self {
        Self { repository, policy }
    }

    pub fn policy(&self) -> &MergePolicy {
        &self.policy
    }

    /// Plan against the store's full contents, apply, then flush. A conflict aborts the
    /// merge and leaves the store as it was.
    pub async fn merge(
        &self,
        new_set: &[CampaignObservation],
        complete_scopes: &BTreeSet<Scope>,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<MergeSummary, MergeError> {
        let stored = self.repository.list_all().await?;
        let plan = plan_merge(new_set, &stored, complete_scopes, &self.policy, now, run_id)?;
        self.apply(&plan).await
    }

    /// Commit every action of `plan` as one repository batch.
    pub async fn apply(&self, plan: &MergePlan) -> Result<MergeSummary, MergeError> {
        let mut summary = MergeSummary {
            unchanged: plan.unchanged,
            out_of_scope: plan.out_of_scope,
            ..MergeSummary::default()
        };
        let mut writes = Vec::with_capacity(plan.actions.len());
        let mut deactivations = Vec::new();
        for action in &plan.actions {
            writes.push(action.record().clone());
            match action {
                MergeAction::Insert(_) => summary.inserted += 1,
                MergeAction::Update(_) => summary.updated += 1,
                MergeAction::Reactivate(_) => summary.reactivated += 1,
                MergeAction::Miss(_) => summary.miss_incremented += 1,
                MergeAction::Deactivate(record) => {
                    summary.miss_incremented += 1;
                    summary.deactivated += 1;
                    deactivations.push(record.key());
                }
            }
        }

        if let Err(err) = self.repository.apply_batch(&writes, &deactivations).await {
            warn!(error = %err, "merge batch rejected; store unchanged");
            return Err(err.into());
        }
        summary.writes = writes.len() + deactivations.len();
        for key in &deactivations {
            debug!(%key, "deactivated campaign");
        }
        self.repository.flush().await?;

        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            reactivated = summary.reactivated,
            deactivated = summary.deactivated,
            unchanged = summary.unchanged,
            writes = summary.writes,
            "merge applied"
        );
        Ok(summary)
    }
}
