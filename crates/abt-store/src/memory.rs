//! In-process backend guarded by a single mutex.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use abt_core::{
    AbtError, Assignment, BucketDelta, BucketKey, ConversionOutcome, Experiment, ExperimentFilter,
    ExperimentId, HourlyLog, NewExperiment, PageId, Status, Variant,
};
use chrono::{DateTime, Utc};

use crate::{
    lock_poisoned, report_order, stale_transition, BucketStore, ExperimentStore, VisitorStore,
};

#[derive(Debug, Clone, Copy)]
struct VisitorRecord {
    variant: Variant,
    counted: bool,
    converted: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    experiments: BTreeMap<ExperimentId, Experiment>,
    buckets: BTreeMap<BucketKey, HourlyLog>,
    visitors: HashMap<(ExperimentId, String), VisitorRecord>,
}

impl MemoryState {
    fn running(&self, id: ExperimentId) -> Result<&Experiment, AbtError> {
        let experiment = self
            .experiments
            .get(&id)
            .ok_or_else(|| AbtError::experiment_not_found(id))?;
        if experiment.status != Status::Running {
            return Err(AbtError::not_active(id, experiment.status));
        }
        Ok(experiment)
    }

    fn active_on_page(&self, page: PageId, except: Option<ExperimentId>) -> Option<&Experiment> {
        self.experiments
            .values()
            .find(|e| e.page == page && e.status.is_active() && Some(e.id) != except)
    }

    fn bump(&mut self, key: &BucketKey, delta: BucketDelta) -> HourlyLog {
        let log = self.buckets.entry(*key).or_insert(HourlyLog {
            key: *key,
            participants: 0,
            conversions: 0,
        });
        log.participants += delta.participants;
        log.conversions += delta.conversions;
        *log
    }
}

/// Store that keeps everything in memory.
///
/// Suitable for tests and single-process deployments; all operations
/// serialize on one lock, which trivially satisfies the atomicity rules.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, AbtError> {
        self.state.lock().map_err(|_| lock_poisoned())
    }
}

impl ExperimentStore for MemoryStore {
    fn create_experiment(
        &self,
        page: PageId,
        new: &NewExperiment,
        now: DateTime<Utc>,
    ) -> Result<Experiment, AbtError> {
        if new.sample_size > NewExperiment::MAX_SAMPLE_SIZE {
            return Err(AbtError::sample_size_too_large(new.sample_size));
        }
        let mut state = self.lock()?;
        if let Some(existing) = state.active_on_page(page, None) {
            return Err(AbtError::duplicate_active(page, existing.id));
        }
        state.next_id += 1;
        let experiment = Experiment {
            id: ExperimentId::from_raw(state.next_id),
            page,
            name: new.name.clone(),
            hypothesis: new.hypothesis.clone(),
            goal: new.goal.clone(),
            treatment_revision: new.treatment_revision,
            sample_size: new.sample_size,
            status: Status::Draft,
            outcome: None,
            created_at: now,
            first_started_at: None,
            last_started_at: None,
            finished_at: None,
            winning_variant: None,
        };
        state.experiments.insert(experiment.id, experiment.clone());
        Ok(experiment)
    }

    fn experiment(&self, id: ExperimentId) -> Result<Experiment, AbtError> {
        self.lock()?
            .experiments
            .get(&id)
            .cloned()
            .ok_or_else(|| AbtError::experiment_not_found(id))
    }

    fn list_experiments(&self, filter: &ExperimentFilter) -> Result<Vec<Experiment>, AbtError> {
        let state = self.lock()?;
        let mut experiments: Vec<Experiment> = state
            .experiments
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        experiments.sort_by(report_order);
        Ok(experiments)
    }

    fn active_for_page(&self, page: PageId) -> Result<Option<Experiment>, AbtError> {
        Ok(self.lock()?.active_on_page(page, None).cloned())
    }

    fn commit_transition(&self, expected: Status, updated: &Experiment) -> Result<(), AbtError> {
        let mut state = self.lock()?;
        let current = state
            .experiments
            .get(&updated.id)
            .ok_or_else(|| AbtError::experiment_not_found(updated.id))?;
        if current.status != expected {
            return Err(stale_transition(current, expected));
        }
        if updated.status == Status::Running {
            if let Some(other) = state.active_on_page(updated.page, Some(updated.id)) {
                return Err(AbtError::duplicate_active(updated.page, other.id));
            }
        }
        state.experiments.insert(updated.id, updated.clone());
        Ok(())
    }

    fn delete_experiment(&self, id: ExperimentId) -> Result<(), AbtError> {
        let mut state = self.lock()?;
        if state.experiments.remove(&id).is_none() {
            return Err(AbtError::experiment_not_found(id));
        }
        state.buckets.retain(|key, _| key.experiment != id);
        state.visitors.retain(|(experiment, _), _| *experiment != id);
        Ok(())
    }
}

impl BucketStore for MemoryStore {
    fn increment(&self, key: &BucketKey, delta: BucketDelta) -> Result<HourlyLog, AbtError> {
        let mut state = self.lock()?;
        state.running(key.experiment)?;
        Ok(state.bump(key, delta))
    }

    fn hourly_logs(&self, experiment: ExperimentId) -> Result<Vec<HourlyLog>, AbtError> {
        let state = self.lock()?;
        // BucketKey orders by (experiment, date, hour, variant).
        Ok(state
            .buckets
            .values()
            .filter(|log| log.key.experiment == experiment)
            .copied()
            .collect())
    }
}

impl VisitorStore for MemoryStore {
    fn assignment(
        &self,
        experiment: ExperimentId,
        visitor_key: &str,
    ) -> Result<Option<Variant>, AbtError> {
        let state = self.lock()?;
        Ok(state
            .visitors
            .get(&(experiment, visitor_key.to_string()))
            .map(|record| record.variant))
    }

    fn assign_visitor(
        &self,
        experiment: ExperimentId,
        visitor_key: &str,
        proposed: Variant,
        count_participant: bool,
        at: DateTime<Utc>,
    ) -> Result<Assignment, AbtError> {
        let mut state = self.lock()?;
        state.running(experiment)?;
        let slot = (experiment, visitor_key.to_string());
        let (variant, is_new) = match state.visitors.get_mut(&slot) {
            Some(record) if count_participant && !record.counted => {
                record.counted = true;
                (record.variant, true)
            }
            Some(record) => {
                return Ok(Assignment {
                    variant: record.variant,
                    is_new: false,
                })
            }
            None => {
                state.visitors.insert(
                    slot,
                    VisitorRecord {
                        variant: proposed,
                        counted: count_participant,
                        converted: false,
                    },
                );
                (proposed, true)
            }
        };
        if count_participant {
            state.bump(
                &BucketKey::at(experiment, variant, at),
                BucketDelta::PARTICIPANT,
            );
        }
        Ok(Assignment { variant, is_new })
    }

    fn convert_visitor(
        &self,
        experiment: ExperimentId,
        visitor_key: &str,
        at: DateTime<Utc>,
    ) -> Result<ConversionOutcome, AbtError> {
        let mut state = self.lock()?;
        state.running(experiment)?;
        let slot = (experiment, visitor_key.to_string());
        let variant = match state.visitors.get_mut(&slot) {
            None => return Ok(ConversionOutcome::NotAssigned),
            Some(record) if record.converted => {
                return Ok(ConversionOutcome::AlreadyConverted(record.variant))
            }
            Some(record) => {
                record.converted = true;
                record.variant
            }
        };
        state.bump(&BucketKey::at(experiment, variant, at), BucketDelta::CONVERSION);
        Ok(ConversionOutcome::Recorded(variant))
    }
}
