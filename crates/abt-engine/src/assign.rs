use std::fmt;
use std::sync::{Arc, Mutex};

use abt_core::{
    hashed_variant, AbtError, Assignment, BucketDelta, BucketKey, Clock, ConversionOutcome,
    ExperimentId, HourlyLog, RngHandle, Variant,
};
use abt_store::Store;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::{AssignmentConfig, AssignmentStrategyKind};

/// Picks the variant proposed to a visitor who has no assignment yet.
#[derive(Debug)]
pub enum AssignmentStrategy {
    Hashed { seed: u64 },
    Random { rng: Mutex<RngHandle> },
}

impl AssignmentStrategy {
    pub fn from_config(config: &AssignmentConfig) -> Self {
        match config.strategy {
            AssignmentStrategyKind::Hashed => AssignmentStrategy::Hashed { seed: config.seed },
            AssignmentStrategyKind::Random => AssignmentStrategy::Random {
                rng: Mutex::new(RngHandle::from_seed(config.seed)),
            },
        }
    }

    fn propose(&self, experiment: ExperimentId, visitor_key: &str) -> Variant {
        match self {
            AssignmentStrategy::Hashed { seed } => hashed_variant(*seed, experiment, visitor_key),
            AssignmentStrategy::Random { rng } => rng
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .coin_flip(),
        }
    }
}

/// Routes visitor events into hourly buckets.
///
/// Every write goes through a single store call, which rejects it unless the
/// experiment is running.
pub struct ParticipantAssigner {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    strategy: AssignmentStrategy,
}

impl fmt::Debug for ParticipantAssigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticipantAssigner")
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl ParticipantAssigner {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, strategy: AssignmentStrategy) -> Self {
        Self {
            store,
            clock,
            strategy,
        }
    }

    /// Returns the visitor's variant, assigning one on first contact.
    ///
    /// Does not count a participant; see [`ParticipantAssigner::participate`].
    pub fn assign_variant(
        &self,
        experiment: ExperimentId,
        visitor_key: &str,
    ) -> Result<Variant, AbtError> {
        let proposed = self.strategy.propose(experiment, visitor_key);
        let assignment =
            self.store
                .assign_visitor(experiment, visitor_key, proposed, false, self.clock.now())?;
        Ok(assignment.variant)
    }

    /// Counts one new participant in the bucket containing `at`.
    pub fn record_participant(
        &self,
        experiment: ExperimentId,
        variant: Variant,
        at: DateTime<Utc>,
    ) -> Result<HourlyLog, AbtError> {
        let log = self.store.increment(
            &BucketKey::at(experiment, variant, at),
            BucketDelta::PARTICIPANT,
        )?;
        debug!(experiment = %experiment, %variant, participants = log.participants, "participant recorded");
        Ok(log)
    }

    /// Counts one conversion in the bucket containing `at`.
    pub fn record_conversion(
        &self,
        experiment: ExperimentId,
        variant: Variant,
        at: DateTime<Utc>,
    ) -> Result<HourlyLog, AbtError> {
        let log = self.store.increment(
            &BucketKey::at(experiment, variant, at),
            BucketDelta::CONVERSION,
        )?;
        debug!(experiment = %experiment, %variant, conversions = log.conversions, "conversion recorded");
        Ok(log)
    }

    /// Assigns the visitor and counts them as a participant the first time.
    pub fn participate(
        &self,
        experiment: ExperimentId,
        visitor_key: &str,
        at: DateTime<Utc>,
    ) -> Result<Assignment, AbtError> {
        let proposed = self.strategy.propose(experiment, visitor_key);
        let assignment = self
            .store
            .assign_visitor(experiment, visitor_key, proposed, true, at)?;
        if assignment.is_new {
            debug!(experiment = %experiment, variant = %assignment.variant, "new participant");
        }
        Ok(assignment)
    }

    /// Counts the visitor's first conversion against their assigned variant.
    pub fn convert(
        &self,
        experiment: ExperimentId,
        visitor_key: &str,
        at: DateTime<Utc>,
    ) -> Result<ConversionOutcome, AbtError> {
        let outcome = self.store.convert_visitor(experiment, visitor_key, at)?;
        debug!(experiment = %experiment, ?outcome, "conversion requested");
        Ok(outcome)
    }
}
