//! Persistence for experiments, hourly buckets and visitor assignments.
//!
//! Every mutating operation is a single critical section at the storage
//! boundary: bucket increments are upserts, lifecycle changes are
//! compare-and-swap commits guarded by the one-active-experiment-per-page
//! rule, and visitor bookkeeping is written together with its bucket.

pub mod memory;
pub mod schema;
pub mod sqlite;

use std::cmp::Ordering;

use abt_core::{
    AbtError, Assignment, BucketDelta, BucketKey, ConversionOutcome, ErrorInfo, Experiment,
    ExperimentFilter, ExperimentId, HourlyLog, NewExperiment, PageId, Status, Variant,
    VariantTotals,
};
use chrono::{DateTime, Utc};

pub use memory::MemoryStore;
pub use schema::{init_schema, SCHEMA_VERSION};
pub use sqlite::SqliteStore;

/// Experiment metadata persistence.
pub trait ExperimentStore: Send + Sync {
    /// Inserts a draft experiment for `page`.
    ///
    /// Fails with [`AbtError::DuplicateActiveExperiment`] when the page
    /// already has a draft, running or paused experiment.
    fn create_experiment(
        &self,
        page: PageId,
        new: &NewExperiment,
        now: DateTime<Utc>,
    ) -> Result<Experiment, AbtError>;

    /// Loads a single experiment.
    fn experiment(&self, id: ExperimentId) -> Result<Experiment, AbtError>;

    /// Lists experiments in report order (see [`report_order`]).
    fn list_experiments(&self, filter: &ExperimentFilter) -> Result<Vec<Experiment>, AbtError>;

    /// The page's draft, running or paused experiment, if any.
    fn active_for_page(&self, page: PageId) -> Result<Option<Experiment>, AbtError>;

    /// Persists a lifecycle change computed from a previously loaded record.
    ///
    /// The write only happens if the stored status still equals `expected`;
    /// otherwise [`AbtError::InvalidTransition`] is returned. When `updated`
    /// enters running, no other experiment on the page may be active.
    fn commit_transition(&self, expected: Status, updated: &Experiment) -> Result<(), AbtError>;

    /// Deletes an experiment together with its buckets and assignments.
    fn delete_experiment(&self, id: ExperimentId) -> Result<(), AbtError>;
}

/// Hourly bucket aggregation.
pub trait BucketStore: Send + Sync {
    /// Adds `delta` to the bucket at `key`, creating it if absent.
    ///
    /// Only accepted while the owning experiment is running.
    fn increment(&self, key: &BucketKey, delta: BucketDelta) -> Result<HourlyLog, AbtError>;

    /// All buckets of an experiment ordered by date, hour and variant.
    fn hourly_logs(&self, experiment: ExperimentId) -> Result<Vec<HourlyLog>, AbtError>;

    /// Totals per variant over all buckets.
    fn totals(&self, experiment: ExperimentId) -> Result<VariantTotals, AbtError> {
        Ok(VariantTotals::from_logs(&self.hourly_logs(experiment)?))
    }
}

/// Per-visitor assignment bookkeeping.
pub trait VisitorStore: Send + Sync {
    /// The visitor's assigned variant, if any.
    fn assignment(
        &self,
        experiment: ExperimentId,
        visitor_key: &str,
    ) -> Result<Option<Variant>, AbtError>;

    /// Returns the visitor's existing assignment or stores `proposed`.
    ///
    /// With `count_participant` set, the participant bucket for `at` is
    /// incremented in the same critical section the first time the visitor
    /// is counted, even when an uncounted assignment already exists. Only
    /// accepted while the experiment is running.
    fn assign_visitor(
        &self,
        experiment: ExperimentId,
        visitor_key: &str,
        proposed: Variant,
        count_participant: bool,
        at: DateTime<Utc>,
    ) -> Result<Assignment, AbtError>;

    /// Counts the visitor's first conversion against their variant.
    fn convert_visitor(
        &self,
        experiment: ExperimentId,
        visitor_key: &str,
        at: DateTime<Utc>,
    ) -> Result<ConversionOutcome, AbtError>;
}

/// Everything the engine needs from a backend.
pub trait Store: ExperimentStore + BucketStore + VisitorStore {}

impl<T> Store for T where T: ExperimentStore + BucketStore + VisitorStore {}

/// Report ordering: most recently first-started first, never-started
/// experiments ahead of everything, ties broken by id.
pub fn report_order(a: &Experiment, b: &Experiment) -> Ordering {
    match (a.first_started_at, b.first_started_at) {
        (None, None) => a.id.cmp(&b.id),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => y.cmp(&x).then_with(|| a.id.cmp(&b.id)),
    }
}

pub(crate) fn stale_transition(current: &Experiment, expected: Status) -> AbtError {
    AbtError::InvalidTransition(
        ErrorInfo::new(
            "stale-transition",
            "experiment status changed before the transition was committed",
        )
        .with_context("experiment", current.id)
        .with_context("expected", expected)
        .with_context("status", current.status),
    )
}

pub(crate) fn lock_poisoned() -> AbtError {
    AbtError::Storage(ErrorInfo::new(
        "store-lock",
        "store lock poisoned by a panicking writer",
    ))
}
