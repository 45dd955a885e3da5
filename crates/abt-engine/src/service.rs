//! Facade wiring the store, lifecycle, assignment and statistics together.

use std::fmt;
use std::sync::Arc;

use abt_core::errors::{AbtError, ErrorInfo};
use abt_core::{
    Assignment, Clock, ConversionOutcome, Experiment, ExperimentFilter, ExperimentId,
    GoalRegistry, HourlyLog, NewExperiment, PageId, PageRef, SystemClock, Variant,
};
use abt_store::{MemoryStore, SqliteStore, Store};
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, warn};

use crate::assign::{AssignmentStrategy, ParticipantAssigner};
use crate::config::{EngineConfig, StorageBackend};
use crate::machine::ExperimentStateMachine;
use crate::stats::{ProgressSummary, StatisticsEngine, TimeSeriesPoint, ZTest};

/// Entry point for the hosting system.
///
/// Permission checks stay with the caller.
pub struct ExperimentService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    goals: Arc<dyn GoalRegistry>,
    machine: ExperimentStateMachine,
    assigner: ParticipantAssigner,
    stats: StatisticsEngine,
}

impl fmt::Debug for ExperimentService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExperimentService")
            .field("assigner", &self.assigner)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl ExperimentService {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        goals: Arc<dyn GoalRegistry>,
        config: &EngineConfig,
    ) -> Self {
        let machine = ExperimentStateMachine::new(store.clone(), clock.clone());
        let assigner = ParticipantAssigner::new(
            store.clone(),
            clock.clone(),
            AssignmentStrategy::from_config(&config.assignment),
        );
        let stats = StatisticsEngine::new(store.clone(), config.statistics.significance_level);
        Self {
            store,
            clock,
            goals,
            machine,
            assigner,
            stats,
        }
    }

    /// Builds the configured backend with the system clock.
    pub fn open(config: &EngineConfig, goals: Arc<dyn GoalRegistry>) -> Result<Self, AbtError> {
        config.validate()?;
        let store: Arc<dyn Store> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::Sqlite => {
                let path = config.storage.path.as_ref().ok_or_else(|| {
                    AbtError::Config(ErrorInfo::new(
                        "config-storage",
                        "sqlite backend requires a path",
                    ))
                })?;
                Arc::new(SqliteStore::open(path)?)
            }
        };
        info!(backend = ?config.storage.backend, "experiment service opened");
        Ok(Self::new(store, Arc::new(SystemClock), goals, config))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Creates a draft experiment on `page`.
    ///
    /// The page must be live with unpublished changes, the goal must be
    /// registered and able to fire on the goal page's type, and the page must
    /// not already have an active experiment.
    pub fn create(&self, page: &PageRef, request: NewExperiment) -> Result<Experiment, AbtError> {
        request.validate()?;
        if !page.is_live || !page.has_unpublished_changes {
            warn!(page = %page.id, "page not eligible for an experiment");
            return Err(AbtError::Validation(
                ErrorInfo::new(
                    "page-not-eligible",
                    "experiments need a live page with unpublished changes",
                )
                .with_context("page", page.id)
                .with_context("is_live", page.is_live)
                .with_context("has_unpublished_changes", page.has_unpublished_changes),
            ));
        }
        let goal = self.goals.goal(&request.goal.event).ok_or_else(|| {
            AbtError::Validation(
                ErrorInfo::new("unknown-goal", "goal event type is not registered")
                    .with_context("goal", &request.goal.event),
            )
        })?;
        if request.goal.page.map_or(true, |goal_page| goal_page == page.id)
            && !goal.is_triggerable_on(&page.page_type)
        {
            return Err(AbtError::Validation(
                ErrorInfo::new(
                    "goal-not-triggerable",
                    "goal event cannot fire on this page type",
                )
                .with_context("goal", &request.goal.event)
                .with_context("page_type", &page.page_type),
            ));
        }
        let mut request = request;
        if request.treatment_revision.is_none() {
            request.treatment_revision = page.latest_revision;
        }
        let experiment = self
            .store
            .create_experiment(page.id, &request, self.clock.now())?;
        info!(experiment = %experiment.id, page = %page.id, "experiment created");
        Ok(experiment)
    }

    pub fn create_and_start(
        &self,
        page: &PageRef,
        request: NewExperiment,
    ) -> Result<Experiment, AbtError> {
        let draft = self.create(page, request)?;
        self.machine.start(draft.id)
    }

    pub fn start(&self, id: ExperimentId) -> Result<Experiment, AbtError> {
        self.machine.start(id)
    }

    pub fn pause(&self, id: ExperimentId) -> Result<Experiment, AbtError> {
        self.machine.pause(id)
    }

    pub fn restart(&self, id: ExperimentId) -> Result<Experiment, AbtError> {
        self.machine.restart(id)
    }

    /// Ends the experiment. A completed experiment freezes whatever winner
    /// the data supports now; a cancelled one records none.
    pub fn finish(&self, id: ExperimentId, cancel: bool) -> Result<Experiment, AbtError> {
        let winner = if cancel {
            None
        } else {
            self.stats.determine_winner(id)?
        };
        self.machine.finish(id, cancel, winner)
    }

    /// Finishes as completed when a winner exists; otherwise leaves it be.
    pub fn conclude(&self, id: ExperimentId) -> Result<Option<Experiment>, AbtError> {
        match self.stats.determine_winner(id)? {
            Some(winner) => {
                info!(experiment = %id, %winner, "winner found");
                self.machine.finish(id, false, Some(winner)).map(Some)
            }
            None => Ok(None),
        }
    }

    pub fn delete(&self, id: ExperimentId) -> Result<(), AbtError> {
        self.store.delete_experiment(id)?;
        info!(experiment = %id, "experiment deleted");
        Ok(())
    }

    pub fn record_participant(
        &self,
        id: ExperimentId,
        variant: Variant,
        at: DateTime<Utc>,
    ) -> Result<HourlyLog, AbtError> {
        self.assigner.record_participant(id, variant, at)
    }

    pub fn record_conversion(
        &self,
        id: ExperimentId,
        variant: Variant,
        at: DateTime<Utc>,
    ) -> Result<HourlyLog, AbtError> {
        self.assigner.record_conversion(id, variant, at)
    }

    pub fn assign_variant(&self, id: ExperimentId, visitor_key: &str) -> Result<Variant, AbtError> {
        self.assigner.assign_variant(id, visitor_key)
    }

    pub fn participate(
        &self,
        id: ExperimentId,
        visitor_key: &str,
        at: DateTime<Utc>,
    ) -> Result<Assignment, AbtError> {
        self.assigner.participate(id, visitor_key, at)
    }

    pub fn convert(
        &self,
        id: ExperimentId,
        visitor_key: &str,
        at: DateTime<Utc>,
    ) -> Result<ConversionOutcome, AbtError> {
        self.assigner.convert(id, visitor_key, at)
    }

    pub fn current_sample_size(&self, id: ExperimentId) -> Result<u64, AbtError> {
        self.stats.current_sample_size(id)
    }

    pub fn conversion_rate(&self, id: ExperimentId, variant: Variant) -> Result<f64, AbtError> {
        self.stats.conversion_rate(id, variant)
    }

    pub fn estimated_completion_date(&self, id: ExperimentId) -> Result<Option<NaiveDate>, AbtError> {
        self.stats.estimated_completion_date(id, self.clock.now())
    }

    pub fn time_series(&self, id: ExperimentId) -> Result<Vec<TimeSeriesPoint>, AbtError> {
        self.stats.time_series(id)
    }

    pub fn significance(&self, id: ExperimentId) -> Result<Option<ZTest>, AbtError> {
        self.stats.significance(id)
    }

    pub fn determine_winner(&self, id: ExperimentId) -> Result<Option<Variant>, AbtError> {
        self.stats.determine_winner(id)
    }

    pub fn summary(&self, id: ExperimentId) -> Result<ProgressSummary, AbtError> {
        self.stats.summary(id, self.clock.now())
    }

    pub fn experiment(&self, id: ExperimentId) -> Result<Experiment, AbtError> {
        self.store.experiment(id)
    }

    pub fn active_for_page(&self, page: PageId) -> Result<Option<Experiment>, AbtError> {
        self.store.active_for_page(page)
    }

    /// Report listing: never-started first, then most recently started.
    pub fn list(&self, filter: &ExperimentFilter) -> Result<Vec<Experiment>, AbtError> {
        self.store.list_experiments(filter)
    }
}
