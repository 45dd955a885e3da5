//! Experiment lifecycle.
//!
//! Legal moves live in [`TRANSITIONS`]; everything else is rejected with
//! [`AbtError::InvalidTransition`] before anything is written.

use std::fmt;
use std::sync::Arc;

use abt_core::errors::{AbtError, ErrorInfo};
use abt_core::{Clock, Experiment, ExperimentId, FinishOutcome, Status, Variant};
use abt_store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Kind of lifecycle request, the column of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Start,
    Pause,
    Restart,
    Finish,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionKind::Start => "start",
            ActionKind::Pause => "pause",
            ActionKind::Restart => "restart",
            ActionKind::Finish => "finish",
        })
    }
}

/// A lifecycle request with its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Action {
    Start,
    Pause,
    Restart,
    Finish {
        /// Early termination by a user rather than a concluded test.
        cancel: bool,
        /// Winner to freeze on the experiment.
        winner: Option<Variant>,
    },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Start => ActionKind::Start,
            Action::Pause => ActionKind::Pause,
            Action::Restart => ActionKind::Restart,
            Action::Finish { .. } => ActionKind::Finish,
        }
    }
}

/// `(from, action, to)` rows. Finished is terminal.
pub const TRANSITIONS: &[(Status, ActionKind, Status)] = &[
    (Status::Draft, ActionKind::Start, Status::Running),
    (Status::Draft, ActionKind::Finish, Status::Finished),
    (Status::Running, ActionKind::Pause, Status::Paused),
    (Status::Running, ActionKind::Finish, Status::Finished),
    (Status::Paused, ActionKind::Restart, Status::Running),
    (Status::Paused, ActionKind::Finish, Status::Finished),
];

/// Looks up the status reached by applying `action` in `from`.
pub fn next_status(from: Status, action: ActionKind) -> Option<Status> {
    TRANSITIONS
        .iter()
        .find(|(source, kind, _)| *source == from && *kind == action)
        .map(|(_, _, target)| *target)
}

/// Computes the record produced by `action` without persisting it.
pub fn apply(
    experiment: &Experiment,
    action: Action,
    now: DateTime<Utc>,
) -> Result<Experiment, AbtError> {
    let target = next_status(experiment.status, action.kind()).ok_or_else(|| {
        AbtError::InvalidTransition(
            ErrorInfo::new(
                "invalid-transition",
                "action is not allowed from the current status",
            )
            .with_context("experiment", experiment.id)
            .with_context("status", experiment.status)
            .with_context("action", action.kind()),
        )
    })?;
    let mut updated = experiment.clone();
    updated.status = target;
    match action {
        Action::Start | Action::Restart => {
            updated.first_started_at.get_or_insert(now);
            updated.last_started_at = Some(now);
        }
        Action::Pause => {}
        Action::Finish { cancel, winner } => {
            updated.finished_at = Some(now);
            updated.outcome = Some(if cancel {
                FinishOutcome::Cancelled
            } else {
                FinishOutcome::Completed
            });
            updated.winning_variant = winner;
        }
    }
    Ok(updated)
}

/// Applies lifecycle actions and commits them atomically through the store.
#[derive(Clone)]
pub struct ExperimentStateMachine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for ExperimentStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExperimentStateMachine").finish_non_exhaustive()
    }
}

impl ExperimentStateMachine {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Loads the experiment, applies `action` and commits the result.
    ///
    /// The commit is conditional on the status read here, so a concurrent
    /// transition makes this call fail instead of overwriting it.
    pub fn transition(&self, id: ExperimentId, action: Action) -> Result<Experiment, AbtError> {
        let current = self.store.experiment(id)?;
        let now = self.clock.now();
        let updated = apply(&current, action, now).map_err(|err| {
            warn!(
                experiment = %id,
                status = %current.status,
                action = %action.kind(),
                "rejected transition"
            );
            err
        })?;
        self.store
            .commit_transition(current.status, &updated)
            .map_err(|err| {
                warn!(
                    experiment = %id,
                    action = %action.kind(),
                    code = %err.info().code,
                    "transition not committed"
                );
                err
            })?;
        info!(
            experiment = %id,
            from = %current.status,
            to = %updated.status,
            action = %action.kind(),
            "experiment transitioned"
        );
        Ok(updated)
    }

    pub fn start(&self, id: ExperimentId) -> Result<Experiment, AbtError> {
        self.transition(id, Action::Start)
    }

    pub fn pause(&self, id: ExperimentId) -> Result<Experiment, AbtError> {
        self.transition(id, Action::Pause)
    }

    /// Resumes a paused experiment, resetting the running-duration window.
    pub fn restart(&self, id: ExperimentId) -> Result<Experiment, AbtError> {
        self.transition(id, Action::Restart)
    }

    pub fn finish(
        &self,
        id: ExperimentId,
        cancel: bool,
        winner: Option<Variant>,
    ) -> Result<Experiment, AbtError> {
        self.transition(id, Action::Finish { cancel, winner })
    }
}
