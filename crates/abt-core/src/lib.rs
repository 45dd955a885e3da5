#![deny(missing_docs)]
#![doc = "Core types, structured errors and collaborator contracts for the abtest engine."]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod clock;
pub mod errors;
pub mod external;
pub mod rng;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::{AbtError, ErrorInfo};
pub use external::{GoalRegistry, GoalType, PageRef, StaticGoalRegistry};
pub use rng::{hashed_variant, RngHandle};
pub use types::{
    Assignment, BucketDelta, BucketKey, ConversionOutcome, Experiment, ExperimentFilter, Goal,
    HourlyLog, NewExperiment, VariantTotals,
};

/// Identifier for a persisted experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExperimentId(i64);

impl ExperimentId {
    /// Creates a new identifier from its raw integer representation.
    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    /// Returns the raw integer representation of the identifier.
    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a page owned by the hosting content system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(i64);

impl PageId {
    /// Creates a new identifier from its raw integer representation.
    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    /// Returns the raw integer representation of the identifier.
    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One of the two page versions being compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// The published content.
    Control,
    /// The modified content under test.
    Treatment,
}

impl Variant {
    /// Both variants in canonical order.
    pub const ALL: [Variant; 2] = [Variant::Control, Variant::Treatment];

    /// Stable lowercase label used for persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Control => "control",
            Variant::Treatment => "treatment",
        }
    }

    /// Returns the opposite variant.
    pub fn other(&self) -> Variant {
        match self {
            Variant::Control => Variant::Treatment,
            Variant::Treatment => Variant::Control,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = AbtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "control" => Ok(Variant::Control),
            "treatment" => Ok(Variant::Treatment),
            other => Err(AbtError::Validation(
                ErrorInfo::new("unknown-variant", "variant must be control or treatment")
                    .with_context("value", other),
            )),
        }
    }
}

/// Lifecycle status of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Created but never started.
    Draft,
    /// Accepting participants and conversions.
    Running,
    /// Temporarily not accepting events.
    Paused,
    /// Terminal state.
    Finished,
}

impl Status {
    /// Statuses that count as the page's active experiment.
    pub const ACTIVE: [Status; 3] = [Status::Draft, Status::Running, Status::Paused];

    /// Stable lowercase label used for persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Draft => "draft",
            Status::Running => "running",
            Status::Paused => "paused",
            Status::Finished => "finished",
        }
    }

    /// Whether an experiment in this status blocks other experiments on its page.
    pub fn is_active(&self) -> bool {
        Status::ACTIVE.contains(self)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = AbtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Status::Draft),
            "running" => Ok(Status::Running),
            "paused" => Ok(Status::Paused),
            "finished" => Ok(Status::Finished),
            other => Err(AbtError::Validation(
                ErrorInfo::new("unknown-status", "unrecognised experiment status")
                    .with_context("value", other),
            )),
        }
    }
}

/// How a finished experiment ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishOutcome {
    /// Ran to a conclusion.
    Completed,
    /// Terminated early by a user.
    Cancelled,
}

impl FinishOutcome {
    /// Stable lowercase label used for persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishOutcome::Completed => "completed",
            FinishOutcome::Cancelled => "cancelled",
        }
    }
}

impl FromStr for FinishOutcome {
    type Err = AbtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(FinishOutcome::Completed),
            "cancelled" => Ok(FinishOutcome::Cancelled),
            other => Err(AbtError::Validation(
                ErrorInfo::new("unknown-outcome", "unrecognised finish outcome")
                    .with_context("value", other),
            )),
        }
    }
}
