use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{AbtError, ErrorInfo};
use crate::{ExperimentId, FinishOutcome, PageId, Status, Variant};

/// Conversion goal measured by an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    /// Event type slug as registered in the goal registry.
    pub event: String,
    /// Page whose visit counts as a conversion, when the goal is page based.
    #[serde(default)]
    pub page: Option<PageId>,
}

/// Caller supplied description of an experiment to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewExperiment {
    /// Human readable name.
    pub name: String,
    /// Free-text hypothesis.
    #[serde(default)]
    pub hypothesis: String,
    /// Goal being measured.
    pub goal: Goal,
    /// Target total participant count across both variants.
    pub sample_size: u64,
    /// Revision of the page content served to the treatment group.
    #[serde(default)]
    pub treatment_revision: Option<i64>,
}

impl NewExperiment {
    /// Largest target a store can persist as a signed 64-bit column.
    pub const MAX_SAMPLE_SIZE: u64 = i64::MAX as u64;

    /// Checks field-level constraints that do not need collaborators.
    pub fn validate(&self) -> Result<(), AbtError> {
        if self.name.trim().is_empty() {
            return Err(AbtError::Validation(ErrorInfo::new(
                "empty-name",
                "experiment name must not be empty",
            )));
        }
        if self.sample_size == 0 {
            return Err(AbtError::Validation(
                ErrorInfo::new("zero-sample-size", "sample size must be positive")
                    .with_context("sample_size", self.sample_size),
            ));
        }
        if self.sample_size > Self::MAX_SAMPLE_SIZE {
            return Err(AbtError::sample_size_too_large(self.sample_size));
        }
        if self.goal.event.trim().is_empty() {
            return Err(AbtError::Validation(ErrorInfo::new(
                "empty-goal",
                "goal event must not be empty",
            )));
        }
        Ok(())
    }
}

/// Persisted experiment metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    /// Store assigned identifier.
    pub id: ExperimentId,
    /// Page under test.
    pub page: PageId,
    /// Human readable name.
    pub name: String,
    /// Free-text hypothesis.
    pub hypothesis: String,
    /// Goal being measured.
    pub goal: Goal,
    /// Revision of the page content served to the treatment group.
    pub treatment_revision: Option<i64>,
    /// Target total participant count across both variants.
    pub sample_size: u64,
    /// Current lifecycle status.
    pub status: Status,
    /// How the experiment ended, once finished.
    pub outcome: Option<FinishOutcome>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// First transition into running. Never changes once set.
    pub first_started_at: Option<DateTime<Utc>>,
    /// Most recent transition into running, including restarts.
    pub last_started_at: Option<DateTime<Utc>>,
    /// Transition into finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Winner frozen when the experiment finished.
    pub winning_variant: Option<Variant>,
}

impl Experiment {
    /// Time elapsed since the most recent start, when running.
    pub fn running_duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        match (self.status, self.last_started_at) {
            (Status::Running, Some(started)) if now >= started => Some(now - started),
            _ => None,
        }
    }
}

/// Filter applied when listing experiments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentFilter {
    /// Restrict to a single status.
    #[serde(default)]
    pub status: Option<Status>,
    /// Restrict to a single page.
    #[serde(default)]
    pub page: Option<PageId>,
}

impl ExperimentFilter {
    /// Whether the experiment passes the filter.
    pub fn matches(&self, experiment: &Experiment) -> bool {
        self.status.map_or(true, |s| s == experiment.status)
            && self.page.map_or(true, |p| p == experiment.page)
    }
}

/// Identity of an hourly aggregation bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    /// Owning experiment.
    pub experiment: ExperimentId,
    /// UTC calendar date.
    pub date: NaiveDate,
    /// UTC hour of day, 0 to 23.
    pub hour: u8,
    /// Variant the counts belong to.
    pub variant: Variant,
}

impl BucketKey {
    /// Bucket containing `at`, truncated to the hour.
    pub fn at(experiment: ExperimentId, variant: Variant, at: DateTime<Utc>) -> Self {
        Self {
            experiment,
            date: at.date_naive(),
            hour: at.hour() as u8,
            variant,
        }
    }
}

/// Counter increments applied to a single bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BucketDelta {
    /// New participants.
    pub participants: u64,
    /// New conversions.
    pub conversions: u64,
}

impl BucketDelta {
    /// One new participant.
    pub const PARTICIPANT: BucketDelta = BucketDelta {
        participants: 1,
        conversions: 0,
    };

    /// One new conversion.
    pub const CONVERSION: BucketDelta = BucketDelta {
        participants: 0,
        conversions: 1,
    };
}

/// Aggregated counts for one (experiment, date, hour, variant) bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyLog {
    /// Bucket identity.
    pub key: BucketKey,
    /// Participants first exposed during this hour.
    pub participants: u64,
    /// Conversions recorded during this hour.
    pub conversions: u64,
}

/// Participant and conversion totals summed over all buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VariantTotals {
    /// Control participants.
    pub control_participants: u64,
    /// Control conversions.
    pub control_conversions: u64,
    /// Treatment participants.
    pub treatment_participants: u64,
    /// Treatment conversions.
    pub treatment_conversions: u64,
}

impl VariantTotals {
    /// Sums a set of hourly logs.
    pub fn from_logs<'a>(logs: impl IntoIterator<Item = &'a HourlyLog>) -> Self {
        let mut totals = Self::default();
        for log in logs {
            totals.add(log.key.variant, log.participants, log.conversions);
        }
        totals
    }

    /// Adds counts for one variant.
    pub fn add(&mut self, variant: Variant, participants: u64, conversions: u64) {
        match variant {
            Variant::Control => {
                self.control_participants += participants;
                self.control_conversions += conversions;
            }
            Variant::Treatment => {
                self.treatment_participants += participants;
                self.treatment_conversions += conversions;
            }
        }
    }

    /// Participants recorded for `variant`.
    pub fn participants(&self, variant: Variant) -> u64 {
        match variant {
            Variant::Control => self.control_participants,
            Variant::Treatment => self.treatment_participants,
        }
    }

    /// Conversions recorded for `variant`.
    pub fn conversions(&self, variant: Variant) -> u64 {
        match variant {
            Variant::Control => self.control_conversions,
            Variant::Treatment => self.treatment_conversions,
        }
    }

    /// Total participants across both variants.
    pub fn sample_size(&self) -> u64 {
        self.control_participants + self.treatment_participants
    }
}

/// Result of assigning a visitor to a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Variant the visitor is served.
    pub variant: Variant,
    /// True when this call created the assignment or, when counting,
    /// counted the visitor as a participant for the first time.
    pub is_new: bool,
}

/// Result of recording a conversion for a visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "variant", rename_all = "snake_case")]
pub enum ConversionOutcome {
    /// Conversion counted for the visitor's variant.
    Recorded(Variant),
    /// The visitor already converted; nothing was counted.
    AlreadyConverted(Variant),
    /// The visitor was never assigned; nothing was counted.
    NotAssigned,
}
