//! Read-side statistics over hourly buckets.
//!
//! Nothing here writes. Empty data yields zeros, `None` or empty vectors,
//! never an error.

use std::fmt;
use std::sync::Arc;

use abt_core::{AbtError, Experiment, ExperimentId, HourlyLog, Status, Variant, VariantTotals};
use abt_store::Store;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Cumulative conversions at the end of one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub date: NaiveDate,
    pub control: u64,
    pub treatment: u64,
}

/// Outcome of a pooled two-proportion z-test. Positive `z` favours treatment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZTest {
    pub z: f64,
    pub p_value: f64,
}

impl ZTest {
    pub fn is_significant(&self, significance_level: f64) -> bool {
        self.p_value < significance_level
    }
}

/// Counts and rate for one variant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VariantStats {
    pub variant: Variant,
    pub participants: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
}

impl VariantStats {
    fn from_totals(totals: &VariantTotals, variant: Variant) -> Self {
        let participants = totals.participants(variant);
        let conversions = totals.conversions(variant);
        Self {
            variant,
            participants,
            conversions,
            conversion_rate: rate(conversions, participants),
        }
    }

    /// Conversion rate as a whole percentage, truncated.
    pub fn conversion_percent(&self) -> u64 {
        if self.participants == 0 {
            0
        } else {
            self.conversions * 100 / self.participants
        }
    }
}

/// Everything the progress report shows for one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSummary {
    pub experiment: ExperimentId,
    pub name: String,
    pub status: Status,
    pub target_sample_size: u64,
    pub current_sample_size: u64,
    /// Whole percent of the target reached, truncated. May exceed 100.
    pub progress_percent: u64,
    pub control: VariantStats,
    pub treatment: VariantStats,
    pub estimated_completion_date: Option<NaiveDate>,
    pub z_test: Option<ZTest>,
    /// Winner the data currently supports at the configured level.
    pub leading_winner: Option<Variant>,
    /// Winner frozen on the experiment when it finished.
    pub winning_variant: Option<Variant>,
    pub time_series: Vec<TimeSeriesPoint>,
}

/// Computes progress and significance from stored buckets.
#[derive(Clone)]
pub struct StatisticsEngine {
    store: Arc<dyn Store>,
    significance_level: f64,
}

impl fmt::Debug for StatisticsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatisticsEngine")
            .field("significance_level", &self.significance_level)
            .finish_non_exhaustive()
    }
}

impl StatisticsEngine {
    pub fn new(store: Arc<dyn Store>, significance_level: f64) -> Self {
        Self {
            store,
            significance_level,
        }
    }

    pub fn significance_level(&self) -> f64 {
        self.significance_level
    }

    pub fn current_sample_size(&self, experiment: ExperimentId) -> Result<u64, AbtError> {
        self.store.experiment(experiment)?;
        Ok(self.store.totals(experiment)?.sample_size())
    }

    /// Conversions over participants for `variant`; 0 with no participants.
    pub fn conversion_rate(
        &self,
        experiment: ExperimentId,
        variant: Variant,
    ) -> Result<f64, AbtError> {
        self.store.experiment(experiment)?;
        let totals = self.store.totals(experiment)?;
        Ok(rate(totals.conversions(variant), totals.participants(variant)))
    }

    /// Projects when the target sample size will be reached.
    ///
    /// Only defined while running, with at least one participant and one
    /// whole day since the last start.
    pub fn estimated_completion_date(
        &self,
        experiment: ExperimentId,
        now: DateTime<Utc>,
    ) -> Result<Option<NaiveDate>, AbtError> {
        let record = self.store.experiment(experiment)?;
        let totals = self.store.totals(experiment)?;
        Ok(estimate_completion(&record, totals.sample_size(), now))
    }

    pub fn time_series(&self, experiment: ExperimentId) -> Result<Vec<TimeSeriesPoint>, AbtError> {
        self.store.experiment(experiment)?;
        Ok(time_series_from_logs(&self.store.hourly_logs(experiment)?))
    }

    /// z-test over the current totals, when both variants have data.
    pub fn significance(&self, experiment: ExperimentId) -> Result<Option<ZTest>, AbtError> {
        self.store.experiment(experiment)?;
        Ok(z_test_for(&self.store.totals(experiment)?))
    }

    /// The significantly better variant, once the target sample is reached.
    pub fn determine_winner(&self, experiment: ExperimentId) -> Result<Option<Variant>, AbtError> {
        let record = self.store.experiment(experiment)?;
        let totals = self.store.totals(experiment)?;
        Ok(winner_for(&record, &totals, self.significance_level))
    }

    pub fn summary(
        &self,
        experiment: ExperimentId,
        now: DateTime<Utc>,
    ) -> Result<ProgressSummary, AbtError> {
        let record = self.store.experiment(experiment)?;
        let logs = self.store.hourly_logs(experiment)?;
        let totals = VariantTotals::from_logs(&logs);
        let sample = totals.sample_size();
        Ok(ProgressSummary {
            experiment: record.id,
            name: record.name.clone(),
            status: record.status,
            target_sample_size: record.sample_size,
            current_sample_size: sample,
            progress_percent: sample.saturating_mul(100) / record.sample_size.max(1),
            control: VariantStats::from_totals(&totals, Variant::Control),
            treatment: VariantStats::from_totals(&totals, Variant::Treatment),
            estimated_completion_date: estimate_completion(&record, sample, now),
            z_test: z_test_for(&totals),
            leading_winner: winner_for(&record, &totals, self.significance_level),
            winning_variant: record.winning_variant,
            time_series: time_series_from_logs(&logs),
        })
    }
}

fn rate(conversions: u64, participants: u64) -> f64 {
    if participants == 0 {
        0.0
    } else {
        conversions as f64 / participants as f64
    }
}

fn z_test_for(totals: &VariantTotals) -> Option<ZTest> {
    two_proportion_z_test(
        totals.control_conversions,
        totals.control_participants,
        totals.treatment_conversions,
        totals.treatment_participants,
    )
}

fn winner_for(
    experiment: &Experiment,
    totals: &VariantTotals,
    significance_level: f64,
) -> Option<Variant> {
    if totals.sample_size() < experiment.sample_size {
        return None;
    }
    let test = z_test_for(totals)?;
    if !test.is_significant(significance_level) {
        return None;
    }
    if test.z > 0.0 {
        Some(Variant::Treatment)
    } else if test.z < 0.0 {
        Some(Variant::Control)
    } else {
        None
    }
}

/// Pooled two-proportion z-test, two sided.
///
/// `None` when either group is empty or the pooled standard error is zero
/// (both rates 0 or both 1).
pub fn two_proportion_z_test(
    control_conversions: u64,
    control_participants: u64,
    treatment_conversions: u64,
    treatment_participants: u64,
) -> Option<ZTest> {
    if control_participants == 0 || treatment_participants == 0 {
        return None;
    }
    let x1 = control_conversions as f64;
    let x2 = treatment_conversions as f64;
    let n1 = control_participants as f64;
    let n2 = treatment_participants as f64;
    let pooled = (x1 + x2) / (n1 + n2);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if !se.is_finite() || se <= 0.0 {
        return None;
    }
    let z = (x2 / n2 - x1 / n1) / se;
    let p_value = (2.0 * (1.0 - normal_cdf(z.abs()))).clamp(0.0, 1.0);
    Some(ZTest { z, p_value })
}

/// Standard normal CDF, Abramowitz-Stegun 26.2.17 (error below 7.5e-8).
pub fn normal_cdf(z: f64) -> f64 {
    if z < 0.0 {
        return 1.0 - normal_cdf(-z);
    }
    let t = 1.0 / (1.0 + 0.231_641_9 * z);
    let d = 0.398_942_280_4 * (-0.5 * z * z).exp();
    let tail = d
        * t
        * (0.319_381_530
            + t * (-0.356_563_782
                + t * (1.781_477_937 + t * (-1.821_255_978 + t * 1.330_274_429))));
    1.0 - tail
}

/// Cumulative conversions per calendar day.
///
/// One point per day from the first to the last log date inclusive. Each
/// point holds the totals after every bucket of that day; days without logs
/// repeat the previous totals. `logs` must be ordered by date and hour.
pub fn time_series_from_logs(logs: &[HourlyLog]) -> Vec<TimeSeriesPoint> {
    let mut points: Vec<TimeSeriesPoint> = Vec::new();
    let mut control = 0;
    let mut treatment = 0;
    for log in logs {
        let date = log.key.date;
        if let Some(last) = points.last().copied() {
            let mut day = last.date;
            while day < date {
                day += Duration::days(1);
                points.push(TimeSeriesPoint {
                    date: day,
                    control,
                    treatment,
                });
            }
        } else {
            points.push(TimeSeriesPoint {
                date,
                control,
                treatment,
            });
        }
        match log.key.variant {
            Variant::Control => control += log.conversions,
            Variant::Treatment => treatment += log.conversions,
        }
        if let Some(last) = points.last_mut() {
            last.control = control;
            last.treatment = treatment;
        }
    }
    points
}

/// Completion estimate from a sample count observed at `now`.
pub fn estimate_completion(
    experiment: &Experiment,
    sample: u64,
    now: DateTime<Utc>,
) -> Option<NaiveDate> {
    if sample == 0 {
        return None;
    }
    let days = experiment.running_duration(now)?.num_days();
    if days <= 0 {
        return None;
    }
    let per_day = sample as f64 / days as f64;
    let remaining = experiment.sample_size.saturating_sub(sample) as f64;
    let days_left = (remaining / per_day).floor() as i64;
    now.date_naive()
        .checked_add_signed(Duration::try_days(days_left)?)
}
