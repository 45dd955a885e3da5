use abt_core::{BucketKey, ExperimentId, HourlyLog, Variant};
use abt_engine::{estimate_completion, time_series_from_logs};
use chrono::{Duration, NaiveDate};
use proptest::prelude::*;

fn arb_logs() -> impl Strategy<Value = Vec<HourlyLog>> {
    prop::collection::vec((0i64..30, 0u8..24, any::<bool>(), 0u64..5, 0u64..5), 0..60).prop_map(
        |raw| {
            let start = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap();
            let mut logs: Vec<HourlyLog> = raw
                .into_iter()
                .map(|(day, hour, treatment, participants, conversions)| HourlyLog {
                    key: BucketKey {
                        experiment: ExperimentId::from_raw(1),
                        date: start + Duration::days(day),
                        hour,
                        variant: if treatment {
                            Variant::Treatment
                        } else {
                            Variant::Control
                        },
                    },
                    participants,
                    conversions,
                })
                .collect();
            logs.sort_by_key(|log| log.key);
            logs.dedup_by_key(|log| log.key);
            logs
        },
    )
}

proptest! {
    #[test]
    fn one_point_per_day_and_never_decreasing(logs in arb_logs()) {
        let series = time_series_from_logs(&logs);
        match (logs.first(), logs.last()) {
            (Some(first), Some(last)) => {
                let days = (last.key.date - first.key.date).num_days() + 1;
                prop_assert_eq!(series.len() as i64, days);
                prop_assert_eq!(series[0].date, first.key.date);
            }
            _ => prop_assert!(series.is_empty()),
        }
        for pair in series.windows(2) {
            prop_assert_eq!(pair[1].date, pair[0].date + Duration::days(1));
            prop_assert!(pair[1].control >= pair[0].control);
            prop_assert!(pair[1].treatment >= pair[0].treatment);
        }
    }

    #[test]
    fn final_point_holds_all_conversions(logs in arb_logs()) {
        let series = time_series_from_logs(&logs);
        let control: u64 = logs
            .iter()
            .filter(|log| log.key.variant == Variant::Control)
            .map(|log| log.conversions)
            .sum();
        let treatment: u64 = logs
            .iter()
            .filter(|log| log.key.variant == Variant::Treatment)
            .map(|log| log.conversions)
            .sum();
        if let Some(last) = series.last() {
            prop_assert_eq!((last.control, last.treatment), (control, treatment));
        }
    }

    #[test]
    fn each_point_counts_its_whole_day(logs in arb_logs()) {
        let series = time_series_from_logs(&logs);
        for point in &series {
            let expected: u64 = logs
                .iter()
                .filter(|log| log.key.date <= point.date && log.key.variant == Variant::Treatment)
                .map(|log| log.conversions)
                .sum();
            prop_assert_eq!(point.treatment, expected);
        }
    }
}

#[test]
fn completion_estimate_requires_a_running_record() {
    use abt_core::{Experiment, Goal, PageId, Status};
    use chrono::{TimeZone, Utc};

    let started = Utc.with_ymd_and_hms(2021, 1, 1, 12, 0, 0).unwrap();
    let mut experiment = Experiment {
        id: ExperimentId::from_raw(1),
        page: PageId::from_raw(1),
        name: "headline".into(),
        hypothesis: String::new(),
        goal: Goal {
            event: "visit-page".into(),
            page: None,
        },
        treatment_revision: None,
        sample_size: 100,
        status: Status::Running,
        outcome: None,
        created_at: started,
        first_started_at: Some(started),
        last_started_at: Some(started),
        finished_at: None,
        winning_variant: None,
    };
    let now = started + Duration::days(3);
    assert_eq!(
        estimate_completion(&experiment, 150, now),
        Some(now.date_naive())
    );
    assert_eq!(estimate_completion(&experiment, 0, now), None);
    assert_eq!(
        estimate_completion(&experiment, 30, now),
        Some(now.date_naive() + Duration::days(7))
    );
    experiment.status = Status::Finished;
    assert_eq!(estimate_completion(&experiment, 30, now), None);
}
