#![allow(dead_code)]

use std::sync::{Arc, Once};

use abt_core::{
    Goal, GoalType, ManualClock, NewExperiment, PageId, PageRef, StaticGoalRegistry,
};
use abt_engine::{EngineConfig, ExperimentService};
use abt_store::{MemoryStore, SqliteStore, Store};
use chrono::{DateTime, TimeZone, Utc};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Installs a test subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 11, 4, 22, 37, 0).unwrap()
}

pub fn goals() -> Arc<StaticGoalRegistry> {
    Arc::new(
        StaticGoalRegistry::new()
            .with_goal(
                "visit-page",
                GoalType {
                    display_name: "Visit page".into(),
                    page_types: Vec::new(),
                },
            )
            .with_goal(
                "submit-form",
                GoalType {
                    display_name: "Submit form".into(),
                    page_types: vec!["form-page".into()],
                },
            ),
    )
}

pub fn page(id: i64) -> PageRef {
    PageRef {
        id: PageId::from_raw(id),
        page_type: "standard-page".into(),
        is_live: true,
        has_unpublished_changes: true,
        latest_revision: Some(7),
    }
}

pub fn request(sample_size: u64) -> NewExperiment {
    NewExperiment {
        name: "Homepage headline".into(),
        hypothesis: "A shorter headline converts better".into(),
        goal: Goal {
            event: "visit-page".into(),
            page: None,
        },
        sample_size,
        treatment_revision: None,
    }
}

pub struct Harness {
    pub service: ExperimentService,
    pub clock: Arc<ManualClock>,
}

pub fn harness_with(store: Arc<dyn Store>, config: &EngineConfig) -> Harness {
    init_tracing();
    let clock = Arc::new(ManualClock::new(t0()));
    let service = ExperimentService::new(store, clock.clone(), goals(), config);
    Harness { service, clock }
}

pub fn harness() -> Harness {
    harness_with(Arc::new(MemoryStore::new()), &EngineConfig::default())
}

pub fn harnesses() -> Vec<(&'static str, Harness)> {
    vec![
        ("memory", harness()),
        (
            "sqlite",
            harness_with(
                Arc::new(SqliteStore::open_in_memory().expect("sqlite")),
                &EngineConfig::default(),
            ),
        ),
    ]
}
