#![allow(dead_code)]

use std::sync::Arc;

use abt_core::{Experiment, Goal, NewExperiment, PageId, Status};
use abt_store::{MemoryStore, SqliteStore, Store};
use chrono::{DateTime, TimeZone, Utc};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 11, 4, 22, 37, 0).unwrap()
}

pub fn backends() -> Vec<(&'static str, Arc<dyn Store>)> {
    vec![
        ("memory", Arc::new(MemoryStore::new()) as Arc<dyn Store>),
        (
            "sqlite",
            Arc::new(SqliteStore::open_in_memory().expect("sqlite")) as Arc<dyn Store>,
        ),
    ]
}

pub fn new_experiment(name: &str) -> NewExperiment {
    NewExperiment {
        name: name.to_string(),
        hypothesis: String::new(),
        goal: Goal {
            event: "visit-page".into(),
            page: None,
        },
        sample_size: 100,
        treatment_revision: Some(1),
    }
}

pub fn start(store: &dyn Store, experiment: &Experiment, at: DateTime<Utc>) -> Experiment {
    let mut running = experiment.clone();
    running.status = Status::Running;
    running.first_started_at.get_or_insert(at);
    running.last_started_at = Some(at);
    store
        .commit_transition(experiment.status, &running)
        .expect("start");
    running
}

pub fn running_experiment(store: &dyn Store, page: i64) -> Experiment {
    let draft = store
        .create_experiment(PageId::from_raw(page), &new_experiment("test"), t0())
        .expect("create");
    start(store, &draft, t0())
}
