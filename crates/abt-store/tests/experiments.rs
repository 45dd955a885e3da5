mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use abt_core::{
    AbtError, BucketDelta, BucketKey, ExperimentFilter, FinishOutcome, PageId, Status, Variant,
};
use abt_store::{BucketStore, ExperimentStore, SqliteStore};
use chrono::Duration;
use common::{backends, new_experiment, running_experiment, start, t0};
use tempfile::NamedTempFile;

#[test]
fn create_starts_in_draft() {
    for (name, store) in backends() {
        let experiment = store
            .create_experiment(PageId::from_raw(7), &new_experiment("headline"), t0())
            .unwrap();
        assert_eq!(experiment.status, Status::Draft, "{name}");
        assert_eq!(experiment.page, PageId::from_raw(7));
        assert_eq!(experiment.created_at, t0());
        assert!(experiment.first_started_at.is_none());
        assert_eq!(store.experiment(experiment.id).unwrap(), experiment, "{name}");
    }
}

#[test]
fn second_active_experiment_on_page_is_rejected() {
    for (name, store) in backends() {
        let first = store
            .create_experiment(PageId::from_raw(1), &new_experiment("a"), t0())
            .unwrap();
        let err = store
            .create_experiment(PageId::from_raw(1), &new_experiment("b"), t0())
            .unwrap_err();
        assert!(matches!(err, AbtError::DuplicateActiveExperiment(_)), "{name}");
        assert_eq!(
            err.info().context.get("existing"),
            Some(&first.id.to_string())
        );
        // Another page is unaffected.
        store
            .create_experiment(PageId::from_raw(2), &new_experiment("c"), t0())
            .unwrap();
        assert_eq!(
            store.active_for_page(PageId::from_raw(1)).unwrap().map(|e| e.id),
            Some(first.id),
            "{name}"
        );
    }
}

#[test]
fn stale_transition_is_rejected_without_mutation() {
    for (name, store) in backends() {
        let running = running_experiment(store.as_ref(), 1);
        let mut paused = running.clone();
        paused.status = Status::Paused;
        let err = store.commit_transition(Status::Draft, &paused).unwrap_err();
        match &err {
            AbtError::InvalidTransition(info) => assert_eq!(info.code, "stale-transition"),
            other => panic!("{name}: unexpected {other:?}"),
        }
        assert_eq!(store.experiment(running.id).unwrap().status, Status::Running, "{name}");
    }
}

#[test]
fn finished_experiment_frees_the_page() {
    for (name, store) in backends() {
        let running = running_experiment(store.as_ref(), 1);
        let mut finished = running.clone();
        finished.status = Status::Finished;
        finished.outcome = Some(FinishOutcome::Completed);
        finished.finished_at = Some(t0() + Duration::days(3));
        finished.winning_variant = Some(Variant::Treatment);
        store.commit_transition(Status::Running, &finished).unwrap();
        assert_eq!(store.experiment(running.id).unwrap(), finished, "{name}");
        assert!(store.active_for_page(PageId::from_raw(1)).unwrap().is_none());

        store
            .create_experiment(PageId::from_raw(1), &new_experiment("next"), t0())
            .expect(name);
    }
}

#[test]
fn list_uses_report_order_and_filters() {
    for (name, store) in backends() {
        let early = running_experiment(store.as_ref(), 1);
        let draft = store
            .create_experiment(PageId::from_raw(2), &new_experiment("draft"), t0())
            .unwrap();
        let late_draft = store
            .create_experiment(PageId::from_raw(3), &new_experiment("late"), t0())
            .unwrap();
        let late = start(store.as_ref(), &late_draft, t0() + Duration::days(1));

        let ids: Vec<_> = store
            .list_experiments(&ExperimentFilter::default())
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![draft.id, late.id, early.id], "{name}");

        let running = store
            .list_experiments(&ExperimentFilter {
                status: Some(Status::Running),
                page: None,
            })
            .unwrap();
        assert_eq!(running.len(), 2, "{name}");

        let page_two = store
            .list_experiments(&ExperimentFilter {
                status: None,
                page: Some(PageId::from_raw(2)),
            })
            .unwrap();
        assert_eq!(page_two.len(), 1);
        assert_eq!(page_two[0].id, draft.id, "{name}");
    }
}

#[test]
fn delete_cascades_to_buckets_and_assignments() {
    for (name, store) in backends() {
        let experiment = running_experiment(store.as_ref(), 1);
        store
            .increment(
                &BucketKey::at(experiment.id, Variant::Control, t0()),
                BucketDelta::PARTICIPANT,
            )
            .unwrap();
        store
            .assign_visitor(experiment.id, "visitor", Variant::Control, true, t0())
            .unwrap();
        store.delete_experiment(experiment.id).unwrap();

        assert!(matches!(store.experiment(experiment.id), Err(AbtError::NotFound(_))), "{name}");
        assert!(store.hourly_logs(experiment.id).unwrap().is_empty(), "{name}");
        assert_eq!(store.assignment(experiment.id, "visitor").unwrap(), None, "{name}");
        assert!(matches!(
            store.delete_experiment(experiment.id),
            Err(AbtError::NotFound(_))
        ));
    }
}

#[test]
fn sqlite_store_persists_across_reopen() {
    let db = NamedTempFile::new().expect("db");
    let id = {
        let store = SqliteStore::open(db.path()).expect("open");
        let experiment = running_experiment(&store, 9);
        store
            .increment(
                &BucketKey::at(experiment.id, Variant::Treatment, t0()),
                BucketDelta::CONVERSION,
            )
            .unwrap();
        experiment.id
    };
    let store = SqliteStore::open(db.path()).expect("reopen");
    let experiment = store.experiment(id).unwrap();
    assert_eq!(experiment.status, Status::Running);
    assert_eq!(experiment.first_started_at, Some(t0()));
    assert_eq!(store.totals(id).unwrap().treatment_conversions, 1);
}

#[test]
fn oversized_sample_size_is_rejected_without_insert() {
    for (name, store) in backends() {
        let mut new = new_experiment("huge");
        new.sample_size = u64::MAX;
        let err = store
            .create_experiment(PageId::from_raw(1), &new, t0())
            .unwrap_err();
        assert!(matches!(err, AbtError::Validation(_)), "{name}");
        assert_eq!(err.info().code, "sample-size-too-large", "{name}");
        assert!(
            store
                .list_experiments(&ExperimentFilter::default())
                .unwrap()
                .is_empty(),
            "{name}"
        );
    }
}

#[test]
fn schema_version_mismatch_is_a_storage_error() {
    let db = NamedTempFile::new().expect("db");
    drop(SqliteStore::open(db.path()).expect("open"));
    {
        let conn = rusqlite::Connection::open(db.path()).expect("raw open");
        conn.execute("UPDATE meta SET version = 99", []).expect("bump");
    }
    let err = SqliteStore::open(db.path()).unwrap_err();
    assert!(matches!(err, AbtError::Storage(_)));
    assert_eq!(err.info().code, "store-schema-version");
    assert!(err.info().hint.is_some());
}

fn two_instances(db: &NamedTempFile) -> [Arc<SqliteStore>; 2] {
    // Two connections on one file behave like two service instances.
    [
        Arc::new(SqliteStore::open(db.path()).expect("open a")),
        Arc::new(SqliteStore::open(db.path()).expect("open b")),
    ]
}

#[test]
fn concurrent_creates_on_one_page_admit_a_single_experiment() {
    let db = NamedTempFile::new().expect("db");
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = two_instances(&db)
        .into_iter()
        .map(|store| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                store.create_experiment(PageId::from_raw(1), &new_experiment("race"), t0())
            })
        })
        .collect();
    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("worker"))
        .collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(AbtError::DuplicateActiveExperiment(_)))));
}

#[test]
fn concurrent_starts_of_one_draft_apply_once() {
    let db = NamedTempFile::new().expect("db");
    let stores = two_instances(&db);
    let draft = stores[0]
        .create_experiment(PageId::from_raw(1), &new_experiment("race"), t0())
        .unwrap();
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = stores
        .into_iter()
        .enumerate()
        .map(|(idx, store)| {
            let barrier = Arc::clone(&barrier);
            let mut running = draft.clone();
            running.status = Status::Running;
            running.first_started_at = Some(t0() + Duration::minutes(idx as i64));
            running.last_started_at = running.first_started_at;
            thread::spawn(move || {
                barrier.wait();
                store.commit_transition(Status::Draft, &running)
            })
        })
        .collect();
    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("worker"))
        .collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(AbtError::InvalidTransition(info)) if info.code == "stale-transition")));
}
