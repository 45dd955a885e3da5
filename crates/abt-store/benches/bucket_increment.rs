use abt_core::{BucketDelta, BucketKey, Goal, NewExperiment, PageId, Status, Variant};
use abt_store::{BucketStore, ExperimentStore, MemoryStore, SqliteStore, Store};
use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn running(store: &dyn Store) -> abt_core::ExperimentId {
    let start = Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap();
    let draft = store
        .create_experiment(
            PageId::from_raw(1),
            &NewExperiment {
                name: "bench".into(),
                hypothesis: String::new(),
                goal: Goal {
                    event: "visit-page".into(),
                    page: None,
                },
                sample_size: 1_000_000,
                treatment_revision: None,
            },
            start,
        )
        .unwrap();
    let mut started = draft.clone();
    started.status = Status::Running;
    started.first_started_at = Some(start);
    started.last_started_at = Some(start);
    store.commit_transition(Status::Draft, &started).unwrap();
    draft.id
}

fn increment_bench(c: &mut Criterion) {
    let start = Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap();
    let keys: Vec<_> = (0..48)
        .flat_map(|hour| {
            Variant::ALL.map(|variant| (variant, start + Duration::hours(hour)))
        })
        .collect();

    let memory = MemoryStore::new();
    let memory_id = running(&memory);
    c.bench_function("memory_increment", |b| {
        b.iter(|| {
            for (variant, at) in &keys {
                let key = BucketKey::at(memory_id, *variant, *at);
                black_box(memory.increment(&key, BucketDelta::PARTICIPANT).unwrap());
            }
        });
    });

    let sqlite = SqliteStore::open_in_memory().unwrap();
    let sqlite_id = running(&sqlite);
    c.bench_function("sqlite_increment", |b| {
        b.iter(|| {
            for (variant, at) in &keys {
                let key = BucketKey::at(sqlite_id, *variant, *at);
                black_box(sqlite.increment(&key, BucketDelta::PARTICIPANT).unwrap());
            }
        });
    });
}

criterion_group!(benches, increment_bench);
criterion_main!(benches);
