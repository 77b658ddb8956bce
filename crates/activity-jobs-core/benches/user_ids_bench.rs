use activity_jobs_core::{
    ActivityRights, ActivityStatus, Entity, JobConfig, JobName, JobRunner, MemoryStore, Record,
    RecordMeta, RecordingIndexer, RightsKind, RightsRecord, RightsSnapshot,
};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::{json, Value};
use time::OffsetDateTime;

fn uids(prefix: &str, index: usize, count: usize) -> Vec<String> {
    (0..count).map(|offset| format!("uid_{prefix}_{}", (index + offset) % 97)).collect()
}

fn mk_rights(index: usize) -> Entity {
    Entity::new(
        RecordMeta::new(OffsetDateTime::UNIX_EPOCH),
        Record::Rights(RightsRecord::Exploration(ActivityRights {
            id: format!("exp_{index}"),
            owner_ids: uids("owner", index, 2),
            editor_ids: uids("editor", index, 3),
            voice_artist_ids: uids("voice", index, 1),
            viewer_ids: uids("viewer", index, 4),
            community_owned: false,
            viewable_if_private: false,
            status: ActivityStatus::Public,
            first_published_msec: Some(1.0e12),
            all_user_ids: Vec::new(),
        })),
    )
}

fn mk_snapshot(index: usize, version: usize) -> Entity {
    let content = match json!({
        "owner_ids": uids("former", index + version, 2),
        "translator_ids": uids("translator", index, 1),
        "status": "publicized",
    }) {
        Value::Object(map) => map,
        other => panic!("snapshot fixture should be an object: {other}"),
    };
    Entity::new(
        RecordMeta::new(OffsetDateTime::UNIX_EPOCH),
        Record::RightsSnapshot(RightsSnapshot {
            id: format!("exp_{index}-{version}"),
            rights_kind: RightsKind::Exploration,
            content,
        }),
    )
}

fn seeded_store(records: usize, snapshots_per_record: usize) -> MemoryStore {
    let mut store = MemoryStore::new();
    for index in 0..records {
        store.insert(mk_rights(index));
        for version in 1..=snapshots_per_record {
            store.insert(mk_snapshot(index, version));
        }
    }
    store
}

fn run_job(store: &mut MemoryStore, name: JobName) {
    let mut search = RecordingIndexer::default();
    let report = JobRunner::new(store, &mut search, JobConfig::default())
        .and_then(|mut runner| runner.run_named(name));
    if let Err(err) = report {
        panic!("{name} benchmark run failed: {err}");
    }
}

fn bench_add_all_user_ids(c: &mut Criterion) {
    let store = seeded_store(1_000, 0);
    c.bench_function("add_all_user_ids_1000_rights", |b| {
        b.iter_batched(
            || store.clone(),
            |mut store| run_job(&mut store, JobName::AddAllUserIds),
            BatchSize::LargeInput,
        );
    });
}

fn bench_add_all_user_ids_snapshots(c: &mut Criterion) {
    let store = seeded_store(200, 5);
    c.bench_function("add_all_user_ids_snapshots_200x5", |b| {
        b.iter_batched(
            || store.clone(),
            |mut store| run_job(&mut store, JobName::AddAllUserIdsSnapshots),
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(user_ids_benches, bench_add_all_user_ids, bench_add_all_user_ids_snapshots);
criterion_main!(user_ids_benches);
