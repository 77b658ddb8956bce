//! In-process, single-shard executor for [`MapReduceJob`]s.
//!
//! Records are mapped one at a time in scan order. Failed map calls are
//! retried while the error is transient, then reported per record; reduce
//! runs once per key after every record has been mapped, keys in
//! lexicographic order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::job::{JobConfig, JobContext, MapOutput, MapReduceJob, ReduceValue};
use crate::jobs::{
    AddAllUserIdsJob, AddAllUserIdsSnapshotsJob, IndexAllActivitiesJob, JobName, ReplaceAdminIdJob,
};
use crate::search::{RecordingIndexer, SearchIndexer};
use crate::store::{Datastore, DryRunStore};
use crate::{Entity, EntityKind, JobError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    CompletedWithFailures,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MapFailure {
    pub kind: EntityKind,
    pub id: String,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReduceOutput {
    pub key: String,
    pub value: ReduceValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PendingWrite {
    pub kind: EntityKind,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct JobReport {
    pub job: String,
    pub entity_classes: Vec<EntityKind>,
    pub dry_run: bool,
    pub status: JobStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub mapped_records: usize,
    pub failures: Vec<MapFailure>,
    pub output: Vec<ReduceOutput>,
    /// Writes a dry run would have made. Always empty for real runs.
    #[serde(default)]
    pub pending_writes: Vec<PendingWrite>,
}

impl JobReport {
    /// Aggregate emitted for `key`, if reduce produced one.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&ReduceValue> {
        self.output.iter().find(|output| output.key == key).map(|output| &output.value)
    }
}

pub struct JobRunner<'a> {
    store: &'a mut dyn Datastore,
    search: &'a mut dyn SearchIndexer,
    config: JobConfig,
}

struct Outcome {
    mapped_records: usize,
    failures: Vec<MapFailure>,
    output: Vec<ReduceOutput>,
}

impl<'a> JobRunner<'a> {
    /// # Errors
    /// Returns [`JobError::Validation`] when `config` is invalid.
    pub fn new(
        store: &'a mut dyn Datastore,
        search: &'a mut dyn SearchIndexer,
        config: JobConfig,
    ) -> Result<Self, JobError> {
        config.validate()?;
        Ok(Self { store, search, config })
    }

    #[must_use]
    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Run one registered job by name.
    ///
    /// # Errors
    /// See [`JobRunner::run`].
    pub fn run_named(&mut self, name: JobName) -> Result<JobReport, JobError> {
        match name {
            JobName::IndexAllActivities => self.run(&IndexAllActivitiesJob),
            JobName::AddAllUserIds => self.run(&AddAllUserIdsJob),
            JobName::AddAllUserIdsSnapshots => self.run(&AddAllUserIdsSnapshotsJob),
            JobName::ReplaceAdminId => self.run(&ReplaceAdminIdJob),
        }
    }

    /// Map every record the job scans, then reduce each emitted key.
    ///
    /// In dry-run mode writes go to an in-memory overlay and indexing to a
    /// recording indexer; neither collaborator of the runner is touched.
    ///
    /// # Errors
    /// Returns an error only when a record class cannot be scanned. Per-record
    /// failures are reported in [`JobReport::failures`].
    pub fn run<J: MapReduceJob>(&mut self, job: &J) -> Result<JobReport, JobError> {
        let started_at = OffsetDateTime::now_utc();
        let dry_run = self.config.dry_run;
        info!(job = job.name(), dry_run, "starting job");

        let (outcome, pending_writes) = if dry_run {
            let mut overlay = DryRunStore::new(&*self.store);
            let mut search = RecordingIndexer::default();
            let outcome = execute(job, &mut overlay, &mut search, &self.config)?;
            let pending = overlay
                .pending_writes()
                .into_iter()
                .map(|entity| PendingWrite { kind: entity.kind(), id: entity.id().to_string() })
                .collect();
            (outcome, pending)
        } else {
            (execute(job, &mut *self.store, &mut *self.search, &self.config)?, Vec::new())
        };

        let status = if outcome.failures.is_empty() {
            JobStatus::Completed
        } else {
            JobStatus::CompletedWithFailures
        };
        info!(
            job = job.name(),
            mapped = outcome.mapped_records,
            failed = outcome.failures.len(),
            keys = outcome.output.len(),
            "job finished"
        );

        Ok(JobReport {
            job: job.name().to_string(),
            entity_classes: job.entity_classes_to_map_over(),
            dry_run,
            status,
            started_at,
            finished_at: OffsetDateTime::now_utc(),
            mapped_records: outcome.mapped_records,
            failures: outcome.failures,
            output: outcome.output,
            pending_writes,
        })
    }
}

fn execute<J: MapReduceJob>(
    job: &J,
    store: &mut dyn Datastore,
    search: &mut dyn SearchIndexer,
    config: &JobConfig,
) -> Result<Outcome, JobError> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut failures = Vec::new();
    let mut mapped_records = 0;

    for kind in job.entity_classes_to_map_over() {
        let entities = store.scan(kind)?;
        debug!(job = job.name(), %kind, records = entities.len(), "mapping record class");

        for entity in entities {
            mapped_records += 1;
            match map_with_retry(job, entity, store, search, config) {
                Ok(pairs) => {
                    for (key, value) in pairs {
                        grouped.entry(key).or_default().push(value);
                    }
                }
                Err(failure) => {
                    warn!(
                        job = job.name(),
                        kind = %failure.kind,
                        id = %failure.id,
                        attempts = failure.attempts,
                        error = %failure.error,
                        "map failed"
                    );
                    failures.push(failure);
                }
            }
        }
    }

    let output = grouped
        .into_iter()
        .flat_map(|(key, values)| job.reduce(&key, values))
        .map(|(key, value)| ReduceOutput { key, value })
        .collect();

    Ok(Outcome { mapped_records, failures, output })
}

/// Map one record, reloading it from the store before each retry.
fn map_with_retry<J: MapReduceJob>(
    job: &J,
    entity: Entity,
    store: &mut dyn Datastore,
    search: &mut dyn SearchIndexer,
    config: &JobConfig,
) -> Result<Vec<MapOutput>, MapFailure> {
    let kind = entity.kind();
    let id = entity.id().to_string();
    let failure = |attempts: u32, err: &JobError| MapFailure {
        kind,
        id: id.clone(),
        attempts,
        error: err.to_string(),
    };

    let mut next = Some(entity);
    let mut attempt = 1;
    loop {
        let entity = match next.take() {
            Some(entity) => entity,
            None => store.get_by_id(kind, &id).map_err(|err| failure(attempt, &err))?,
        };
        let input = J::Input::try_from(entity).map_err(|err| failure(attempt, &err))?;

        let mut ctx = JobContext { store: &mut *store, search: &mut *search, config };
        match job.map(input, &mut ctx) {
            Ok(pairs) => return Ok(pairs),
            Err(err) if err.is_retryable() && attempt < config.max_map_attempts => {
                debug!(%kind, %id, attempt, error = %err, "retrying map call");
                attempt += 1;
            }
            Err(err) => return Err(failure(attempt, &err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::jobs::{KEPT_COMMIT_KEY, RENAMED_COMMIT_KEY};
    use crate::search::SearchIndexName;
    use crate::{
        ActivityRights, ActivityStatus, ActivitySummary, ActivityType, CommitLogEntry,
        MemoryStore, Record, RecordMeta, RightsKind, RightsRecord, RightsSnapshot,
    };

    fn at_epoch(record: Record) -> Entity {
        Entity::new(RecordMeta::new(OffsetDateTime::UNIX_EPOCH), record)
    }

    fn commit(id: &str, user_id: &str) -> Entity {
        at_epoch(Record::CommitLog(CommitLogEntry {
            id: id.to_string(),
            user_id: user_id.to_string(),
            exploration_id: "exp_1".to_string(),
            commit_type: "edit".to_string(),
            commit_message: String::new(),
            version: 1,
            post_commit_status: ActivityStatus::Private,
            post_commit_community_owned: false,
        }))
    }

    fn collection_rights(id: &str, owners: &[&str], viewers: &[&str]) -> Entity {
        at_epoch(Record::Rights(RightsRecord::Collection(ActivityRights {
            id: id.to_string(),
            owner_ids: owners.iter().map(ToString::to_string).collect(),
            editor_ids: vec![],
            voice_artist_ids: vec![],
            viewer_ids: viewers.iter().map(ToString::to_string).collect(),
            community_owned: false,
            viewable_if_private: false,
            status: ActivityStatus::Private,
            first_published_msec: None,
            all_user_ids: vec![],
        })))
    }

    fn summary(id: &str, activity_type: ActivityType, deleted: bool) -> Entity {
        at_epoch(Record::Summary(ActivitySummary {
            id: id.to_string(),
            activity_type,
            title: id.to_string(),
            category: String::new(),
            objective: String::new(),
            language_code: "en".to_string(),
            tags: vec![],
            ratings: BTreeMap::new(),
            deleted,
        }))
    }

    fn run(
        store: &mut MemoryStore,
        search: &mut RecordingIndexer,
        name: JobName,
        config: JobConfig,
    ) -> Result<JobReport, JobError> {
        let mut runner = JobRunner::new(store, search, config)?;
        runner.run_named(name)
    }

    #[test]
    fn replace_admin_id_reports_renamed_ids_and_kept_counts() -> Result<(), JobError> {
        let mut store = MemoryStore::new();
        store.insert(commit("exploration-exp_1-1", "Admin"));
        store.insert(commit("exploration-exp_1-2", "uid_a"));
        store.insert(commit("exploration-exp_1-3", "uid_b"));
        let mut search = RecordingIndexer::default();

        let report =
            run(&mut store, &mut search, JobName::ReplaceAdminId, JobConfig::default())?;

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.mapped_records, 3);
        assert_eq!(
            report.value(RENAMED_COMMIT_KEY),
            Some(&ReduceValue::Ids(vec!["exploration-exp_1-1".to_string()]))
        );
        assert_eq!(report.value(KEPT_COMMIT_KEY), Some(&ReduceValue::Count(2)));
        Ok(())
    }

    #[test]
    fn reduce_keys_are_sorted() -> Result<(), JobError> {
        let mut store = MemoryStore::new();
        store.insert(commit("c1", "uid_a"));
        store.insert(commit("c2", "Admin"));
        let mut search = RecordingIndexer::default();

        let report =
            run(&mut store, &mut search, JobName::ReplaceAdminId, JobConfig::default())?;
        let keys: Vec<&str> = report.output.iter().map(|output| output.key.as_str()).collect();
        assert_eq!(keys, vec![KEPT_COMMIT_KEY, RENAMED_COMMIT_KEY]);
        Ok(())
    }

    #[test]
    fn add_all_user_ids_counts_per_class() -> Result<(), JobError> {
        let mut store = MemoryStore::new();
        store.insert(collection_rights("col_1", &["uid_a"], &["uid_c"]));
        store.insert(collection_rights("col_2", &["uid_b"], &[]));
        let mut search = RecordingIndexer::default();

        let report = run(&mut store, &mut search, JobName::AddAllUserIds, JobConfig::default())?;
        assert_eq!(
            report.value("SUCCESS - CollectionRightsModel"),
            Some(&ReduceValue::Count(2))
        );
        assert_eq!(report.output.len(), 1);
        Ok(())
    }

    #[test]
    fn index_job_emits_no_output_and_skips_deleted() -> Result<(), JobError> {
        let mut store = MemoryStore::new();
        store.insert(summary("exp_1", ActivityType::Exploration, false));
        store.insert(summary("exp_2", ActivityType::Exploration, true));
        store.insert(summary("col_1", ActivityType::Collection, false));
        let mut search = RecordingIndexer::default();

        let report =
            run(&mut store, &mut search, JobName::IndexAllActivities, JobConfig::default())?;
        assert!(report.output.is_empty());
        assert_eq!(report.mapped_records, 3);
        assert_eq!(search.call_count(SearchIndexName::Explorations), 1);
        assert_eq!(search.call_count(SearchIndexName::Collections), 1);
        Ok(())
    }

    #[test]
    fn missing_parent_is_reported_as_record_failure() -> Result<(), JobError> {
        let mut store = MemoryStore::new();
        let content = match json!({ "id": "col_missing", "owner_ids": ["uid_a"] }) {
            serde_json::Value::Object(map) => map,
            other => panic!("fixture should be an object: {other}"),
        };
        store.insert(at_epoch(Record::RightsSnapshot(RightsSnapshot {
            id: "col_missing-1".to_string(),
            rights_kind: RightsKind::Collection,
            content,
        })));
        let mut search = RecordingIndexer::default();

        let report =
            run(&mut store, &mut search, JobName::AddAllUserIdsSnapshots, JobConfig::default())?;

        assert_eq!(report.status, JobStatus::CompletedWithFailures);
        assert!(report.output.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id, "col_missing-1");
        assert_eq!(report.failures[0].attempts, 1);
        Ok(())
    }

    #[test]
    fn snapshot_job_widens_parent_and_leaves_snapshot_as_stored() -> Result<(), JobError> {
        let mut store = MemoryStore::new();
        store.insert(at_epoch(Record::Rights(RightsRecord::Exploration(ActivityRights {
            id: "exp_1".to_string(),
            owner_ids: vec!["uid_owner".to_string()],
            editor_ids: vec![],
            voice_artist_ids: vec![],
            viewer_ids: vec![],
            community_owned: false,
            viewable_if_private: false,
            status: ActivityStatus::Public,
            first_published_msec: None,
            all_user_ids: vec!["uid_owner".to_string()],
        }))));
        let content = match json!({
            "id": "exp_1",
            "owner_ids": ["uid_former_owner"],
            "translator_ids": ["uid_translator"],
            "status": "publicized"
        }) {
            serde_json::Value::Object(map) => map,
            other => panic!("fixture should be an object: {other}"),
        };
        let seeded = at_epoch(Record::RightsSnapshot(RightsSnapshot {
            id: "exp_1-1".to_string(),
            rights_kind: RightsKind::Exploration,
            content,
        }));
        store.insert(seeded.clone());
        let mut search = RecordingIndexer::default();

        let report =
            run(&mut store, &mut search, JobName::AddAllUserIdsSnapshots, JobConfig::default())?;
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(
            report.value("SUCCESS - ExplorationRightsSnapshotContentModel"),
            Some(&ReduceValue::Count(1))
        );

        let reloaded =
            store.get_by_id(EntityKind::ExplorationRightsSnapshotContentModel, "exp_1-1")?;
        assert_eq!(reloaded, seeded);
        assert_eq!(reloaded.meta.revision, 0);
        let Record::RightsSnapshot(snapshot) = &reloaded.record else {
            panic!("expected a rights snapshot, got {:?}", reloaded.record);
        };
        assert_eq!(snapshot.content.get("status"), Some(&json!("publicized")));
        assert_eq!(snapshot.content.get("translator_ids"), Some(&json!(["uid_translator"])));

        let (_, rights) = store.get_rights(RightsKind::Exploration, "exp_1")?;
        assert_eq!(
            rights.all_user_ids(),
            ["uid_former_owner", "uid_owner", "uid_translator"].map(String::from).as_slice()
        );
        Ok(())
    }

    #[test]
    fn dry_run_leaves_store_and_index_untouched() -> Result<(), JobError> {
        let mut store = MemoryStore::new();
        store.insert(collection_rights("col_1", &["uid_a"], &["uid_c"]));
        store.insert(summary("exp_1", ActivityType::Exploration, false));
        let mut search = RecordingIndexer::default();
        let config = JobConfig { dry_run: true, ..JobConfig::default() };

        let report = run(&mut store, &mut search, JobName::AddAllUserIds, config.clone())?;
        assert!(report.dry_run);
        assert_eq!(
            report.pending_writes,
            vec![PendingWrite { kind: EntityKind::CollectionRightsModel, id: "col_1".to_string() }]
        );
        let (meta, rights) = store.get_rights(RightsKind::Collection, "col_1")?;
        assert_eq!(meta.revision, 0);
        assert!(rights.all_user_ids().is_empty());

        run(&mut store, &mut search, JobName::IndexAllActivities, config)?;
        assert!(search.calls().is_empty());
        Ok(())
    }

    #[test]
    fn invalid_config_is_rejected_before_running() {
        let mut store = MemoryStore::new();
        let mut search = RecordingIndexer::default();
        let config = JobConfig { max_map_attempts: 0, ..JobConfig::default() };
        assert!(matches!(
            JobRunner::new(&mut store, &mut search, config),
            Err(JobError::Validation(_))
        ));
    }

    /// Store whose writes fail transiently a fixed number of times.
    struct FlakyStore {
        inner: MemoryStore,
        failures_left: u32,
        puts: u32,
    }

    impl Datastore for FlakyStore {
        fn scan(&self, kind: EntityKind) -> Result<Vec<Entity>, JobError> {
            self.inner.scan(kind)
        }

        fn get_by_id(&self, kind: EntityKind, id: &str) -> Result<Entity, JobError> {
            self.inner.get_by_id(kind, id)
        }

        fn put(
            &mut self,
            entity: &Entity,
            update_last_updated_time: bool,
        ) -> Result<RecordMeta, JobError> {
            self.puts += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(JobError::Store("database is locked".to_string()));
            }
            self.inner.put(entity, update_last_updated_time)
        }
    }

    #[test]
    fn transient_failures_are_retried_up_to_the_budget() -> Result<(), JobError> {
        let mut inner = MemoryStore::new();
        inner.insert(commit("c1", "Admin"));
        let mut store = FlakyStore { inner, failures_left: 2, puts: 0 };
        let mut search = RecordingIndexer::default();

        let report = JobRunner::new(&mut store, &mut search, JobConfig::default())?
            .run_named(JobName::ReplaceAdminId)?;
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(store.puts, 3);

        let mut inner = MemoryStore::new();
        inner.insert(commit("c1", "Admin"));
        let mut store = FlakyStore { inner, failures_left: 5, puts: 0 };
        let report = JobRunner::new(&mut store, &mut search, JobConfig::default())?
            .run_named(JobName::ReplaceAdminId)?;
        assert_eq!(report.status, JobStatus::CompletedWithFailures);
        assert_eq!(report.failures[0].attempts, 3);
        Ok(())
    }
}
