use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::job::{JobContext, MapOutput, MapReduceJob, ReduceValue};
use crate::jobs::{count_values, success_key, JobName};
use crate::{Entity, EntityKind, JobError, Record, RightsKind, RightsSnapshot};

/// Widens `all_user_ids` on current rights records with the role ids found in
/// their historical snapshots.
///
/// Each map call reloads the current record and writes it back with a
/// revision check, retrying on conflict, so concurrent merges into the same
/// record do not lose each other's ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddAllUserIdsSnapshotsJob;

pub struct SnapshotInput(pub RightsSnapshot);

impl TryFrom<Entity> for SnapshotInput {
    type Error = JobError;

    fn try_from(entity: Entity) -> Result<Self, Self::Error> {
        match entity.record {
            Record::RightsSnapshot(snapshot) => Ok(Self(snapshot)),
            other => Err(JobError::UnexpectedEntity {
                expected: "rights snapshot content",
                kind: other.kind(),
            }),
        }
    }
}

impl MapReduceJob for AddAllUserIdsSnapshotsJob {
    type Input = SnapshotInput;

    fn name(&self) -> &'static str {
        JobName::AddAllUserIdsSnapshots.as_str()
    }

    fn entity_classes_to_map_over(&self) -> Vec<EntityKind> {
        vec![
            EntityKind::CollectionRightsSnapshotContentModel,
            EntityKind::ExplorationRightsSnapshotContentModel,
            EntityKind::TopicRightsSnapshotContentModel,
        ]
    }

    fn map(
        &self,
        input: SnapshotInput,
        ctx: &mut JobContext<'_>,
    ) -> Result<Vec<MapOutput>, JobError> {
        let SnapshotInput(snapshot) = input;
        let reconstructed = snapshot.reconstruct()?;
        let role_user_ids = reconstructed.role_user_ids();
        merge_user_ids(ctx, snapshot.rights_kind, reconstructed.id(), role_user_ids)?;

        Ok(vec![(success_key(snapshot.rights_kind.snapshot_entity_kind()), snapshot.id)])
    }

    fn reduce(&self, key: &str, values: Vec<String>) -> Vec<(String, ReduceValue)> {
        count_values(key, &values)
    }
}

fn merge_user_ids(
    ctx: &mut JobContext<'_>,
    kind: RightsKind,
    id: &str,
    user_ids: BTreeSet<String>,
) -> Result<(), JobError> {
    let mut attempt = 1;
    loop {
        let (meta, mut rights) = ctx.store.get_rights(kind, id)?;
        let missing =
            user_ids.iter().filter(|user_id| !rights.all_user_ids().contains(user_id)).count();
        if missing == 0 {
            debug!(?kind, id, "snapshot role ids already present");
            return Ok(());
        }

        rights.widen_all_user_ids(user_ids.iter().cloned());
        match ctx.store.put(&Entity::new(meta, Record::Rights(rights)), false) {
            Ok(_) => {
                debug!(?kind, id, added = missing, "widened all_user_ids from snapshot");
                return Ok(());
            }
            Err(err @ JobError::Conflict { .. }) if attempt < ctx.config.max_write_attempts => {
                warn!(?kind, id, attempt, error = %err, "rights record changed during merge");
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::{json, Map, Value};
    use time::OffsetDateTime;

    use super::*;
    use crate::store::Datastore;
    use crate::{
        JobConfig, MemoryStore, RecordMeta, RecordingIndexer, RightsRecord, TopicRights,
    };

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture should be a JSON object: {other}"),
        }
    }

    fn stored(record: Record) -> Entity {
        Entity::new(RecordMeta::new(OffsetDateTime::UNIX_EPOCH), record)
    }

    fn snapshot(kind: RightsKind, id: &str, content: Value) -> RightsSnapshot {
        RightsSnapshot { id: id.to_string(), rights_kind: kind, content: object(content) }
    }

    fn run_map(
        store: &mut dyn Datastore,
        snapshot: RightsSnapshot,
        config: &JobConfig,
    ) -> Result<Vec<MapOutput>, JobError> {
        let mut search = RecordingIndexer::default();
        let mut ctx = JobContext { store, search: &mut search, config };
        AddAllUserIdsSnapshotsJob.map(SnapshotInput(snapshot), &mut ctx)
    }

    fn seeded_exploration(all_user_ids: &[&str]) -> Result<MemoryStore, JobError> {
        let mut store = MemoryStore::new();
        let rights: RightsRecord = serde_json::from_value(json!({
            "rights_type": "exploration",
            "rights": {
                "id": "exp_1",
                "owner_ids": ["uid_owner"],
                "all_user_ids": all_user_ids,
            }
        }))
        .map_err(|err| JobError::Validation(err.to_string()))?;
        store.insert(stored(Record::Rights(rights)));
        Ok(store)
    }

    #[test]
    fn exploration_snapshot_widens_current_record() -> Result<(), JobError> {
        let mut store = seeded_exploration(&["uid_owner"])?;
        let snapshot = snapshot(
            RightsKind::Exploration,
            "exp_1-2",
            json!({
                "id": "exp_1",
                "owner_ids": ["uid_former_owner"],
                "translator_ids": ["uid_translator"],
                "status": "publicized"
            }),
        );
        let output = run_map(&mut store, snapshot, &JobConfig::default())?;
        assert_eq!(
            output,
            vec![(
                "SUCCESS - ExplorationRightsSnapshotContentModel".to_string(),
                "exp_1-2".to_string()
            )]
        );

        let (meta, rights) = store.get_rights(RightsKind::Exploration, "exp_1")?;
        assert_eq!(
            rights.all_user_ids(),
            ids(&["uid_former_owner", "uid_owner", "uid_translator"]).as_slice()
        );
        assert_eq!(meta.last_updated, OffsetDateTime::UNIX_EPOCH);
        Ok(())
    }

    #[test]
    fn topic_snapshot_merges_snapshot_managers() -> Result<(), JobError> {
        let mut store = MemoryStore::new();
        store.insert(stored(Record::Rights(RightsRecord::Topic(TopicRights {
            id: "topic_1".to_string(),
            manager_ids: ids(&["uid_current"]),
            topic_is_published: false,
            all_user_ids: ids(&["uid_current"]),
        }))));

        run_map(
            &mut store,
            snapshot(
                RightsKind::Topic,
                "topic_1-1",
                json!({ "id": "topic_1", "manager_ids": ["uid_historic"] }),
            ),
            &JobConfig::default(),
        )?;

        let (_, rights) = store.get_rights(RightsKind::Topic, "topic_1")?;
        assert_eq!(rights.all_user_ids(), ids(&["uid_current", "uid_historic"]).as_slice());
        Ok(())
    }

    #[test]
    fn missing_current_record_fails_the_map_call() {
        let mut store = MemoryStore::new();
        let result = run_map(
            &mut store,
            snapshot(RightsKind::Collection, "col_9-4", json!({ "id": "col_9" })),
            &JobConfig::default(),
        );

        match result {
            Err(JobError::NotFound { kind: EntityKind::CollectionRightsModel, id }) => {
                assert_eq!(id, "col_9");
            }
            other => panic!("expected not found, got {other:?}"),
        }
    }

    #[test]
    fn already_merged_snapshot_skips_the_write() -> Result<(), JobError> {
        let mut store = seeded_exploration(&["uid_owner", "uid_viewer"])?;
        run_map(
            &mut store,
            snapshot(RightsKind::Exploration, "exp_1-1", json!({ "viewer_ids": ["uid_viewer"] })),
            &JobConfig::default(),
        )?;

        let (meta, _) = store.get_rights(RightsKind::Exploration, "exp_1")?;
        assert_eq!(meta.revision, 0);
        Ok(())
    }

    /// Store whose first `put` loses a race against another writer.
    struct RacingStore {
        inner: MemoryStore,
        raced: bool,
    }

    impl Datastore for RacingStore {
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
            if !self.raced {
                self.raced = true;
                let mut competing = self.inner.get_by_id(entity.kind(), entity.id())?;
                if let Record::Rights(rights) = &mut competing.record {
                    rights.widen_all_user_ids(vec!["uid_concurrent".to_string()]);
                }
                self.inner.put(&competing, false)?;
            }
            self.inner.put(entity, update_last_updated_time)
        }
    }

    #[test]
    fn conflicting_write_is_retried_without_losing_ids() -> Result<(), JobError> {
        let mut store = RacingStore { inner: seeded_exploration(&["uid_owner"])?, raced: false };
        run_map(
            &mut store,
            snapshot(RightsKind::Exploration, "exp_1-5", json!({ "editor_ids": ["uid_editor"] })),
            &JobConfig::default(),
        )?;

        let (meta, rights) = store.inner.get_rights(RightsKind::Exploration, "exp_1")?;
        assert_eq!(
            rights.all_user_ids(),
            ids(&["uid_concurrent", "uid_editor", "uid_owner"]).as_slice()
        );
        assert_eq!(meta.revision, 2);
        Ok(())
    }

    #[test]
    fn conflict_surfaces_once_write_attempts_are_exhausted() -> Result<(), JobError> {
        let mut store = RacingStore { inner: seeded_exploration(&["uid_owner"])?, raced: false };
        let config = JobConfig { max_write_attempts: 1, ..JobConfig::default() };
        let result = run_map(
            &mut store,
            snapshot(RightsKind::Exploration, "exp_1-5", json!({ "editor_ids": ["uid_editor"] })),
            &config,
        );

        assert!(matches!(result, Err(JobError::Conflict { .. })));
        Ok(())
    }

    proptest! {
        #[test]
        fn property_merge_is_superset_of_before_and_snapshot(
            existing in proptest::collection::vec("uid_[a-e]", 0..5),
            historic in proptest::collection::vec("uid_[c-h]", 0..5),
        ) {
            let mut store = MemoryStore::new();
            store.insert(stored(Record::Rights(RightsRecord::Topic(TopicRights {
                id: "topic_1".to_string(),
                manager_ids: vec![],
                topic_is_published: false,
                all_user_ids: existing.clone(),
            }))));

            let result = run_map(
                &mut store,
                snapshot(
                    RightsKind::Topic,
                    "topic_1-3",
                    json!({ "id": "topic_1", "manager_ids": historic }),
                ),
                &JobConfig::default(),
            );
            prop_assert!(result.is_ok());

            let after = store.get_rights(RightsKind::Topic, "topic_1");
            prop_assert!(after.is_ok());
            let (_, after) = after.unwrap_or_else(|_| unreachable!());
            let after: BTreeSet<String> = after.all_user_ids().iter().cloned().collect();

            prop_assert!(existing.iter().all(|id| after.contains(id)));
            prop_assert!(historic.iter().all(|id| after.contains(id)));
        }
    }
}
