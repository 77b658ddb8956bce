use tracing::info;

use crate::job::{JobContext, MapOutput, MapReduceJob, ReduceValue, LEGACY_ADMIN_ID};
use crate::jobs::JobName;
use crate::{CommitLogEntry, Entity, EntityKind, JobError, Record, RecordMeta, SnapshotMetadata};

pub const RENAMED_SNAPSHOT_KEY: &str = "SUCCESS-RENAMED-SNAPSHOT";
pub const KEPT_SNAPSHOT_KEY: &str = "SUCCESS-KEPT-SNAPSHOT";
pub const RENAMED_COMMIT_KEY: &str = "SUCCESS-RENAMED-COMMIT";
pub const KEPT_COMMIT_KEY: &str = "SUCCESS-KEPT-COMMIT";

const KEPT_KEY_PREFIX: &str = "SUCCESS-KEPT";

/// Rewrites the legacy `"Admin"` actor id to the system committer id.
///
/// Renamed record ids are reported in full so the change can be audited or
/// reverted; untouched records are only counted.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceAdminIdJob;

pub enum ActorRecordInput {
    SnapshotMetadata(RecordMeta, SnapshotMetadata),
    CommitLog(RecordMeta, CommitLogEntry),
}

impl TryFrom<Entity> for ActorRecordInput {
    type Error = JobError;

    fn try_from(entity: Entity) -> Result<Self, Self::Error> {
        match entity.record {
            Record::SnapshotMetadata(metadata) => Ok(Self::SnapshotMetadata(entity.meta, metadata)),
            Record::CommitLog(entry) => Ok(Self::CommitLog(entity.meta, entry)),
            other => Err(JobError::UnexpectedEntity {
                expected: "snapshot metadata or commit log entry",
                kind: other.kind(),
            }),
        }
    }
}

impl MapReduceJob for ReplaceAdminIdJob {
    type Input = ActorRecordInput;

    fn name(&self) -> &'static str {
        JobName::ReplaceAdminId.as_str()
    }

    fn entity_classes_to_map_over(&self) -> Vec<EntityKind> {
        vec![
            EntityKind::ExplorationRightsSnapshotMetadataModel,
            EntityKind::ExplorationCommitLogEntryModel,
        ]
    }

    fn map(
        &self,
        input: ActorRecordInput,
        ctx: &mut JobContext<'_>,
    ) -> Result<Vec<MapOutput>, JobError> {
        let system_id = ctx.config.system_committer_id.clone();
        match input {
            ActorRecordInput::SnapshotMetadata(meta, mut metadata) => {
                if metadata.committer_id != LEGACY_ADMIN_ID {
                    return Ok(vec![(KEPT_SNAPSHOT_KEY.to_string(), metadata.id)]);
                }
                metadata.committer_id = system_id;
                let id = metadata.id.clone();
                ctx.store.put(&Entity::new(meta, Record::SnapshotMetadata(metadata)), false)?;
                info!(%id, "renamed legacy committer id on snapshot metadata");
                Ok(vec![(RENAMED_SNAPSHOT_KEY.to_string(), id)])
            }
            ActorRecordInput::CommitLog(meta, mut entry) => {
                if entry.user_id != LEGACY_ADMIN_ID {
                    return Ok(vec![(KEPT_COMMIT_KEY.to_string(), entry.id)]);
                }
                entry.user_id = system_id;
                let id = entry.id.clone();
                ctx.store.put(&Entity::new(meta, Record::CommitLog(entry)), false)?;
                info!(%id, "renamed legacy user id on commit log entry");
                Ok(vec![(RENAMED_COMMIT_KEY.to_string(), id)])
            }
        }
    }

    fn reduce(&self, key: &str, values: Vec<String>) -> Vec<(String, ReduceValue)> {
        if key.starts_with(KEPT_KEY_PREFIX) {
            vec![(key.to_string(), ReduceValue::Count(values.len()))]
        } else {
            vec![(key.to_string(), ReduceValue::Ids(values))]
        }
    }
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::store::Datastore;
    use crate::{ActivityStatus, JobConfig, MemoryStore, RecordingIndexer};

    fn commit(id: &str, user_id: &str) -> Entity {
        Entity::new(
            RecordMeta::new(OffsetDateTime::UNIX_EPOCH),
            Record::CommitLog(CommitLogEntry {
                id: id.to_string(),
                user_id: user_id.to_string(),
                exploration_id: "exp_1".to_string(),
                commit_type: "edit".to_string(),
                commit_message: "Changed title".to_string(),
                version: 2,
                post_commit_status: ActivityStatus::Public,
                post_commit_community_owned: false,
            }),
        )
    }

    fn metadata(id: &str, committer_id: &str) -> Entity {
        Entity::new(
            RecordMeta::new(OffsetDateTime::UNIX_EPOCH),
            Record::SnapshotMetadata(SnapshotMetadata {
                id: id.to_string(),
                committer_id: committer_id.to_string(),
                commit_type: "edit".to_string(),
                commit_message: "Release ownership".to_string(),
                commit_cmds: vec![],
            }),
        )
    }

    fn map_entity(store: &mut MemoryStore, entity: Entity) -> Result<Vec<MapOutput>, JobError> {
        store.insert(entity.clone());
        let mut search = RecordingIndexer::default();
        let config = JobConfig::default();
        let mut ctx = JobContext { store, search: &mut search, config: &config };
        ReplaceAdminIdJob.map(ActorRecordInput::try_from(entity)?, &mut ctx)
    }

    #[test]
    fn admin_commit_is_renamed_without_touching_timestamp() -> Result<(), JobError> {
        let mut store = MemoryStore::new();
        let output = map_entity(&mut store, commit("exploration-exp_1-2", "Admin"))?;
        assert_eq!(
            output,
            vec![(RENAMED_COMMIT_KEY.to_string(), "exploration-exp_1-2".to_string())]
        );

        let stored =
            store.get_by_id(EntityKind::ExplorationCommitLogEntryModel, "exploration-exp_1-2")?;
        let Record::CommitLog(entry) = stored.record else {
            panic!("commit log entry should stay a commit log entry");
        };
        assert_eq!(entry.user_id, "admin");
        assert_eq!(stored.meta.last_updated, OffsetDateTime::UNIX_EPOCH);
        assert_eq!(stored.meta.revision, 1);
        Ok(())
    }

    #[test]
    fn other_committers_are_kept_unchanged() -> Result<(), JobError> {
        let mut store = MemoryStore::new();
        for committer in ["uid_a", "admin", "ADMIN", "Admin "] {
            let id = format!("exp_1-{committer}");
            let output = map_entity(&mut store, metadata(&id, committer))?;
            assert_eq!(output, vec![(KEPT_SNAPSHOT_KEY.to_string(), id.clone())]);

            let stored = store.get_by_id(EntityKind::ExplorationRightsSnapshotMetadataModel, &id)?;
            assert_eq!(stored.meta.revision, 0);
        }
        Ok(())
    }

    #[test]
    fn admin_snapshot_metadata_uses_configured_system_id() -> Result<(), JobError> {
        let mut store = MemoryStore::new();
        let entity = metadata("exp_1-1", "Admin");
        store.insert(entity.clone());
        let mut search = RecordingIndexer::default();
        let config =
            JobConfig { system_committer_id: "system".to_string(), ..JobConfig::default() };
        let mut ctx = JobContext { store: &mut store, search: &mut search, config: &config };

        let output = ReplaceAdminIdJob.map(ActorRecordInput::try_from(entity)?, &mut ctx)?;
        assert_eq!(output, vec![(RENAMED_SNAPSHOT_KEY.to_string(), "exp_1-1".to_string())]);

        let stored =
            store.get_by_id(EntityKind::ExplorationRightsSnapshotMetadataModel, "exp_1-1")?;
        let Record::SnapshotMetadata(metadata) = stored.record else {
            panic!("snapshot metadata should stay snapshot metadata");
        };
        assert_eq!(metadata.committer_id, "system");
        Ok(())
    }

    #[test]
    fn reduce_counts_kept_and_lists_renamed() {
        let ids = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            ReplaceAdminIdJob.reduce(KEPT_COMMIT_KEY, ids.clone()),
            vec![(KEPT_COMMIT_KEY.to_string(), ReduceValue::Count(2))]
        );
        assert_eq!(
            ReplaceAdminIdJob.reduce(RENAMED_SNAPSHOT_KEY, ids.clone()),
            vec![(RENAMED_SNAPSHOT_KEY.to_string(), ReduceValue::Ids(ids))]
        );
    }
}
