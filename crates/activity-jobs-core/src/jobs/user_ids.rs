use tracing::debug;

use crate::job::{JobContext, MapOutput, MapReduceJob, ReduceValue};
use crate::jobs::{count_values, success_key, JobName};
use crate::{Entity, EntityKind, JobError, Record, RecordMeta, RightsRecord};

/// Sets `all_user_ids` on every rights record to the union of its role lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddAllUserIdsJob;

pub struct RightsInput {
    pub meta: RecordMeta,
    pub rights: RightsRecord,
}

impl TryFrom<Entity> for RightsInput {
    type Error = JobError;

    fn try_from(entity: Entity) -> Result<Self, Self::Error> {
        match entity.record {
            Record::Rights(rights) => Ok(Self { meta: entity.meta, rights }),
            other => {
                Err(JobError::UnexpectedEntity { expected: "rights record", kind: other.kind() })
            }
        }
    }
}

impl MapReduceJob for AddAllUserIdsJob {
    type Input = RightsInput;

    fn name(&self) -> &'static str {
        JobName::AddAllUserIds.as_str()
    }

    fn entity_classes_to_map_over(&self) -> Vec<EntityKind> {
        vec![
            EntityKind::CollectionRightsModel,
            EntityKind::ExplorationRightsModel,
            EntityKind::TopicRightsModel,
        ]
    }

    fn map(
        &self,
        input: RightsInput,
        ctx: &mut JobContext<'_>,
    ) -> Result<Vec<MapOutput>, JobError> {
        let RightsInput { meta, mut rights } = input;
        let kind = rights.rights_kind().rights_entity_kind();
        let id = rights.id().to_string();

        let user_ids = rights.role_user_ids();
        debug!(%kind, %id, user_ids = user_ids.len(), "recomputed all_user_ids");
        rights.set_all_user_ids(user_ids);
        ctx.store.put(&Entity::new(meta, Record::Rights(rights)), false)?;

        Ok(vec![(success_key(kind), id)])
    }

    fn reduce(&self, key: &str, values: Vec<String>) -> Vec<(String, ReduceValue)> {
        count_values(key, &values)
    }
}
