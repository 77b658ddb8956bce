use tracing::debug;

use crate::job::{JobContext, MapOutput, MapReduceJob, ReduceValue};
use crate::jobs::JobName;
use crate::{ActivitySummary, ActivityType, Entity, EntityKind, JobError, Record};

/// Pushes every non-deleted exploration and collection summary into search.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexAllActivitiesJob;

pub enum SummaryInput {
    Exploration(ActivitySummary),
    Collection(ActivitySummary),
}

impl TryFrom<Entity> for SummaryInput {
    type Error = JobError;

    fn try_from(entity: Entity) -> Result<Self, Self::Error> {
        match entity.record {
            Record::Summary(summary) => match summary.activity_type {
                ActivityType::Exploration => Ok(Self::Exploration(summary)),
                ActivityType::Collection => Ok(Self::Collection(summary)),
            },
            other => {
                Err(JobError::UnexpectedEntity { expected: "activity summary", kind: other.kind() })
            }
        }
    }
}

impl MapReduceJob for IndexAllActivitiesJob {
    type Input = SummaryInput;

    fn name(&self) -> &'static str {
        JobName::IndexAllActivities.as_str()
    }

    fn entity_classes_to_map_over(&self) -> Vec<EntityKind> {
        vec![EntityKind::ExpSummaryModel, EntityKind::CollectionSummaryModel]
    }

    fn map(
        &self,
        input: SummaryInput,
        ctx: &mut JobContext<'_>,
    ) -> Result<Vec<MapOutput>, JobError> {
        match input {
            SummaryInput::Exploration(summary) | SummaryInput::Collection(summary)
                if summary.deleted =>
            {
                debug!(id = %summary.id, "skipping deleted summary");
            }
            SummaryInput::Exploration(summary) => {
                ctx.search.index_exploration_summaries(&[summary])?;
            }
            SummaryInput::Collection(summary) => {
                ctx.search.index_collection_summaries(&[summary])?;
            }
        }
        Ok(Vec::new())
    }

    fn reduce(&self, _key: &str, _values: Vec<String>) -> Vec<(String, ReduceValue)> {
        Vec::new()
    }
}
