use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::job::{MapReduceJob, ReduceValue};
use crate::EntityKind;

mod index_activities;
mod replace_admin_id;
mod user_ids;
mod user_ids_snapshots;

pub use index_activities::{IndexAllActivitiesJob, SummaryInput};
pub use replace_admin_id::{
    ActorRecordInput, ReplaceAdminIdJob, KEPT_COMMIT_KEY, KEPT_SNAPSHOT_KEY, RENAMED_COMMIT_KEY,
    RENAMED_SNAPSHOT_KEY,
};
pub use user_ids::{AddAllUserIdsJob, RightsInput};
pub use user_ids_snapshots::{AddAllUserIdsSnapshotsJob, SnapshotInput};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum JobName {
    #[serde(rename = "IndexAllActivitiesJobManager")]
    IndexAllActivities,
    #[serde(rename = "AddAllUserIdsOneOffJob")]
    AddAllUserIds,
    #[serde(rename = "AddAllUserIdsSnapshotsOneOffJob")]
    AddAllUserIdsSnapshots,
    #[serde(rename = "ReplaceAdminIdOneOffJob")]
    ReplaceAdminId,
}

impl JobName {
    pub const ALL: [Self; 4] = [
        Self::IndexAllActivities,
        Self::AddAllUserIds,
        Self::AddAllUserIdsSnapshots,
        Self::ReplaceAdminId,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IndexAllActivities => "IndexAllActivitiesJobManager",
            Self::AddAllUserIds => "AddAllUserIdsOneOffJob",
            Self::AddAllUserIdsSnapshots => "AddAllUserIdsSnapshotsOneOffJob",
            Self::ReplaceAdminId => "ReplaceAdminIdOneOffJob",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|name| name.as_str() == value)
    }

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::IndexAllActivities => {
                "Index every non-deleted exploration and collection summary for search."
            }
            Self::AddAllUserIds => {
                "Backfill all_user_ids on rights records from their role lists."
            }
            Self::AddAllUserIdsSnapshots => {
                "Widen all_user_ids on rights records with role ids from their snapshots."
            }
            Self::ReplaceAdminId => {
                "Replace the legacy 'Admin' actor id on exploration commit records."
            }
        }
    }

    #[must_use]
    pub fn entity_classes_to_map_over(self) -> Vec<EntityKind> {
        match self {
            Self::IndexAllActivities => IndexAllActivitiesJob.entity_classes_to_map_over(),
            Self::AddAllUserIds => AddAllUserIdsJob.entity_classes_to_map_over(),
            Self::AddAllUserIdsSnapshots => AddAllUserIdsSnapshotsJob.entity_classes_to_map_over(),
            Self::ReplaceAdminId => ReplaceAdminIdJob.entity_classes_to_map_over(),
        }
    }
}

impl Display for JobName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn success_key(kind: EntityKind) -> String {
    format!("SUCCESS - {kind}")
}

fn count_values(key: &str, values: &[String]) -> Vec<(String, ReduceValue)> {
    vec![(key.to_string(), ReduceValue::Count(values.len()))]
}
