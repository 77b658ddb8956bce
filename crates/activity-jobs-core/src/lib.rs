use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod action_spec;
pub mod job;
pub mod jobs;
pub mod records;
pub mod runner;
pub mod search;
pub mod store;

pub use action_spec::{CustomizationArgSpec, LearnerActionSpec, SchemaType, ValueSchema};
pub use job::{
    JobConfig, JobContext, MapOutput, MapReduceJob, ReduceValue, LEGACY_ADMIN_ID,
    SYSTEM_COMMITTER_ID,
};
pub use jobs::{
    AddAllUserIdsJob, AddAllUserIdsSnapshotsJob, IndexAllActivitiesJob, JobName, ReplaceAdminIdJob,
};
pub use records::{
    transform_dict_to_valid, ActivityRights, ActivityStatus, ActivitySummary, ActivityType,
    CommitLogEntry, Entity, Record, RightsKind, RightsRecord, RightsSnapshot, SnapshotMetadata,
    TopicRights,
};
pub use runner::{JobReport, JobRunner, JobStatus, MapFailure, PendingWrite, ReduceOutput};
pub use search::{
    collection_search_rank, exploration_search_rank, RecordingIndexer, SearchDocument,
    SearchIndexName, SearchIndexer, DEFAULT_SEARCH_RANK,
};
pub use store::{Datastore, DryRunStore, MemoryStore};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum JobError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },
    #[error("revision conflict on {kind} {id}: expected {expected}, found {found}")]
    Conflict { kind: EntityKind, id: String, expected: u64, found: u64 },
    #[error("expected {expected}, got {kind}")]
    UnexpectedEntity { expected: &'static str, kind: EntityKind },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("search index error: {0}")]
    Index(String),
}

impl JobError {
    /// Whether a fresh attempt at the same map call could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Store(_) | Self::Index(_))
    }
}

/// Every persisted record class the jobs know about.
///
/// Names match the datastore class names so they can be used verbatim in
/// reduce keys (`SUCCESS - ExplorationRightsModel`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EntityKind {
    ExpSummaryModel,
    CollectionSummaryModel,
    CollectionRightsModel,
    ExplorationRightsModel,
    TopicRightsModel,
    CollectionRightsSnapshotContentModel,
    ExplorationRightsSnapshotContentModel,
    TopicRightsSnapshotContentModel,
    ExplorationRightsSnapshotMetadataModel,
    ExplorationCommitLogEntryModel,
}

impl EntityKind {
    pub const ALL: [Self; 10] = [
        Self::ExpSummaryModel,
        Self::CollectionSummaryModel,
        Self::CollectionRightsModel,
        Self::ExplorationRightsModel,
        Self::TopicRightsModel,
        Self::CollectionRightsSnapshotContentModel,
        Self::ExplorationRightsSnapshotContentModel,
        Self::TopicRightsSnapshotContentModel,
        Self::ExplorationRightsSnapshotMetadataModel,
        Self::ExplorationCommitLogEntryModel,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExpSummaryModel => "ExpSummaryModel",
            Self::CollectionSummaryModel => "CollectionSummaryModel",
            Self::CollectionRightsModel => "CollectionRightsModel",
            Self::ExplorationRightsModel => "ExplorationRightsModel",
            Self::TopicRightsModel => "TopicRightsModel",
            Self::CollectionRightsSnapshotContentModel => "CollectionRightsSnapshotContentModel",
            Self::ExplorationRightsSnapshotContentModel => "ExplorationRightsSnapshotContentModel",
            Self::TopicRightsSnapshotContentModel => "TopicRightsSnapshotContentModel",
            Self::ExplorationRightsSnapshotMetadataModel => {
                "ExplorationRightsSnapshotMetadataModel"
            }
            Self::ExplorationCommitLogEntryModel => "ExplorationCommitLogEntryModel",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage bookkeeping carried by every persisted record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordMeta {
    #[serde(with = "time::serde::rfc3339")]
    pub created_on: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
    /// Row revision used for compare-and-swap writes. Starts at 0.
    #[serde(default)]
    pub revision: u64,
}

impl RecordMeta {
    #[must_use]
    pub fn new(at: OffsetDateTime) -> Self {
        Self { created_on: at, last_updated: at, revision: 0 }
    }

    /// Meta a store assigns after a successful compare-and-swap `put`.
    #[must_use]
    pub fn next(self, update_last_updated_time: bool, now: OffsetDateTime) -> Self {
        Self {
            created_on: self.created_on,
            last_updated: if update_last_updated_time { now } else { self.last_updated },
            revision: self.revision + 1,
        }
    }
}
