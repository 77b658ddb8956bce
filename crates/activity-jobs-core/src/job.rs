use serde::{Deserialize, Serialize};

use crate::search::SearchIndexer;
use crate::store::Datastore;
use crate::{Entity, EntityKind, JobError};

/// Actor id written by legacy admin tooling.
pub const LEGACY_ADMIN_ID: &str = "Admin";
/// Canonical actor id for system-initiated edits.
pub const SYSTEM_COMMITTER_ID: &str = "admin";

/// One `(key, value)` pair emitted by `map`. Values are record ids.
pub type MapOutput = (String, String);

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum ReduceValue {
    Count(usize),
    Ids(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    pub system_committer_id: String,
    /// Attempts per map call before the record is reported as failed.
    pub max_map_attempts: u32,
    /// Compare-and-swap attempts for read-modify-write merges.
    pub max_write_attempts: u32,
    pub dry_run: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            system_committer_id: SYSTEM_COMMITTER_ID.to_string(),
            max_map_attempts: 3,
            max_write_attempts: 5,
            dry_run: false,
        }
    }
}

impl JobConfig {
    /// # Errors
    /// Returns [`JobError::Validation`] for zero attempt budgets or an empty
    /// or legacy system committer id.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.max_map_attempts == 0 {
            return Err(JobError::Validation("max_map_attempts MUST be >= 1".to_string()));
        }
        if self.max_write_attempts == 0 {
            return Err(JobError::Validation("max_write_attempts MUST be >= 1".to_string()));
        }
        if self.system_committer_id.trim().is_empty() {
            return Err(JobError::Validation(
                "system_committer_id MUST be non-empty".to_string(),
            ));
        }
        if self.system_committer_id == LEGACY_ADMIN_ID {
            return Err(JobError::Validation(format!(
                "system_committer_id MUST differ from the legacy id {LEGACY_ADMIN_ID:?}"
            )));
        }
        Ok(())
    }
}

/// Collaborators a `map` call may touch.
pub struct JobContext<'a> {
    pub store: &'a mut dyn Datastore,
    pub search: &'a mut dyn SearchIndexer,
    pub config: &'a JobConfig,
}

pub trait MapReduceJob {
    /// Records this job accepts. Conversion rejects every other class.
    type Input: TryFrom<Entity, Error = JobError>;

    fn name(&self) -> &'static str;

    fn entity_classes_to_map_over(&self) -> Vec<EntityKind>;

    /// # Errors
    /// Any error fails this record only; the runner may retry it.
    fn map(&self, input: Self::Input, ctx: &mut JobContext<'_>)
        -> Result<Vec<MapOutput>, JobError>;

    fn reduce(&self, key: &str, values: Vec<String>) -> Vec<(String, ReduceValue)>;
}
