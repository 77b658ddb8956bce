use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{EntityKind, JobError, RecordMeta};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Exploration,
    Collection,
}

impl ActivityType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exploration => "exploration",
            Self::Collection => "collection",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RightsKind {
    Collection,
    Exploration,
    Topic,
}

impl RightsKind {
    #[must_use]
    pub fn rights_entity_kind(self) -> EntityKind {
        match self {
            Self::Collection => EntityKind::CollectionRightsModel,
            Self::Exploration => EntityKind::ExplorationRightsModel,
            Self::Topic => EntityKind::TopicRightsModel,
        }
    }

    #[must_use]
    pub fn snapshot_entity_kind(self) -> EntityKind {
        match self {
            Self::Collection => EntityKind::CollectionRightsSnapshotContentModel,
            Self::Exploration => EntityKind::ExplorationRightsSnapshotContentModel,
            Self::Topic => EntityKind::TopicRightsSnapshotContentModel,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    #[default]
    Private,
    Public,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ActivitySummary {
    pub id: String,
    pub activity_type: ActivityType,
    pub title: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub language_code: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Rating value ("1".."5") to number of learners who gave it.
    #[serde(default)]
    pub ratings: BTreeMap<String, u64>,
    #[serde(default)]
    pub deleted: bool,
}

/// Role lists of a collection or exploration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityRights {
    pub id: String,
    #[serde(default)]
    pub owner_ids: Vec<String>,
    #[serde(default)]
    pub editor_ids: Vec<String>,
    #[serde(default)]
    pub voice_artist_ids: Vec<String>,
    #[serde(default)]
    pub viewer_ids: Vec<String>,
    #[serde(default)]
    pub community_owned: bool,
    #[serde(default)]
    pub viewable_if_private: bool,
    #[serde(default)]
    pub status: ActivityStatus,
    #[serde(default)]
    pub first_published_msec: Option<f64>,
    /// Absent on records written before the backfill; treated as empty.
    #[serde(default)]
    pub all_user_ids: Vec<String>,
}

impl ActivityRights {
    #[must_use]
    pub fn role_user_ids(&self) -> BTreeSet<String> {
        self.owner_ids
            .iter()
            .chain(&self.editor_ids)
            .chain(&self.voice_artist_ids)
            .chain(&self.viewer_ids)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TopicRights {
    pub id: String,
    #[serde(default)]
    pub manager_ids: Vec<String>,
    #[serde(default)]
    pub topic_is_published: bool,
    #[serde(default)]
    pub all_user_ids: Vec<String>,
}

impl TopicRights {
    #[must_use]
    pub fn role_user_ids(&self) -> BTreeSet<String> {
        self.manager_ids.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "rights_type", content = "rights", rename_all = "snake_case")]
pub enum RightsRecord {
    Collection(ActivityRights),
    Exploration(ActivityRights),
    Topic(TopicRights),
}

impl RightsRecord {
    #[must_use]
    pub fn rights_kind(&self) -> RightsKind {
        match self {
            Self::Collection(_) => RightsKind::Collection,
            Self::Exploration(_) => RightsKind::Exploration,
            Self::Topic(_) => RightsKind::Topic,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Collection(rights) | Self::Exploration(rights) => &rights.id,
            Self::Topic(rights) => &rights.id,
        }
    }

    /// Union of the role lists that apply to this kind of rights record.
    #[must_use]
    pub fn role_user_ids(&self) -> BTreeSet<String> {
        match self {
            Self::Collection(rights) | Self::Exploration(rights) => rights.role_user_ids(),
            Self::Topic(rights) => rights.role_user_ids(),
        }
    }

    #[must_use]
    pub fn all_user_ids(&self) -> &[String] {
        match self {
            Self::Collection(rights) | Self::Exploration(rights) => &rights.all_user_ids,
            Self::Topic(rights) => &rights.all_user_ids,
        }
    }

    pub fn set_all_user_ids(&mut self, user_ids: BTreeSet<String>) {
        let user_ids = user_ids.into_iter().collect();
        match self {
            Self::Collection(rights) | Self::Exploration(rights) => rights.all_user_ids = user_ids,
            Self::Topic(rights) => rights.all_user_ids = user_ids,
        }
    }

    /// Add `user_ids` to `all_user_ids`. Never removes an existing id.
    pub fn widen_all_user_ids(&mut self, user_ids: impl IntoIterator<Item = String>) {
        let mut merged: BTreeSet<String> = self.all_user_ids().iter().cloned().collect();
        merged.extend(user_ids);
        self.set_all_user_ids(merged);
    }
}

/// Historical copy of a rights record at one revision.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RightsSnapshot {
    /// `<parent rights id>-<version>`.
    pub id: String,
    pub rights_kind: RightsKind,
    pub content: Map<String, Value>,
}

impl RightsSnapshot {
    #[must_use]
    pub fn parent_id(&self) -> &str {
        match self.id.rsplit_once('-') {
            Some((parent, version))
                if !version.is_empty() && version.chars().all(|ch| ch.is_ascii_digit()) =>
            {
                parent
            }
            _ => &self.id,
        }
    }

    /// Rebuild a transient rights value from the stored field dictionary.
    ///
    /// Collection and exploration contents go through
    /// [`transform_dict_to_valid`] first; topic contents are used as-is.
    ///
    /// # Errors
    /// Returns [`JobError::Validation`] when the content does not describe a
    /// rights record of this snapshot's kind.
    pub fn reconstruct(&self) -> Result<RightsRecord, JobError> {
        let mut content = self.content.clone();
        if !content.contains_key("id") {
            content.insert("id".to_string(), Value::String(self.parent_id().to_string()));
        }

        let invalid = |err: serde_json::Error| {
            JobError::Validation(format!("snapshot {} has invalid content: {err}", self.id))
        };

        match self.rights_kind {
            RightsKind::Collection => {
                let content = Value::Object(transform_dict_to_valid(content));
                Ok(RightsRecord::Collection(serde_json::from_value(content).map_err(invalid)?))
            }
            RightsKind::Exploration => {
                let content = Value::Object(transform_dict_to_valid(content));
                Ok(RightsRecord::Exploration(serde_json::from_value(content).map_err(invalid)?))
            }
            RightsKind::Topic => {
                let content = Value::Object(content);
                Ok(RightsRecord::Topic(serde_json::from_value(content).map_err(invalid)?))
            }
        }
    }
}

/// Bring a collection/exploration rights dictionary written by an older
/// schema up to the current field layout.
#[must_use]
pub fn transform_dict_to_valid(mut content: Map<String, Value>) -> Map<String, Value> {
    if content.get("status").and_then(Value::as_str) == Some("publicized") {
        content.insert("status".to_string(), Value::String("public".to_string()));
    }

    if let Some(translator_ids) = content.remove("translator_ids") {
        let has_translators = translator_ids.as_array().is_some_and(|ids| !ids.is_empty());
        if has_translators {
            content.insert("voice_artist_ids".to_string(), translator_ids);
        }
    }

    content.remove("all_viewer_ids");
    content.remove("cloned_from");
    content
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SnapshotMetadata {
    pub id: String,
    pub committer_id: String,
    pub commit_type: String,
    #[serde(default)]
    pub commit_message: String,
    #[serde(default)]
    pub commit_cmds: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CommitLogEntry {
    pub id: String,
    pub user_id: String,
    pub exploration_id: String,
    pub commit_type: String,
    #[serde(default)]
    pub commit_message: String,
    pub version: u32,
    #[serde(default)]
    pub post_commit_status: ActivityStatus,
    #[serde(default)]
    pub post_commit_community_owned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "family", content = "fields", rename_all = "snake_case")]
pub enum Record {
    Summary(ActivitySummary),
    Rights(RightsRecord),
    RightsSnapshot(RightsSnapshot),
    SnapshotMetadata(SnapshotMetadata),
    CommitLog(CommitLogEntry),
}

impl Record {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Summary(summary) => match summary.activity_type {
                ActivityType::Exploration => EntityKind::ExpSummaryModel,
                ActivityType::Collection => EntityKind::CollectionSummaryModel,
            },
            Self::Rights(rights) => rights.rights_kind().rights_entity_kind(),
            Self::RightsSnapshot(snapshot) => snapshot.rights_kind.snapshot_entity_kind(),
            Self::SnapshotMetadata(_) => EntityKind::ExplorationRightsSnapshotMetadataModel,
            Self::CommitLog(_) => EntityKind::ExplorationCommitLogEntryModel,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Summary(summary) => &summary.id,
            Self::Rights(rights) => rights.id(),
            Self::RightsSnapshot(snapshot) => &snapshot.id,
            Self::SnapshotMetadata(metadata) => &metadata.id,
            Self::CommitLog(entry) => &entry.id,
        }
    }
}

/// A record together with its storage bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub meta: RecordMeta,
    pub record: Record,
}

impl Entity {
    #[must_use]
    pub fn new(meta: RecordMeta, record: Record) -> Self {
        Self { meta, record }
    }

    #[must_use]
    pub fn kind(&self) -> EntityKind {
        self.record.kind()
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.record.id()
    }
}
