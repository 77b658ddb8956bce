use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ActivitySummary, JobError};

pub const DEFAULT_SEARCH_RANK: i64 = 20;

/// Weight applied to the number of ratings of each value ("1".."5").
const RATING_WEIGHTINGS: [(&str, i64); 5] = [("1", -5), ("2", -2), ("3", 2), ("4", 5), ("5", 10)];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SearchIndexName {
    Explorations,
    Collections,
}

impl SearchIndexName {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Explorations => "explorations",
            Self::Collections => "collections",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "explorations" => Some(Self::Explorations),
            "collections" => Some(Self::Collections),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SearchDocument {
    pub id: String,
    pub title: String,
    pub category: String,
    pub objective: String,
    pub language_code: String,
    pub tags: Vec<String>,
    pub rank: i64,
}

impl SearchDocument {
    #[must_use]
    pub fn from_exploration_summary(summary: &ActivitySummary) -> Self {
        Self::from_summary(summary, exploration_search_rank(summary))
    }

    #[must_use]
    pub fn from_collection_summary(summary: &ActivitySummary) -> Self {
        Self::from_summary(summary, collection_search_rank(summary))
    }

    fn from_summary(summary: &ActivitySummary, rank: i64) -> Self {
        Self {
            id: summary.id.clone(),
            title: summary.title.clone(),
            category: summary.category.clone(),
            objective: summary.objective.clone(),
            language_code: summary.language_code.clone(),
            tags: summary.tags.clone(),
            rank,
        }
    }
}

/// Rank from the rating distribution, never below zero.
#[must_use]
pub fn exploration_search_rank(summary: &ActivitySummary) -> i64 {
    let mut rank = DEFAULT_SEARCH_RANK;
    for (rating, weight) in RATING_WEIGHTINGS {
        let count = summary.ratings.get(rating).copied().unwrap_or(0);
        rank = rank.saturating_add(i64::try_from(count).unwrap_or(i64::MAX).saturating_mul(weight));
    }
    rank.max(0)
}

#[must_use]
pub fn collection_search_rank(_summary: &ActivitySummary) -> i64 {
    DEFAULT_SEARCH_RANK
}

pub trait SearchIndexer {
    /// # Errors
    /// Returns [`JobError::Index`] when the documents cannot be indexed.
    fn index_exploration_summaries(&mut self, summaries: &[ActivitySummary])
        -> Result<(), JobError>;

    /// # Errors
    /// Returns [`JobError::Index`] when the documents cannot be indexed.
    fn index_collection_summaries(&mut self, summaries: &[ActivitySummary])
        -> Result<(), JobError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IndexCall {
    pub index: SearchIndexName,
    pub document_ids: Vec<String>,
}

/// In-memory indexer that keeps every call and the latest document per id.
#[derive(Debug, Clone, Default)]
pub struct RecordingIndexer {
    calls: Vec<IndexCall>,
    documents: BTreeMap<(SearchIndexName, String), SearchDocument>,
}

impl RecordingIndexer {
    #[must_use]
    pub fn calls(&self) -> &[IndexCall] {
        &self.calls
    }

    #[must_use]
    pub fn call_count(&self, index: SearchIndexName) -> usize {
        self.calls.iter().filter(|call| call.index == index).count()
    }

    #[must_use]
    pub fn document(&self, index: SearchIndexName, id: &str) -> Option<&SearchDocument> {
        self.documents.get(&(index, id.to_string()))
    }

    #[must_use]
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    fn record(&mut self, index: SearchIndexName, documents: Vec<SearchDocument>) {
        self.calls.push(IndexCall {
            index,
            document_ids: documents.iter().map(|document| document.id.clone()).collect(),
        });
        for document in documents {
            self.documents.insert((index, document.id.clone()), document);
        }
    }
}

impl SearchIndexer for RecordingIndexer {
    fn index_exploration_summaries(
        &mut self,
        summaries: &[ActivitySummary],
    ) -> Result<(), JobError> {
        let documents = summaries.iter().map(SearchDocument::from_exploration_summary).collect();
        self.record(SearchIndexName::Explorations, documents);
        Ok(())
    }

    fn index_collection_summaries(
        &mut self,
        summaries: &[ActivitySummary],
    ) -> Result<(), JobError> {
        let documents = summaries.iter().map(SearchDocument::from_collection_summary).collect();
        self.record(SearchIndexName::Collections, documents);
        Ok(())
    }
}
