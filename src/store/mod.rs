//! Typed access to the `results` table.
//!
//! Engine code only talks to [`RecordStore`]; adapters validate rows at the
//! boundary so nothing downstream sees an untyped shape.

mod rest;
mod sqlite;

pub use rest::RestStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consolidate::MergePlan;
use crate::error::TallyError;

/// Rows 0..=1000, the window the job has always scanned.
pub const DEFAULT_BATCH_LIMIT: usize = 1001;

/// One logged generation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: String,
    pub provider: String,
    pub prompt: String,
    /// Usage counter as stored. Parsed on demand by [`ResultRecord::parse_uses`].
    pub uses: String,
    pub created_at: DateTime<Utc>,
}

impl ResultRecord {
    pub fn new(
        id: impl Into<String>,
        provider: impl Into<String>,
        prompt: impl Into<String>,
        uses: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            prompt: prompt.into(),
            uses: uses.to_string(),
            created_at,
        }
    }

    pub fn key(&self) -> GroupKey {
        GroupKey {
            provider: self.provider.clone(),
            prompt: self.prompt.clone(),
        }
    }

    /// Strict decimal parse. Negative counters are rejected.
    pub fn parse_uses(&self) -> Result<i64, TallyError> {
        match self.uses.trim().parse::<i64>() {
            Ok(n) if n >= 0 => Ok(n),
            _ => Err(TallyError::InvalidUses {
                id: self.id.clone(),
                value: self.uses.clone(),
            }),
        }
    }
}

/// Logical identity of a duplicate group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub provider: String,
    pub prompt: String,
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, crate::util::truncate_chars(&self.prompt, 40))
    }
}

/// Offset/limit window for a candidate scan. `limit` is a hard cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRange {
    pub offset: usize,
    pub limit: usize,
}

impl BatchRange {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// Inclusive row bounds, `inclusive(0, 1000)` covers 1001 rows.
    pub fn inclusive(from: usize, to: usize) -> Self {
        Self {
            offset: from,
            limit: to.saturating_sub(from) + 1,
        }
    }
}

impl Default for BatchRange {
    fn default() -> Self {
        Self::new(0, DEFAULT_BATCH_LIMIT)
    }
}

/// Equality filters. `None` fields do not constrain the select.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub provider: Option<String>,
    pub prompt: Option<String>,
}

impl RecordFilter {
    pub fn provider(p: impl Into<String>) -> Self {
        Self {
            provider: Some(p.into()),
            prompt: None,
        }
    }

    pub fn key(key: &GroupKey) -> Self {
        Self {
            provider: Some(key.provider.clone()),
            prompt: Some(key.prompt.clone()),
        }
    }

    pub(crate) fn pairs(&self) -> Vec<(&'static str, &str)> {
        let mut out = Vec::with_capacity(2);
        if let Some(ref p) = self.provider {
            out.push(("provider", p.as_str()));
        }
        if let Some(ref p) = self.prompt {
            out.push(("prompt", p.as_str()));
        }
        out
    }
}

/// Fields to change on update-by-id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uses: Option<i64>,
}

impl RecordPatch {
    pub fn uses(n: i64) -> Self {
        Self { uses: Some(n) }
    }

    pub fn is_empty(&self) -> bool {
        self.uses.is_none()
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Short label for logs and `/health`.
    fn kind(&self) -> &'static str;

    /// `Some(range)` caps the result; `None` must return every match.
    async fn select(
        &self,
        filter: &RecordFilter,
        range: Option<BatchRange>,
    ) -> Result<Vec<ResultRecord>, TallyError>;

    /// Deleting an id that no longer exists is not an error.
    async fn delete_by_id(&self, id: &str) -> Result<(), TallyError>;

    async fn update_by_id(&self, id: &str, patch: &RecordPatch) -> Result<(), TallyError>;

    fn is_transactional(&self) -> bool {
        false
    }

    /// Delete the plan's losers and write the winner's total as one unit.
    async fn merge_atomic(&self, _plan: &MergePlan) -> Result<(), TallyError> {
        Err(TallyError::Unsupported("transactional merge"))
    }

    /// Advisory lease. Stores without lease support grant every request.
    async fn try_acquire_lease(
        &self,
        _name: &str,
        _holder: &str,
        _ttl: Duration,
    ) -> Result<bool, TallyError> {
        Ok(true)
    }

    async fn release_lease(&self, _name: &str, _holder: &str) -> Result<(), TallyError> {
        Ok(())
    }
}

pub type SharedStore = Arc<dyn RecordStore>;
