//! Storage trait for terminal session audit records.
//!
//! The gateway does not own a database; persistence is an external
//! collaborator reached through [`SessionStore`]. The in-process
//! `DashMapSessionStore` implements it for standalone runs and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::gateway::types::SessionRecord;

/// Failures reported by a [`SessionStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("record {0} not found")]
    NotFound(String),

    #[error("record {0} already exists")]
    Duplicate(String),

    #[error("record {0} is already finalized")]
    AlreadyFinalized(String),

    /// Backend temporarily unavailable; worth retrying.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

/// Persistence for session audit records.
///
/// Implementations must be thread-safe (`Send + Sync`) for use across
/// async tasks.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a freshly opened record.
    async fn insert(&self, record: SessionRecord) -> Result<(), StorageError>;

    /// Set the end timestamp and close reason of an open record.
    async fn finalize(
        &self,
        record_id: &str,
        ended_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), StorageError>;

    /// Fetch one record.
    async fn get(&self, record_id: &str) -> Result<Option<SessionRecord>, StorageError>;

    /// All records that have not been finalized.
    async fn list_active(&self) -> Result<Vec<SessionRecord>, StorageError>;
}
