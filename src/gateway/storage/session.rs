//! DashMap-based session record storage.
//!
//! Keeps audit records in process memory with lock-free concurrent access.
//! Finalized records are retained so they remain queryable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::gateway::types::SessionRecord;

use super::traits::{SessionStore, StorageError};

/// DashMap-based implementation of `SessionStore`.
pub struct DashMapSessionStore {
    records: DashMap<String, SessionRecord>,
}

impl DashMapSessionStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for DashMapSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for DashMapSessionStore {
    async fn insert(&self, record: SessionRecord) -> Result<(), StorageError> {
        match self.records.entry(record.record_id.clone()) {
            Entry::Occupied(entry) => Err(StorageError::Duplicate(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(record);
                Ok(())
            }
        }
    }

    async fn finalize(
        &self,
        record_id: &str,
        ended_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), StorageError> {
        let mut record = self
            .records
            .get_mut(record_id)
            .ok_or_else(|| StorageError::NotFound(record_id.to_string()))?;
        if record.ended_at.is_some() {
            return Err(StorageError::AlreadyFinalized(record_id.to_string()));
        }
        record.ended_at = Some(ended_at);
        record.close_reason = Some(reason.to_string());
        Ok(())
    }

    async fn get(&self, record_id: &str) -> Result<Option<SessionRecord>, StorageError> {
        Ok(self.records.get(record_id).map(|r| r.clone()))
    }

    async fn list_active(&self) -> Result<Vec<SessionRecord>, StorageError> {
        let mut active: Vec<SessionRecord> = self
            .records
            .iter()
            .filter(|entry| entry.is_open())
            .map(|entry| entry.value().clone())
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(active)
    }
}
