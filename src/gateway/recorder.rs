//! Audit trail of terminal sessions.
//!
//! The recorder writes one [`SessionRecord`] per terminal session through
//! the external [`SessionStore`] and finalizes it exactly once when the
//! session ends.
//!
//! Recording is best-effort relative to the interactive terminal: a failed
//! [`open`](SessionRecorder::open) is logged and yields `None`, and the
//! terminal keeps working. Finalization is guarded by an in-memory table of
//! open records; only the caller that removes an entry from that table
//! writes the end timestamp, so racing cleanup paths cannot double-finalize.
//! Transient store failures during finalization are retried with
//! exponential backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use dashmap::DashMap;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::error::GatewayError;
use super::storage::{SessionStore, StorageError};
use super::types::SessionRecord;

/// Upper bound for the delay between finalize retries.
const MAX_FINALIZE_DELAY: Duration = Duration::from_secs(2);

/// Parameters of a new audit record.
#[derive(Debug, Clone)]
pub struct RecordRequest {
    pub session_id: String,
    pub user_id: String,
    pub host_id: String,
    pub cols: u16,
    pub rows: u16,
    pub client_ip: String,
}

pub struct SessionRecorder {
    store: Arc<dyn SessionStore>,
    /// record_id -> session (stream) id of records not yet finalized
    open: DashMap<String, String>,
    /// session (stream) id -> record_id
    by_session: DashMap<String, String>,
    max_retries: u32,
    min_retry_delay: Duration,
}

impl SessionRecorder {
    pub fn new(store: Arc<dyn SessionStore>, max_retries: u32) -> Self {
        Self {
            store,
            open: DashMap::new(),
            by_session: DashMap::new(),
            max_retries,
            min_retry_delay: Duration::from_millis(50),
        }
    }

    /// Persist a new record. Returns its id, or `None` if the store failed.
    pub async fn open(&self, request: RecordRequest) -> Option<String> {
        let record_id = Uuid::new_v4().to_string();
        let record = SessionRecord {
            record_id: record_id.clone(),
            session_id: request.session_id.clone(),
            user_id: request.user_id,
            host_id: request.host_id,
            cols: request.cols,
            rows: request.rows,
            client_ip: request.client_ip,
            started_at: Utc::now(),
            ended_at: None,
            close_reason: None,
        };

        match self.store.insert(record).await {
            Ok(()) => {
                self.open
                    .insert(record_id.clone(), request.session_id.clone());
                self.by_session
                    .insert(request.session_id.clone(), record_id.clone());
                info!(
                    "Recorded terminal session {} as {}",
                    request.session_id, record_id
                );
                Some(record_id)
            }
            Err(e) => {
                error!(
                    "Failed to record terminal session {}: {}",
                    request.session_id, e
                );
                None
            }
        }
    }

    /// Finalize a record. Returns true only for the call that performed the
    /// finalization; later or concurrent calls are no-ops.
    pub async fn close(&self, record_id: &str, reason: &str) -> bool {
        let Some((_, session_id)) = self.open.remove(record_id) else {
            return false;
        };
        self.by_session
            .remove_if(&session_id, |_, owner| owner == record_id);

        let ended_at = Utc::now();
        let attempt_counter = AtomicU32::new(0);
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.min_retry_delay)
            .with_max_delay(MAX_FINALIZE_DELAY)
            .with_max_times(self.max_retries as usize);

        let result = (|| async {
            attempt_counter.fetch_add(1, Ordering::SeqCst);
            self.store.finalize(record_id, ended_at, reason).await
        })
        .retry(backoff)
        .when(StorageError::is_transient)
        .notify(|err, dur| {
            warn!(
                "Finalizing record {} failed: {}. Retrying in {:?}",
                record_id, err, dur
            );
        })
        .await;

        match result {
            Ok(()) => {
                info!(
                    "Finalized record {} for session {}: {}",
                    record_id, session_id, reason
                );
            }
            Err(e) => {
                error!(
                    "Failed to finalize record {} after {} attempt(s): {}",
                    record_id,
                    attempt_counter.load(Ordering::SeqCst),
                    e
                );
            }
        }
        true
    }

    /// Finalize the record belonging to a terminal session, if any.
    pub async fn close_for_session(&self, session_id: &str, reason: &str) -> bool {
        let record_id = match self.by_session.get(session_id) {
            Some(id) => id.clone(),
            None => return false,
        };
        self.close(&record_id, reason).await
    }

    pub fn record_for_session(&self, session_id: &str) -> Option<String> {
        self.by_session.get(session_id).map(|id| id.clone())
    }

    pub async fn get(&self, record_id: &str) -> Result<Option<SessionRecord>, GatewayError> {
        self.store
            .get(record_id)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }

    pub async fn list_active(&self) -> Result<Vec<SessionRecord>, GatewayError> {
        self.store
            .list_active()
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }
}
