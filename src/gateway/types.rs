//! Serializable request, response and record types for the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audit record of one terminal session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub record_id: String,
    /// Stream id of the terminal session this record audits
    pub session_id: String,
    pub user_id: String,
    pub host_id: String,
    pub cols: u16,
    pub rows: u16,
    pub client_ip: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
}

impl SessionRecord {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Body of `POST /api/terminal/sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub host_id: String,
    /// Terminal columns
    pub width: u16,
    /// Terminal rows
    pub height: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    /// Absent when the audit record could not be written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_session_id: Option<String>,
    pub websocket_url: String,
    pub host_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionListResponse {
    /// Audit records of sessions that have not been closed yet
    pub sessions: Vec<SessionRecord>,
    /// Total number of active sessions
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CloseSessionResponse {
    pub session_id: String,
    pub closed: bool,
    pub message: String,
}
