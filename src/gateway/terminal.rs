//! Terminal session multiplexer.
//!
//! A [`TerminalSession`] joins one browser-facing bridge to one agent-facing
//! byte stream, identified by the stream id handed to the agent in its
//! terminal task. The multiplexer is the sole owner of every session; bridges
//! and agent links only borrow them for the lifetime of a connection.
//!
//! # Channels
//!
//! Each session owns two bounded channels:
//! - towards the agent: tagged sub-protocol frames (see [`AgentFrame`])
//! - from the agent: raw terminal output
//!
//! The agent ends of both channels wait in the session until the agent's
//! stream connects and claims them with
//! [`TerminalMultiplexer::accept_agent_stream`]. Frames written before then
//! are buffered.
//!
//! # Closing
//!
//! [`TerminalMultiplexer::close`] removes the session and cancels its
//! `closed` token; it is idempotent, and only the first caller's reason is
//! kept. Anything blocked in [`TerminalSession::receive`] or
//! [`TerminalSession::send`] wakes up immediately. A session also observes
//! the disconnect token of the agent connection it was created for, so a
//! dropped or replaced agent terminates the session.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{AgentFrame, TerminalSize};
use super::error::GatewayError;
use super::registry::AgentRegistry;

/// Default bound of each per-session channel, in frames.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Reason recorded when the agent connection behind a session goes away.
pub const REASON_AGENT_DISCONNECTED: &str = "agent disconnected";
/// Reason recorded when the agent closes its end of the stream.
pub const REASON_AGENT_CLOSED_STREAM: &str = "agent closed stream";
/// Reason recorded when no browser attached in time.
pub const REASON_ATTACH_TIMEOUT: &str = "attach timeout";

/// Summary of a live session, as listed by the management API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub stream_id: String,
    pub host_id: String,
    pub agent_id: String,
    pub cols: u16,
    pub rows: u16,
    pub attached: bool,
    pub created_at: DateTime<Utc>,
}

/// Agent-side halves of a session's channels.
#[derive(Debug)]
pub struct AgentStreamEnd {
    /// Frames to write to the agent
    pub outbound: mpsc::Receiver<Vec<u8>>,
    /// Terminal output read from the agent
    pub inbound: mpsc::Sender<Vec<u8>>,
    /// Cancelled when the session closes
    pub closed: CancellationToken,
}

#[derive(Debug)]
pub struct TerminalSession {
    stream_id: String,
    host_id: String,
    agent_id: String,
    created_at: DateTime<Utc>,
    size: Mutex<TerminalSize>,
    to_agent: mpsc::Sender<Vec<u8>>,
    from_agent: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    agent_end: Mutex<Option<AgentStreamEnd>>,
    attached: AtomicBool,
    closed: CancellationToken,
    agent_gone: CancellationToken,
    close_reason: OnceLock<String>,
}

impl TerminalSession {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn size(&self) -> TerminalSize {
        self.size.lock().map(|s| *s).unwrap_or_default()
    }

    pub fn set_size(&self, size: TerminalSize) {
        if let Ok(mut current) = self.size.lock() {
            *current = size;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Reason given by whoever closed the session first.
    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.get().map(String::as_str)
    }

    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub fn info(&self) -> SessionInfo {
        let size = self.size();
        SessionInfo {
            stream_id: self.stream_id.clone(),
            host_id: self.host_id.clone(),
            agent_id: self.agent_id.clone(),
            cols: size.cols,
            rows: size.rows,
            attached: self.is_attached(),
            created_at: self.created_at,
        }
    }

    /// Queue one sub-protocol frame for the agent, in order.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), GatewayError> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                Err(GatewayError::NotFound(format!("session {} is closed", self.stream_id)))
            }
            _ = self.agent_gone.cancelled() => {
                Err(GatewayError::AgentUnreachable(self.agent_id.clone()))
            }
            sent = self.to_agent.send(frame) => {
                sent.map_err(|_| GatewayError::AgentUnreachable(self.agent_id.clone()))
            }
        }
    }

    /// Next chunk of agent output.
    ///
    /// `Ok(None)` means the session was closed or the agent ended its
    /// stream. An error means the agent connection dropped. Never blocks
    /// past either condition.
    pub async fn receive(&self) -> Result<Option<Vec<u8>>, GatewayError> {
        let mut rx = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Ok(None),
            rx = self.from_agent.lock() => rx,
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Ok(None),
            chunk = rx.recv() => Ok(chunk),
            _ = self.agent_gone.cancelled() => {
                Err(GatewayError::AgentUnreachable(self.agent_id.clone()))
            }
        }
    }

    fn finish(&self, reason: &str) {
        let _ = self.close_reason.set(reason.to_string());
        // Best effort; the agent link flushes whatever is already queued
        if self.to_agent.try_send(AgentFrame::Eof.encode()).is_err() {
            debug!("No room for end-of-stream frame on session {}", self.stream_id);
        }
        self.closed.cancel();
        if let Ok(mut end) = self.agent_end.lock() {
            end.take();
        }
    }
}

/// Exclusive claim on a session's browser side.
///
/// Released when dropped, after which another bridge may attach.
pub struct TerminalAttachment {
    session: Arc<TerminalSession>,
}

impl TerminalAttachment {
    pub fn session(&self) -> &Arc<TerminalSession> {
        &self.session
    }
}

impl Drop for TerminalAttachment {
    fn drop(&mut self) {
        self.session.attached.store(false, Ordering::Release);
    }
}

/// Owner of all terminal sessions.
///
/// Uses two `DashMap` instances:
/// - Primary storage: stream_id -> TerminalSession
/// - Secondary index: agent_id -> stream ids, for agent-wide teardown
pub struct TerminalMultiplexer {
    registry: Arc<AgentRegistry>,
    sessions: DashMap<String, Arc<TerminalSession>>,
    sessions_by_agent: DashMap<String, HashSet<String>>,
    channel_capacity: usize,
}

impl TerminalMultiplexer {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self::with_capacity(registry, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(registry: Arc<AgentRegistry>, channel_capacity: usize) -> Self {
        Self {
            registry,
            sessions: DashMap::new(),
            sessions_by_agent: DashMap::new(),
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Allocate a session bound to the agent's current connection.
    pub fn create(
        &self,
        stream_id: &str,
        host_id: &str,
        agent_id: &str,
        size: TerminalSize,
    ) -> Result<Arc<TerminalSession>, GatewayError> {
        let agent = self
            .registry
            .get(agent_id)
            .ok_or_else(|| GatewayError::AgentUnreachable(agent_id.to_string()))?;

        let session = match self.sessions.entry(stream_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(GatewayError::SessionExists(stream_id.to_string()));
            }
            Entry::Vacant(entry) => {
                let (to_agent, outbound) = mpsc::channel(self.channel_capacity);
                let (inbound, from_agent) = mpsc::channel(self.channel_capacity);
                let closed = CancellationToken::new();
                let session = Arc::new(TerminalSession {
                    stream_id: stream_id.to_string(),
                    host_id: host_id.to_string(),
                    agent_id: agent_id.to_string(),
                    created_at: Utc::now(),
                    size: Mutex::new(size),
                    to_agent,
                    from_agent: tokio::sync::Mutex::new(from_agent),
                    agent_end: Mutex::new(Some(AgentStreamEnd {
                        outbound,
                        inbound,
                        closed: closed.clone(),
                    })),
                    attached: AtomicBool::new(false),
                    closed,
                    agent_gone: agent.disconnected(),
                    close_reason: OnceLock::new(),
                });
                // Indexed before it becomes visible to close()
                self.sessions_by_agent
                    .entry(agent_id.to_string())
                    .or_default()
                    .insert(stream_id.to_string());
                entry.insert(session.clone());
                session
            }
        };

        info!(
            "Terminal session {} created for host {} via agent {}",
            stream_id, host_id, agent_id
        );
        Ok(session)
    }

    pub fn get(&self, stream_id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.get(stream_id).map(|s| s.clone())
    }

    /// Close a session. Unknown or already closed sessions are a no-op.
    /// Returns true for the call that actually closed it.
    pub fn close(&self, stream_id: &str, reason: &str) -> bool {
        // The index is updated under the session's entry, as in create()
        let session = match self.sessions.entry(stream_id.to_string()) {
            Entry::Vacant(_) => return false,
            Entry::Occupied(entry) => {
                let agent_id = entry.get().agent_id.clone();
                if let Some(mut streams) = self.sessions_by_agent.get_mut(&agent_id) {
                    streams.remove(stream_id);
                }
                self.sessions_by_agent
                    .remove_if(&agent_id, |_, streams| streams.is_empty());
                entry.remove()
            }
        };

        session.finish(reason);
        info!("Terminal session {} closed: {}", stream_id, reason);
        true
    }

    /// Forward one sub-protocol frame to the agent.
    pub async fn send_to_agent(&self, stream_id: &str, frame: Vec<u8>) -> Result<(), GatewayError> {
        let session = self
            .get(stream_id)
            .ok_or_else(|| GatewayError::NotFound(format!("session {}", stream_id)))?;
        session.send(frame).await
    }

    /// Next chunk of agent output, closing the session when the agent side
    /// fails or ends.
    pub async fn receive_from_agent(&self, stream_id: &str) -> Result<Option<Vec<u8>>, GatewayError> {
        let session = self
            .get(stream_id)
            .ok_or_else(|| GatewayError::NotFound(format!("session {}", stream_id)))?;
        self.receive(&session).await
    }

    /// Like [`receive_from_agent`](Self::receive_from_agent) for a session
    /// the caller already holds.
    pub async fn receive(
        &self,
        session: &TerminalSession,
    ) -> Result<Option<Vec<u8>>, GatewayError> {
        match session.receive().await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                if !session.is_closed() {
                    self.close(&session.stream_id, REASON_AGENT_CLOSED_STREAM);
                }
                Ok(None)
            }
            Err(e) => {
                warn!(
                    "Agent {} dropped while serving session {}",
                    session.agent_id, session.stream_id
                );
                self.close(&session.stream_id, REASON_AGENT_DISCONNECTED);
                Err(e)
            }
        }
    }

    /// Hand the agent ends of a session's channels to its stream transport.
    /// Each session can be claimed once.
    pub fn accept_agent_stream(&self, stream_id: &str) -> Result<AgentStreamEnd, GatewayError> {
        let session = self
            .get(stream_id)
            .ok_or_else(|| GatewayError::NotFound(format!("session {}", stream_id)))?;
        let claimed = session
            .agent_end
            .lock()
            .map_err(|_| GatewayError::Internal(format!("session {} state poisoned", stream_id)))?
            .take();
        claimed.ok_or_else(|| GatewayError::AlreadyAttached(stream_id.to_string()))
    }

    /// Claim the browser side of a session.
    pub fn attach(&self, stream_id: &str) -> Result<TerminalAttachment, GatewayError> {
        let session = self
            .get(stream_id)
            .ok_or_else(|| GatewayError::NotFound(format!("session {}", stream_id)))?;
        if session
            .attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(GatewayError::AlreadyAttached(stream_id.to_string()));
        }
        Ok(TerminalAttachment { session })
    }

    /// Close a session no browser has attached to. Once this wins, later
    /// attach attempts fail. Returns false if a bridge got there first.
    pub fn expire_unattached(&self, stream_id: &str, reason: &str) -> bool {
        let Some(session) = self.get(stream_id) else {
            return false;
        };
        if session
            .attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.close(stream_id, reason)
    }

    pub fn sessions_for_agent(&self, agent_id: &str) -> Vec<String> {
        self.sessions_by_agent
            .get(agent_id)
            .map(|streams| streams.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Close every session served by `agent_id`. Returns how many closed.
    pub fn close_agent_sessions(&self, agent_id: &str, reason: &str) -> usize {
        self.sessions_for_agent(agent_id)
            .iter()
            .filter(|stream_id| self.close(stream_id, reason))
            .count()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.sessions.iter().map(|entry| entry.info()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
