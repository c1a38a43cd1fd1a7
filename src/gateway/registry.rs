//! Registry of connected agents.
//!
//! One [`AgentConnection`] exists per live agent control stream. The
//! registry owns them exclusively; other components look agents up by host
//! or agent id and receive a shared handle.
//!
//! # Replacement
//!
//! Registering an agent id that is already present replaces the previous
//! connection. The old connection's `disconnected` token is cancelled so
//! anything bound to the stale transport (terminal sessions, the transport's
//! own pump) stops using it. Each registration gets a fresh connection id;
//! [`AgentRegistry::unregister_connection`] only removes the entry if it
//! still belongs to that connection, so a stale transport shutting down
//! cannot evict its successor.
//!
//! # Task delivery
//!
//! [`AgentRegistry::enqueue_task`] hands tasks to the connection's bounded
//! outbound buffer. An unknown agent fails immediately. A full buffer is
//! waited on for at most the configured enqueue timeout, after which the
//! agent is reported unreachable.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::error::GatewayError;

/// Kind of work dispatched to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Open an interactive terminal bound to `params.stream_id`.
    Terminal,
}

/// A unit of work for an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub kind: TaskKind,
    pub params: HashMap<String, String>,
}

impl AgentTask {
    /// Task asking the agent to open a terminal and attach it to `stream_id`.
    pub fn terminal(stream_id: &str, cols: u16, rows: u16) -> Self {
        let params = HashMap::from([
            ("stream_id".to_string(), stream_id.to_string()),
            ("cols".to_string(), cols.to_string()),
            ("rows".to_string(), rows.to_string()),
        ]);
        Self {
            id: Uuid::new_v4().to_string(),
            kind: TaskKind::Terminal,
            params,
        }
    }
}

/// A live agent control stream.
#[derive(Debug)]
pub struct AgentConnection {
    pub agent_id: String,
    pub host_id: String,
    /// Distinguishes successive registrations of the same agent id
    pub conn_id: u64,
    pub connected_at: DateTime<Utc>,
    last_heartbeat_ms: AtomicI64,
    tasks: mpsc::Sender<AgentTask>,
    disconnected: CancellationToken,
}

impl AgentConnection {
    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_heartbeat_ms.load(Ordering::Relaxed))
            .unwrap_or(self.connected_at)
    }

    /// Cancelled when this connection is unregistered or replaced.
    pub fn disconnected(&self) -> CancellationToken {
        self.disconnected.clone()
    }

    pub fn is_connected(&self) -> bool {
        !self.disconnected.is_cancelled()
    }

    fn touch(&self) {
        self.last_heartbeat_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

/// Concurrent registry of agent connections.
///
/// Uses two `DashMap` instances:
/// - Primary storage: agent_id -> AgentConnection
/// - Secondary index: host_id -> agent_id for host lookups
pub struct AgentRegistry {
    agents: DashMap<String, Arc<AgentConnection>>,
    agents_by_host: DashMap<String, String>,
    next_conn_id: AtomicU64,
    enqueue_timeout: Duration,
}

impl AgentRegistry {
    pub fn new(enqueue_timeout: Duration) -> Self {
        Self {
            agents: DashMap::new(),
            agents_by_host: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
            enqueue_timeout,
        }
    }

    /// Record a new connection for `agent_id`, replacing any earlier one.
    pub fn register(
        &self,
        agent_id: &str,
        host_id: &str,
        tasks: mpsc::Sender<AgentTask>,
    ) -> Arc<AgentConnection> {
        let now = Utc::now();
        let conn = Arc::new(AgentConnection {
            agent_id: agent_id.to_string(),
            host_id: host_id.to_string(),
            conn_id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            connected_at: now,
            last_heartbeat_ms: AtomicI64::new(now.timestamp_millis()),
            tasks,
            disconnected: CancellationToken::new(),
        });

        if let Some(previous) = self.agents.insert(agent_id.to_string(), conn.clone()) {
            previous.disconnected.cancel();
            if previous.host_id != host_id {
                self.agents_by_host
                    .remove_if(&previous.host_id, |_, owner| owner == agent_id);
            }
            warn!(
                "Agent {} reconnected; connection {} replaced by {}",
                agent_id, previous.conn_id, conn.conn_id
            );
        } else {
            info!(
                "Agent {} registered for host {} (connection {})",
                agent_id, host_id, conn.conn_id
            );
        }
        self.agents_by_host
            .insert(host_id.to_string(), agent_id.to_string());

        conn
    }

    /// Remove an agent. Unknown ids are a no-op.
    pub fn unregister(&self, agent_id: &str) -> bool {
        match self.agents.remove(agent_id) {
            Some((_, conn)) => {
                self.release(&conn);
                true
            }
            None => false,
        }
    }

    /// Remove an agent only if `conn_id` is still its current connection.
    pub fn unregister_connection(&self, agent_id: &str, conn_id: u64) -> bool {
        match self
            .agents
            .remove_if(agent_id, |_, conn| conn.conn_id == conn_id)
        {
            Some((_, conn)) => {
                self.release(&conn);
                true
            }
            None => false,
        }
    }

    fn release(&self, conn: &AgentConnection) {
        conn.disconnected.cancel();
        self.agents_by_host
            .remove_if(&conn.host_id, |_, owner| *owner == conn.agent_id);
        info!(
            "Agent {} unregistered (host {}, connection {})",
            conn.agent_id, conn.host_id, conn.conn_id
        );
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentConnection>> {
        self.agents.get(agent_id).map(|c| c.clone())
    }

    /// Find the agent currently serving `host_id`.
    pub fn resolve_by_host(&self, host_id: &str) -> Option<Arc<AgentConnection>> {
        let agent_id = self.agents_by_host.get(host_id)?.clone();
        self.get(&agent_id).filter(|conn| conn.host_id == host_id)
    }

    /// Refresh an agent's heartbeat timestamp.
    pub fn touch(&self, agent_id: &str) -> bool {
        match self.agents.get(agent_id) {
            Some(conn) => {
                conn.touch();
                true
            }
            None => false,
        }
    }

    /// Hand a task to the agent's transport.
    pub async fn enqueue_task(&self, agent_id: &str, task: AgentTask) -> Result<(), GatewayError> {
        let conn = self
            .get(agent_id)
            .ok_or_else(|| GatewayError::AgentUnreachable(agent_id.to_string()))?;

        let task_id = task.id.clone();
        match tokio::time::timeout(self.enqueue_timeout, conn.tasks.send(task)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                warn!(
                    "Task {} not delivered: agent {} transport closed",
                    task_id, agent_id
                );
                Err(GatewayError::AgentUnreachable(agent_id.to_string()))
            }
            Err(_) => {
                warn!(
                    "Task {} not delivered: agent {} outbound buffer full for {:?}",
                    task_id, agent_id, self.enqueue_timeout
                );
                Err(GatewayError::AgentUnreachable(agent_id.to_string()))
            }
        }
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(Duration::from_millis(200))
    }

    mod registration {
        use super::*;

        #[test]
        fn test_register_and_resolve_by_host() {
            let registry = registry();
            let (tx, _rx) = mpsc::channel(4);
            let conn = registry.register("agent-1", "H1", tx);

            let found = registry.resolve_by_host("H1").unwrap();
            assert_eq!(found.agent_id, "agent-1");
            assert_eq!(found.conn_id, conn.conn_id);
            assert!(registry.resolve_by_host("H2").is_none());
            assert!(found.is_connected());
        }

        #[test]
        fn test_replace_cancels_previous_connection() {
            let registry = registry();
            let (tx1, _rx1) = mpsc::channel(4);
            let (tx2, _rx2) = mpsc::channel(4);
            let first = registry.register("agent-1", "H1", tx1);
            let second = registry.register("agent-1", "H1", tx2);

            assert!(!first.is_connected());
            assert!(second.is_connected());
            assert_ne!(first.conn_id, second.conn_id);
            assert_eq!(registry.agent_count(), 1);
            assert_eq!(
                registry.get("agent-1").unwrap().conn_id,
                second.conn_id
            );
        }

        #[test]
        fn test_stale_connection_cannot_evict_successor() {
            let registry = registry();
            let (tx1, _rx1) = mpsc::channel(4);
            let (tx2, _rx2) = mpsc::channel(4);
            let first = registry.register("agent-1", "H1", tx1);
            let second = registry.register("agent-1", "H1", tx2);

            assert!(!registry.unregister_connection("agent-1", first.conn_id));
            assert!(registry.resolve_by_host("H1").is_some());

            assert!(registry.unregister_connection("agent-1", second.conn_id));
            assert!(registry.resolve_by_host("H1").is_none());
        }

        #[test]
        fn test_moving_host_updates_index() {
            let registry = registry();
            let (tx1, _rx1) = mpsc::channel(4);
            let (tx2, _rx2) = mpsc::channel(4);
            registry.register("agent-1", "H1", tx1);
            registry.register("agent-1", "H9", tx2);

            assert!(registry.resolve_by_host("H1").is_none());
            assert_eq!(registry.resolve_by_host("H9").unwrap().agent_id, "agent-1");
        }

        #[test]
        fn test_unregister_is_idempotent() {
            let registry = registry();
            let (tx, _rx) = mpsc::channel(4);
            let conn = registry.register("agent-1", "H1", tx);

            assert!(registry.unregister("agent-1"));
            assert!(!registry.unregister("agent-1"));
            assert!(!registry.unregister("unknown"));
            assert!(conn.disconnected().is_cancelled());
            assert!(registry.resolve_by_host("H1").is_none());
        }

        #[test]
        fn test_touch_updates_heartbeat() {
            let registry = registry();
            let (tx, _rx) = mpsc::channel(4);
            let conn = registry.register("agent-1", "H1", tx);
            let before = conn.last_heartbeat();

            std::thread::sleep(Duration::from_millis(5));
            assert!(registry.touch("agent-1"));
            assert!(conn.last_heartbeat() > before);
            assert!(!registry.touch("unknown"));
        }

        #[tokio::test]
        async fn test_concurrent_registration() {
            let registry = Arc::new(registry());
            let mut handles = Vec::new();
            let mut receivers = Vec::new();
            for i in 0..32 {
                let (tx, rx) = mpsc::channel(1);
                receivers.push(rx);
                let registry = registry.clone();
                handles.push(tokio::spawn(async move {
                    registry.register(&format!("agent-{}", i), &format!("H{}", i), tx);
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }
            assert_eq!(registry.agent_count(), 32);
            for i in 0..32 {
                assert!(registry.resolve_by_host(&format!("H{}", i)).is_some());
            }
        }
    }

    mod enqueue {
        use super::*;

        #[tokio::test]
        async fn test_enqueue_delivers_task() {
            let registry = registry();
            let (tx, mut rx) = mpsc::channel(4);
            registry.register("agent-1", "H1", tx);

            let task = AgentTask::terminal("stream-1", 120, 40);
            registry.enqueue_task("agent-1", task.clone()).await.unwrap();

            let received = rx.recv().await.unwrap();
            assert_eq!(received, task);
            assert_eq!(received.kind, TaskKind::Terminal);
            assert_eq!(received.params["stream_id"], "stream-1");
        }

        #[tokio::test]
        async fn test_enqueue_unknown_agent_fails_fast() {
            let registry = AgentRegistry::new(Duration::from_secs(3600));
            let started = std::time::Instant::now();
            let err = registry
                .enqueue_task("ghost", AgentTask::terminal("s", 80, 24))
                .await
                .unwrap_err();
            assert_eq!(err, GatewayError::AgentUnreachable("ghost".to_string()));
            assert!(started.elapsed() < Duration::from_secs(1));
        }

        #[tokio::test(start_paused = true)]
        async fn test_enqueue_full_buffer_is_bounded() {
            let registry = AgentRegistry::new(Duration::from_secs(2));
            let (tx, _rx) = mpsc::channel(1);
            registry.register("agent-1", "H1", tx);

            registry
                .enqueue_task("agent-1", AgentTask::terminal("s1", 80, 24))
                .await
                .unwrap();

            let started = tokio::time::Instant::now();
            let err = registry
                .enqueue_task("agent-1", AgentTask::terminal("s2", 80, 24))
                .await
                .unwrap_err();
            assert_eq!(err.code(), "agent_unreachable");
            assert!(started.elapsed() >= Duration::from_secs(2));
            assert!(started.elapsed() < Duration::from_secs(3));
        }

        #[tokio::test]
        async fn test_enqueue_closed_transport_fails() {
            let registry = registry();
            let (tx, rx) = mpsc::channel(4);
            registry.register("agent-1", "H1", tx);
            drop(rx);

            let err = registry
                .enqueue_task("agent-1", AgentTask::terminal("s", 80, 24))
                .await
                .unwrap_err();
            assert_eq!(err, GatewayError::AgentUnreachable("agent-1".to_string()));
        }

        #[test]
        fn test_task_ids_are_unique() {
            let a = AgentTask::terminal("s", 80, 24);
            let b = AgentTask::terminal("s", 80, 24);
            assert_ne!(a.id, b.id);
        }

        #[test]
        fn test_task_wire_shape() {
            let task = AgentTask::terminal("stream-9", 100, 30);
            let json = serde_json::to_value(&task).unwrap();
            assert_eq!(json["kind"], "terminal");
            assert_eq!(json["params"]["stream_id"], "stream-9");
            assert_eq!(json["params"]["cols"], "100");
        }
    }
}
