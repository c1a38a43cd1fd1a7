//! Agent-facing WebSocket transport.
//!
//! Two kinds of socket connect agents to the gateway:
//!
//! - **Control** (`/agent/connect`): one per agent. Registers the agent,
//!   carries queued [`AgentTask`]s to it as JSON text frames and accepts
//!   heartbeats and telemetry snapshots from it.
//! - **Stream** (`/agent/stream/{stream_id}`): one per terminal. Carries the
//!   tagged sub-protocol to the agent and raw terminal output back, as
//!   binary frames.
//!
//! A control socket that ends only unregisters the agent if the registry
//! entry is still its own; a connection replaced by a reconnect leaves its
//! successor alone.

use std::fmt::Display;
use std::sync::Arc;

use futures::{Sink, SinkExt, Stream, StreamExt};
use poem::web::websocket::Message;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::bridge::{BridgeSettings, REASON_HEARTBEAT_TIMEOUT};
use super::registry::AgentRegistry;
use super::state::{HostStateSnapshot, StateCollector};
use super::terminal::{AgentStreamEnd, REASON_AGENT_DISCONNECTED, TerminalMultiplexer};

pub const REASON_AGENT_SOCKET_CLOSED: &str = "agent socket closed";
pub const REASON_AGENT_REPLACED: &str = "replaced by newer connection";

/// Messages an agent sends on its control socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Heartbeat,
    State(HostStateSnapshot),
}

#[derive(Clone)]
pub struct AgentLink {
    registry: Arc<AgentRegistry>,
    multiplexer: Arc<TerminalMultiplexer>,
    collector: Arc<StateCollector>,
    task_queue: usize,
    settings: BridgeSettings,
}

impl AgentLink {
    pub fn new(
        registry: Arc<AgentRegistry>,
        multiplexer: Arc<TerminalMultiplexer>,
        collector: Arc<StateCollector>,
        task_queue: usize,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            registry,
            multiplexer,
            collector,
            task_queue: task_queue.max(1),
            settings,
        }
    }

    /// Serve an agent's control socket until it closes or is replaced.
    pub async fn run_control<Tx, Rx, E>(
        &self,
        agent_id: &str,
        host_id: &str,
        mut sink: Tx,
        mut stream: Rx,
    ) -> &'static str
    where
        Tx: Sink<Message> + Unpin + Send,
        Tx::Error: Display,
        Rx: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: Display,
    {
        let (task_tx, mut tasks) = mpsc::channel(self.task_queue);
        let conn = self.registry.register(agent_id, host_id, task_tx);
        let disconnected = conn.disconnected();

        let read_deadline = self.settings.read_deadline;
        let deadline = sleep(read_deadline);
        tokio::pin!(deadline);

        let reason = loop {
            tokio::select! {
                biased;
                _ = disconnected.cancelled() => break REASON_AGENT_REPLACED,
                task = tasks.recv() => {
                    let Some(task) = task else { break REASON_AGENT_REPLACED };
                    let text = match serde_json::to_string(&task) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Cannot encode task {} for agent {}: {}", task.id, agent_id, e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::text(text)).await {
                        warn!("Task {} not written to agent {}: {}", task.id, agent_id, e);
                        break REASON_AGENT_SOCKET_CLOSED;
                    }
                    debug!("Task {} delivered to agent {}", task.id, agent_id);
                }
                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => break REASON_AGENT_SOCKET_CLOSED,
                        Some(Ok(_)) => {
                            deadline.as_mut().reset(Instant::now() + read_deadline);
                            continue;
                        }
                        Some(Err(e)) => {
                            warn!("Read error on agent {} control socket: {}", agent_id, e);
                            break REASON_AGENT_SOCKET_CLOSED;
                        }
                    };
                    deadline.as_mut().reset(Instant::now() + read_deadline);
                    self.handle_message(agent_id, &conn.host_id, &text);
                }
                _ = &mut deadline => {
                    warn!("Agent {} silent for {:?}", agent_id, read_deadline);
                    break REASON_HEARTBEAT_TIMEOUT;
                }
            }
        };

        if self.registry.unregister_connection(agent_id, conn.conn_id) {
            let closed = self
                .multiplexer
                .close_agent_sessions(agent_id, REASON_AGENT_DISCONNECTED);
            if closed > 0 {
                info!("Closed {} terminal session(s) of agent {}", closed, agent_id);
            }
        }
        let _ = sink.close().await;
        info!(
            "Agent {} control socket (connection {}) ended: {}",
            agent_id, conn.conn_id, reason
        );
        reason
    }

    fn handle_message(&self, agent_id: &str, host_id: &str, text: &str) {
        match serde_json::from_str::<AgentMessage>(text) {
            Ok(AgentMessage::Heartbeat) => {
                self.registry.touch(agent_id);
            }
            Ok(AgentMessage::State(mut snapshot)) => {
                self.registry.touch(agent_id);
                if snapshot.host_id.is_empty() {
                    snapshot.host_id = host_id.to_string();
                }
                let delivered = self.collector.publish(snapshot);
                debug!("State from agent {} fanned out to {} subscriber(s)", agent_id, delivered);
            }
            Err(e) => warn!("Ignoring malformed message from agent {}: {}", agent_id, e),
        }
    }

    /// Serve the agent's byte stream for one terminal session.
    pub async fn run_stream<Tx, Rx, E>(&self, stream_id: &str, mut sink: Tx, mut stream: Rx) -> &'static str
    where
        Tx: Sink<Message> + Unpin + Send,
        Tx::Error: Display,
        Rx: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: Display,
    {
        let AgentStreamEnd {
            mut outbound,
            inbound,
            closed,
        } = match self.multiplexer.accept_agent_stream(stream_id) {
            Ok(end) => end,
            Err(e) => {
                warn!("Refusing agent stream {}: {}", stream_id, e);
                let _ = sink.close().await;
                return e.code();
            }
        };
        info!("Agent stream {} connected", stream_id);

        let reason = loop {
            tokio::select! {
                biased;
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break "session closed" };
                    if sink.send(Message::binary(frame)).await.is_err() {
                        break REASON_AGENT_SOCKET_CLOSED;
                    }
                }
                _ = closed.cancelled() => {
                    while let Ok(frame) = outbound.try_recv() {
                        if sink.send(Message::binary(frame)).await.is_err() {
                            break;
                        }
                    }
                    break "session closed";
                }
                message = stream.next() => {
                    let data = match message {
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Text(text))) => text.into_bytes(),
                        Some(Ok(Message::Close(_))) | None => break REASON_AGENT_SOCKET_CLOSED,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!("Read error on agent stream {}: {}", stream_id, e);
                            break REASON_AGENT_SOCKET_CLOSED;
                        }
                    };
                    tokio::select! {
                        _ = closed.cancelled() => break "session closed",
                        sent = inbound.send(data) => {
                            if sent.is_err() {
                                break "session closed";
                            }
                        }
                    }
                }
            }
        };

        drop(inbound);
        let _ = sink.close().await;
        info!("Agent stream {} ended: {}", stream_id, reason);
        reason
    }
}
