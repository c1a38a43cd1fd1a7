//! Browser-facing WebSocket bridge for terminal sessions.
//!
//! One [`TerminalBridge::run`] call drives one upgraded browser socket
//! through `Upgraded -> Streaming -> Closing -> Closed`:
//!
//! - On entry the bridge claims the session's browser side and sends the
//!   `connected` envelope.
//! - While streaming, a single `select!` loop waits on the next browser
//!   frame, the next chunk of agent output, the heartbeat ticker and the
//!   read deadline. The deadline is pushed back on every received frame.
//! - Whatever ends the loop (close command, read or write failure, deadline
//!   expiry, agent loss, or the session being closed elsewhere) produces a
//!   reason, and the same cleanup runs exactly once with it.
//!
//! The bridge is generic over the socket halves so tests can drive it with
//! in-memory channels.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use poem::web::websocket::Message;
use tokio::time::{Instant, interval_at, sleep, timeout};
use tracing::{debug, info, warn};

use super::codec::{AgentFrame, Envelope, ErrorCode, TerminalSize};
use super::config::GatewayConfig;
use super::recorder::SessionRecorder;
use super::terminal::{REASON_AGENT_CLOSED_STREAM, REASON_AGENT_DISCONNECTED, TerminalMultiplexer, TerminalSession};

pub const REASON_CLOSE_COMMAND: &str = "close command";
pub const REASON_USER_REQUESTED: &str = "User requested";
pub const REASON_HEARTBEAT_TIMEOUT: &str = "heartbeat timeout";
pub const REASON_CLIENT_DISCONNECTED: &str = "client disconnected";
pub const REASON_AGENT_STALLED: &str = "agent stalled";

/// Upper bound on each best-effort frame written during cleanup.
const CLEANUP_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Liveness timing shared by the terminal and telemetry bridges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeSettings {
    pub heartbeat: Duration,
    pub read_deadline: Duration,
}

impl From<&GatewayConfig> for BridgeSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            heartbeat: config.heartbeat_interval,
            read_deadline: config.read_deadline,
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Connecting,
    Upgraded,
    Streaming,
    Closing,
    Closed,
}

/// How a bridge run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOutcome {
    pub state: BridgeState,
    pub reason: String,
}

pub(crate) fn log_transition(conn: &str, from: BridgeState, to: BridgeState) {
    debug!("Bridge {}: {:?} -> {:?}", conn, from, to);
}

/// Write one text frame.
pub(crate) async fn send_text<Tx>(sink: &mut Tx, text: String) -> Result<(), String>
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
{
    sink.send(Message::text(text)).await.map_err(|e| e.to_string())
}

async fn send_envelope<Tx>(sink: &mut Tx, envelope: &Envelope) -> Result<(), String>
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
{
    let text = envelope.encode().map_err(|e| e.to_string())?;
    send_text(sink, text).await
}

/// Best-effort write that never stalls cleanup.
pub(crate) async fn send_text_best_effort<Tx>(sink: &mut Tx, text: String)
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
{
    match timeout(CLEANUP_SEND_TIMEOUT, send_text(sink, text)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Dropped final frame: {}", e),
        Err(_) => debug!("Dropped final frame: peer not reading"),
    }
}

/// What the loop does after one inbound frame.
enum Step {
    Continue,
    Close(String),
}

#[derive(Clone)]
pub struct TerminalBridge {
    multiplexer: Arc<TerminalMultiplexer>,
    recorder: Arc<SessionRecorder>,
    settings: BridgeSettings,
}

impl TerminalBridge {
    pub fn new(
        multiplexer: Arc<TerminalMultiplexer>,
        recorder: Arc<SessionRecorder>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            multiplexer,
            recorder,
            settings,
        }
    }

    /// Drive an upgraded socket bound to `stream_id` until it closes.
    pub async fn run<Tx, Rx, E>(&self, stream_id: &str, mut sink: Tx, mut stream: Rx) -> BridgeOutcome
    where
        Tx: Sink<Message> + Unpin + Send,
        Tx::Error: Display,
        Rx: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: Display,
    {
        let attachment = match self.multiplexer.attach(stream_id) {
            Ok(attachment) => attachment,
            Err(e) => {
                warn!("Rejecting terminal socket for {}: {}", stream_id, e);
                let envelope = Envelope::error(ErrorCode::SessionUnavailable, e.to_string());
                if let Ok(text) = envelope.encode() {
                    send_text_best_effort(&mut sink, text).await;
                }
                let _ = sink.close().await;
                log_transition(stream_id, BridgeState::Upgraded, BridgeState::Closed);
                return BridgeOutcome {
                    state: BridgeState::Closed,
                    reason: e.code().to_string(),
                };
            }
        };
        let session = attachment.session().clone();

        let size = session.size();
        let connected = Envelope::Connected {
            session_id: stream_id.to_string(),
            host_id: session.host_id().to_string(),
            cols: size.cols,
            rows: size.rows,
        };
        let reason = match send_envelope(&mut sink, &connected).await {
            Ok(()) => {
                log_transition(stream_id, BridgeState::Upgraded, BridgeState::Streaming);
                info!("Terminal socket attached to session {}", stream_id);
                self.stream(&session, &mut sink, &mut stream).await
            }
            Err(e) => {
                warn!("Failed to greet terminal socket {}: {}", stream_id, e);
                REASON_CLIENT_DISCONNECTED.to_string()
            }
        };

        log_transition(stream_id, BridgeState::Streaming, BridgeState::Closing);
        self.cleanup(&session, &mut sink, &reason).await;
        drop(attachment);
        log_transition(stream_id, BridgeState::Closing, BridgeState::Closed);

        BridgeOutcome {
            state: BridgeState::Closed,
            reason,
        }
    }

    async fn stream<Tx, Rx, E>(&self, session: &TerminalSession, sink: &mut Tx, stream: &mut Rx) -> String
    where
        Tx: Sink<Message> + Unpin + Send,
        Tx::Error: Display,
        Rx: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: Display,
    {
        let heartbeat_every = self.settings.heartbeat;
        let read_deadline = self.settings.read_deadline;
        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        let deadline = sleep(read_deadline);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                frame = stream.next() => {
                    let message = match frame {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            warn!("Read error on session {}: {}", session.stream_id(), e);
                            return REASON_CLIENT_DISCONNECTED.to_string();
                        }
                        None => return REASON_CLIENT_DISCONNECTED.to_string(),
                    };
                    deadline.as_mut().reset(Instant::now() + read_deadline);
                    if let Step::Close(reason) = self.handle_frame(session, sink, message).await {
                        return reason;
                    }
                }
                output = self.multiplexer.receive(session) => {
                    match output {
                        Ok(Some(data)) => {
                            if let Err(e) = send_envelope(sink, &Envelope::Output { data }).await {
                                warn!("Write error on session {}: {}", session.stream_id(), e);
                                return REASON_CLIENT_DISCONNECTED.to_string();
                            }
                        }
                        Ok(None) => {
                            return session
                                .close_reason()
                                .unwrap_or(REASON_AGENT_CLOSED_STREAM)
                                .to_string();
                        }
                        Err(_) => return REASON_AGENT_DISCONNECTED.to_string(),
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = send_envelope(sink, &Envelope::Ping).await {
                        warn!("Heartbeat failed on session {}: {}", session.stream_id(), e);
                        return REASON_CLIENT_DISCONNECTED.to_string();
                    }
                }
                _ = &mut deadline => {
                    warn!(
                        "No frames on session {} for {:?}",
                        session.stream_id(),
                        read_deadline
                    );
                    return REASON_HEARTBEAT_TIMEOUT.to_string();
                }
            }
        }
    }

    async fn handle_frame<Tx>(&self, session: &TerminalSession, sink: &mut Tx, message: Message) -> Step
    where
        Tx: Sink<Message> + Unpin + Send,
        Tx::Error: Display,
    {
        let envelope = match message {
            Message::Text(text) => match Envelope::decode(&text) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!("Bad frame on session {}: {}", session.stream_id(), e);
                    return self
                        .reply(sink, &Envelope::error(e.error_code(), e.to_string()))
                        .await;
                }
            },
            // Raw binary frames carry keystrokes
            Message::Binary(data) => Envelope::Input { data },
            Message::Ping(_) | Message::Pong(_) => return Step::Continue,
            Message::Close(_) => return Step::Close(REASON_CLIENT_DISCONNECTED.to_string()),
        };

        match envelope {
            Envelope::Input { data } => self.forward(session, AgentFrame::Input(data)).await,
            Envelope::Resize { cols, rows } => {
                if cols == 0 || rows == 0 {
                    let error = Envelope::error(
                        ErrorCode::InvalidInput,
                        format!("invalid terminal size {}x{}", cols, rows),
                    );
                    return self.reply(sink, &error).await;
                }
                let size = TerminalSize { cols, rows };
                session.set_size(size);
                self.forward(session, AgentFrame::Resize(size)).await
            }
            Envelope::Command { data } => match data.command.as_str() {
                "close" => Step::Close(REASON_CLOSE_COMMAND.to_string()),
                other => {
                    let error =
                        Envelope::error(ErrorCode::InvalidInput, format!("unknown command: {}", other));
                    self.reply(sink, &error).await
                }
            },
            Envelope::Ping => self.reply(sink, &Envelope::Pong).await,
            Envelope::Pong => Step::Continue,
            other => {
                let error = Envelope::error(
                    ErrorCode::InvalidInput,
                    format!("unexpected message type: {}", other.kind()),
                );
                self.reply(sink, &error).await
            }
        }
    }

    /// Queue a frame for the agent. A full queue is waited on for at most
    /// one read deadline, since the loop's timers are not polled meanwhile.
    async fn forward(&self, session: &TerminalSession, frame: AgentFrame) -> Step {
        let sent = match timeout(self.settings.read_deadline, session.send(frame.encode())).await {
            Ok(sent) => sent,
            Err(_) => {
                warn!(
                    "Agent not draining session {} for {:?}",
                    session.stream_id(),
                    self.settings.read_deadline
                );
                return Step::Close(REASON_AGENT_STALLED.to_string());
            }
        };
        match sent {
            Ok(()) => Step::Continue,
            Err(e) => {
                warn!("Cannot forward to agent on session {}: {}", session.stream_id(), e);
                let reason = match session.close_reason() {
                    Some(reason) => reason.to_string(),
                    None => REASON_AGENT_DISCONNECTED.to_string(),
                };
                Step::Close(reason)
            }
        }
    }

    async fn reply<Tx>(&self, sink: &mut Tx, envelope: &Envelope) -> Step
    where
        Tx: Sink<Message> + Unpin + Send,
        Tx::Error: Display,
    {
        match send_envelope(sink, envelope).await {
            Ok(()) => Step::Continue,
            Err(_) => Step::Close(REASON_CLIENT_DISCONNECTED.to_string()),
        }
    }

    async fn cleanup<Tx>(&self, session: &TerminalSession, sink: &mut Tx, reason: &str)
    where
        Tx: Sink<Message> + Unpin + Send,
        Tx::Error: Display,
    {
        let stream_id = session.stream_id();
        let notice = match reason {
            REASON_AGENT_DISCONNECTED | REASON_AGENT_STALLED => {
                Some(Envelope::error(ErrorCode::AgentDisconnected, reason))
            }
            REASON_HEARTBEAT_TIMEOUT => Some(Envelope::error(ErrorCode::ConnectionClosed, reason)),
            _ => None,
        };
        if reason != REASON_CLIENT_DISCONNECTED {
            for envelope in notice.iter().chain(std::iter::once(&Envelope::Disconnected)) {
                if let Ok(text) = envelope.encode() {
                    send_text_best_effort(sink, text).await;
                }
            }
        }

        self.multiplexer.close(stream_id, reason);
        self.recorder.close_for_session(stream_id, reason).await;
        let _ = sink.close().await;
        info!("Terminal socket for session {} closed: {}", stream_id, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::codec::{TAG_INPUT, TAG_RESIZE};
    use crate::gateway::recorder::RecordRequest;
    use crate::gateway::registry::{AgentRegistry, AgentTask};
    use crate::gateway::storage::{DashMapSessionStore, SessionStore};
    use crate::gateway::terminal::AgentStreamEnd;
    use futures::channel::mpsc as fmpsc;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    type ClientTx = fmpsc::UnboundedSender<Result<Message, std::io::Error>>;
    type ClientRx = fmpsc::UnboundedReceiver<Message>;

    struct Harness {
        registry: Arc<AgentRegistry>,
        multiplexer: Arc<TerminalMultiplexer>,
        store: Arc<DashMapSessionStore>,
        bridge: TerminalBridge,
        agent: AgentStreamEnd,
        record_id: String,
        _tasks: mpsc::Receiver<AgentTask>,
    }

    async fn harness() -> Harness {
        let registry = Arc::new(AgentRegistry::new(Duration::from_millis(100)));
        let (task_tx, tasks) = mpsc::channel(4);
        registry.register("agent-1", "H1", task_tx);

        let multiplexer = Arc::new(TerminalMultiplexer::new(registry.clone()));
        multiplexer
            .create("s1", "H1", "agent-1", TerminalSize::default())
            .unwrap();
        let agent = multiplexer.accept_agent_stream("s1").unwrap();

        let store = Arc::new(DashMapSessionStore::new());
        let recorder = Arc::new(SessionRecorder::new(store.clone(), 1));
        let record_id = recorder
            .open(RecordRequest {
                session_id: "s1".into(),
                user_id: "u1".into(),
                host_id: "H1".into(),
                cols: 80,
                rows: 24,
                client_ip: "127.0.0.1".into(),
            })
            .await
            .unwrap();

        let bridge = TerminalBridge::new(multiplexer.clone(), recorder, BridgeSettings::default());
        Harness {
            registry,
            multiplexer,
            store,
            bridge,
            agent,
            record_id,
            _tasks: tasks,
        }
    }

    fn connect(bridge: &TerminalBridge, stream_id: &str) -> (ClientTx, ClientRx, JoinHandle<BridgeOutcome>) {
        let (to_bridge, inbound) = fmpsc::unbounded();
        let (outbound, from_bridge) = fmpsc::unbounded();
        let bridge = bridge.clone();
        let stream_id = stream_id.to_string();
        let handle = tokio::spawn(async move { bridge.run(&stream_id, outbound, inbound).await });
        (to_bridge, from_bridge, handle)
    }

    fn send(client: &ClientTx, text: &str) {
        client.unbounded_send(Ok(Message::text(text))).unwrap();
    }

    async fn next_envelope(client: &mut ClientRx) -> Envelope {
        loop {
            match client.next().await {
                Some(Message::Text(text)) => return Envelope::decode(&text).unwrap(),
                Some(_) => continue,
                None => panic!("bridge closed the socket"),
            }
        }
    }

    mod streaming {
        use super::*;

        #[tokio::test]
        async fn test_resize_then_close_command() {
            let mut h = harness().await;
            let (client, mut rx, handle) = connect(&h.bridge, "s1");

            match next_envelope(&mut rx).await {
                Envelope::Connected { session_id, host_id, cols, rows } => {
                    assert_eq!(session_id, "s1");
                    assert_eq!(host_id, "H1");
                    assert_eq!((cols, rows), (80, 24));
                }
                other => panic!("expected connected, got {:?}", other),
            }

            send(&client, r#"{"type":"resize","cols":120,"rows":40}"#);
            let frame = h.agent.outbound.recv().await.unwrap();
            assert_eq!(frame[0], TAG_RESIZE);
            assert_eq!(&frame[1..], br#"{"cols":120,"rows":40}"#);

            send(&client, r#"{"type":"command","data":{"command":"close"}}"#);
            let outcome = handle.await.unwrap();
            assert_eq!(outcome.state, BridgeState::Closed);
            assert_eq!(outcome.reason, REASON_CLOSE_COMMAND);
            assert_eq!(next_envelope(&mut rx).await, Envelope::Disconnected);

            let record = h.store.get(&h.record_id).await.unwrap().unwrap();
            assert!(record.ended_at.is_some());
            assert_eq!(record.close_reason.as_deref(), Some(REASON_CLOSE_COMMAND));
            assert!(h.multiplexer.get("s1").is_none());
        }

        #[tokio::test]
        async fn test_input_and_output_preserve_bytes() {
            let mut h = harness().await;
            let (client, mut rx, handle) = connect(&h.bridge, "s1");
            next_envelope(&mut rx).await;

            send(&client, r#"{"type":"input","data":"AAr/aGVsbG8="}"#);
            let frame = h.agent.outbound.recv().await.unwrap();
            assert_eq!(frame[0], TAG_INPUT);
            assert_eq!(&frame[1..], &[0x00, 0x0A, 0xFF, b'h', b'e', b'l', b'l', b'o']);

            h.agent.inbound.send(vec![0x1b, b'[', b'H', 0x00]).await.unwrap();
            assert_eq!(
                next_envelope(&mut rx).await,
                Envelope::Output {
                    data: vec![0x1b, b'[', b'H', 0x00]
                }
            );

            drop(client);
            assert_eq!(handle.await.unwrap().reason, REASON_CLIENT_DISCONNECTED);
        }

        #[tokio::test]
        async fn test_malformed_frames_do_not_close() {
            let h = harness().await;
            let (client, mut rx, handle) = connect(&h.bridge, "s1");
            next_envelope(&mut rx).await;

            send(&client, "not json");
            match next_envelope(&mut rx).await {
                Envelope::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidInput),
                other => panic!("expected error, got {:?}", other),
            }

            send(&client, r#"{"type":"resize","cols":"wide","rows":40}"#);
            match next_envelope(&mut rx).await {
                Envelope::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidInput),
                other => panic!("expected error, got {:?}", other),
            }

            send(&client, r#"{"type":"ping"}"#);
            assert_eq!(next_envelope(&mut rx).await, Envelope::Pong);
            assert!(!handle.is_finished());
            assert!(h.multiplexer.get("s1").is_some());
        }
    }

    mod termination {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_heartbeat_timeout_closes_session() {
            let h = harness().await;
            let started = Instant::now();
            let (_client, mut rx, handle) = connect(&h.bridge, "s1");
            next_envelope(&mut rx).await;

            let outcome = handle.await.unwrap();
            assert_eq!(outcome.reason, REASON_HEARTBEAT_TIMEOUT);
            assert!(started.elapsed() >= Duration::from_secs(60));

            let record = h.store.get(&h.record_id).await.unwrap().unwrap();
            assert_eq!(record.close_reason.as_deref(), Some(REASON_HEARTBEAT_TIMEOUT));
        }

        #[tokio::test(start_paused = true)]
        async fn test_pong_extends_deadline() {
            let h = harness().await;
            let started = Instant::now();
            let (client, mut rx, handle) = connect(&h.bridge, "s1");
            next_envelope(&mut rx).await;

            assert_eq!(next_envelope(&mut rx).await, Envelope::Ping);
            sleep(Duration::from_secs(20)).await;
            send(&client, r#"{"type":"pong"}"#);

            sleep(Duration::from_secs(40)).await;
            assert!(!handle.is_finished());

            let outcome = handle.await.unwrap();
            assert_eq!(outcome.reason, REASON_HEARTBEAT_TIMEOUT);
            assert!(started.elapsed() >= Duration::from_secs(110));
        }

        #[tokio::test(start_paused = true)]
        async fn test_full_agent_queue_does_not_wedge_bridge() {
            let h = harness().await;
            let started = Instant::now();
            let (client, mut rx, handle) = connect(&h.bridge, "s1");
            next_envelope(&mut rx).await;

            // Nobody drains h.agent.outbound, so the last keystroke cannot be queued
            for _ in 0..=crate::gateway::terminal::DEFAULT_CHANNEL_CAPACITY {
                client.unbounded_send(Ok(Message::binary(b"x".to_vec()))).unwrap();
            }

            let outcome = handle.await.unwrap();
            assert_eq!(outcome.reason, REASON_AGENT_STALLED);
            assert!(started.elapsed() >= Duration::from_secs(60));
            assert!(h.multiplexer.get("s1").is_none());

            let record = h.store.get(&h.record_id).await.unwrap().unwrap();
            assert_eq!(record.close_reason.as_deref(), Some(REASON_AGENT_STALLED));
            drop(h.agent);
        }

        #[tokio::test]
        async fn test_agent_disconnect_notifies_client() {
            let h = harness().await;
            let (_client, mut rx, handle) = connect(&h.bridge, "s1");
            next_envelope(&mut rx).await;

            h.registry.unregister("agent-1");

            let outcome = handle.await.unwrap();
            assert_eq!(outcome.reason, REASON_AGENT_DISCONNECTED);
            match next_envelope(&mut rx).await {
                Envelope::Error { code, .. } => assert_eq!(code, ErrorCode::AgentDisconnected),
                other => panic!("expected error, got {:?}", other),
            }
            assert_eq!(next_envelope(&mut rx).await, Envelope::Disconnected);
        }

        #[tokio::test]
        async fn test_close_from_management_api() {
            let h = harness().await;
            let (_client, mut rx, handle) = connect(&h.bridge, "s1");
            next_envelope(&mut rx).await;

            assert!(h.multiplexer.close("s1", REASON_USER_REQUESTED));

            let outcome = handle.await.unwrap();
            assert_eq!(outcome.reason, REASON_USER_REQUESTED);
            let record = h.store.get(&h.record_id).await.unwrap().unwrap();
            assert_eq!(record.close_reason.as_deref(), Some(REASON_USER_REQUESTED));
        }

        #[tokio::test]
        async fn test_second_socket_is_rejected() {
            let h = harness().await;
            let (_first, mut first_rx, first) = connect(&h.bridge, "s1");
            next_envelope(&mut first_rx).await;

            let (_second, mut second_rx, second) = connect(&h.bridge, "s1");
            match next_envelope(&mut second_rx).await {
                Envelope::Error { code, .. } => assert_eq!(code, ErrorCode::SessionUnavailable),
                other => panic!("expected error, got {:?}", other),
            }
            assert_eq!(second.await.unwrap().reason, "already_attached");

            assert!(!first.is_finished());
            assert!(h.multiplexer.get("s1").is_some());
        }

        #[tokio::test]
        async fn test_unknown_session_is_rejected() {
            let h = harness().await;
            let (_client, mut rx, handle) = connect(&h.bridge, "missing");
            match next_envelope(&mut rx).await {
                Envelope::Error { code, .. } => assert_eq!(code, ErrorCode::SessionUnavailable),
                other => panic!("expected error, got {:?}", other),
            }
            assert_eq!(handle.await.unwrap().reason, "not_found");
        }
    }
}
