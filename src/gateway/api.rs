//! HTTP and WebSocket routes.
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | GET | `/api/terminal/sessions` | List active session records |
//! | POST | `/api/terminal/sessions` | Create a terminal session |
//! | DELETE | `/api/terminal/sessions/:session_id` | Close a session |
//! | GET (WS) | `/ws/terminal/:session_id` | Browser terminal socket |
//! | GET (WS) | `/ws/state` | Browser telemetry socket |
//! | GET (WS) | `/agent/connect?agent_id=&host_id=` | Agent control socket |
//! | GET (WS) | `/agent/stream/:stream_id` | Agent terminal byte stream |

use std::sync::Arc;

use futures::StreamExt;
use poem::web::websocket::WebSocket;
use poem::web::{Data, Json, Path, Query};
use poem::{Endpoint, EndpointExt, IntoResponse, Request, Route, delete, get, handler};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::access::{AllowAll, HostAccess};
use super::agent_link::AgentLink;
use super::bridge::{BridgeSettings, REASON_USER_REQUESTED, TerminalBridge};
use super::codec::TerminalSize;
use super::config::GatewayConfig;
use super::error::GatewayError;
use super::monitor::MonitorBridge;
use super::recorder::{RecordRequest, SessionRecorder};
use super::registry::{AgentRegistry, AgentTask};
use super::state::StateCollector;
use super::storage::{DashMapSessionStore, SessionStore};
use super::terminal::{REASON_ATTACH_TIMEOUT, TerminalMultiplexer, TerminalSession};
use super::types::{CloseSessionResponse, CreateSessionRequest, CreateSessionResponse, SessionListResponse};

/// Header carrying the authenticated user id, set by the fronting proxy.
pub const USER_ID_HEADER: &str = "X-User-Id";

const ANONYMOUS_USER: &str = "anonymous";

/// Reason recorded when a freshly created session is rolled back.
const REASON_TASK_DELIVERY_FAILED: &str = "task delivery failed";

/// Fallback for a session closed without a reason.
const REASON_SESSION_CLOSED: &str = "session closed";

/// Shared components, constructed once at startup.
pub struct AppState {
    pub config: GatewayConfig,
    pub registry: Arc<AgentRegistry>,
    pub multiplexer: Arc<TerminalMultiplexer>,
    pub collector: Arc<StateCollector>,
    pub recorder: Arc<SessionRecorder>,
    pub access: Arc<dyn HostAccess>,
    terminal_bridge: TerminalBridge,
    monitor_bridge: MonitorBridge,
    agent_link: AgentLink,
}

impl AppState {
    pub fn new(config: GatewayConfig, store: Arc<dyn SessionStore>, access: Arc<dyn HostAccess>) -> Self {
        let settings = BridgeSettings::from(&config);
        let registry = Arc::new(AgentRegistry::new(config.enqueue_timeout));
        let multiplexer = Arc::new(TerminalMultiplexer::new(registry.clone()));
        let collector = Arc::new(StateCollector::new(config.subscriber_queue));
        let recorder = Arc::new(SessionRecorder::new(store, config.recorder_retries));

        Self {
            terminal_bridge: TerminalBridge::new(multiplexer.clone(), recorder.clone(), settings),
            monitor_bridge: MonitorBridge::new(collector.clone(), settings),
            agent_link: AgentLink::new(
                registry.clone(),
                multiplexer.clone(),
                collector.clone(),
                config.agent_queue,
                settings,
            ),
            config,
            registry,
            multiplexer,
            collector,
            recorder,
            access,
        }
    }

    /// In-memory storage and unrestricted host access.
    pub fn standalone(config: GatewayConfig) -> Self {
        Self::new(config, Arc::new(DashMapSessionStore::new()), Arc::new(AllowAll))
    }

    /// Allocate a terminal session on `request.host_id` and ask its agent to
    /// open the terminal. Nothing is left behind if the task cannot be
    /// delivered.
    pub async fn create_terminal_session(
        &self,
        user_id: &str,
        client_ip: &str,
        request: CreateSessionRequest,
    ) -> Result<CreateSessionResponse, GatewayError> {
        let host_id = request.host_id.trim();
        if host_id.is_empty() {
            return Err(GatewayError::InvalidRequest("host_id is required".into()));
        }
        if request.width == 0 || request.height == 0 {
            return Err(GatewayError::InvalidRequest(format!(
                "invalid terminal size {}x{}",
                request.width, request.height
            )));
        }
        if !self.access.can_access(user_id, host_id).await {
            warn!("User {} denied terminal access to host {}", user_id, host_id);
            return Err(GatewayError::NotFound(format!("host {}", host_id)));
        }
        let agent = self
            .registry
            .resolve_by_host(host_id)
            .ok_or_else(|| GatewayError::NotFound(format!("no agent connected for host {}", host_id)))?;

        let stream_id = Uuid::new_v4().to_string();
        let size = TerminalSize {
            cols: request.width,
            rows: request.height,
        };
        let session = self
            .multiplexer
            .create(&stream_id, host_id, &agent.agent_id, size)?;

        let record_id = self
            .recorder
            .open(RecordRequest {
                session_id: stream_id.clone(),
                user_id: user_id.to_string(),
                host_id: host_id.to_string(),
                cols: size.cols,
                rows: size.rows,
                client_ip: client_ip.to_string(),
            })
            .await;

        let task = AgentTask::terminal(&stream_id, size.cols, size.rows);
        if let Err(e) = self.registry.enqueue_task(&agent.agent_id, task).await {
            self.multiplexer
                .close(&stream_id, REASON_TASK_DELIVERY_FAILED);
            if let Some(record_id) = &record_id {
                self.recorder
                    .close(record_id, REASON_TASK_DELIVERY_FAILED)
                    .await;
            }
            return Err(GatewayError::Internal(format!(
                "could not deliver terminal task: {}",
                e
            )));
        }
        self.watch_session(session);

        info!(
            "User {} opened terminal {} on host {} ({}x{})",
            user_id, stream_id, host_id, size.cols, size.rows
        );
        Ok(CreateSessionResponse {
            websocket_url: self.config.terminal_ws_url(&stream_id),
            session_id: stream_id,
            recorded_session_id: record_id,
            host_id: host_id.to_string(),
        })
    }

    /// Finalize the session's audit record whichever path closes it, and
    /// expire the session if no browser attaches within `attach_timeout`.
    fn watch_session(&self, session: Arc<TerminalSession>) {
        let multiplexer = self.multiplexer.clone();
        let recorder = self.recorder.clone();
        let attach_timeout = self.config.attach_timeout;

        tokio::spawn(async move {
            let closed = session.closed();
            tokio::select! {
                _ = closed.cancelled() => {}
                _ = sleep(attach_timeout) => {
                    if multiplexer.expire_unattached(session.stream_id(), REASON_ATTACH_TIMEOUT) {
                        warn!(
                            "No browser attached to terminal {} within {:?}",
                            session.stream_id(),
                            attach_timeout
                        );
                    }
                    closed.cancelled().await;
                }
            }

            let reason = session.close_reason().unwrap_or(REASON_SESSION_CLOSED);
            if recorder.close_for_session(session.stream_id(), reason).await {
                debug!("Audit record of terminal {} finalized: {}", session.stream_id(), reason);
            }
        });
    }

    /// Close a session on behalf of its user.
    pub async fn close_terminal_session(&self, session_id: &str) -> Result<CloseSessionResponse, GatewayError> {
        let closed = self.multiplexer.close(session_id, REASON_USER_REQUESTED);
        let finalized = self
            .recorder
            .close_for_session(session_id, REASON_USER_REQUESTED)
            .await;
        if !closed && !finalized {
            return Err(GatewayError::NotFound(format!("session {}", session_id)));
        }
        Ok(CloseSessionResponse {
            session_id: session_id.to_string(),
            closed: true,
            message: "Session closed".to_string(),
        })
    }

    pub async fn list_terminal_sessions(&self) -> Result<SessionListResponse, GatewayError> {
        let sessions = self.recorder.list_active().await?;
        Ok(SessionListResponse {
            count: sessions.len(),
            sessions,
        })
    }
}

fn user_id(req: &Request) -> String {
    req.header(USER_ID_HEADER)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .unwrap_or(ANONYMOUS_USER)
        .to_string()
}

/// First hop of `X-Forwarded-For`, then `X-Real-IP`, then the peer address.
fn client_ip(req: &Request) -> String {
    let forwarded = req
        .header("X-Forwarded-For")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    let real_ip = req
        .header("X-Real-IP")
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    match forwarded.or(real_ip) {
        Some(ip) => ip.to_string(),
        None => req
            .remote_addr()
            .as_socket_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

#[handler]
async fn list_sessions(state: Data<&Arc<AppState>>) -> poem::Result<Json<SessionListResponse>> {
    Ok(Json(state.list_terminal_sessions().await?))
}

#[handler]
async fn create_session(
    req: &Request,
    state: Data<&Arc<AppState>>,
    Json(body): Json<CreateSessionRequest>,
) -> poem::Result<Json<CreateSessionResponse>> {
    let response = state
        .create_terminal_session(&user_id(req), &client_ip(req), body)
        .await?;
    Ok(Json(response))
}

#[handler]
async fn close_session(
    Path(session_id): Path<String>,
    state: Data<&Arc<AppState>>,
) -> poem::Result<Json<CloseSessionResponse>> {
    Ok(Json(state.close_terminal_session(&session_id).await?))
}

#[handler]
fn terminal_ws(Path(session_id): Path<String>, ws: WebSocket, state: Data<&Arc<AppState>>) -> impl IntoResponse {
    let bridge = state.terminal_bridge.clone();
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        bridge.run(&session_id, sink, stream).await;
    })
}

#[handler]
fn state_ws(ws: WebSocket, state: Data<&Arc<AppState>>) -> impl IntoResponse {
    let bridge = state.monitor_bridge.clone();
    let subscriber_id = Uuid::new_v4().to_string();
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        bridge.run(&subscriber_id, sink, stream).await;
    })
}

#[derive(Debug, Deserialize)]
struct AgentConnectParams {
    agent_id: String,
    host_id: String,
}

#[handler]
fn agent_connect(
    Query(params): Query<AgentConnectParams>,
    ws: WebSocket,
    state: Data<&Arc<AppState>>,
) -> poem::Result<impl IntoResponse> {
    if params.agent_id.trim().is_empty() || params.host_id.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("agent_id and host_id are required".into()).into());
    }
    let link = state.agent_link.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        link.run_control(&params.agent_id, &params.host_id, sink, stream)
            .await;
    }))
}

#[handler]
fn agent_stream(
    Path(stream_id): Path<String>,
    ws: WebSocket,
    state: Data<&Arc<AppState>>,
) -> poem::Result<impl IntoResponse> {
    if state.multiplexer.get(&stream_id).is_none() {
        return Err(GatewayError::NotFound(format!("session {}", stream_id)).into());
    }
    let link = state.agent_link.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        link.run_stream(&stream_id, sink, stream).await;
    }))
}

/// Build the gateway's routes around shared state.
pub fn routes(state: Arc<AppState>) -> impl Endpoint {
    Route::new()
        .at("/api/terminal/sessions", get(list_sessions).post(create_session))
        .at("/api/terminal/sessions/:session_id", delete(close_session))
        .at("/ws/terminal/:session_id", get(terminal_ws))
        .at("/ws/state", get(state_ws))
        .at("/agent/connect", get(agent_connect))
        .at("/agent/stream/:stream_id", get(agent_stream))
        .data(state)
}
