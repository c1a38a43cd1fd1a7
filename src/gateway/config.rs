//! Configuration resolution for the gateway.
//!
//! Every setting follows the same three-tier priority:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from the environment (or `.env`)
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! Unparseable environment values are ignored in favour of the default.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `GATEWAY_PORT` | 8008 | HTTP listen port |
//! | `GATEWAY_PUBLIC_WS_BASE` | `ws://localhost:<port>` | Prefix of returned WebSocket URLs |
//! | `GATEWAY_HEARTBEAT_SECS` | 30 | Bridge ping interval |
//! | `GATEWAY_READ_DEADLINE_SECS` | 60 | Bridge read deadline |
//! | `GATEWAY_ENQUEUE_TIMEOUT_MS` | 2000 | Wait on a full agent task buffer |
//! | `GATEWAY_AGENT_QUEUE` | 64 | Per-agent task buffer |
//! | `GATEWAY_SUBSCRIBER_QUEUE` | 32 | Per-subscriber telemetry queue |
//! | `GATEWAY_RECORDER_RETRIES` | 3 | Retries when finalizing audit records |
//! | `GATEWAY_ATTACH_TIMEOUT_SECS` | 60 | How long a new session waits for its browser |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

pub(crate) const DEFAULT_PORT: u16 = 8008;

/// Default interval between bridge heartbeats, in seconds
pub(crate) const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Default read deadline, in seconds
pub(crate) const DEFAULT_READ_DEADLINE_SECS: u64 = 60;

pub(crate) const DEFAULT_ENQUEUE_TIMEOUT_MS: u64 = 2000;

pub(crate) const DEFAULT_AGENT_QUEUE: usize = 64;

pub(crate) const DEFAULT_SUBSCRIBER_QUEUE: usize = 32;

pub(crate) const DEFAULT_RECORDER_RETRIES: u32 = 3;

/// Default wait for a browser to attach to a new session, in seconds
pub(crate) const DEFAULT_ATTACH_TIMEOUT_SECS: u64 = 60;

pub(crate) const PORT_ENV_VAR: &str = "GATEWAY_PORT";
pub(crate) const PUBLIC_WS_BASE_ENV_VAR: &str = "GATEWAY_PUBLIC_WS_BASE";
pub(crate) const HEARTBEAT_ENV_VAR: &str = "GATEWAY_HEARTBEAT_SECS";
pub(crate) const READ_DEADLINE_ENV_VAR: &str = "GATEWAY_READ_DEADLINE_SECS";
pub(crate) const ENQUEUE_TIMEOUT_ENV_VAR: &str = "GATEWAY_ENQUEUE_TIMEOUT_MS";
pub(crate) const AGENT_QUEUE_ENV_VAR: &str = "GATEWAY_AGENT_QUEUE";
pub(crate) const SUBSCRIBER_QUEUE_ENV_VAR: &str = "GATEWAY_SUBSCRIBER_QUEUE";
pub(crate) const RECORDER_RETRIES_ENV_VAR: &str = "GATEWAY_RECORDER_RETRIES";
pub(crate) const ATTACH_TIMEOUT_ENV_VAR: &str = "GATEWAY_ATTACH_TIMEOUT_SECS";

/// Resolve a value with priority: parameter -> env var -> default
fn resolve_parsed<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    if let Some(value) = param {
        return value;
    }

    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    default
}

pub(crate) fn resolve_port(port_param: Option<u16>) -> u16 {
    resolve_parsed(port_param, PORT_ENV_VAR, DEFAULT_PORT)
}

/// Resolve the public WebSocket base URL. Trailing slashes are stripped.
pub(crate) fn resolve_public_ws_base(base_param: Option<String>, port: u16) -> String {
    let base = base_param
        .or_else(|| env::var(PUBLIC_WS_BASE_ENV_VAR).ok())
        .filter(|b| !b.trim().is_empty())
        .unwrap_or_else(|| format!("ws://localhost:{}", port));
    base.trim().trim_end_matches('/').to_string()
}

pub(crate) fn resolve_heartbeat_secs(heartbeat_param: Option<u64>) -> u64 {
    resolve_parsed(heartbeat_param, HEARTBEAT_ENV_VAR, DEFAULT_HEARTBEAT_SECS)
}

pub(crate) fn resolve_read_deadline_secs(deadline_param: Option<u64>) -> u64 {
    resolve_parsed(deadline_param, READ_DEADLINE_ENV_VAR, DEFAULT_READ_DEADLINE_SECS)
}

pub(crate) fn resolve_enqueue_timeout_ms(timeout_param: Option<u64>) -> u64 {
    resolve_parsed(timeout_param, ENQUEUE_TIMEOUT_ENV_VAR, DEFAULT_ENQUEUE_TIMEOUT_MS)
}

pub(crate) fn resolve_agent_queue(queue_param: Option<usize>) -> usize {
    resolve_parsed(queue_param, AGENT_QUEUE_ENV_VAR, DEFAULT_AGENT_QUEUE).max(1)
}

pub(crate) fn resolve_subscriber_queue(queue_param: Option<usize>) -> usize {
    resolve_parsed(queue_param, SUBSCRIBER_QUEUE_ENV_VAR, DEFAULT_SUBSCRIBER_QUEUE).max(1)
}

pub(crate) fn resolve_recorder_retries(retries_param: Option<u32>) -> u32 {
    resolve_parsed(retries_param, RECORDER_RETRIES_ENV_VAR, DEFAULT_RECORDER_RETRIES)
}

pub(crate) fn resolve_attach_timeout_secs(timeout_param: Option<u64>) -> u64 {
    resolve_parsed(timeout_param, ATTACH_TIMEOUT_ENV_VAR, DEFAULT_ATTACH_TIMEOUT_SECS).max(1)
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub port: u16,
    pub public_ws_base: String,
    pub heartbeat_interval: Duration,
    pub read_deadline: Duration,
    pub enqueue_timeout: Duration,
    pub agent_queue: usize,
    pub subscriber_queue: usize,
    pub recorder_retries: u32,
    /// Unattached sessions are closed after this long
    pub attach_timeout: Duration,
}

impl GatewayConfig {
    /// Resolve every setting from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let port = resolve_port(None);
        let heartbeat = resolve_heartbeat_secs(None).max(1);
        let mut deadline = resolve_read_deadline_secs(None);
        if deadline <= heartbeat {
            warn!(
                "Read deadline {}s does not exceed heartbeat {}s; using {}s",
                deadline,
                heartbeat,
                heartbeat * 2
            );
            deadline = heartbeat * 2;
        }

        Self {
            port,
            public_ws_base: resolve_public_ws_base(None, port),
            heartbeat_interval: Duration::from_secs(heartbeat),
            read_deadline: Duration::from_secs(deadline),
            enqueue_timeout: Duration::from_millis(resolve_enqueue_timeout_ms(None)),
            agent_queue: resolve_agent_queue(None),
            subscriber_queue: resolve_subscriber_queue(None),
            recorder_retries: resolve_recorder_retries(None),
            attach_timeout: Duration::from_secs(resolve_attach_timeout_secs(None)),
        }
    }

    /// WebSocket URL a browser uses to attach to `session_id`.
    pub fn terminal_ws_url(&self, session_id: &str) -> String {
        format!("{}/ws/terminal/{}", self.public_ws_base, session_id)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            public_ws_base: format!("ws://localhost:{}", DEFAULT_PORT),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            read_deadline: Duration::from_secs(DEFAULT_READ_DEADLINE_SECS),
            enqueue_timeout: Duration::from_millis(DEFAULT_ENQUEUE_TIMEOUT_MS),
            agent_queue: DEFAULT_AGENT_QUEUE,
            subscriber_queue: DEFAULT_SUBSCRIBER_QUEUE,
            recorder_retries: DEFAULT_RECORDER_RETRIES,
            attach_timeout: Duration::from_secs(DEFAULT_ATTACH_TIMEOUT_SECS),
        }
    }
}
