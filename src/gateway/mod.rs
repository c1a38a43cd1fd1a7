//! Agent connection and terminal-tunneling gateway.
//!
//! This module is organized into the following submodules:
//!
//! - `codec`: Browser envelope, agent sub-protocol and telemetry wire formats
//! - `registry`: Live agent connections and task dispatch
//! - `terminal`: Terminal session multiplexer
//! - `state`: Telemetry pub/sub
//! - `recorder`: Session audit trail
//! - `storage`: Persistence trait for audit records and an in-memory backend
//! - `bridge`: Browser terminal WebSocket bridge
//! - `monitor`: Browser telemetry WebSocket bridge
//! - `agent_link`: Agent control and stream sockets
//! - `access`: Host authorization seam
//! - `api`: HTTP routes and shared application state
//! - `types`: Serializable request, response and record types
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error taxonomy

pub mod access;
pub mod agent_link;
pub mod api;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod monitor;
pub mod recorder;
pub mod registry;
pub mod state;
pub mod storage;
pub mod terminal;
pub mod types;

pub use api::{AppState, routes};
pub use config::GatewayConfig;
pub use error::GatewayError;
