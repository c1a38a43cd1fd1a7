//! Storage abstractions for session audit records.
//!
//! This module provides a trait-based storage abstraction that enables:
//! - Dependency injection of the external persistence backend
//! - Lock-free concurrent access via the DashMap implementation
//! - Clean separation between storage and recording logic

mod session;
mod traits;

pub use session::DashMapSessionStore;
pub use traits::{SessionStore, StorageError};
