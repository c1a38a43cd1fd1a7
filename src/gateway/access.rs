//! Authorization seam for terminal access.
//!
//! User and role management live outside the gateway; it only asks whether
//! a user may open a terminal on a host.

use async_trait::async_trait;

/// Decides whether a user may open terminals on a host.
#[async_trait]
pub trait HostAccess: Send + Sync {
    async fn can_access(&self, user_id: &str, host_id: &str) -> bool;
}

/// Grants every user access to every host.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl HostAccess for AllowAll {
    async fn can_access(&self, _user_id: &str, _host_id: &str) -> bool {
        true
    }
}
