//! Telemetry fan-out from agents to browser subscribers.
//!
//! Agents push [`HostStateSnapshot`]s into the [`StateCollector`], which
//! forwards each one to every subscriber whose interest set contains the
//! snapshot's host.
//!
//! # Delivery policy
//!
//! - An empty interest set means *all hosts*.
//! - Each subscriber owns a bounded `broadcast` channel. When it is full the
//!   **oldest** queued snapshot is dropped so the newest state always gets
//!   through; the publisher never waits on a slow consumer. Capacities are
//!   rounded up to a power of two.
//! - Subscribing again under the same id drops the previous sender, so at
//!   most one live channel exists per subscriber id.
//! - A new subscription is primed with the latest known snapshot of every
//!   host it is interested in. Priming happens after registration, so a
//!   concurrent publish may arrive twice but is never missed.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, info};

/// Point-in-time telemetry sample for one host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostStateSnapshot {
    pub host_id: String,
    /// CPU usage in percent
    pub cpu_usage: f64,
    pub mem_used: u64,
    pub mem_total: u64,
    pub swap_used: u64,
    pub swap_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
    /// Bytes per second
    pub net_in_speed: u64,
    /// Bytes per second
    pub net_out_speed: u64,
    pub net_in_transfer: u64,
    pub net_out_transfer: u64,
    pub load_1: f64,
    pub load_5: f64,
    pub load_15: f64,
    pub tcp_conn_count: u64,
    pub udp_conn_count: u64,
    pub process_count: u64,
    /// Seconds since boot
    pub uptime: u64,
    pub timestamp: DateTime<Utc>,
}

/// Receiving end of a telemetry subscription.
pub struct Subscription {
    subscriber_id: String,
    receiver: broadcast::Receiver<Arc<HostStateSnapshot>>,
    dropped: u64,
}

impl Subscription {
    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Wait for the next snapshot. Returns `None` once the subscription has
    /// been closed by unsubscribe or replacement and nothing is left queued.
    pub async fn recv(&mut self) -> Option<Arc<HostStateSnapshot>> {
        loop {
            match self.receiver.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(RecvError::Lagged(n)) => self.lagged(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Arc<HostStateSnapshot>> {
        loop {
            match self.receiver.try_recv() {
                Ok(snapshot) => return Some(snapshot),
                Err(TryRecvError::Lagged(n)) => self.lagged(n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Number of snapshots evicted because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn lagged(&mut self, n: u64) {
        self.dropped += n;
        debug!(
            "Subscriber {} lagging, {} snapshot(s) dropped",
            self.subscriber_id, n
        );
    }
}

struct Subscriber {
    host_ids: HashSet<String>,
    sender: broadcast::Sender<Arc<HostStateSnapshot>>,
}

impl Subscriber {
    fn wants(&self, host_id: &str) -> bool {
        wants(&self.host_ids, host_id)
    }
}

fn wants(host_ids: &HashSet<String>, host_id: &str) -> bool {
    host_ids.is_empty() || host_ids.contains(host_id)
}

/// Publish/subscribe hub for host telemetry.
pub struct StateCollector {
    subscribers: DashMap<String, Subscriber>,
    latest: DashMap<String, Arc<HostStateSnapshot>>,
    queue_capacity: usize,
}

impl StateCollector {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            latest: DashMap::new(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register interest in `host_ids`, replacing any earlier subscription
    /// under the same id.
    pub fn subscribe(
        &self,
        subscriber_id: &str,
        host_ids: impl IntoIterator<Item = String>,
    ) -> Subscription {
        let host_ids: HashSet<String> = host_ids.into_iter().collect();
        let (sender, receiver) = broadcast::channel(self.queue_capacity);
        let primer = sender.clone();
        let subscriber = Subscriber {
            host_ids: host_ids.clone(),
            sender,
        };

        let host_count = host_ids.len();
        if self
            .subscribers
            .insert(subscriber_id.to_string(), subscriber)
            .is_some()
        {
            debug!("Replaced telemetry subscription {}", subscriber_id);
        }

        for entry in self.latest.iter() {
            if wants(&host_ids, entry.key()) {
                let _ = primer.send(entry.value().clone());
            }
        }
        drop(primer);
        info!(
            "Telemetry subscriber {} watching {} host(s){}",
            subscriber_id,
            host_count,
            if host_count == 0 { " (all)" } else { "" }
        );

        Subscription {
            subscriber_id: subscriber_id.to_string(),
            receiver,
            dropped: 0,
        }
    }

    /// Drop a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, subscriber_id: &str) -> bool {
        match self.subscribers.remove(subscriber_id) {
            Some(_) => {
                debug!("Telemetry subscriber {} removed", subscriber_id);
                true
            }
            None => false,
        }
    }

    /// Fan a snapshot out to interested subscribers. Returns how many
    /// subscribers received it.
    pub fn publish(&self, snapshot: HostStateSnapshot) -> usize {
        let snapshot = Arc::new(snapshot);
        self.latest
            .insert(snapshot.host_id.clone(), snapshot.clone());

        let mut delivered = 0;
        for entry in self.subscribers.iter() {
            if !entry.wants(&snapshot.host_id) {
                continue;
            }
            // Fails only when the subscription was dropped without unsubscribing
            if entry.sender.send(snapshot.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn latest(&self, host_id: &str) -> Option<Arc<HostStateSnapshot>> {
        self.latest.get(host_id).map(|s| s.clone())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
