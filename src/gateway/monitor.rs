//! Browser-facing WebSocket bridge for host telemetry.
//!
//! Each socket is one subscriber of the [`StateCollector`]. Control frames
//! (`subscribe`/`unsubscribe`) change its interest set; every matching
//! snapshot is pushed as a `state_update` frame. Liveness follows the same
//! heartbeat and read-deadline rules as terminal sockets, and the
//! subscription is always removed when the socket closes.

use std::collections::HashSet;
use std::fmt::Display;
use std::sync::Arc;

use futures::{Sink, SinkExt, Stream, StreamExt};
use poem::web::websocket::Message;
use tokio::time::{Instant, interval_at, sleep};
use tracing::{debug, info, warn};

use super::bridge::{
    BridgeOutcome, BridgeSettings, BridgeState, REASON_CLIENT_DISCONNECTED, REASON_HEARTBEAT_TIMEOUT,
    log_transition, send_text, send_text_best_effort,
};
use super::codec::{Envelope, ErrorCode, MonitorEvent, MonitorRequest};
use super::state::{HostStateSnapshot, StateCollector, Subscription};

/// Interest set of one telemetry socket. Empty `hosts` means all hosts.
#[derive(Default)]
struct Interest {
    hosts: HashSet<String>,
    subscription: Option<Subscription>,
}

impl Interest {
    async fn next(&mut self) -> Option<Arc<HostStateSnapshot>> {
        match &mut self.subscription {
            Some(subscription) => subscription.recv().await,
            None => std::future::pending().await,
        }
    }
}

#[derive(Clone)]
pub struct MonitorBridge {
    collector: Arc<StateCollector>,
    settings: BridgeSettings,
}

impl MonitorBridge {
    pub fn new(collector: Arc<StateCollector>, settings: BridgeSettings) -> Self {
        Self {
            collector,
            settings,
        }
    }

    /// Drive an upgraded telemetry socket until it closes.
    pub async fn run<Tx, Rx, E>(&self, subscriber_id: &str, mut sink: Tx, mut stream: Rx) -> BridgeOutcome
    where
        Tx: Sink<Message> + Unpin + Send,
        Tx::Error: Display,
        Rx: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: Display,
    {
        info!("Telemetry socket {} opened", subscriber_id);
        let mut interest = Interest::default();
        let mut state = BridgeState::Upgraded;

        let heartbeat_every = self.settings.heartbeat;
        let read_deadline = self.settings.read_deadline;
        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        let deadline = sleep(read_deadline);
        tokio::pin!(deadline);

        let reason = loop {
            tokio::select! {
                frame = stream.next() => {
                    let message = match frame {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            warn!("Read error on telemetry socket {}: {}", subscriber_id, e);
                            break REASON_CLIENT_DISCONNECTED;
                        }
                        None => break REASON_CLIENT_DISCONNECTED,
                    };
                    deadline.as_mut().reset(Instant::now() + read_deadline);

                    let text = match message {
                        Message::Text(text) => text,
                        Message::Close(_) => break REASON_CLIENT_DISCONNECTED,
                        _ => continue,
                    };
                    let reply = self.handle_control(subscriber_id, &mut interest, &text);
                    if interest.subscription.is_some() && state == BridgeState::Upgraded {
                        log_transition(subscriber_id, state, BridgeState::Streaming);
                        state = BridgeState::Streaming;
                    }
                    if let Some(reply) = reply
                        && send_text(&mut sink, reply).await.is_err()
                    {
                        break REASON_CLIENT_DISCONNECTED;
                    }
                }
                snapshot = interest.next() => {
                    let Some(snapshot) = snapshot else {
                        interest.subscription = None;
                        continue;
                    };
                    let event = MonitorEvent::StateUpdate { data: (*snapshot).clone() };
                    match event.encode() {
                        Ok(text) => {
                            if let Err(e) = send_text(&mut sink, text).await {
                                warn!("Write error on telemetry socket {}: {}", subscriber_id, e);
                                break REASON_CLIENT_DISCONNECTED;
                            }
                        }
                        Err(e) => warn!("Skipping snapshot for {}: {}", snapshot.host_id, e),
                    }
                }
                _ = heartbeat.tick() => {
                    let Ok(ping) = Envelope::Ping.encode() else { continue };
                    if send_text(&mut sink, ping).await.is_err() {
                        break REASON_CLIENT_DISCONNECTED;
                    }
                }
                _ = &mut deadline => {
                    warn!("No frames on telemetry socket {} for {:?}", subscriber_id, read_deadline);
                    break REASON_HEARTBEAT_TIMEOUT;
                }
            }
        };

        log_transition(subscriber_id, state, BridgeState::Closing);
        drop(interest);
        self.collector.unsubscribe(subscriber_id);
        if reason != REASON_CLIENT_DISCONNECTED
            && let Ok(text) = Envelope::Disconnected.encode()
        {
            send_text_best_effort(&mut sink, text).await;
        }
        let _ = sink.close().await;
        log_transition(subscriber_id, BridgeState::Closing, BridgeState::Closed);
        info!("Telemetry socket {} closed: {}", subscriber_id, reason);

        BridgeOutcome {
            state: BridgeState::Closed,
            reason: reason.to_string(),
        }
    }

    /// Apply one control frame. Returns an error frame to send back, if any.
    fn handle_control(&self, subscriber_id: &str, interest: &mut Interest, text: &str) -> Option<String> {
        let request = match MonitorRequest::decode(text) {
            Ok(request) => request,
            Err(e) => {
                debug!("Bad control frame on {}: {}", subscriber_id, e);
                return error_frame(e.error_code(), e.to_string());
            }
        };

        match request {
            MonitorRequest::Subscribe { host_ids } => {
                interest.hosts = host_ids.into_iter().collect();
                interest.subscription = Some(
                    self.collector
                        .subscribe(subscriber_id, interest.hosts.iter().cloned()),
                );
                None
            }
            MonitorRequest::Unsubscribe { host_ids } => {
                if host_ids.is_empty() {
                    interest.hosts.clear();
                    interest.subscription = None;
                    self.collector.unsubscribe(subscriber_id);
                    return None;
                }
                if interest.subscription.is_none() {
                    return None;
                }
                if interest.hosts.is_empty() {
                    return error_frame(
                        ErrorCode::InvalidInput,
                        "cannot remove individual hosts from an all-hosts subscription".into(),
                    );
                }
                for host_id in &host_ids {
                    interest.hosts.remove(host_id);
                }
                if interest.hosts.is_empty() {
                    interest.subscription = None;
                    self.collector.unsubscribe(subscriber_id);
                } else {
                    interest.subscription = Some(
                        self.collector
                            .subscribe(subscriber_id, interest.hosts.iter().cloned()),
                    );
                }
                None
            }
        }
    }
}

fn error_frame(code: ErrorCode, message: String) -> Option<String> {
    MonitorEvent::Error { code, message }.encode().ok()
}
