use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use tokio::sync::broadcast;
use tracing::debug;

use crate::flow::tracker::FlowSample;
use crate::flow::{ConnectionKey, SocketState};
use crate::proc::ProcessIdentity;
use crate::rollup::{AppSample, GlobalSample};

/// Connection-level notification payload.
#[derive(Debug, Clone)]
pub struct ConnectionUpdate {
    pub key: ConnectionKey,
    pub state: SocketState,
    pub identity: Option<ProcessIdentity>,
    /// App key of the owning process, when attributed and cached.
    pub app: Option<String>,
    pub send_bps: f64,
    pub recv_bps: f64,
    pub total_sent: u64,
    pub total_received: u64,
    pub first_seen: SystemTime,
    pub opened: bool,
    pub closed: bool,
}

impl ConnectionUpdate {
    /// Builds an update from a per-cycle flow sample.
    pub fn from_sample(sample: &FlowSample, app: Option<String>) -> Self {
        Self {
            key: sample.key,
            state: sample.state,
            identity: sample.identity,
            app,
            send_bps: sample.send_bps,
            recv_bps: sample.recv_bps,
            total_sent: sample.total_sent,
            total_received: sample.total_received,
            first_seen: sample.first_seen,
            opened: sample.opened,
            closed: sample.closed,
        }
    }
}

/// Typed notification events pushed to external subscribers.
///
/// A closed set with concrete payloads: transports frame and route these;
/// the core knows nothing about subscriber sessions.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    ConnectionChanged(ConnectionUpdate),
    AppSampleReady(AppSample),
    GlobalSampleReady(GlobalSample),
}

impl ChangeEvent {
    /// Returns the canonical event kind label.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionChanged(_) => "connection_changed",
            Self::AppSampleReady(_) => "app_sample_ready",
            Self::GlobalSampleReady(_) => "global_sample_ready",
        }
    }
}

/// Fan-out point for change events.
///
/// Backed by a bounded broadcast channel: a subscriber that falls behind
/// loses the oldest events for itself only and observes the lag, while the
/// publishing path never blocks on slow consumers.
pub struct Publisher {
    tx: broadcast::Sender<ChangeEvent>,
    published: AtomicU64,
}

impl Publisher {
    /// Creates a publisher with the given per-subscriber buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            published: AtomicU64::new(0),
        }
    }

    /// Registers a new subscriber receiving all subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    /// Publishes one event to all current subscribers.
    ///
    /// With no subscribers the event is discarded; production continues
    /// regardless of delivery.
    pub fn publish(&self, event: ChangeEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);

        if self.tx.receiver_count() == 0 {
            return;
        }

        if let Err(e) = self.tx.send(event) {
            // All receivers detached between the check and the send.
            debug!(kind = e.0.kind(), "change event had no receivers");
        }
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Total events produced since startup, delivered or not.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use crate::flow::Protocol;

    use super::*;

    fn update(closed: bool) -> ConnectionUpdate {
        ConnectionUpdate {
            key: ConnectionKey {
                local: SocketAddr::from(([127, 0, 0, 1], 9000)),
                remote: SocketAddr::from(([127, 0, 0, 2], 443)),
                pid: 7,
                protocol: Protocol::Tcp,
            },
            state: SocketState::Established,
            identity: None,
            app: Some("firefox".to_string()),
            send_bps: 1.0,
            recv_bps: 2.0,
            total_sent: 10,
            total_received: 20,
            first_seen: SystemTime::UNIX_EPOCH,
            opened: true,
            closed,
        }
    }

    #[test]
    fn test_event_kinds() {
        assert_eq!(
            ChangeEvent::ConnectionChanged(update(false)).kind(),
            "connection_changed"
        );
        let sample = GlobalSample {
            window_start: SystemTime::UNIX_EPOCH,
            window_end: SystemTime::UNIX_EPOCH,
            bytes_sent: 0,
            bytes_received: 0,
        };
        assert_eq!(
            ChangeEvent::GlobalSampleReady(sample).kind(),
            "global_sample_ready"
        );
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let publisher = Publisher::new(16);
        let mut a = publisher.subscribe();
        let mut b = publisher.subscribe();

        publisher.publish(ChangeEvent::ConnectionChanged(update(false)));

        for rx in [&mut a, &mut b] {
            let event = rx.recv().await.expect("event delivered");
            assert_eq!(event.kind(), "connection_changed");
        }
        assert_eq!(publisher.published_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_discarded() {
        let publisher = Publisher::new(16);
        publisher.publish(ChangeEvent::ConnectionChanged(update(false)));
        assert_eq!(publisher.subscriber_count(), 0);
        assert_eq!(publisher.published_count(), 1);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_loses_oldest_only() {
        let publisher = Publisher::new(2);
        let mut rx = publisher.subscribe();

        for _ in 0..4 {
            publisher.publish(ChangeEvent::ConnectionChanged(update(false)));
        }

        // The first receive reports the lag, subsequent ones deliver.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert_eq!(n, 2),
            other => panic!("expected lag, got {other:?}"),
        }
        assert!(rx.recv().await.is_ok());
        assert!(rx.recv().await.is_ok());
    }
}
