//! Event system for reward notifications
//!
//! The engine emits an event for every committed award so that UI surfaces
//! can show a toast without polling. Useful for:
//! - Award notifications
//! - Audit logging
//! - Alerting on users queued for reconciliation

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

/// Reward events emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RewardEvent {
    PointsAwarded {
        user_id: String,
        trigger_type: String,
        points: i64,
        total_points: i64,
    },
    BadgeAwarded {
        user_id: String,
        badge_id: String,
        name: String,
    },
    TierChanged {
        user_id: String,
        from: String,
        to: String,
    },
    ReconciliationFlagged {
        user_id: String,
        reason: String,
    },
}

impl RewardEvent {
    pub fn user_id(&self) -> &str {
        match self {
            Self::PointsAwarded { user_id, .. }
            | Self::BadgeAwarded { user_id, .. }
            | Self::TierChanged { user_id, .. }
            | Self::ReconciliationFlagged { user_id, .. } => user_id,
        }
    }
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &RewardEvent);
}

/// Event bus for broadcasting reward events
pub struct EventBus {
    sender: broadcast::Sender<RewardEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: RewardEvent) {
        trace!(event = ?event, "Emitting reward event");
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RewardEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging event listener for audit trails
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &RewardEvent) {
        match event {
            RewardEvent::BadgeAwarded { user_id, badge_id, .. } => {
                info!(user_id = %user_id, badge_id = %badge_id, "Badge awarded");
            }
            RewardEvent::TierChanged { user_id, from, to } => {
                info!(user_id = %user_id, from = %from, to = %to, "Tier changed");
            }
            RewardEvent::ReconciliationFlagged { user_id, reason } => {
                warn!(user_id = %user_id, reason = %reason, "User flagged for reconciliation");
            }
            RewardEvent::PointsAwarded { .. } => {
                trace!(event = ?event, "Reward event");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_event_bus_emit_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.emit(RewardEvent::BadgeAwarded {
            user_id: "u-1".into(),
            badge_id: "first_event".into(),
            name: "First Event".into(),
        });

        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("timeout")
            .expect("receive error");

        assert_eq!(event.user_id(), "u-1");
        match event {
            RewardEvent::BadgeAwarded { badge_id, .. } => assert_eq!(badge_id, "first_event"),
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_bus_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(RewardEvent::TierChanged {
            user_id: "u-1".into(),
            from: "Bronze".into(),
            to: "Silver".into(),
        });
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = RewardEvent::PointsAwarded {
            user_id: "u-1".into(),
            trigger_type: "team_join".into(),
            points: 15,
            total_points: 15,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "points_awarded");
        assert_eq!(json["points"], 15);
    }
}
