//! Ride state change events.
//!
//! The core publishes a [`RideEvent`] after every successful origin write
//! and after every successful mirror propagation. The real-time transport
//! (sockets, pub/sub) subscribes to the [`EventBus`] and fans events out to
//! connected clients.
//!
//! ## Guarantees
//!
//! - **At-most-once delivery**: Slow receivers may miss events
//! - **In-memory only**: Events are not persisted
//! - **No replay**: Lagged receivers get `RecvError::Lagged`
//!
//! Clients that miss an event resynchronize through `get_ride`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ride::{Ride, RideId, RideStatus, RiderId};

const DEFAULT_CAPACITY: usize = 1024;

/// Which copy a change landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordCopy {
    Origin,
    Mirror,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideEvent {
    pub ride_id: RideId,
    pub status: RideStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rider_id: Option<RiderId>,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub copy: RecordCopy,
}

impl RideEvent {
    pub fn from_ride(ride: &Ride, copy: RecordCopy) -> Self {
        Self {
            ride_id: ride.id,
            status: ride.status,
            rider_id: ride.rider_id,
            version: ride.version,
            timestamp: ride.updated_at,
            copy,
        }
    }
}

/// Broadcast channel for ride events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RideEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: RideEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RideEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ride::fixtures::requested_ride;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let ride = requested_ride();

        bus.emit(RideEvent::from_ride(&ride, RecordCopy::Origin));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.ride_id, ride.id);
        assert_eq!(event.status, RideStatus::Requested);
        assert_eq!(event.copy, RecordCopy::Origin);
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(RideEvent::from_ride(&requested_ride(), RecordCopy::Mirror));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn lagged_receiver_misses_events() {
        let bus = EventBus::with_capacity(1);
        let mut rx = bus.subscribe();
        let ride = requested_ride();
        bus.emit(RideEvent::from_ride(&ride, RecordCopy::Origin));
        bus.emit(RideEvent::from_ride(&ride, RecordCopy::Mirror));

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
        assert_eq!(rx.recv().await.unwrap().copy, RecordCopy::Mirror);
    }
}
