//! # Event Bus
//!
//! Broadcast-channel event bus used for decoupled communication between the
//! playback core, the UI layer, and the remote-control bridges.
//!
//! Delivery is best-effort: a lagging subscriber drops the oldest events
//! rather than stalling publishers. Consumers that need a precise picture of
//! playback poll the facade's snapshot instead of replaying every event.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, PlaybackEvent};
//!
//! let bus = EventBus::with_default_capacity();
//! let mut rx = bus.subscribe();
//! bus.emit(CoreEvent::Playback(PlaybackEvent::NextRequested)).ok();
//! ```

use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

/// Top-level event published on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    Playback(PlaybackEvent),
}

/// Playback-domain events.
///
/// Transport-level state lives in the playback facade itself; these events
/// carry the track-level requests and lifecycle notices that the playback
/// core cannot satisfy alone (playlist navigation, rating) or that other
/// modules want to observe (backend switches, asynchronous failures).
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// The active track played to its end.
    TrackEnded,
    /// A remote-control surface asked for the next track.
    NextRequested,
    /// A remote-control surface asked for the previous track.
    PreviousRequested,
    /// A remote-control surface liked the current track.
    LikeRequested,
    /// A remote-control surface disliked the current track.
    DislikeRequested,
    /// The active backend was replaced at runtime.
    BackendSwitched { from: String, to: String },
    /// An asynchronous playback failure surfaced via the state stream.
    PlaybackFailed { reason: String },
}

impl CoreEvent {
    /// Short human-readable description, used in logs.
    pub fn description(&self) -> &'static str {
        match self {
            CoreEvent::Playback(PlaybackEvent::TrackEnded) => "track ended",
            CoreEvent::Playback(PlaybackEvent::NextRequested) => "next requested",
            CoreEvent::Playback(PlaybackEvent::PreviousRequested) => "previous requested",
            CoreEvent::Playback(PlaybackEvent::LikeRequested) => "like requested",
            CoreEvent::Playback(PlaybackEvent::DislikeRequested) => "dislike requested",
            CoreEvent::Playback(PlaybackEvent::BackendSwitched { .. }) => "backend switched",
            CoreEvent::Playback(PlaybackEvent::PlaybackFailed { .. }) => "playback failed",
        }
    }
}

/// Central event bus for publishing and subscribing to [`CoreEvent`]s.
///
/// Cloning the bus is cheap; all clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Create an event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create an event bus with [`DEFAULT_EVENT_BUFFER_SIZE`].
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of subscribers the event was delivered to, or an
    /// error when there are none. Publishing to an empty bus is not a fault
    /// worth surfacing to callers, so most call sites use `.ok()`.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        tracing::trace!(event = event.description(), "emitting core event");
        self.sender.send(event)
    }

    /// Publish a playback event, ignoring the no-subscriber case.
    pub fn emit_playback(&self, event: PlaybackEvent) {
        self.emit(CoreEvent::Playback(event)).ok();
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(CoreEvent::Playback(PlaybackEvent::TrackEnded))
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event, CoreEvent::Playback(PlaybackEvent::TrackEnded));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new(8);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(CoreEvent::Playback(PlaybackEvent::NextRequested))
            .unwrap();

        assert_eq!(
            rx1.recv().await.unwrap(),
            CoreEvent::Playback(PlaybackEvent::NextRequested)
        );
        assert_eq!(
            rx2.recv().await.unwrap(),
            CoreEvent::Playback(PlaybackEvent::NextRequested)
        );
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::with_default_capacity();
        assert!(bus
            .emit(CoreEvent::Playback(PlaybackEvent::PreviousRequested))
            .is_err());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_drops_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for _ in 0..4 {
            bus.emit(CoreEvent::Playback(PlaybackEvent::TrackEnded))
                .unwrap();
        }

        // The first recv reports how many events were missed.
        match rx.recv().await {
            Err(RecvError::Lagged(missed)) => assert!(missed >= 1),
            other => panic!("expected lag error, got {:?}", other),
        }
    }
}
