//! # Backend Contract
//!
//! Every audio engine implements [`PlayerBackend`]. The facade owns exactly
//! one backend at a time and is the single consumer of its notification
//! streams.
//!
//! Command methods are prompt: they hand work to the backend's internal
//! command loop and return, they never wait for audio to actually start.
//! Asynchronous failures (network, decode, protocol) surface as `Error` or
//! `Stopped` on the state stream rather than as method errors.

use crate::error::Result;
use crate::types::{PlaybackState, PlayableTrack};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Channel capacity for state-change notifications.
pub const STATE_CHANNEL_CAPACITY: usize = 16;
/// Channel capacity for position ticks. Small on purpose; ticks are shed
/// under backpressure.
pub const TIME_CHANNEL_CAPACITY: usize = 4;

/// How long a producer is willing to wait on a full state channel before
/// giving up on the notification.
pub const STATE_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Notification streams handed to the facade. Single reader; taken once.
pub struct BackendNotifications {
    /// State transitions, in order. Producers wait up to
    /// [`STATE_SEND_TIMEOUT`] on a full channel, then drop the notification.
    pub state_rx: mpsc::Receiver<PlaybackState>,
    /// Position ticks. Best-effort: producers use `try_send` and shed ticks
    /// when the consumer lags.
    pub time_rx: mpsc::Receiver<Duration>,
}

/// Pluggable playback engine.
#[async_trait]
pub trait PlayerBackend: Send + Sync {
    /// Stable identifier used in the registry and in configuration.
    fn name(&self) -> &'static str;

    /// Begin playback of a new track, replacing whatever was playing.
    /// Submission is debounced: if the command loop is saturated for more
    /// than a second the request is dropped with a warning.
    async fn play(&self, track: PlayableTrack);

    async fn pause(&self);
    async fn resume(&self);

    /// Stop playback and release the current session's resources. The
    /// backend stays usable for a subsequent `play`.
    async fn stop(&self);

    async fn toggle(&self);

    /// Reposition within the current track. Out-of-range positions are
    /// clamped; engines that cannot seek the current codec ignore this.
    async fn seek(&self, position: Duration);

    /// Current position. Estimated between engine reads where the engine's
    /// own reporting is coarse.
    fn position(&self) -> Duration;

    fn state(&self) -> PlaybackState;

    fn is_playing(&self) -> bool {
        self.state().is_playing()
    }

    /// Current volume, 0..=100.
    fn volume(&self) -> u8;

    /// Set volume. Values above 100 are rejected with
    /// [`crate::error::PlayerError::InvalidVolume`].
    async fn set_volume(&self, volume: u8) -> Result<()>;

    async fn volume_up(&self) -> Result<()> {
        self.set_volume(self.volume().saturating_add(5).min(100)).await
    }

    async fn volume_down(&self) -> Result<()> {
        self.set_volume(self.volume().saturating_sub(5)).await
    }

    /// Take the notification streams. Returns `None` after the first call.
    fn take_notifications(&self) -> Option<BackendNotifications>;

    /// Release every resource the backend holds: child processes, sockets,
    /// devices, tasks. Idempotent. After close the backend is defunct.
    async fn close(&self);
}

/// Producer-side halves of the notification streams, shared by the engines.
#[derive(Clone)]
pub struct NotificationSender {
    state_tx: mpsc::Sender<PlaybackState>,
    time_tx: mpsc::Sender<Duration>,
}

impl NotificationSender {
    /// Create a connected sender/receiver pair with the standard capacities.
    pub fn channel() -> (Self, BackendNotifications) {
        let (state_tx, state_rx) = mpsc::channel(STATE_CHANNEL_CAPACITY);
        let (time_tx, time_rx) = mpsc::channel(TIME_CHANNEL_CAPACITY);
        (
            Self { state_tx, time_tx },
            BackendNotifications { state_rx, time_rx },
        )
    }

    /// Publish a state transition. Waits up to [`STATE_SEND_TIMEOUT`] on a
    /// full channel, then drops the notification with a warning.
    pub async fn send_state(&self, state: PlaybackState) {
        if self
            .state_tx
            .send_timeout(state, STATE_SEND_TIMEOUT)
            .await
            .is_err()
        {
            tracing::warn!(?state, "state notification dropped, consumer stalled");
        }
    }

    /// Publish a position tick. Never blocks; sheds under backpressure.
    pub fn send_time(&self, passed: Duration) {
        let _ = self.time_tx.try_send(passed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_sends_arrive_in_order() {
        let (tx, mut notifications) = NotificationSender::channel();
        tx.send_state(PlaybackState::Buffering).await;
        tx.send_state(PlaybackState::Playing).await;
        tx.send_state(PlaybackState::Paused).await;

        assert_eq!(
            notifications.state_rx.recv().await,
            Some(PlaybackState::Buffering)
        );
        assert_eq!(
            notifications.state_rx.recv().await,
            Some(PlaybackState::Playing)
        );
        assert_eq!(
            notifications.state_rx.recv().await,
            Some(PlaybackState::Paused)
        );
    }

    #[tokio::test]
    async fn test_time_ticks_shed_when_full() {
        let (tx, mut notifications) = NotificationSender::channel();
        for i in 0..(TIME_CHANNEL_CAPACITY + 8) {
            tx.send_time(Duration::from_secs(i as u64));
        }
        // Only the first CAPACITY ticks survive; the rest were shed.
        let mut received = 0;
        while notifications.time_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, TIME_CHANNEL_CAPACITY);
    }
}
