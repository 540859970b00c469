//! # In-process decode engine
//!
//! Plays tracks inside this process: bytes are spooled to a cache file while
//! a symphonia decode loop feeds an audio output through a ring buffer.
//! Playback starts as soon as a small prebuffer is spooled.
//!
//! Commands are serialized through a bounded channel into a single command
//! loop, so there is exactly one writer of session state. `play` submissions
//! time out after one second when the loop is saturated, which debounces
//! track-switch bursts.

mod decode;
mod output;
mod spool;

pub use output::{
    cpal_output_factory, null_output_factory, AudioOutput, OutputControl, OutputFactory,
    OUTPUT_CHANNELS, OUTPUT_SAMPLE_RATE,
};
pub use spool::{ByteSource, ByteStream, DefaultByteSource, Spool};

use crate::backend::{BackendNotifications, NotificationSender, PlayerBackend};
use crate::config::InProcessConfig;
use crate::error::{PlayerError, Result};
use crate::ring_buffer::RingBuffer;
use crate::timer::Timer;
use crate::types::{DecodeHint, PlaybackState, PlayableTrack};
use async_trait::async_trait;
use decode::{DecodeSession, SessionEnd};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const BACKEND_NAME: &str = "in_process";

/// Burst debounce on play submission.
const PLAY_SUBMIT_TIMEOUT: Duration = Duration::from_secs(1);
const COMMAND_CAPACITY: usize = 4;

enum Command {
    Play(Box<PlayableTrack>),
    Pause,
    Resume,
    Toggle,
    Stop,
    Seek(Duration),
    Close,
}

struct Shared {
    state: Mutex<PlaybackState>,
    volume: AtomicU8,
    control: OutputControl,
    timer: Mutex<Option<Arc<Timer>>>,
    notify: NotificationSender,
    closed: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: PlaybackState) {
        *self.state.lock() = state;
    }

    async fn publish_state(&self, state: PlaybackState) {
        self.set_state(state);
        self.notify.send_state(state).await;
    }
}

pub struct InProcessEngine {
    cmd_tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
    notifications: Mutex<Option<BackendNotifications>>,
}

impl InProcessEngine {
    /// Construct with the real HTTP source and cpal output.
    pub fn new(config: InProcessConfig, tick_interval: Duration, volume: u8) -> Result<Self> {
        Self::with_parts(
            config,
            tick_interval,
            volume,
            cpal_output_factory(),
            Arc::new(DefaultByteSource::new()),
        )
    }

    /// Construction seam: tests swap in a scripted byte source and a
    /// deviceless output.
    pub fn with_parts(
        config: InProcessConfig,
        tick_interval: Duration,
        volume: u8,
        output_factory: OutputFactory,
        source: Arc<dyn ByteSource>,
    ) -> Result<Self> {
        if volume > 100 {
            return Err(PlayerError::InvalidVolume(volume));
        }

        let (notify, notifications) = NotificationSender::channel();
        let control = OutputControl::new();
        let (gain, muted) = gain_for(volume);
        control.set_gain(gain, muted);
        control.set_paused(true);

        let ring = RingBuffer::new(config.ring_capacity);
        let output = output_factory(ring.clone(), control.clone())?;

        let shared = Arc::new(Shared {
            state: Mutex::new(PlaybackState::Stopped),
            volume: AtomicU8::new(volume),
            control,
            timer: Mutex::new(None),
            notify,
            closed: AtomicBool::new(false),
        });

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        tokio::spawn(command_loop(
            cmd_rx,
            Arc::clone(&shared),
            config,
            tick_interval,
            ring,
            output,
            source,
        ));

        Ok(Self {
            cmd_tx,
            shared,
            notifications: Mutex::new(Some(notifications)),
        })
    }

    async fn submit(&self, command: Command) {
        if self.cmd_tx.send(command).await.is_err() {
            tracing::warn!("command loop gone, command dropped");
        }
    }
}

#[async_trait]
impl PlayerBackend for InProcessEngine {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn play(&self, track: PlayableTrack) {
        if self
            .cmd_tx
            .send_timeout(Command::Play(Box::new(track)), PLAY_SUBMIT_TIMEOUT)
            .await
            .is_err()
        {
            tracing::warn!("play submission timed out, request dropped");
        }
    }

    async fn pause(&self) {
        self.submit(Command::Pause).await;
    }

    async fn resume(&self) {
        self.submit(Command::Resume).await;
    }

    async fn stop(&self) {
        self.submit(Command::Stop).await;
    }

    async fn toggle(&self) {
        self.submit(Command::Toggle).await;
    }

    async fn seek(&self, position: Duration) {
        self.submit(Command::Seek(position)).await;
    }

    fn position(&self) -> Duration {
        self.shared
            .timer
            .lock()
            .as_ref()
            .map(|timer| timer.passed())
            .unwrap_or_default()
    }

    fn state(&self) -> PlaybackState {
        *self.shared.state.lock()
    }

    fn volume(&self) -> u8 {
        self.shared.volume.load(Ordering::Relaxed)
    }

    async fn set_volume(&self, volume: u8) -> Result<()> {
        if volume > 100 {
            return Err(PlayerError::InvalidVolume(volume));
        }
        self.shared.volume.store(volume, Ordering::Relaxed);
        let (gain, muted) = gain_for(volume);
        self.shared.control.set_gain(gain, muted);
        Ok(())
    }

    fn take_notifications(&self) -> Option<BackendNotifications> {
        self.notifications.lock().take()
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.submit(Command::Close).await;
    }
}

/// External 0..=100 volume to output gain. The curve is exponential with
/// base 2: full volume is unity gain, every 20 points halves it, zero mutes.
fn gain_for(volume: u8) -> (f32, bool) {
    let exponent = f64::from(volume) * 5.0 / 100.0 - 5.0;
    (2f64.powf(exponent) as f32, volume == 0)
}

/// One playback session's moving parts, torn down as a unit.
struct Session {
    cancel: CancellationToken,
    spool: Arc<Spool>,
    timer: Arc<Timer>,
    pending_seek: Arc<Mutex<Option<Duration>>>,
    hint: DecodeHint,
    duration: Duration,
}

impl Session {
    async fn teardown(self) {
        self.cancel.cancel();
        self.timer.stop();
        self.spool.remove().await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn command_loop(
    mut cmd_rx: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
    config: InProcessConfig,
    tick_interval: Duration,
    ring: RingBuffer,
    output: Box<dyn AudioOutput>,
    source: Arc<dyn ByteSource>,
) {
    let mut session: Option<Session> = None;

    while let Some(command) = cmd_rx.recv().await {
        match command {
            Command::Play(track) => {
                if let Some(old) = session.take() {
                    old.teardown().await;
                    ring.clear();
                }
                session = start_session(
                    &shared,
                    &config,
                    tick_interval,
                    &ring,
                    Arc::clone(&source),
                    *track,
                )
                .await;
            }
            Command::Pause => {
                if session.is_some() && shared.state.lock().is_playing() {
                    shared.control.set_paused(true);
                    if let Some(timer) = shared.timer.lock().as_ref() {
                        timer.pause();
                    }
                    shared.publish_state(PlaybackState::Paused).await;
                }
            }
            Command::Resume => {
                if session.is_some() && *shared.state.lock() == PlaybackState::Paused {
                    shared.control.set_paused(false);
                    if let Some(timer) = shared.timer.lock().as_ref() {
                        timer.run();
                    }
                    shared.publish_state(PlaybackState::Playing).await;
                }
            }
            Command::Toggle => {
                let state = *shared.state.lock();
                match state {
                    PlaybackState::Playing => {
                        shared.control.set_paused(true);
                        if let Some(timer) = shared.timer.lock().as_ref() {
                            timer.pause();
                        }
                        shared.publish_state(PlaybackState::Paused).await;
                    }
                    PlaybackState::Paused => {
                        shared.control.set_paused(false);
                        if let Some(timer) = shared.timer.lock().as_ref() {
                            timer.run();
                        }
                        shared.publish_state(PlaybackState::Playing).await;
                    }
                    _ => {}
                }
            }
            Command::Seek(position) => {
                if let Some(current) = session.as_ref() {
                    if current.hint != DecodeHint::Mp3 {
                        tracing::debug!(hint = ?current.hint, "seek unsupported for codec, ignored");
                        continue;
                    }
                    let target = clamp_position(position, current.duration);
                    *current.pending_seek.lock() = Some(target);
                    current.timer.set_passed(target);
                    ring.clear();
                }
            }
            Command::Stop => {
                if let Some(old) = session.take() {
                    old.teardown().await;
                    ring.clear();
                    shared.control.set_paused(true);
                    shared.timer.lock().take();
                    shared.publish_state(PlaybackState::Stopped).await;
                }
            }
            Command::Close => {
                if let Some(old) = session.take() {
                    old.teardown().await;
                }
                shared.timer.lock().take();
                output.shutdown();
                break;
            }
        }
    }
}

/// Start spool, gate, timer and decode task for one track. Returns `None`
/// (after publishing a terminal state) when the source cannot be played.
async fn start_session(
    shared: &Arc<Shared>,
    config: &InProcessConfig,
    tick_interval: Duration,
    ring: &RingBuffer,
    source: Arc<dyn ByteSource>,
    track: PlayableTrack,
) -> Option<Session> {
    shared.publish_state(PlaybackState::Buffering).await;

    let cancel = CancellationToken::new();
    let hint = track.codec;

    let spool = match Spool::start(
        source,
        track.url.clone(),
        config.spool_dir(),
        config.retry_attempts,
        config.retry_backoff,
        cancel.clone(),
    )
    .await
    {
        Ok(spool) => Arc::new(spool),
        Err(err) => {
            tracing::error!(url = %track.url, %err, "spool start failed");
            shared.publish_state(PlaybackState::Stopped).await;
            return None;
        }
    };

    // FLAC frames are large; give the demuxer more runway before starting.
    let gate = if hint == DecodeHint::Flac {
        config.prebuffer_bytes * 4
    } else {
        config.prebuffer_bytes
    };
    if let Err(err) = spool.wait_for_bytes(gate).await {
        tracing::error!(url = %track.url, %err, "prebuffer gate failed");
        spool.remove().await;
        shared.publish_state(PlaybackState::Stopped).await;
        return None;
    }

    let tick_notify = shared.notify.clone();
    let timer = Arc::new(Timer::new(
        tick_interval,
        Box::new(move |passed| tick_notify.send_time(passed)),
    ));
    shared.timer.lock().replace(Arc::clone(&timer));

    let pending_seek = Arc::new(Mutex::new(None));
    let decode = DecodeSession {
        spool: Arc::clone(&spool),
        hint,
        ring: ring.clone(),
        timer: Arc::clone(&timer),
        cancel: cancel.clone(),
        pending_seek: Arc::clone(&pending_seek),
    };

    let watcher_shared = Arc::clone(shared);
    let watcher_cancel = cancel.clone();
    let watcher_timer = Arc::clone(&timer);
    tokio::spawn(async move {
        let end = match tokio::task::spawn_blocking(move || decode::run_session(decode)).await {
            Ok(end) => end,
            Err(err) => SessionEnd::Failed(PlayerError::Decode(format!("decode task: {err}"))),
        };
        if watcher_cancel.is_cancelled() {
            return;
        }
        watcher_timer.stop();
        watcher_shared.control.set_paused(true);
        match end {
            SessionEnd::Finished => {
                tracing::debug!("track finished");
                watcher_shared.publish_state(PlaybackState::Stopped).await;
            }
            SessionEnd::Cancelled => {}
            SessionEnd::Failed(PlayerError::Source(reason)) => {
                tracing::error!(%reason, "source failed mid-track");
                watcher_shared.publish_state(PlaybackState::Stopped).await;
            }
            SessionEnd::Failed(err) => {
                tracing::error!(%err, "decode session failed");
                watcher_shared.publish_state(PlaybackState::Error).await;
            }
        }
    });

    shared.control.set_paused(false);
    timer.run();
    shared.publish_state(PlaybackState::Playing).await;

    Some(Session {
        cancel,
        spool,
        timer,
        pending_seek,
        hint,
        duration: track.duration,
    })
}

/// Clamp a seek target into the track. An unknown duration passes the target
/// through untouched.
fn clamp_position(position: Duration, duration: Duration) -> Duration {
    if duration.is_zero() {
        return position;
    }
    position.min(duration.saturating_sub(Duration::from_millis(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_mapping_endpoints() {
        let (gain, muted) = gain_for(100);
        assert!((gain - 1.0).abs() < 1e-6);
        assert!(!muted);

        let (gain, muted) = gain_for(0);
        assert!(muted);
        assert!(gain < 0.04);
    }

    #[test]
    fn test_gain_halves_every_twenty_points() {
        let (at_80, _) = gain_for(80);
        let (at_60, _) = gain_for(60);
        assert!((at_80 - 0.5).abs() < 1e-6);
        assert!((at_60 - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_clamp_position() {
        let duration = Duration::from_secs(180);
        assert_eq!(
            clamp_position(Duration::from_secs(60), duration),
            Duration::from_secs(60)
        );
        assert_eq!(
            clamp_position(Duration::from_secs(3600), duration),
            duration - Duration::from_millis(1)
        );
        // Unknown duration: no clamping possible.
        assert_eq!(
            clamp_position(Duration::from_secs(60), Duration::ZERO),
            Duration::from_secs(60)
        );
    }
}
