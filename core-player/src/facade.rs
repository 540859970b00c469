//! # Player facade
//!
//! The single entry point the application talks to. Owns a registry of
//! backend registrations, exactly one active backend, and the notification
//! pump that turns backend streams into [`PlayingInfo`] snapshots and
//! playback events.
//!
//! Backends can be switched at runtime; the facade captures the transport
//! state around the switch and restores it on the new backend, so from the
//! outside the track keeps playing.

use crate::backend::{BackendNotifications, PlayerBackend};
use crate::config::PlayerConfig;
use crate::error::{PlayerError, Result};
use crate::remote::Controller;
use crate::types::{PlaybackState, PlayableTrack, PlayingInfo};
use async_trait::async_trait;
use core_runtime::events::{EventBus, PlaybackEvent};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

/// Budget for constructing a backend, covering process spawns and daemon
/// handshakes.
pub const CONSTRUCTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Deferred backend constructor.
pub type BackendFactory =
    Box<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn PlayerBackend>>> + Send + Sync>;

/// One selectable backend.
pub struct BackendRegistration {
    pub name: &'static str,
    /// Higher wins during automatic selection.
    pub priority: u32,
    /// Cheap environment probe: is this backend worth constructing here?
    pub available: Box<dyn Fn() -> bool + Send + Sync>,
    pub factory: BackendFactory,
}

struct Active {
    backend: Arc<dyn PlayerBackend>,
    pump_cancel: CancellationToken,
}

/// Facade-side view of what the active backend last reported.
#[derive(Default)]
struct Observed {
    state: PlaybackState,
    position: Duration,
}

pub struct PlayerFacade {
    config: PlayerConfig,
    registry: Mutex<Vec<BackendRegistration>>,
    active: RwLock<Option<Active>>,
    current_track: Arc<Mutex<Option<PlayableTrack>>>,
    observed: Arc<Mutex<Observed>>,
    info_tx: watch::Sender<PlayingInfo>,
    events: EventBus,
}

impl PlayerFacade {
    pub fn new(config: PlayerConfig, events: EventBus) -> Result<Self> {
        config.validate()?;
        let (info_tx, _) = watch::channel(PlayingInfo::default());
        Ok(Self {
            config,
            registry: Mutex::new(Vec::new()),
            active: RwLock::new(None),
            current_track: Arc::new(Mutex::new(None)),
            observed: Arc::new(Mutex::new(Observed::default())),
            info_tx,
            events,
        })
    }

    pub fn register(&self, registration: BackendRegistration) {
        self.registry.lock().push(registration);
    }

    /// Pick and construct the configured backend (or the best available one)
    /// and start pumping its notifications. Failure is startup-fatal.
    pub async fn initialize(&self) -> Result<()> {
        let name = self.select_backend_name()?;
        let backend = self.construct(name).await?;
        self.install(backend).await;
        tracing::info!(backend = name, "playback backend initialized");
        Ok(())
    }

    /// Resolve the configured backend name against the registry.
    fn select_backend_name(&self) -> Result<&'static str> {
        let registry = self.registry.lock();
        if self.config.backend == "auto" {
            return registry
                .iter()
                .filter(|r| (r.available)())
                .max_by_key(|r| r.priority)
                .map(|r| r.name)
                .ok_or(PlayerError::NoPlayerAvailable);
        }
        let registration = registry
            .iter()
            .find(|r| r.name == self.config.backend)
            .ok_or_else(|| PlayerError::BackendNotFound(self.config.backend.clone()))?;
        if !(registration.available)() {
            return Err(PlayerError::BackendUnavailable(registration.name.to_string()));
        }
        Ok(registration.name)
    }

    async fn construct(&self, name: &str) -> Result<Arc<dyn PlayerBackend>> {
        let future = {
            let registry = self.registry.lock();
            let registration = registry
                .iter()
                .find(|r| r.name == name)
                .ok_or_else(|| PlayerError::BackendNotFound(name.to_string()))?;
            if !(registration.available)() {
                return Err(PlayerError::BackendUnavailable(name.to_string()));
            }
            (registration.factory)()
        };
        tokio::time::timeout(CONSTRUCTION_TIMEOUT, future)
            .await
            .map_err(|_| PlayerError::Timeout(format!("constructing backend '{name}'")))?
    }

    async fn install(&self, backend: Arc<dyn PlayerBackend>) {
        let pump_cancel = CancellationToken::new();
        if let Some(notifications) = backend.take_notifications() {
            tokio::spawn(pump_notifications(
                notifications,
                Arc::clone(&self.current_track),
                Arc::clone(&self.observed),
                self.info_tx.clone(),
                self.events.clone(),
                Arc::clone(&backend),
                pump_cancel.clone(),
            ));
        } else {
            tracing::warn!("backend notifications already taken");
        }
        *self.active.write().await = Some(Active {
            backend,
            pump_cancel,
        });
    }

    /// Tear down the active backend and bring up the named one. If a track
    /// was loaded, playback resumes on the new backend at the old position.
    pub async fn switch_backend(&self, name: &str) -> Result<()> {
        let (was_playing, position, track, from) = {
            let active = self.active.read().await;
            let Some(active) = active.as_ref() else {
                return Err(PlayerError::NoPlayerAvailable);
            };
            if active.backend.name() == name {
                return Ok(());
            }
            (
                active.backend.state(),
                active.backend.position(),
                self.current_track.lock().clone(),
                active.backend.name(),
            )
        };

        let replacement = self.construct(name).await?;

        if let Some(old) = self.active.write().await.take() {
            old.pump_cancel.cancel();
            old.backend.close().await;
        }
        self.install(replacement).await;

        if let Some(track) = track {
            if matches!(was_playing, PlaybackState::Playing | PlaybackState::Paused) {
                let active = self.active.read().await;
                if let Some(active) = active.as_ref() {
                    active.backend.play(track).await;
                    active.backend.seek(position).await;
                    if was_playing == PlaybackState::Paused {
                        active.backend.pause().await;
                    }
                }
            }
        }

        self.events.emit_playback(PlaybackEvent::BackendSwitched {
            from: from.to_string(),
            to: name.to_string(),
        });
        tracing::info!(from, to = name, "backend switched");
        Ok(())
    }

    pub async fn current_backend_name(&self) -> Option<&'static str> {
        self.active.read().await.as_ref().map(|a| a.backend.name())
    }

    pub async fn play(&self, track: PlayableTrack) -> Result<()> {
        let active = self.active.read().await;
        let active = active.as_ref().ok_or(PlayerError::NoPlayerAvailable)?;
        self.current_track.lock().replace(track.clone());
        self.observed.lock().position = Duration::ZERO;
        active.backend.play(track).await;
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        self.with_backend(|b| async move { b.pause().await }).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.with_backend(|b| async move { b.resume().await }).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.current_track.lock().take();
        self.with_backend(|b| async move { b.stop().await }).await
    }

    pub async fn toggle(&self) -> Result<()> {
        self.with_backend(|b| async move { b.toggle().await }).await
    }

    pub async fn seek(&self, position: Duration) -> Result<()> {
        self.with_backend(|b| async move { b.seek(position).await })
            .await
    }

    pub async fn set_volume(&self, volume: u8) -> Result<()> {
        if volume > 100 {
            return Err(PlayerError::InvalidVolume(volume));
        }
        let active = self.active.read().await;
        let active = active.as_ref().ok_or(PlayerError::NoPlayerAvailable)?;
        active.backend.set_volume(volume).await
    }

    pub async fn volume(&self) -> u8 {
        self.active
            .read()
            .await
            .as_ref()
            .map(|a| a.backend.volume())
            .unwrap_or(0)
    }

    pub async fn position(&self) -> Duration {
        self.active
            .read()
            .await
            .as_ref()
            .map(|a| a.backend.position())
            .unwrap_or_default()
    }

    pub async fn state(&self) -> PlaybackState {
        self.active
            .read()
            .await
            .as_ref()
            .map(|a| a.backend.state())
            .unwrap_or_default()
    }

    pub async fn is_playing(&self) -> bool {
        self.state().await.is_playing()
    }

    /// Watch channel carrying the latest [`PlayingInfo`] snapshot.
    pub fn subscribe_info(&self) -> watch::Receiver<PlayingInfo> {
        self.info_tx.subscribe()
    }

    /// Close the active backend and stop its pump.
    pub async fn shutdown(&self) {
        if let Some(active) = self.active.write().await.take() {
            active.pump_cancel.cancel();
            active.backend.close().await;
        }
    }

    async fn with_backend<F, Fut>(&self, op: F) -> Result<()>
    where
        F: FnOnce(Arc<dyn PlayerBackend>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let backend = {
            let active = self.active.read().await;
            Arc::clone(&active.as_ref().ok_or(PlayerError::NoPlayerAvailable)?.backend)
        };
        op(backend).await;
        Ok(())
    }

    fn snapshot(
        track: &Option<PlayableTrack>,
        observed: &Observed,
        volume: u8,
    ) -> PlayingInfo {
        let mut info = PlayingInfo {
            state: observed.state,
            passed_duration: observed.position,
            volume,
            ..PlayingInfo::default()
        };
        if let Some(track) = track {
            info.total_duration = track.duration;
            info.track_id = track.id;
            info.name = track.title.clone();
            info.artist = track.artist_line();
            info.album = track.album.clone();
            info.album_artist = track.album_artist.clone();
            info.artwork_url = track.artwork_url.clone();
        }
        info
    }
}

#[async_trait]
impl Controller for PlayerFacade {
    async fn ctrl_pause(&self) -> Result<()> {
        self.pause().await
    }

    async fn ctrl_resume(&self) -> Result<()> {
        self.resume().await
    }

    async fn ctrl_stop(&self) -> Result<()> {
        self.stop().await
    }

    async fn ctrl_toggle(&self) -> Result<()> {
        self.toggle().await
    }

    async fn ctrl_seek(&self, position: Duration) -> Result<()> {
        self.seek(position).await
    }

    async fn ctrl_set_volume(&self, volume: u8) -> Result<()> {
        self.set_volume(volume).await
    }

    async fn ctrl_next(&self) -> Result<()> {
        self.events.emit_playback(PlaybackEvent::NextRequested);
        Ok(())
    }

    async fn ctrl_previous(&self) -> Result<()> {
        self.events.emit_playback(PlaybackEvent::PreviousRequested);
        Ok(())
    }

    async fn ctrl_like(&self) -> Result<()> {
        self.events.emit_playback(PlaybackEvent::LikeRequested);
        Ok(())
    }

    async fn ctrl_dislike(&self) -> Result<()> {
        self.events.emit_playback(PlaybackEvent::DislikeRequested);
        Ok(())
    }

    fn playing_info(&self) -> PlayingInfo {
        self.info_tx.borrow().clone()
    }
}

/// Single consumer of a backend's notification streams. Folds them into the
/// observed state, the info watch channel, and the event bus.
async fn pump_notifications(
    mut notifications: BackendNotifications,
    current_track: Arc<Mutex<Option<PlayableTrack>>>,
    observed: Arc<Mutex<Observed>>,
    info_tx: watch::Sender<PlayingInfo>,
    events: EventBus,
    backend: Arc<dyn PlayerBackend>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            state = notifications.state_rx.recv() => {
                let Some(state) = state else { return };
                let previous = {
                    let mut observed = observed.lock();
                    let previous = observed.state;
                    observed.state = state;
                    previous
                };
                handle_transition(previous, state, &current_track, &events);
                publish_info(&current_track, &observed, &info_tx, &backend);
            }
            passed = notifications.time_rx.recv() => {
                let Some(passed) = passed else { return };
                observed.lock().position = passed;
                publish_info(&current_track, &observed, &info_tx, &backend);
            }
        }
    }
}

fn handle_transition(
    previous: PlaybackState,
    state: PlaybackState,
    current_track: &Mutex<Option<PlayableTrack>>,
    events: &EventBus,
) {
    let was_active = matches!(
        previous,
        PlaybackState::Playing | PlaybackState::Paused | PlaybackState::Buffering
    );
    match state {
        PlaybackState::Stopped if was_active && current_track.lock().is_some() => {
            events.emit_playback(PlaybackEvent::TrackEnded);
        }
        PlaybackState::Error => {
            events.emit_playback(PlaybackEvent::PlaybackFailed {
                reason: "backend reported playback error".to_string(),
            });
        }
        _ => {}
    }
}

fn publish_info(
    current_track: &Mutex<Option<PlayableTrack>>,
    observed: &Mutex<Observed>,
    info_tx: &watch::Sender<PlayingInfo>,
    backend: &Arc<dyn PlayerBackend>,
) {
    let info = {
        let track = current_track.lock();
        let observed = observed.lock();
        PlayerFacade::snapshot(&track, &observed, backend.volume())
    };
    let _ = info_tx.send(info);
}
