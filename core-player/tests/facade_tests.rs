//! Facade behavior against scripted backends: selection, transport
//! forwarding, runtime switching with state restore, and event publishing.

use async_trait::async_trait;
use core_player::backend::{BackendNotifications, NotificationSender, PlayerBackend};
use core_player::config::PlayerConfig;
use core_player::error::{PlayerError, Result};
use core_player::facade::{BackendRegistration, PlayerFacade};
use core_player::Controller;
use core_player::types::{PlaybackState, PlayableTrack};
use core_runtime::events::{CoreEvent, EventBus, PlaybackEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

struct FakeBackend {
    name: &'static str,
    state: Mutex<PlaybackState>,
    position: Mutex<Duration>,
    volume: Mutex<u8>,
    played: Mutex<Vec<PlayableTrack>>,
    seeks: Mutex<Vec<Duration>>,
    closed: Mutex<bool>,
    notify: NotificationSender,
    notifications: Mutex<Option<BackendNotifications>>,
}

impl FakeBackend {
    fn new(name: &'static str) -> Arc<Self> {
        let (notify, notifications) = NotificationSender::channel();
        Arc::new(Self {
            name,
            state: Mutex::new(PlaybackState::Stopped),
            position: Mutex::new(Duration::ZERO),
            volume: Mutex::new(60),
            played: Mutex::new(Vec::new()),
            seeks: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
            notify,
            notifications: Mutex::new(Some(notifications)),
        })
    }

    async fn push_state(&self, state: PlaybackState) {
        *self.state.lock() = state;
        self.notify.send_state(state).await;
    }
}

#[async_trait]
impl PlayerBackend for FakeBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn play(&self, track: PlayableTrack) {
        self.played.lock().push(track);
        self.push_state(PlaybackState::Playing).await;
    }

    async fn pause(&self) {
        self.push_state(PlaybackState::Paused).await;
    }

    async fn resume(&self) {
        self.push_state(PlaybackState::Playing).await;
    }

    async fn stop(&self) {
        self.push_state(PlaybackState::Stopped).await;
    }

    async fn toggle(&self) {
        let next = match *self.state.lock() {
            PlaybackState::Playing => PlaybackState::Paused,
            _ => PlaybackState::Playing,
        };
        self.push_state(next).await;
    }

    async fn seek(&self, position: Duration) {
        self.seeks.lock().push(position);
        *self.position.lock() = position;
    }

    fn position(&self) -> Duration {
        *self.position.lock()
    }

    fn state(&self) -> PlaybackState {
        *self.state.lock()
    }

    fn volume(&self) -> u8 {
        *self.volume.lock()
    }

    async fn set_volume(&self, volume: u8) -> Result<()> {
        if volume > 100 {
            return Err(PlayerError::InvalidVolume(volume));
        }
        *self.volume.lock() = volume;
        Ok(())
    }

    fn take_notifications(&self) -> Option<BackendNotifications> {
        self.notifications.lock().take()
    }

    async fn close(&self) {
        *self.closed.lock() = true;
    }
}

fn registration(backend: &Arc<FakeBackend>, priority: u32) -> BackendRegistration {
    let backend = Arc::clone(backend);
    BackendRegistration {
        name: backend.name,
        priority,
        available: Box::new(|| true),
        factory: Box::new(move || {
            let backend = Arc::clone(&backend);
            Box::pin(async move { Ok(backend as Arc<dyn PlayerBackend>) })
        }),
    }
}

fn track(title: &str) -> PlayableTrack {
    PlayableTrack {
        url: format!("https://cdn.example/{title}.mp3"),
        id: 7,
        title: title.to_string(),
        artists: vec!["Artist".to_string()],
        duration: Duration::from_secs(240),
        ..PlayableTrack::default()
    }
}

async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

async fn next_playback_event(
    rx: &mut core_runtime::events::Receiver<CoreEvent>,
) -> PlaybackEvent {
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event bus closed");
    let CoreEvent::Playback(event) = event;
    event
}

#[tokio::test]
async fn test_play_then_seek_reports_position() {
    let facade = PlayerFacade::new(PlayerConfig::default(), EventBus::default()).unwrap();
    let backend = FakeBackend::new("fake");
    facade.register(registration(&backend, 10));
    facade.initialize().await.unwrap();

    facade.play(track("song")).await.unwrap();
    wait_until(|| backend.state().is_playing()).await;

    facade.seek(Duration::from_secs(60)).await.unwrap();
    assert_eq!(facade.position().await, Duration::from_secs(60));
    assert_eq!(backend.seeks.lock().as_slice(), &[Duration::from_secs(60)]);
}

#[tokio::test]
async fn test_auto_selection_prefers_higher_priority() {
    let facade = PlayerFacade::new(PlayerConfig::default(), EventBus::default()).unwrap();
    let low = FakeBackend::new("low");
    let high = FakeBackend::new("high");
    facade.register(registration(&low, 10));
    facade.register(registration(&high, 20));
    facade.initialize().await.unwrap();

    assert_eq!(facade.current_backend_name().await, Some("high"));
}

#[tokio::test]
async fn test_configured_backend_overrides_priority() {
    let config = PlayerConfig {
        backend: "low".to_string(),
        ..PlayerConfig::default()
    };
    let facade = PlayerFacade::new(config, EventBus::default()).unwrap();
    let low = FakeBackend::new("low");
    let high = FakeBackend::new("high");
    facade.register(registration(&low, 10));
    facade.register(registration(&high, 20));
    facade.initialize().await.unwrap();

    assert_eq!(facade.current_backend_name().await, Some("low"));
}

#[tokio::test]
async fn test_unavailable_backends_are_skipped() {
    let facade = PlayerFacade::new(PlayerConfig::default(), EventBus::default()).unwrap();
    let reachable = FakeBackend::new("reachable");
    let broken = FakeBackend::new("broken");
    let mut unavailable = registration(&broken, 50);
    unavailable.available = Box::new(|| false);
    facade.register(unavailable);
    facade.register(registration(&reachable, 10));
    facade.initialize().await.unwrap();

    assert_eq!(facade.current_backend_name().await, Some("reachable"));
}

#[tokio::test]
async fn test_switch_backend_restores_track_and_position() {
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let facade = PlayerFacade::new(PlayerConfig::default(), events).unwrap();
    let first = FakeBackend::new("first");
    let second = FakeBackend::new("second");
    facade.register(registration(&first, 20));
    facade.register(registration(&second, 10));
    facade.initialize().await.unwrap();

    facade.play(track("song")).await.unwrap();
    wait_until(|| first.state().is_playing()).await;
    first.seek(Duration::from_secs(30)).await;

    facade.switch_backend("second").await.unwrap();

    assert_eq!(facade.current_backend_name().await, Some("second"));
    assert!(*first.closed.lock());
    wait_until(|| !second.played.lock().is_empty()).await;
    assert_eq!(second.played.lock()[0].title, "song");
    assert_eq!(second.seeks.lock().as_slice(), &[Duration::from_secs(30)]);

    loop {
        if let PlaybackEvent::BackendSwitched { from, to } = next_playback_event(&mut rx).await {
            assert_eq!(from, "first");
            assert_eq!(to, "second");
            break;
        }
    }
}

#[tokio::test]
async fn test_switch_to_same_backend_is_a_no_op() {
    let facade = PlayerFacade::new(PlayerConfig::default(), EventBus::default()).unwrap();
    let backend = FakeBackend::new("only");
    facade.register(registration(&backend, 10));
    facade.initialize().await.unwrap();

    facade.switch_backend("only").await.unwrap();
    assert!(!*backend.closed.lock());
}

#[tokio::test]
async fn test_no_backend_reports_no_player_available() {
    let facade = PlayerFacade::new(PlayerConfig::default(), EventBus::default()).unwrap();

    let err = facade.initialize().await.unwrap_err();
    assert!(err.to_string().contains("no player available"));

    let err = facade.play(track("song")).await.unwrap_err();
    assert!(err.to_string().contains("no player available"));

    let err = facade.pause().await.unwrap_err();
    assert!(matches!(err, PlayerError::NoPlayerAvailable));
}

#[tokio::test]
async fn test_unknown_backend_name_is_rejected() {
    let config = PlayerConfig {
        backend: "missing".to_string(),
        ..PlayerConfig::default()
    };
    let facade = PlayerFacade::new(config, EventBus::default()).unwrap();
    let backend = FakeBackend::new("present");
    facade.register(registration(&backend, 10));

    let err = facade.initialize().await.unwrap_err();
    assert!(matches!(err, PlayerError::BackendNotFound(name) if name == "missing"));
}

#[tokio::test]
async fn test_volume_above_hundred_is_rejected() {
    let facade = PlayerFacade::new(PlayerConfig::default(), EventBus::default()).unwrap();
    let backend = FakeBackend::new("fake");
    facade.register(registration(&backend, 10));
    facade.initialize().await.unwrap();

    assert!(matches!(
        facade.set_volume(101).await,
        Err(PlayerError::InvalidVolume(101))
    ));
    facade.set_volume(30).await.unwrap();
    assert_eq!(facade.volume().await, 30);
}

#[tokio::test]
async fn test_track_end_publishes_event_and_snapshot() {
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let facade = PlayerFacade::new(PlayerConfig::default(), events).unwrap();
    let backend = FakeBackend::new("fake");
    facade.register(registration(&backend, 10));
    facade.initialize().await.unwrap();

    let mut info_rx = facade.subscribe_info();
    facade.play(track("finale")).await.unwrap();
    wait_until(|| backend.state().is_playing()).await;

    backend.push_state(PlaybackState::Stopped).await;

    loop {
        if next_playback_event(&mut rx).await == PlaybackEvent::TrackEnded {
            break;
        }
    }

    wait_until(|| info_rx.borrow_and_update().state == PlaybackState::Stopped).await;
    let info = facade.playing_info();
    assert_eq!(info.name, "finale");
    assert_eq!(info.total_duration, Duration::from_secs(240));
}
