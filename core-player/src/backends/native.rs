//! # OS-native engine (macOS)
//!
//! Wraps AVFoundation's `AVPlayer`, which handles streaming, decoding and
//! output on its own. We mirror its state and clock.
//!
//! The did-play-to-end notification fires on an AVFoundation thread; its
//! handler only pushes a signal onto a channel, and a tokio task turns that
//! into the Stopped transition.

use crate::backend::{BackendNotifications, NotificationSender, PlayerBackend};
use crate::error::{PlayerError, Result};
use crate::types::{PlaybackState, PlayableTrack};
use async_trait::async_trait;
use block2::RcBlock;
use objc2::rc::{autoreleasepool, Retained};
use objc2::runtime::{AnyObject, ProtocolObject};
use objc2_av_foundation::{AVPlayer, AVPlayerItem};
use objc2_core_media::{CMTime, CMTimeFlags, CMTimeScale};
use objc2_foundation::{NSNotification, NSNotificationCenter, NSObjectProtocol, NSString, NSURL};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const BACKEND_NAME: &str = "native";

/// AVPlayer's reported clock lags observable audio slightly; published ticks
/// are compensated forward.
const CLOCK_COMPENSATION: Duration = Duration::from_millis(800);

/// AVPlayer is documented thread-safe for the calls we make.
struct PlayerHandle(Retained<AVPlayer>);
unsafe impl Send for PlayerHandle {}
unsafe impl Sync for PlayerHandle {}

struct ObserverHandle(Retained<ProtocolObject<dyn NSObjectProtocol>>);
unsafe impl Send for ObserverHandle {}
unsafe impl Sync for ObserverHandle {}

struct Shared {
    state: Mutex<PlaybackState>,
    volume: AtomicU8,
    notify: NotificationSender,
    closed: AtomicBool,
}

impl Shared {
    async fn publish_state(&self, state: PlaybackState) {
        *self.state.lock() = state;
        self.notify.send_state(state).await;
    }
}

pub struct NativeFrameworkEngine {
    player: PlayerHandle,
    shared: Arc<Shared>,
    notifications: Mutex<Option<BackendNotifications>>,
    observer: Mutex<Option<ObserverHandle>>,
    ended_tx: mpsc::UnboundedSender<()>,
    cancel: CancellationToken,
}

impl NativeFrameworkEngine {
    pub fn new(tick_interval: Duration, volume: u8) -> Result<Self> {
        if volume > 100 {
            return Err(PlayerError::InvalidVolume(volume));
        }

        let player = unsafe { AVPlayer::new() };
        unsafe { player.setVolume(volume as f32 / 100.0) };
        let player = PlayerHandle(player);

        let (notify, notifications) = NotificationSender::channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(PlaybackState::Stopped),
            volume: AtomicU8::new(volume),
            notify,
            closed: AtomicBool::new(false),
        });

        let cancel = CancellationToken::new();
        let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<()>();

        // End-of-track forwarder: the notification block pushes here.
        let end_shared = Arc::clone(&shared);
        let end_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = end_cancel.cancelled() => return,
                    signal = ended_rx.recv() => {
                        if signal.is_none() {
                            return;
                        }
                        tracing::debug!("native player reported end of track");
                        end_shared.publish_state(PlaybackState::Stopped).await;
                    }
                }
            }
        });

        let engine = Self {
            player,
            shared,
            notifications: Mutex::new(Some(notifications)),
            observer: Mutex::new(None),
            ended_tx,
            cancel,
        };
        engine.spawn_ticker(tick_interval);
        Ok(engine)
    }

    fn spawn_ticker(&self, tick_interval: Duration) {
        let player = PlayerHandle(self.player.0.clone());
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if !shared.state.lock().is_playing() {
                    continue;
                }
                if let Some(position) = current_position(&player.0) {
                    shared.notify.send_time(position + CLOCK_COMPENSATION);
                }
            }
        });
    }

    /// Install the did-play-to-end observer for the new item, replacing the
    /// previous item's observer.
    fn observe_item_end(&self, item: &AVPlayerItem) {
        let center = unsafe { NSNotificationCenter::defaultCenter() };
        if let Some(old) = self.observer.lock().take() {
            unsafe { center.removeObserver(&old.0) };
        }

        let ended_tx = self.ended_tx.clone();
        let block = RcBlock::new(move |_notification: std::ptr::NonNull<NSNotification>| {
            let _ = ended_tx.send(());
        });

        let name = unsafe { objc2_av_foundation::AVPlayerItemDidPlayToEndTimeNotification };
        let object: &AnyObject = item;
        let observer = unsafe {
            center.addObserverForName_object_queue_usingBlock(Some(name), Some(object), None, &block)
        };
        self.observer.lock().replace(ObserverHandle(observer));
    }
}

/// AVPlayer silently drops seeks to a CMTime without the valid flag set, so
/// the target is built field by field rather than zero-initialised.
fn seek_target(position: Duration, timescale: CMTimeScale) -> CMTime {
    CMTime {
        value: (position.as_secs_f64() * timescale as f64) as i64,
        timescale,
        flags: CMTimeFlags::Valid,
        epoch: 0,
    }
}

fn cm_time_to_duration(time: CMTime) -> Option<Duration> {
    if time.timescale == 0 {
        return None;
    }
    let seconds = time.value as f64 / time.timescale as f64;
    if seconds < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}

fn current_position(player: &AVPlayer) -> Option<Duration> {
    let time = unsafe { player.currentTime() };
    cm_time_to_duration(time)
}

#[async_trait]
impl PlayerBackend for NativeFrameworkEngine {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn play(&self, track: PlayableTrack) {
        autoreleasepool(|_| {
            let url_string = NSString::from_str(&track.url);
            let Some(url) = (unsafe { NSURL::URLWithString(&url_string) }) else {
                tracing::error!(url = %track.url, "unparseable track url");
                return;
            };
            let item = unsafe { AVPlayerItem::playerItemWithURL(&url) };
            self.observe_item_end(&item);
            unsafe {
                self.player.0.replaceCurrentItemWithPlayerItem(Some(&item));
                self.player.0.play();
            }
        });
        self.shared.publish_state(PlaybackState::Playing).await;
    }

    async fn pause(&self) {
        if self.shared.state.lock().is_playing() {
            unsafe { self.player.0.pause() };
            self.shared.publish_state(PlaybackState::Paused).await;
        }
    }

    async fn resume(&self) {
        if *self.shared.state.lock() == PlaybackState::Paused {
            unsafe { self.player.0.play() };
            self.shared.publish_state(PlaybackState::Playing).await;
        }
    }

    async fn stop(&self) {
        unsafe {
            self.player.0.pause();
            self.player.0.replaceCurrentItemWithPlayerItem(None);
        }
        self.shared.publish_state(PlaybackState::Stopped).await;
    }

    async fn toggle(&self) {
        let state = *self.shared.state.lock();
        match state {
            PlaybackState::Playing => self.pause().await,
            PlaybackState::Paused => self.resume().await,
            _ => {}
        }
    }

    async fn seek(&self, position: Duration) {
        // Without a known item duration timescale there is nothing sane to
        // seek against.
        let timescale = unsafe {
            self.player
                .0
                .currentItem()
                .map(|item| item.duration().timescale)
        };
        let Some(timescale) = timescale else {
            return;
        };
        if timescale == 0 {
            return;
        }
        unsafe { self.player.0.seekToTime(seek_target(position, timescale)) };
    }

    fn position(&self) -> Duration {
        current_position(&self.player.0).unwrap_or_default()
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
        unsafe { self.player.0.setVolume(volume as f32 / 100.0) };
        Ok(())
    }

    fn take_notifications(&self) -> Option<BackendNotifications> {
        self.notifications.lock().take()
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        unsafe {
            self.player.0.pause();
            self.player.0.replaceCurrentItemWithPlayerItem(None);
        }
        if let Some(observer) = self.observer.lock().take() {
            let center = unsafe { NSNotificationCenter::defaultCenter() };
            unsafe { center.removeObserver(&observer.0) };
        }
    }
}
