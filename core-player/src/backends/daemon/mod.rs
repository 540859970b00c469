//! # Daemon-client engine
//!
//! Controls an MPD-compatible daemon over TCP. The daemon owns the audio
//! pipeline; this engine owns a one-song queue inside it and mirrors the
//! daemon's state.
//!
//! Two connections: a shared command connection (redialed on demand) and a
//! dedicated watcher connection blocking in `idle player mixer`. External
//! changes (another client, the daemon finishing a song) reach us only
//! through the watcher's status resync.

mod proto;

pub use proto::{escape_arg, DaemonConnection, Response, SharedConnection};

use crate::backend::{BackendNotifications, NotificationSender, PlayerBackend};
use crate::config::DaemonConfig;
use crate::error::{PlayerError, Result};
use crate::timer::Timer;
use crate::types::{PlaybackState, PlayableTrack};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const BACKEND_NAME: &str = "daemon";

const COMMAND_CAPACITY: usize = 4;
const PLAY_SUBMIT_TIMEOUT: Duration = Duration::from_secs(1);
/// A stop observed this soon after a play initiation is the queue-swap race,
/// not a real stop.
const STALE_STOP_WINDOW: Duration = Duration::from_secs(2);
/// Poll cadence and budget for the post-rescan database settle.
const RESCAN_POLL: Duration = Duration::from_millis(100);
const RESCAN_POLL_ATTEMPTS: u32 = 50;

enum Command {
    Play(Box<PlayableTrack>),
    Pause,
    Resume,
    Toggle,
    Stop,
    Seek(Duration),
    SetVolume(u8),
    Close,
}

struct Shared {
    state: Mutex<PlaybackState>,
    volume: AtomicU8,
    timer: Mutex<Option<Arc<Timer>>>,
    notify: NotificationSender,
    closed: AtomicBool,
    /// Instant of the latest play initiation, for the stale-stop guard.
    last_play: Mutex<Option<Instant>>,
}

impl Shared {
    async fn publish_state(&self, state: PlaybackState) {
        let changed = {
            let mut current = self.state.lock();
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            self.notify.send_state(state).await;
        }
    }
}

pub struct DaemonClientEngine {
    cmd_tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
    notifications: Mutex<Option<BackendNotifications>>,
    cancel: CancellationToken,
}

impl DaemonClientEngine {
    /// Connect to the daemon (optionally spawning it first) and prepare a
    /// clean one-song queue. Any failure here is construction-fatal.
    pub async fn new(config: DaemonConfig, tick_interval: Duration, volume: u8) -> Result<Self> {
        if volume > 100 {
            return Err(PlayerError::InvalidVolume(volume));
        }

        let daemon_child = if config.autostart {
            Some(autostart_daemon(&config).await?)
        } else {
            None
        };

        let conn = Arc::new(SharedConnection::new(config.address.clone()));
        conn.command("clear").await?;
        // single mode makes the daemon stop at the end of our one song,
        // which is the end-of-track signal.
        conn.command("single 1").await?;
        conn.command("repeat 0").await?;
        conn.command(&format!("setvol {volume}")).await?;

        let (notify, notifications) = NotificationSender::channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(PlaybackState::Stopped),
            volume: AtomicU8::new(volume),
            timer: Mutex::new(None),
            notify,
            closed: AtomicBool::new(false),
            last_play: Mutex::new(None),
        });

        let cancel = CancellationToken::new();

        tokio::spawn(watcher_loop(
            config.address.clone(),
            Arc::clone(&conn),
            Arc::clone(&shared),
            cancel.clone(),
        ));

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        tokio::spawn(command_loop(
            cmd_rx,
            Arc::clone(&shared),
            conn,
            tick_interval,
            daemon_child,
        ));

        Ok(Self {
            cmd_tx,
            shared,
            notifications: Mutex::new(Some(notifications)),
            cancel,
        })
    }

    async fn submit(&self, command: Command) {
        if self.cmd_tx.send(command).await.is_err() {
            tracing::warn!("command loop gone, command dropped");
        }
    }
}

#[async_trait]
impl PlayerBackend for DaemonClientEngine {
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
        self.submit(Command::SetVolume(volume)).await;
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
        self.submit(Command::Close).await;
    }
}

/// Kill any daemon left over from a previous run, then spawn ours.
async fn autostart_daemon(config: &DaemonConfig) -> Result<tokio::process::Child> {
    let bin = config
        .bin
        .as_ref()
        .ok_or_else(|| PlayerError::Construction("daemon autostart without binary".to_string()))?;

    if let Some(name) = bin.file_name().and_then(|n| n.to_str()) {
        let _ = tokio::process::Command::new("pkill")
            .arg("-x")
            .arg(name)
            .status()
            .await;
    }

    let mut command = tokio::process::Command::new(bin);
    if let Some(config_file) = &config.config_file {
        command.arg(config_file);
    }
    command.arg("--no-daemon").kill_on_drop(true);
    let child = command
        .spawn()
        .map_err(|err| PlayerError::Process(format!("spawn {}: {err}", bin.display())))?;

    // Give it a moment to bind before the first dial.
    for _ in 0..50 {
        if tokio::net::TcpStream::connect(&config.address).await.is_ok() {
            return Ok(child);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Err(PlayerError::Timeout(format!(
        "daemon never listened on {}",
        config.address
    )))
}

/// Dedicated connection blocking in `idle`. Every wakeup triggers a status
/// resync through the shared command connection.
async fn watcher_loop(
    addr: String,
    conn: Arc<SharedConnection>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let mut idle_conn = match DaemonConnection::connect(&addr).await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::debug!(%err, "watcher dial failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                }
            }
        };

        loop {
            let changed = tokio::select! {
                _ = cancel.cancelled() => return,
                changed = idle_conn.idle("player mixer") => changed,
            };
            match changed {
                Ok(subsystems) => {
                    tracing::trace!(?subsystems, "daemon subsystems changed");
                    resync_status(&conn, &shared).await;
                }
                Err(err) => {
                    tracing::debug!(%err, "watcher connection lost");
                    break;
                }
            }
        }
    }
}

/// Pull `status` and fold the daemon's view into ours.
async fn resync_status(conn: &SharedConnection, shared: &Shared) {
    let status = match conn.command("status").await {
        Ok(status) => status,
        Err(err) => {
            tracing::debug!(%err, "status resync failed");
            return;
        }
    };

    if let Some(volume) = status.get("volume").and_then(|v| v.parse::<i16>().ok()) {
        if (0..=100).contains(&volume) {
            shared.volume.store(volume as u8, Ordering::Relaxed);
        }
    }

    if let Some(elapsed) = status.get("elapsed").and_then(|v| v.parse::<f64>().ok()) {
        if let Some(timer) = shared.timer.lock().as_ref() {
            timer.set_passed(Duration::from_secs_f64(elapsed.max(0.0)));
        }
    }

    let Some(state) = status.get("state").map(parse_state) else {
        return;
    };

    if state == PlaybackState::Stopped && is_stale_stop(shared) {
        tracing::debug!("ignoring stop during track switch");
        return;
    }

    {
        let timer = shared.timer.lock();
        if let Some(timer) = timer.as_ref() {
            match state {
                PlaybackState::Playing => timer.run(),
                PlaybackState::Paused => timer.pause(),
                PlaybackState::Stopped => timer.stop(),
                _ => {}
            }
        }
    }

    shared.publish_state(state).await;
}

fn parse_state(raw: &str) -> PlaybackState {
    match raw {
        "play" => PlaybackState::Playing,
        "pause" => PlaybackState::Paused,
        _ => PlaybackState::Stopped,
    }
}

/// A daemon-side stop right after we rebuilt the queue is an artifact of the
/// deleteid/addid sequence, not a real track end.
fn is_stale_stop(shared: &Shared) -> bool {
    let playing = {
        let state = *shared.state.lock();
        state == PlaybackState::Playing || state == PlaybackState::Buffering
    };
    playing
        && shared
            .last_play
            .lock()
            .map(|at| at.elapsed() < STALE_STOP_WINDOW)
            .unwrap_or(false)
}

async fn command_loop(
    mut cmd_rx: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
    conn: Arc<SharedConnection>,
    tick_interval: Duration,
    mut daemon_child: Option<tokio::process::Child>,
) {
    // Queue id of the song currently loaded in the daemon.
    let mut queue_id: Option<u64> = None;

    while let Some(command) = cmd_rx.recv().await {
        match command {
            Command::Play(track) => {
                queue_id = start_track(&shared, &conn, tick_interval, *track, queue_id).await;
            }
            Command::Pause => {
                if shared.state.lock().is_playing() {
                    if let Err(err) = conn.command("pause 1").await {
                        tracing::warn!(%err, "pause failed");
                        continue;
                    }
                    if let Some(timer) = shared.timer.lock().as_ref() {
                        timer.pause();
                    }
                    shared.publish_state(PlaybackState::Paused).await;
                }
            }
            Command::Resume => {
                if *shared.state.lock() == PlaybackState::Paused {
                    if let Err(err) = conn.command("pause 0").await {
                        tracing::warn!(%err, "resume failed");
                        continue;
                    }
                    if let Some(timer) = shared.timer.lock().as_ref() {
                        timer.run();
                    }
                    shared.publish_state(PlaybackState::Playing).await;
                }
            }
            Command::Toggle => {
                let state = *shared.state.lock();
                let target = match state {
                    PlaybackState::Playing => ("pause 1", PlaybackState::Paused),
                    PlaybackState::Paused => ("pause 0", PlaybackState::Playing),
                    _ => continue,
                };
                if let Err(err) = conn.command(target.0).await {
                    tracing::warn!(%err, "toggle failed");
                    continue;
                }
                {
                    let timer = shared.timer.lock();
                    if let Some(timer) = timer.as_ref() {
                        match target.1 {
                            PlaybackState::Playing => timer.run(),
                            _ => timer.pause(),
                        }
                    }
                }
                shared.publish_state(target.1).await;
            }
            Command::Seek(position) => {
                let command = format!("seekcur {:.3}", position.as_secs_f64());
                if conn.command(&command).await.is_ok() {
                    if let Some(timer) = shared.timer.lock().as_ref() {
                        timer.set_passed(position);
                    }
                }
            }
            Command::SetVolume(volume) => {
                if let Err(err) = conn.command(&format!("setvol {volume}")).await {
                    tracing::warn!(%err, "setvol failed");
                }
            }
            Command::Stop => {
                let _ = conn.command("stop").await;
                if let Some(id) = queue_id.take() {
                    let _ = conn.command(&format!("deleteid {id}")).await;
                }
                if let Some(timer) = shared.timer.lock().take() {
                    timer.stop();
                }
                shared.publish_state(PlaybackState::Stopped).await;
            }
            Command::Close => {
                let _ = conn.command("stop").await;
                let _ = conn.command("clear").await;
                if let Some(timer) = shared.timer.lock().take() {
                    timer.stop();
                }
                if let Some(mut child) = daemon_child.take() {
                    if let Err(err) = child.kill().await {
                        tracing::debug!(%err, "daemon already gone");
                    }
                }
                break;
            }
        }
    }
}

/// Replace the daemon's queue with the new track and start it. Returns the
/// new queue id (or the old one when the switch failed).
async fn start_track(
    shared: &Arc<Shared>,
    conn: &SharedConnection,
    tick_interval: Duration,
    track: PlayableTrack,
    previous_id: Option<u64>,
) -> Option<u64> {
    shared.publish_state(PlaybackState::Buffering).await;
    let _ = conn.command("pause 1").await;

    if let Some(timer) = shared.timer.lock().take() {
        timer.stop();
    }

    if let Some(id) = previous_id {
        if let Err(err) = conn.command(&format!("deleteid {id}")).await {
            tracing::debug!(%err, id, "previous queue entry already gone");
        }
    }

    let uri = track.url.strip_prefix("file://").unwrap_or(&track.url);

    // Local files need the daemon's database to know them first.
    if track.is_local() {
        if let Err(err) = conn.command("rescan").await {
            tracing::warn!(%err, "rescan failed");
        } else {
            for _ in 0..RESCAN_POLL_ATTEMPTS {
                match conn.command("status").await {
                    Ok(status) if status.get("updating_db").is_none() => break,
                    Ok(_) => tokio::time::sleep(RESCAN_POLL).await,
                    Err(_) => break,
                }
            }
        }
    }

    let id = match conn.command(&format!("addid {}", escape_arg(uri))).await {
        Ok(response) => match response.get("Id").and_then(|v| v.parse::<u64>().ok()) {
            Some(id) => id,
            None => {
                tracing::error!("addid returned no id");
                shared.publish_state(PlaybackState::Stopped).await;
                return None;
            }
        },
        Err(err) => {
            tracing::error!(%err, url = %track.url, "addid failed");
            shared.publish_state(PlaybackState::Stopped).await;
            return None;
        }
    };

    let tick_notify = shared.notify.clone();
    let timer = Arc::new(Timer::new(
        tick_interval,
        Box::new(move |passed| tick_notify.send_time(passed)),
    ));
    shared.timer.lock().replace(Arc::clone(&timer));

    shared.last_play.lock().replace(Instant::now());

    if let Err(err) = conn.command(&format!("playid {id}")).await {
        tracing::error!(%err, "playid failed");
        shared.publish_state(PlaybackState::Stopped).await;
        return Some(id);
    }

    // Remote URLs carry no tags the daemon could read; push ours so other
    // clients display something sensible.
    if !track.is_local() {
        let tags = [
            ("artist", track.artist_line()),
            ("album", track.album.clone()),
            ("title", track.title.clone()),
        ];
        for (tag, value) in tags {
            if value.is_empty() {
                continue;
            }
            let command = format!("addtagid {id} {tag} {}", escape_arg(&value));
            if let Err(err) = conn.command(&command).await {
                tracing::debug!(%err, tag, "addtagid failed");
            }
        }
    }

    timer.run();
    shared.publish_state(PlaybackState::Playing).await;
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state() {
        assert_eq!(parse_state("play"), PlaybackState::Playing);
        assert_eq!(parse_state("pause"), PlaybackState::Paused);
        assert_eq!(parse_state("stop"), PlaybackState::Stopped);
        assert_eq!(parse_state("anything"), PlaybackState::Stopped);
    }

    #[tokio::test]
    async fn test_stale_stop_window() {
        let (notify, _notifications) = NotificationSender::channel();
        let shared = Shared {
            state: Mutex::new(PlaybackState::Playing),
            volume: AtomicU8::new(60),
            timer: Mutex::new(None),
            notify,
            closed: AtomicBool::new(false),
            last_play: Mutex::new(Some(Instant::now())),
        };
        assert!(is_stale_stop(&shared));

        // Old play initiation: a stop is real.
        shared
            .last_play
            .lock()
            .replace(Instant::now() - Duration::from_secs(5));
        assert!(!is_stale_stop(&shared));

        // Not playing: a stop is real.
        shared.last_play.lock().replace(Instant::now());
        *shared.state.lock() = PlaybackState::Stopped;
        assert!(!is_stale_stop(&shared));
    }
}
