//! # Control-socket engine
//!
//! Drives an external mpv-compatible player over its JSON IPC socket. The
//! player process is spawned per track; commands travel as single
//! newline-delimited JSON lines over short-lived connections, fire and
//! forget. One persistent connection per session listens for the player's
//! `end-file` event, which is the only way we learn the track ended.
//!
//! Position is estimated locally by the session timer and reconciled against
//! the player's `time-pos` property about once a second, so ticks stay
//! smooth even though property reads are slow.

use crate::backend::{BackendNotifications, NotificationSender, PlayerBackend};
use crate::config::ControlSocketConfig;
use crate::error::{PlayerError, Result};
use crate::timer::Timer;
use crate::types::{PlaybackState, PlayableTrack};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const BACKEND_NAME: &str = "control_socket";

const COMMAND_CAPACITY: usize = 4;
const PLAY_SUBMIT_TIMEOUT: Duration = Duration::from_secs(1);
/// Write/read deadline on the IPC socket.
const SOCKET_DEADLINE: Duration = Duration::from_secs(2);
/// Poll cadence while waiting for the spawned player's socket.
const SOCKET_POLL: Duration = Duration::from_millis(100);
/// Minimum interval between authoritative `time-pos` reconciliations.
const RESYNC_INTERVAL: Duration = Duration::from_secs(1);

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
}

impl Shared {
    async fn publish_state(&self, state: PlaybackState) {
        *self.state.lock() = state;
        self.notify.send_state(state).await;
    }
}

pub struct ControlSocketEngine {
    cmd_tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
    notifications: Mutex<Option<BackendNotifications>>,
}

impl ControlSocketEngine {
    /// Validates the player binary, then starts the command loop. A binary
    /// that cannot report its version is construction-fatal.
    pub async fn new(config: ControlSocketConfig, tick_interval: Duration, volume: u8) -> Result<Self> {
        if volume > 100 {
            return Err(PlayerError::InvalidVolume(volume));
        }
        probe_binary(&config.bin).await?;

        let (notify, notifications) = NotificationSender::channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(PlaybackState::Stopped),
            volume: AtomicU8::new(volume),
            timer: Mutex::new(None),
            notify,
            closed: AtomicBool::new(false),
        });

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        tokio::spawn(command_loop(cmd_rx, Arc::clone(&shared), config, tick_interval));

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
impl PlayerBackend for ControlSocketEngine {
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
        self.submit(Command::Close).await;
    }
}

async fn probe_binary(bin: &str) -> Result<()> {
    let output = tokio::process::Command::new(bin)
        .arg("--version")
        .output()
        .await
        .map_err(|err| PlayerError::Construction(format!("player binary '{bin}': {err}")))?;
    if !output.status.success() {
        return Err(PlayerError::Construction(format!(
            "player binary '{bin}' exited with {}",
            output.status
        )));
    }
    Ok(())
}

struct Session {
    cancel: CancellationToken,
    timer: Arc<Timer>,
    child: Child,
}

impl Session {
    async fn teardown(mut self) {
        self.cancel.cancel();
        self.timer.stop();
        if let Err(err) = self.child.kill().await {
            tracing::debug!(%err, "player process already gone");
        }
    }
}

async fn command_loop(
    mut cmd_rx: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
    config: ControlSocketConfig,
    tick_interval: Duration,
) {
    let socket_path = config.socket_path();
    let mut session: Option<Session> = None;

    while let Some(command) = cmd_rx.recv().await {
        match command {
            Command::Play(track) => {
                if let Some(old) = session.take() {
                    old.teardown().await;
                }
                session =
                    start_session(&shared, &config, &socket_path, tick_interval, *track).await;
            }
            Command::Pause => {
                if session.is_some() && shared.state.lock().is_playing() {
                    send_command(&socket_path, json!(["set_property", "pause", true])).await;
                    if let Some(timer) = shared.timer.lock().as_ref() {
                        timer.pause();
                    }
                    shared.publish_state(PlaybackState::Paused).await;
                }
            }
            Command::Resume => {
                if session.is_some() && *shared.state.lock() == PlaybackState::Paused {
                    send_command(&socket_path, json!(["set_property", "pause", false])).await;
                    if let Some(timer) = shared.timer.lock().as_ref() {
                        timer.run();
                    }
                    shared.publish_state(PlaybackState::Playing).await;
                }
            }
            Command::Toggle => {
                let state = *shared.state.lock();
                if session.is_none() {
                    continue;
                }
                match state {
                    PlaybackState::Playing => {
                        send_command(&socket_path, json!(["set_property", "pause", true])).await;
                        if let Some(timer) = shared.timer.lock().as_ref() {
                            timer.pause();
                        }
                        shared.publish_state(PlaybackState::Paused).await;
                    }
                    PlaybackState::Paused => {
                        send_command(&socket_path, json!(["set_property", "pause", false])).await;
                        if let Some(timer) = shared.timer.lock().as_ref() {
                            timer.run();
                        }
                        shared.publish_state(PlaybackState::Playing).await;
                    }
                    _ => {}
                }
            }
            Command::Seek(position) => {
                if session.is_some() {
                    send_command(
                        &socket_path,
                        json!(["seek", position.as_secs_f64(), "absolute"]),
                    )
                    .await;
                    if let Some(timer) = shared.timer.lock().as_ref() {
                        timer.set_passed(position);
                    }
                }
            }
            Command::SetVolume(volume) => {
                if session.is_some() {
                    send_command(&socket_path, json!(["set_property", "volume", volume])).await;
                }
            }
            Command::Stop => {
                if let Some(old) = session.take() {
                    old.teardown().await;
                    shared.timer.lock().take();
                    shared.publish_state(PlaybackState::Stopped).await;
                }
            }
            Command::Close => {
                if let Some(old) = session.take() {
                    old.teardown().await;
                }
                shared.timer.lock().take();
                break;
            }
        }
    }
}

async fn start_session(
    shared: &Arc<Shared>,
    config: &ControlSocketConfig,
    socket_path: &Path,
    tick_interval: Duration,
    track: PlayableTrack,
) -> Option<Session> {
    shared.publish_state(PlaybackState::Buffering).await;

    // A stale socket file keeps the fresh player from binding.
    let _ = tokio::fs::remove_file(socket_path).await;

    let child = match spawn_player(config, socket_path, shared.volume.load(Ordering::Relaxed), &track) {
        Ok(child) => child,
        Err(err) => {
            tracing::error!(%err, "player spawn failed");
            shared.publish_state(PlaybackState::Stopped).await;
            return None;
        }
    };

    if let Err(err) = wait_for_socket(socket_path, config.startup_timeout).await {
        tracing::error!(%err, "player socket never came up");
        shared.publish_state(PlaybackState::Stopped).await;
        return None;
    }

    let cancel = CancellationToken::new();
    let tick_notify = shared.notify.clone();
    let timer = Arc::new(Timer::new(
        tick_interval,
        Box::new(move |passed| tick_notify.send_time(passed)),
    ));
    shared.timer.lock().replace(Arc::clone(&timer));

    tokio::spawn(event_listener(
        socket_path.to_path_buf(),
        Arc::clone(shared),
        cancel.clone(),
    ));
    tokio::spawn(position_resync(
        socket_path.to_path_buf(),
        Arc::clone(&timer),
        cancel.clone(),
    ));

    timer.run();
    shared.publish_state(PlaybackState::Playing).await;

    Some(Session {
        cancel,
        timer,
        child,
    })
}

fn spawn_player(
    config: &ControlSocketConfig,
    socket_path: &Path,
    volume: u8,
    track: &PlayableTrack,
) -> Result<Child> {
    let mut command = tokio::process::Command::new(&config.bin);
    command
        .arg("--no-video")
        .arg("--no-terminal")
        .arg(format!("--input-ipc-server={}", socket_path.display()))
        .arg("--idle")
        .arg("--cache=yes")
        .arg("--demuxer-max-bytes=120MiB")
        .arg("--demuxer-readahead-secs=120")
        .arg("--audio-device=auto")
        .arg(format!("--volume={volume}"))
        .arg(format!("--force-media-title={}", track.display_title()))
        .arg(&track.url)
        .kill_on_drop(true);

    command
        .spawn()
        .map_err(|err| PlayerError::Process(format!("spawn {}: {err}", config.bin)))
}

async fn wait_for_socket(socket_path: &Path, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if UnixStream::connect(socket_path).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(PlayerError::Timeout(format!(
                "player socket {}",
                socket_path.display()
            )));
        }
        tokio::time::sleep(SOCKET_POLL).await;
    }
}

/// Encode an IPC command line.
fn command_line(args: Value) -> String {
    let mut line = json!({ "command": args }).to_string();
    line.push('\n');
    line
}

/// Fire-and-forget command over a fresh connection.
async fn send_command(socket_path: &Path, args: Value) {
    let line = command_line(args);
    let result = tokio::time::timeout(SOCKET_DEADLINE, async {
        let mut stream = UnixStream::connect(socket_path).await?;
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await?;
        Ok::<_, std::io::Error>(())
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(%err, "ipc command failed"),
        Err(_) => tracing::warn!("ipc command timed out"),
    }
}

/// Request a property and extract its `data` field. Event lines arriving on
/// the same connection are skipped.
async fn query_property(socket_path: &Path, property: &str) -> Result<Value> {
    let line = command_line(json!(["get_property", property]));
    tokio::time::timeout(SOCKET_DEADLINE, async {
        let mut stream = UnixStream::connect(socket_path).await?;
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut response = String::new();
        loop {
            response.clear();
            if reader.read_line(&mut response).await? == 0 {
                return Err(PlayerError::Protocol("connection closed".to_string()));
            }
            let value: Value = serde_json::from_str(response.trim())
                .map_err(|err| PlayerError::Protocol(format!("bad ipc line: {err}")))?;
            if value.get("event").is_some() {
                continue;
            }
            if let Some(data) = value.get("data") {
                return Ok(data.clone());
            }
            return Err(PlayerError::Protocol(format!(
                "no data for property {property}"
            )));
        }
    })
    .await
    .map_err(|_| PlayerError::Timeout(format!("get_property {property}")))?
}

/// Persistent listener: the `end-file` event is the session's only
/// end-of-track signal.
async fn event_listener(socket_path: PathBuf, shared: Arc<Shared>, cancel: CancellationToken) {
    let stream = tokio::select! {
        _ = cancel.cancelled() => return,
        stream = UnixStream::connect(&socket_path) => match stream {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(%err, "event listener connect failed");
                return;
            }
        },
    };

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read_line(&mut line) => read,
        };
        match read {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let Ok(value) = serde_json::from_str::<Value>(line.trim()) else {
            continue;
        };
        if value.get("event").and_then(Value::as_str) == Some("end-file") {
            tracing::debug!("player reported end of track");
            if let Some(timer) = shared.timer.lock().as_ref() {
                timer.stop();
            }
            shared.publish_state(PlaybackState::Stopped).await;
            return;
        }
    }
}

/// Reconcile the locally estimated position against the player's clock.
async fn position_resync(socket_path: PathBuf, timer: Arc<Timer>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(RESYNC_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        match query_property(&socket_path, "time-pos").await {
            Ok(value) => {
                if let Some(seconds) = value.as_f64() {
                    if seconds >= 0.0 {
                        timer.set_passed(Duration::from_secs_f64(seconds));
                    }
                }
            }
            Err(err) => tracing::debug!(%err, "position resync skipped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_shape() {
        let line = command_line(json!(["set_property", "pause", true]));
        assert_eq!(line, "{\"command\":[\"set_property\",\"pause\",true]}\n");
    }

    #[test]
    fn test_seek_command_is_absolute() {
        let line = command_line(json!(["seek", 60.0, "absolute"]));
        let value: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["command"][0], "seek");
        assert_eq!(value["command"][2], "absolute");
    }

    #[tokio::test]
    async fn test_query_property_skips_event_lines() {
        use tokio::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            use tokio::io::AsyncReadExt;
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"{\"event\":\"property-change\"}\n{\"data\":42.5,\"error\":\"success\"}\n")
                .await
                .unwrap();
        });

        let value = query_property(&path, "time-pos").await.unwrap();
        assert_eq!(value.as_f64(), Some(42.5));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_end_file_event_publishes_stopped() {
        use tokio::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let (notify, mut notifications) = NotificationSender::channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(PlaybackState::Playing),
            volume: AtomicU8::new(60),
            timer: Mutex::new(None),
            notify,
            closed: AtomicBool::new(false),
        });

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(b"{\"event\":\"pause\"}\n{\"event\":\"end-file\"}\n")
                .await
                .unwrap();
        });

        event_listener(path, Arc::clone(&shared), CancellationToken::new()).await;
        server.await.unwrap();

        assert_eq!(*shared.state.lock(), PlaybackState::Stopped);
        assert_eq!(
            notifications.state_rx.recv().await,
            Some(PlaybackState::Stopped)
        );
    }
}
