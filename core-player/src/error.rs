//! # Player Error Types
//!
//! Error taxonomy for the playback core.
//!
//! Synchronous validation failures (`InvalidVolume`, `NoPlayerAvailable`)
//! return directly to the caller. Asynchronous failures (decode errors,
//! dead external processes, daemon disconnects) surface only through the
//! backend's state-change stream; the triggering command has already
//! returned by the time they occur.

use thiserror::Error;

/// Errors that can occur during playback operations.
#[derive(Error, Debug)]
pub enum PlayerError {
    /// A playback command was issued before a backend was initialized.
    #[error("no player available")]
    NoPlayerAvailable,

    /// Volume outside the 0-100 scale. Rejected, never clamped, so the
    /// caller's UI can flag the bug.
    #[error("invalid volume {0}: must be within 0-100")]
    InvalidVolume(u8),

    /// The requested backend is not registered.
    #[error("backend not found: {0}")]
    BackendNotFound(String),

    /// The requested backend is registered but failed its availability probe.
    #[error("backend '{0}' is not available")]
    BackendUnavailable(String),

    /// Backend construction or initialization failed. Startup-fatal.
    #[error("backend construction failed: {0}")]
    Construction(String),

    /// Failed to open or read an audio source.
    #[error("audio source error: {0}")]
    Source(String),

    /// Error during audio decoding.
    #[error("decode error: {0}")]
    Decode(String),

    /// Wire-protocol error talking to an external player or daemon.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Failed to spawn or control an external process.
    #[error("process error: {0}")]
    Process(String),

    /// An operation exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// HTTP-level failure while streaming.
    #[error("http error: {0}")]
    Http(String),

    /// An internal channel closed unexpectedly (backend shut down).
    #[error("player channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PlayerError>;
