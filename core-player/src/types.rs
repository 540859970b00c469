//! # Core Playback Types
//!
//! Shared data model for the playback core: the playback state machine's
//! value set, the immutable track descriptor handed in by the URL resolver,
//! and the `PlayingInfo` snapshot consumed by remote-control bridges.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Playback state of a backend instance.
///
/// Exactly one value holds at any instant. Transitions are driven either by
/// explicit user commands or by asynchronous backend notifications
/// (end-of-stream, decode failure, external-process events).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
    /// Initial prebuffering before decoded audio is flowing.
    Buffering,
    /// Terminal failure state after retries are exhausted.
    Error,
}

impl PlaybackState {
    /// `true` iff the state is [`PlaybackState::Playing`].
    pub fn is_playing(&self) -> bool {
        matches!(self, PlaybackState::Playing)
    }
}

/// Codec family hint for the in-process decode engine.
///
/// Other backends ignore this; they hand the URL to their own demuxer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeHint {
    Mp3,
    Flac,
    Ogg,
    Wav,
    #[default]
    Unknown,
}

impl DecodeHint {
    /// Sniff the codec family from a URL or file path extension.
    pub fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        match path.rsplit('.').next().map(|e| e.to_ascii_lowercase()) {
            Some(ext) if ext == "mp3" => DecodeHint::Mp3,
            Some(ext) if ext == "flac" => DecodeHint::Flac,
            Some(ext) if ext == "ogg" || ext == "oga" => DecodeHint::Ogg,
            Some(ext) if ext == "wav" => DecodeHint::Wav,
            _ => DecodeHint::Unknown,
        }
    }

    /// Extension hint handed to the demuxer probe.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            DecodeHint::Mp3 => Some("mp3"),
            DecodeHint::Flac => Some("flac"),
            DecodeHint::Ogg => Some("ogg"),
            DecodeHint::Wav => Some("wav"),
            DecodeHint::Unknown => None,
        }
    }
}

/// Immutable description of a playable track.
///
/// Supplied by the external URL resolver; the playback core never fetches
/// metadata itself.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlayableTrack {
    /// Source URL (`http(s)://...`) or local path (`file://...` or plain).
    pub url: String,
    /// Catalog identifier.
    pub id: i64,
    pub title: String,
    pub artists: Vec<String>,
    pub album: String,
    pub album_artist: String,
    /// Declared total duration from the catalog.
    #[serde(default)]
    pub duration: Duration,
    /// Codec family, used by the in-process engine only.
    #[serde(default)]
    pub codec: DecodeHint,
    /// Artwork URL forwarded to remote-control surfaces.
    #[serde(default)]
    pub artwork_url: String,
}

impl PlayableTrack {
    /// Joined artist names, for display and tagging.
    pub fn artist_line(&self) -> String {
        self.artists
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// "title - artists" line suitable for an external player's window
    /// title. Newlines are stripped; an empty title yields an empty string.
    pub fn display_title(&self) -> String {
        let title = self.title.trim();
        if title.is_empty() {
            return String::new();
        }
        let artists = self.artist_line();
        let combined = if artists.is_empty() {
            title.to_string()
        } else {
            format!("{} - {}", title, artists)
        };
        combined.replace(['\n', '\r'], " ").trim().to_string()
    }

    /// `true` when the URL points at a local file rather than a stream.
    pub fn is_local(&self) -> bool {
        !self.url.starts_with("http://") && !self.url.starts_with("https://")
    }
}

/// Point-in-time playback snapshot assembled by the facade for external
/// consumers (remote-control bridges, the UI's render loop).
///
/// Never mutated after construction; a fresh snapshot is produced on every
/// state, time, or volume change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlayingInfo {
    pub total_duration: Duration,
    pub passed_duration: Duration,
    pub state: PlaybackState,
    /// Normalized 0-100 scale regardless of backend.
    pub volume: u8,
    pub track_id: i64,
    pub name: String,
    pub artist: String,
    pub album: String,
    pub album_artist: String,
    pub artwork_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_playing() {
        assert!(PlaybackState::Playing.is_playing());
        for state in [
            PlaybackState::Stopped,
            PlaybackState::Paused,
            PlaybackState::Buffering,
            PlaybackState::Error,
        ] {
            assert!(!state.is_playing());
        }
    }

    #[test]
    fn test_decode_hint_from_url() {
        assert_eq!(DecodeHint::from_url("http://x/a.mp3"), DecodeHint::Mp3);
        assert_eq!(
            DecodeHint::from_url("http://x/a.FLAC?sig=abc"),
            DecodeHint::Flac
        );
        assert_eq!(DecodeHint::from_url("/music/b.ogg"), DecodeHint::Ogg);
        assert_eq!(DecodeHint::from_url("track.wav"), DecodeHint::Wav);
        assert_eq!(DecodeHint::from_url("http://x/stream"), DecodeHint::Unknown);
    }

    #[test]
    fn test_artist_line_skips_blank_names() {
        let track = PlayableTrack {
            artists: vec!["Alice".into(), "  ".into(), "Bob".into()],
            ..Default::default()
        };
        assert_eq!(track.artist_line(), "Alice, Bob");
    }

    #[test]
    fn test_display_title_sanitizes_newlines() {
        let track = PlayableTrack {
            title: "Song\nName".into(),
            artists: vec!["Artist".into()],
            ..Default::default()
        };
        assert_eq!(track.display_title(), "Song Name - Artist");
    }

    #[test]
    fn test_display_title_empty_when_untitled() {
        let track = PlayableTrack::default();
        assert_eq!(track.display_title(), "");
    }

    #[test]
    fn test_is_local() {
        let mut track = PlayableTrack {
            url: "https://cdn/a.mp3".into(),
            ..Default::default()
        };
        assert!(!track.is_local());
        track.url = "file:///music/a.mp3".into();
        assert!(track.is_local());
        track.url = "/music/a.mp3".into();
        assert!(track.is_local());
    }
}
