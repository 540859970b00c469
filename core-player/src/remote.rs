//! Control surface exposed to remote-control bridges (media keys, MPRIS-like
//! integrations, UI shells). The facade implements it; transport operations
//! forward to the active backend, playlist-level operations are published as
//! events for the playlist owner to act on.

use crate::error::Result;
use crate::types::PlayingInfo;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait Controller: Send + Sync {
    async fn ctrl_pause(&self) -> Result<()>;
    async fn ctrl_resume(&self) -> Result<()>;
    async fn ctrl_stop(&self) -> Result<()>;
    async fn ctrl_toggle(&self) -> Result<()>;

    /// Seek within the current track. Negative positions cannot be
    /// expressed; out-of-range positions are clamped by the backend.
    async fn ctrl_seek(&self, position: Duration) -> Result<()>;

    async fn ctrl_set_volume(&self, volume: u8) -> Result<()>;

    /// Playlist-level requests. The playback core owns no playlist; these
    /// publish events the playlist owner subscribes to.
    async fn ctrl_next(&self) -> Result<()>;
    async fn ctrl_previous(&self) -> Result<()>;
    async fn ctrl_like(&self) -> Result<()>;
    async fn ctrl_dislike(&self) -> Result<()>;

    /// Snapshot of what is playing, for display surfaces.
    fn playing_info(&self) -> PlayingInfo;
}
