//! Workspace facade crate.
//!
//! Re-exports the playback core (`core-player`) and the runtime
//! infrastructure (`core-runtime`) so host applications can depend on a
//! single `tunecore` crate.

pub use core_player as player;
pub use core_runtime as runtime;
