//! # Playback Core
//!
//! Pluggable audio-backend abstraction for a terminal streaming client.
//!
//! ## Overview
//!
//! This crate provides:
//! - A [`backend::PlayerBackend`] contract every engine implements
//! - Four engines: in-process decode, mpv control socket, MPD daemon
//!   client, and (on macOS) AVFoundation's AVPlayer
//! - A [`facade::PlayerFacade`] that owns the active backend, supports
//!   runtime switching, and publishes [`types::PlayingInfo`] snapshots
//! - The [`remote::Controller`] trait consumed by remote-control bridges

pub mod backend;
pub mod backends;
pub mod config;
pub mod error;
pub mod facade;
pub mod remote;
pub mod ring_buffer;
pub mod timer;
pub mod types;

pub use backend::{BackendNotifications, PlayerBackend};
pub use config::PlayerConfig;
pub use error::{PlayerError, Result};
pub use facade::{BackendRegistration, PlayerFacade};
pub use remote::Controller;
pub use types::{DecodeHint, PlaybackState, PlayableTrack, PlayingInfo};
