//! # Playback Engines
//!
//! Four interchangeable implementations of [`PlayerBackend`]:
//!
//! - [`in_process`]: demux/decode/resample in this process, audio out
//!   through the system device. Works everywhere; the default.
//! - [`control_socket`]: drives a spawned mpv-compatible player over its
//!   JSON IPC socket. Unix only.
//! - [`daemon`]: client for an MPD-protocol daemon over TCP.
//! - [`native`]: AVFoundation's AVPlayer. macOS only.
//!
//! [`built_in_registrations`] wires them into the facade registry with the
//! default priority order.

#[cfg(unix)]
pub mod control_socket;
pub mod daemon;
pub mod in_process;
#[cfg(target_os = "macos")]
pub mod native;

use crate::backend::PlayerBackend;
use crate::config::PlayerConfig;
use crate::facade::BackendRegistration;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Registrations for every engine compiled into this build, highest
/// priority first. Availability probes are cheap and synchronous; actual
/// construction stays deferred behind the factory.
pub fn built_in_registrations(config: &PlayerConfig) -> Vec<BackendRegistration> {
    let mut registrations = Vec::new();

    {
        let in_process = config.in_process.clone();
        let tick = config.tick_interval;
        let volume = config.initial_volume;
        registrations.push(BackendRegistration {
            name: in_process::BACKEND_NAME,
            priority: 100,
            available: Box::new(output_device_present),
            factory: Box::new(move || {
                let config = in_process.clone();
                Box::pin(async move {
                    in_process::InProcessEngine::new(config, tick, volume)
                        .map(|engine| Arc::new(engine) as Arc<dyn PlayerBackend>)
                })
            }),
        });
    }

    #[cfg(target_os = "macos")]
    {
        let tick = config.tick_interval;
        let volume = config.initial_volume;
        registrations.push(BackendRegistration {
            name: native::BACKEND_NAME,
            priority: 90,
            available: Box::new(|| true),
            factory: Box::new(move || {
                Box::pin(async move {
                    native::NativeFrameworkEngine::new(tick, volume)
                        .map(|engine| Arc::new(engine) as Arc<dyn PlayerBackend>)
                })
            }),
        });
    }

    #[cfg(unix)]
    {
        let control_socket = config.control_socket.clone();
        let tick = config.tick_interval;
        let volume = config.initial_volume;
        let bin = control_socket.bin.clone();
        registrations.push(BackendRegistration {
            name: control_socket::BACKEND_NAME,
            priority: 80,
            available: Box::new(move || binary_on_path(&bin)),
            factory: Box::new(move || {
                let config = control_socket.clone();
                Box::pin(async move {
                    control_socket::ControlSocketEngine::new(config, tick, volume)
                        .await
                        .map(|engine| Arc::new(engine) as Arc<dyn PlayerBackend>)
                })
            }),
        });
    }

    {
        let daemon = config.daemon.clone();
        let tick = config.tick_interval;
        let volume = config.initial_volume;
        let probe = daemon.clone();
        registrations.push(BackendRegistration {
            name: daemon::BACKEND_NAME,
            priority: 60,
            available: Box::new(move || {
                if probe.autostart {
                    probe
                        .bin
                        .as_ref()
                        .and_then(|bin| bin.to_str())
                        .map(binary_on_path)
                        .unwrap_or(false)
                } else {
                    daemon_reachable(&probe.address)
                }
            }),
            factory: Box::new(move || {
                let config = daemon.clone();
                Box::pin(async move {
                    daemon::DaemonClientEngine::new(config, tick, volume)
                        .await
                        .map(|engine| Arc::new(engine) as Arc<dyn PlayerBackend>)
                })
            }),
        });
    }

    registrations
}

fn output_device_present() -> bool {
    use cpal::traits::HostTrait;
    cpal::default_host().default_output_device().is_some()
}

/// Resolve a binary the way the shell would: absolute/relative paths are
/// checked directly, bare names are searched on `PATH`.
fn binary_on_path(bin: &str) -> bool {
    let path = Path::new(bin);
    if path.components().count() > 1 {
        return path.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(bin).is_file()))
        .unwrap_or(false)
}

fn daemon_reachable(address: &str) -> bool {
    use std::net::{TcpStream, ToSocketAddrs};
    let Ok(mut addrs) = address.to_socket_addrs() else {
        return false;
    };
    addrs
        .next()
        .map(|addr| TcpStream::connect_timeout(&addr, Duration::from_millis(500)).is_ok())
        .unwrap_or(false)
}
