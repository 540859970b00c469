//! Audio output stage for the in-process engine.
//!
//! The engine writes decoded samples into the ring buffer; an [`AudioOutput`]
//! drains it. The real implementation drives a cpal device callback; tests
//! use [`NullOutput`], which drains at roughly real-time pace without a
//! device.
//!
//! While paused the output emits silence and does not drain the queue, so
//! resume picks up exactly where pause left off.

use crate::error::{PlayerError, Result};
use crate::ring_buffer::RingBuffer;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fixed output format. Decoded audio is converted and resampled to this
/// before it reaches the ring buffer.
pub const OUTPUT_SAMPLE_RATE: u32 = 44_100;
pub const OUTPUT_CHANNELS: u16 = 2;

/// Shared flags read by the output callback on every block.
#[derive(Clone)]
pub struct OutputControl {
    gain_bits: Arc<AtomicU32>,
    muted: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl OutputControl {
    pub fn new() -> Self {
        Self {
            gain_bits: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            muted: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_gain(&self, gain: f32, muted: bool) {
        self.gain_bits.store(gain.to_bits(), Ordering::Relaxed);
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn gain(&self) -> f32 {
        if self.muted.load(Ordering::Relaxed) {
            0.0
        } else {
            f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }
}

impl Default for OutputControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running output. Dropping without `shutdown` leaks the device
/// thread until process exit, so the engine calls `shutdown` from `close`.
pub trait AudioOutput: Send + Sync {
    fn shutdown(&self);
}

/// Constructor seam: the engine is handed a factory so tests can swap the
/// device out.
pub type OutputFactory =
    Box<dyn Fn(RingBuffer, OutputControl) -> Result<Box<dyn AudioOutput>> + Send + Sync>;

pub fn cpal_output_factory() -> OutputFactory {
    Box::new(|ring, control| Ok(Box::new(CpalOutput::start(ring, control)?)))
}

pub fn null_output_factory() -> OutputFactory {
    Box::new(|ring, control| Ok(Box::new(NullOutput::start(ring, control))))
}

// ============================================================================
// cpal implementation
// ============================================================================

/// Real device output. The cpal `Stream` is not `Send`, so it lives on a
/// dedicated thread; this handle only signals that thread.
pub struct CpalOutput {
    stop_tx: std::sync::mpsc::Sender<()>,
}

impl CpalOutput {
    pub fn start(ring: RingBuffer, control: OutputControl) -> Result<Self> {
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

        std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let stream = match Self::build_stream(ring, control) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                // Keep the stream alive until shutdown.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|err| PlayerError::Construction(format!("output thread: {err}")))?;

        ready_rx
            .recv()
            .map_err(|_| PlayerError::Construction("output thread died".to_string()))??;

        Ok(Self { stop_tx })
    }

    fn build_stream(ring: RingBuffer, control: OutputControl) -> Result<cpal::Stream> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlayerError::Construction("no audio output device".to_string()))?;

        tracing::info!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            "opening audio output"
        );

        let config = cpal::StreamConfig {
            channels: OUTPUT_CHANNELS,
            sample_rate: cpal::SampleRate(OUTPUT_SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };

        let err_fn = |err| tracing::error!(%err, "audio stream error");

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _| {
                    if control.is_paused() {
                        data.fill(0.0);
                        return;
                    }
                    let read = ring.read(data);
                    // Underrun: pad with silence.
                    data[read..].fill(0.0);
                    let gain = control.gain();
                    if gain != 1.0 {
                        for sample in &mut data[..read] {
                            *sample *= gain;
                        }
                    }
                },
                err_fn,
                None,
            )
            .map_err(|err| PlayerError::Construction(format!("output stream: {err}")))?;

        stream
            .play()
            .map_err(|err| PlayerError::Construction(format!("output start: {err}")))?;

        Ok(stream)
    }
}

impl AudioOutput for CpalOutput {
    fn shutdown(&self) {
        let _ = self.stop_tx.send(());
    }
}

// ============================================================================
// Null implementation (tests)
// ============================================================================

/// Deviceless output that drains the ring buffer at real-time pace. Honors
/// the pause flag the same way the device callback does.
pub struct NullOutput {
    stop: Arc<AtomicBool>,
}

impl NullOutput {
    pub fn start(ring: RingBuffer, control: OutputControl) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        std::thread::spawn(move || {
            let tick = Duration::from_millis(10);
            let samples_per_tick =
                (OUTPUT_SAMPLE_RATE as usize * OUTPUT_CHANNELS as usize) / 100;
            let mut sink = vec![0.0f32; samples_per_tick];
            while !thread_stop.load(Ordering::Relaxed) {
                if !control.is_paused() {
                    ring.read(&mut sink);
                }
                std::thread::sleep(tick);
            }
        });

        Self { stop }
    }
}

impl AudioOutput for NullOutput {
    fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
