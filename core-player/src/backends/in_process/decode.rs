//! Blocking decode loop for the in-process engine.
//!
//! Runs on a `spawn_blocking` thread. Reads the spool file through symphonia,
//! normalizes every packet to interleaved stereo f32 at the fixed output
//! rate, and pushes it into the ring buffer. A full ring buffer is the
//! decode throttle.
//!
//! The spool may still be downloading while we decode. Hitting the end of
//! the spooled bytes before the download is complete is not end-of-track:
//! the loop waits, reopens the reader and seeks back to where it was. When
//! the download completes mid-session, MP3 sources get one deliberate reopen
//! so the demuxer sees the final file length (a reader that started on a
//! partial file keeps its truncated length).

use crate::error::{PlayerError, Result};
use crate::ring_buffer::RingBuffer;
use crate::timer::Timer;
use crate::types::DecodeHint;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::conv::IntoSample;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;
use symphonia::core::units::Time;
use tokio_util::sync::CancellationToken;

use super::output::{OUTPUT_CHANNELS, OUTPUT_SAMPLE_RATE};
use super::spool::Spool;

/// Wait between polls when the decoder outruns the download.
const STARVED_POLL: Duration = Duration::from_millis(100);
/// Backpressure nap when the ring buffer is full.
const RING_FULL_NAP: Duration = Duration::from_millis(10);
/// Corrupt packets tolerated in a row before the session fails.
const MAX_CONSECUTIVE_ERRORS: usize = 10;

/// How a decode session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// Track played to the end and the ring buffer drained.
    Finished,
    /// Session token was cancelled (stop or track switch).
    Cancelled,
    Failed(PlayerError),
}

/// Inputs of one decode session. Everything shared is owned elsewhere; the
/// session only borrows observability (spool) and pushes samples (ring).
pub struct DecodeSession {
    pub spool: Arc<Spool>,
    pub hint: DecodeHint,
    pub ring: RingBuffer,
    pub timer: Arc<Timer>,
    pub cancel: CancellationToken,
    /// Seek requests from the command loop; honored for MP3 only.
    pub pending_seek: Arc<Mutex<Option<Duration>>>,
}

struct Reader {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: usize,
}

impl Reader {
    fn open(path: &Path, hint: DecodeHint) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let source = Box::new(file) as Box<dyn MediaSource>;
        let stream = MediaSourceStream::new(source, Default::default());

        let mut probe_hint = Hint::new();
        if let Some(ext) = hint.extension() {
            probe_hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &probe_hint,
                stream,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|err| PlayerError::Decode(format!("probe: {err}")))?;

        let format = probed.format;
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| PlayerError::Decode("no decodable track".to_string()))?;

        let track_id = track.id;
        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| PlayerError::Decode("missing sample rate".to_string()))?;
        let channels = track
            .codec_params
            .channels
            .map(|ch| ch.count())
            .unwrap_or(2);

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|err| PlayerError::Decode(format!("decoder: {err}")))?;

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
        })
    }

    fn seek_to(&mut self, position: Duration) {
        let time = Time::from(position.as_secs_f64());
        if let Err(err) = self.format.seek(
            SeekMode::Coarse,
            SeekTo::Time {
                time,
                track_id: Some(self.track_id),
            },
        ) {
            tracing::warn!(%err, ?position, "seek failed, continuing from current packet");
        }
        self.decoder.reset();
    }
}

/// Run one decode session to its end. Blocking; call from `spawn_blocking`.
pub fn run_session(session: DecodeSession) -> SessionEnd {
    let mut reader = match Reader::open(session.spool.path(), session.hint) {
        Ok(reader) => reader,
        Err(err) => return SessionEnd::Failed(err),
    };
    tracing::debug!(
        sample_rate = reader.sample_rate,
        channels = reader.channels,
        hint = ?session.hint,
        "decode session started"
    );

    // Set once the post-completion reopen has happened.
    let mut saw_complete = session.spool.is_complete();
    let mut consecutive_errors = 0usize;
    let mut resampler: Option<StreamResampler> = None;

    loop {
        if session.cancel.is_cancelled() {
            return SessionEnd::Cancelled;
        }

        if let Some(target) = session.pending_seek.lock().take() {
            if session.hint == DecodeHint::Mp3 {
                reader.seek_to(target);
            }
        }

        // A reader opened on a partial file keeps the stale length; once the
        // download finishes, reopen MP3 sessions against the full file and
        // seek back to (just before) where we were.
        if !saw_complete && session.spool.is_complete() {
            saw_complete = true;
            if session.hint == DecodeHint::Mp3 {
                let resume = session
                    .timer
                    .passed()
                    .saturating_sub(Duration::from_millis(1));
                match Reader::open(session.spool.path(), session.hint) {
                    Ok(mut fresh) => {
                        fresh.seek_to(resume);
                        reader = fresh;
                    }
                    Err(err) => {
                        tracing::warn!(%err, "reopen after download completion failed");
                    }
                }
            }
        }

        let packet = match reader.format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                if session.spool.is_complete() {
                    return drain_ring(&session);
                }
                if session.spool.is_failed() {
                    return SessionEnd::Failed(PlayerError::Source(
                        "download failed mid-track".to_string(),
                    ));
                }
                // Outran the download: wait for bytes, then resume with a
                // fresh reader at the current position.
                std::thread::sleep(STARVED_POLL);
                let resume = session.timer.passed();
                match Reader::open(session.spool.path(), session.hint) {
                    Ok(mut fresh) => {
                        fresh.seek_to(resume);
                        reader = fresh;
                    }
                    Err(_) => std::thread::sleep(STARVED_POLL),
                }
                continue;
            }
            Err(SymphoniaError::ResetRequired) => {
                reader.decoder.reset();
                continue;
            }
            Err(err) => {
                return SessionEnd::Failed(PlayerError::Decode(format!("read packet: {err}")));
            }
        };

        if packet.track_id() != reader.track_id {
            continue;
        }

        let samples = match reader.decoder.decode(&packet) {
            Ok(decoded) => {
                consecutive_errors = 0;
                to_interleaved_f32(&decoded)
            }
            Err(SymphoniaError::DecodeError(err)) => {
                consecutive_errors += 1;
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    return SessionEnd::Failed(PlayerError::Decode(format!(
                        "stream corrupt: {err}"
                    )));
                }
                tracing::warn!(consecutive_errors, %err, "skipping undecodable packet");
                continue;
            }
            Err(SymphoniaError::IoError(err)) => {
                consecutive_errors += 1;
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    return SessionEnd::Failed(PlayerError::Decode(format!(
                        "stream corrupt: {err}"
                    )));
                }
                tracing::warn!(consecutive_errors, %err, "skipping undecodable packet");
                continue;
            }
            Err(err) => {
                return SessionEnd::Failed(PlayerError::Decode(format!("decode: {err}")));
            }
        };

        let stereo = to_stereo(&samples, reader.channels);
        let resampled = if reader.sample_rate == OUTPUT_SAMPLE_RATE {
            stereo
        } else {
            match resample(&mut resampler, &stereo, reader.sample_rate) {
                Ok(resampled) => resampled,
                Err(err) => return SessionEnd::Failed(err),
            }
        };

        if !write_with_backpressure(&session.ring, &resampled, &session.cancel) {
            return SessionEnd::Cancelled;
        }
    }
}

/// Let the output play out what is left in the ring buffer.
fn drain_ring(session: &DecodeSession) -> SessionEnd {
    while !session.ring.is_empty() {
        if session.cancel.is_cancelled() {
            return SessionEnd::Cancelled;
        }
        std::thread::sleep(RING_FULL_NAP);
    }
    SessionEnd::Finished
}

fn write_with_backpressure(ring: &RingBuffer, samples: &[f32], cancel: &CancellationToken) -> bool {
    let mut offset = 0;
    while offset < samples.len() {
        if cancel.is_cancelled() {
            return false;
        }
        let written = ring.write(&samples[offset..]);
        if written == 0 {
            std::thread::sleep(RING_FULL_NAP);
        }
        offset += written;
    }
    true
}

// ============================================================================
// Sample normalization
// ============================================================================

/// Flatten a decoded buffer of any sample format into interleaved f32.
fn to_interleaved_f32(buffer: &AudioBufferRef<'_>) -> Vec<f32> {
    match buffer {
        AudioBufferRef::F32(buf) => interleave(buf, |s: f32| s),
        AudioBufferRef::F64(buf) => interleave(buf, |s: f64| s.into_sample()),
        AudioBufferRef::S32(buf) => interleave(buf, |s: i32| s.into_sample()),
        AudioBufferRef::S16(buf) => interleave(buf, |s: i16| s.into_sample()),
        AudioBufferRef::S24(buf) => interleave(buf, |s| IntoSample::into_sample(s)),
        AudioBufferRef::S8(buf) => interleave(buf, |s: i8| s.into_sample()),
        AudioBufferRef::U32(buf) => interleave(buf, |s: u32| s.into_sample()),
        AudioBufferRef::U24(buf) => interleave(buf, |s| IntoSample::into_sample(s)),
        AudioBufferRef::U16(buf) => interleave(buf, |s: u16| s.into_sample()),
        AudioBufferRef::U8(buf) => interleave(buf, |s: u8| s.into_sample()),
    }
}

fn interleave<T>(buf: &AudioBuffer<T>, convert: fn(T) -> f32) -> Vec<f32>
where
    T: Sample + Copy,
{
    let channels = buf.spec().channels.count();
    let frames = buf.frames();
    let mut out = Vec::with_capacity(frames * channels);
    for frame in 0..frames {
        for channel in 0..channels {
            out.push(convert(buf.chan(channel)[frame]));
        }
    }
    out
}

/// Map interleaved samples of any channel count onto stereo.
fn to_stereo(samples: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        2 => samples.to_vec(),
        1 => {
            let mut out = Vec::with_capacity(samples.len() * 2);
            for &sample in samples {
                out.push(sample);
                out.push(sample);
            }
            out
        }
        n if n > 2 => {
            // Keep the front pair, drop the rest.
            let frames = samples.len() / n;
            let mut out = Vec::with_capacity(frames * 2);
            for frame in 0..frames {
                out.push(samples[frame * n]);
                out.push(samples[frame * n + 1]);
            }
            out
        }
        _ => Vec::new(),
    }
}

/// Resampler kept for the whole session so interpolation history carries
/// across packet boundaries. `FastFixedIn` is bound to one input geometry;
/// `resample` rebuilds it when the rate or packet frame count changes.
struct StreamResampler {
    inner: rubato::FastFixedIn<f32>,
    from_rate: u32,
    chunk_frames: usize,
}

impl StreamResampler {
    fn new(from_rate: u32, chunk_frames: usize) -> Result<Self> {
        let inner = rubato::FastFixedIn::<f32>::new(
            OUTPUT_SAMPLE_RATE as f64 / from_rate as f64,
            1.0,
            rubato::PolynomialDegree::Septic,
            chunk_frames,
            OUTPUT_CHANNELS as usize,
        )
        .map_err(|err| PlayerError::Decode(format!("resampler: {err}")))?;
        Ok(Self {
            inner,
            from_rate,
            chunk_frames,
        })
    }

    fn matches(&self, from_rate: u32, chunk_frames: usize) -> bool {
        self.from_rate == from_rate && self.chunk_frames == chunk_frames
    }

    /// Resample one interleaved stereo chunk of exactly `chunk_frames` frames.
    fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        use rubato::Resampler;

        let frames = self.chunk_frames;
        let mut left = Vec::with_capacity(frames);
        let mut right = Vec::with_capacity(frames);
        for frame in 0..frames {
            left.push(samples[frame * 2]);
            right.push(samples[frame * 2 + 1]);
        }

        let planar = self
            .inner
            .process(&[left, right], None)
            .map_err(|err| PlayerError::Decode(format!("resample: {err}")))?;

        let out_frames = planar[0].len();
        let mut out = Vec::with_capacity(out_frames * 2);
        for frame in 0..out_frames {
            out.push(planar[0][frame]);
            out.push(planar[1][frame]);
        }
        Ok(out)
    }
}

/// Resample an interleaved stereo buffer through the session resampler,
/// rebuilding it only when the input geometry changes.
fn resample(
    slot: &mut Option<StreamResampler>,
    samples: &[f32],
    from_rate: u32,
) -> Result<Vec<f32>> {
    let frames = samples.len() / OUTPUT_CHANNELS as usize;
    if frames == 0 {
        return Ok(Vec::new());
    }
    if !slot
        .as_ref()
        .is_some_and(|r| r.matches(from_rate, frames))
    {
        *slot = Some(StreamResampler::new(from_rate, frames)?);
    }
    let Some(resampler) = slot.as_mut() else {
        return Ok(Vec::new());
    };
    resampler.process(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono_upmix_duplicates() {
        let out = to_stereo(&[0.1, 0.2, 0.3], 1);
        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2, 0.3, 0.3]);
    }

    #[test]
    fn test_stereo_passthrough() {
        let samples = vec![0.1, -0.1, 0.2, -0.2];
        assert_eq!(to_stereo(&samples, 2), samples);
    }

    #[test]
    fn test_surround_keeps_front_pair() {
        // 5.1 layout, one frame: FL FR FC LFE RL RR
        let out = to_stereo(&[0.1, 0.2, 0.9, 0.9, 0.9, 0.9], 6);
        assert_eq!(out, vec![0.1, 0.2]);
    }

    #[test]
    fn test_resample_changes_frame_count() {
        // 48 kHz → 44.1 kHz shrinks the buffer by the rate ratio.
        let frames = 4800;
        let input = vec![0.5f32; frames * 2];
        let mut slot = None;
        let output = resample(&mut slot, &input, 48_000).unwrap();
        let out_frames = output.len() / 2;
        let expected = (frames as f64 * 44_100.0 / 48_000.0) as usize;
        assert!(
            (out_frames as i64 - expected as i64).unsigned_abs() < 64,
            "got {out_frames}, expected about {expected}"
        );
    }

    #[test]
    fn test_resampler_state_carries_across_chunks() {
        // A 440 Hz sine chunk at 48 kHz, fed twice.
        let frames = 1024;
        let chunk: Vec<f32> = (0..frames)
            .flat_map(|n| {
                let t = n as f32 / 48_000.0;
                let s = (t * 440.0 * std::f32::consts::TAU).sin();
                [s, s]
            })
            .collect();

        let mut slot = None;
        let first = resample(&mut slot, &chunk, 48_000).unwrap();
        let second = resample(&mut slot, &chunk, 48_000).unwrap();

        let mut fresh = None;
        let fresh_first = resample(&mut fresh, &chunk, 48_000).unwrap();

        // Same history for the first chunk; the second chunk interpolates
        // from the first's tail instead of restarting from silence.
        assert_eq!(first, fresh_first);
        assert_ne!(second, fresh_first);
    }

    #[test]
    fn test_resampler_rebuilds_on_geometry_change() {
        let mut slot = None;
        resample(&mut slot, &vec![0.25; 800 * 2], 48_000).unwrap();
        // A different packet size or rate gets a fresh resampler, not an
        // input-length error.
        resample(&mut slot, &vec![0.25; 512 * 2], 48_000).unwrap();
        resample(&mut slot, &vec![0.25; 512 * 2], 32_000).unwrap();
    }
}
