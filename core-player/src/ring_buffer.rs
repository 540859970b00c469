//! # PCM Sample Ring Buffer
//!
//! Circular buffer carrying interleaved f32 samples from the decode task
//! (producer) to the audio-output callback (consumer).
//!
//! Writes are bounded: a full buffer accepts nothing and the decoder backs
//! off, so the buffer doubles as the decode throttle. The output callback
//! reads whatever is available and pads the remainder with silence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct RingBuffer {
    inner: Arc<RingBufferInner>,
}

struct RingBufferInner {
    buffer: parking_lot::Mutex<Vec<f32>>,
    capacity: usize,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
}

impl RingBuffer {
    /// Capacity is in samples, not frames: one second of stereo 44.1 kHz
    /// audio is `44100 * 2`.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RingBufferInner {
                buffer: parking_lot::Mutex::new(vec![0.0; capacity]),
                capacity,
                write_pos: AtomicUsize::new(0),
                read_pos: AtomicUsize::new(0),
            }),
        }
    }

    /// Write samples, stopping at the first sample that would overwrite
    /// unread data. Returns the number of samples accepted.
    pub fn write(&self, samples: &[f32]) -> usize {
        if samples.is_empty() {
            return 0;
        }

        let mut buffer = self.inner.buffer.lock();
        let write_pos = self.inner.write_pos.load(Ordering::Acquire);
        let read_pos = self.inner.read_pos.load(Ordering::Acquire);

        // One slot is kept empty to distinguish full from empty.
        let free = self.inner.capacity - 1 - Self::distance(read_pos, write_pos, self.inner.capacity);
        let to_write = free.min(samples.len());

        for (i, &sample) in samples[..to_write].iter().enumerate() {
            buffer[(write_pos + i) % self.inner.capacity] = sample;
        }

        self.inner
            .write_pos
            .store((write_pos + to_write) % self.inner.capacity, Ordering::Release);

        to_write
    }

    /// Read up to `output.len()` samples. Returns the number actually read;
    /// the rest of `output` is left untouched.
    pub fn read(&self, output: &mut [f32]) -> usize {
        if output.is_empty() {
            return 0;
        }

        let buffer = self.inner.buffer.lock();
        let read_pos = self.inner.read_pos.load(Ordering::Acquire);
        let write_pos = self.inner.write_pos.load(Ordering::Acquire);

        let available = Self::distance(read_pos, write_pos, self.inner.capacity);
        let to_read = available.min(output.len());

        for (i, slot) in output[..to_read].iter_mut().enumerate() {
            *slot = buffer[(read_pos + i) % self.inner.capacity];
        }

        self.inner
            .read_pos
            .store((read_pos + to_read) % self.inner.capacity, Ordering::Release);

        to_read
    }

    /// Samples currently available to read.
    pub fn available(&self) -> usize {
        let read_pos = self.inner.read_pos.load(Ordering::Acquire);
        let write_pos = self.inner.write_pos.load(Ordering::Acquire);
        Self::distance(read_pos, write_pos, self.inner.capacity)
    }

    /// Samples that can be written without being refused.
    pub fn free_space(&self) -> usize {
        self.inner.capacity - 1 - self.available()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free_space() == 0
    }

    /// Drop all buffered samples. Used on stop, seek and track switch.
    pub fn clear(&self) {
        let _buffer = self.inner.buffer.lock();
        self.inner.read_pos.store(0, Ordering::Release);
        self.inner.write_pos.store(0, Ordering::Release);
    }

    fn distance(read_pos: usize, write_pos: usize, capacity: usize) -> usize {
        if write_pos >= read_pos {
            write_pos - read_pos
        } else {
            capacity - read_pos + write_pos
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_roundtrip() {
        let buffer = RingBuffer::new(1024);

        let samples = vec![0.1, 0.2, 0.3, 0.4];
        assert_eq!(buffer.write(&samples), 4);
        assert_eq!(buffer.available(), 4);

        let mut output = vec![0.0; 4];
        assert_eq!(buffer.read(&mut output), 4);
        assert_eq!(output, samples);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_wrap_around() {
        let buffer = RingBuffer::new(9);

        buffer.write(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);

        let mut output = vec![0.0; 4];
        buffer.read(&mut output);
        assert_eq!(output, vec![1.0, 2.0, 3.0, 4.0]);

        buffer.write(&[9.0, 10.0, 11.0, 12.0]);

        let mut output = vec![0.0; 8];
        assert_eq!(buffer.read(&mut output), 8);
        assert_eq!(output, vec![5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
    }

    #[test]
    fn test_write_refuses_overwrite() {
        let buffer = RingBuffer::new(5);

        // Only capacity - 1 slots are usable.
        assert_eq!(buffer.write(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]), 4);
        assert!(buffer.is_full());
        assert_eq!(buffer.write(&[7.0]), 0);

        let mut output = vec![0.0; 4];
        assert_eq!(buffer.read(&mut output), 4);
        assert_eq!(output, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_partial_read() {
        let buffer = RingBuffer::new(1024);
        buffer.write(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let mut output = vec![0.0; 3];
        assert_eq!(buffer.read(&mut output), 3);
        assert_eq!(output, vec![1.0, 2.0, 3.0]);
        assert_eq!(buffer.available(), 3);
    }

    #[test]
    fn test_read_from_empty() {
        let buffer = RingBuffer::new(64);
        let mut output = vec![7.0; 8];
        assert_eq!(buffer.read(&mut output), 0);
        // Untouched on a short read.
        assert_eq!(output, vec![7.0; 8]);
    }

    #[test]
    fn test_clear() {
        let buffer = RingBuffer::new(64);
        buffer.write(&[1.0, 2.0, 3.0]);
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.free_space(), 63);
    }
}
