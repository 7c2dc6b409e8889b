//! Circular IQ replay history.
//!
//! Stores the last N seconds of pre-DSP samples. Seeking moves the read
//! pointer behind the write head; loop mode advances the write pointer
//! without storing, so a frozen snapshot can be replayed any number of
//! times. The whole structure is guarded by its own mutex so saving and
//! seeking are safe while streaming continues.

use std::path::Path;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Sample types the history can hold, with their conversion to the
/// 16-bit WAV output.
pub trait ReplaySample: Copy + Default + Send + 'static {
    fn to_wav_i16(self) -> i16;
}

impl ReplaySample for u8 {
    fn to_wav_i16(self) -> i16 {
        ((self as i16) - 128) << 8
    }
}

impl ReplaySample for i16 {
    fn to_wav_i16(self) -> i16 {
        self
    }
}

impl ReplaySample for i32 {
    // 24-bit fixed point: keep the top 16 bits
    fn to_wav_i16(self) -> i16 {
        (self >> 8) as i16
    }
}

impl ReplaySample for f32 {
    fn to_wav_i16(self) -> i16 {
        (self * 32768.0).clamp(-32768.0, 32767.0) as i16
    }
}

struct Inner<T> {
    data: Vec<T>,
    write: usize,
    read: usize,
    read_offset: usize,
    count: usize,
    looping: bool,
}

pub struct ReplayBuffer<T: ReplaySample> {
    inner: Mutex<Inner<T>>,
}

impl<T: ReplaySample> ReplayBuffer<T> {
    /// Capacity in components (one IQ pair is two components).
    pub fn new(capacity: usize) -> ReplayBuffer<T> {
        ReplayBuffer {
            inner: Mutex::new(Inner {
                data: vec![T::default(); capacity.max(2)],
                write: 0,
                read: 0,
                read_offset: 0,
                count: 0,
                looping: false,
            }),
        }
    }

    pub fn for_duration(seconds: f32, sample_rate: u32) -> ReplayBuffer<T> {
        ReplayBuffer::new((seconds as f64 * sample_rate as f64) as usize * 2)
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_loop(&self, looping: bool) {
        self.inner.lock().looping = looping;
    }

    pub fn looping(&self) -> bool {
        self.inner.lock().looping
    }

    /// True when reads should come from the history rather than live
    /// data.
    pub fn use_replay(&self) -> bool {
        let inner = self.inner.lock();
        inner.read_offset > 0 || inner.looping
    }

    /// Append components. In loop mode the write pointer advances but
    /// nothing is stored, preserving the captured snapshot.
    pub fn write(&self, samples: &[T]) {
        let mut inner = self.inner.lock();
        let capacity = inner.data.len();
        let mut remaining = samples;
        while !remaining.is_empty() {
            let write = inner.write;
            let len = remaining.len().min(capacity - write);
            if !inner.looping {
                inner.data[write..write + len].copy_from_slice(&remaining[..len]);
            }
            inner.write = (write + len) % capacity;
            inner.count = (inner.count + len).min(capacity);
            remaining = &remaining[len..];
        }
    }

    /// Read components from the current read pointer, advancing it.
    pub fn read(&self, out: &mut [T]) -> usize {
        let mut inner = self.inner.lock();
        let capacity = inner.data.len();
        let mut done = 0;
        while done < out.len() {
            let read = inner.read;
            let len = (out.len() - done).min(capacity - read);
            out[done..done + len].copy_from_slice(&inner.data[read..read + len]);
            inner.read = (read + len) % capacity;
            done += len;
        }
        done
    }

    /// Place the read pointer `components_back` behind the write head,
    /// clamped to the oldest stored sample.
    pub fn set_read_offset(&self, components_back: usize) {
        let mut inner = self.inner.lock();
        let capacity = inner.data.len();
        inner.read_offset = components_back;
        let offset = components_back.min(capacity - 1).min(inner.count);
        inner.read = (inner.write + capacity - offset) % capacity;
    }

    pub fn read_offset(&self) -> usize {
        self.inner.lock().read_offset
    }

    /// Resize to `seconds` of history at `sample_rate`, keeping the
    /// most recent data.
    pub fn set_size(&self, seconds: f32, sample_rate: u32) {
        let new_capacity = ((seconds as f64 * sample_rate as f64) as usize * 2).max(2);
        let mut inner = self.inner.lock();
        if new_capacity == inner.data.len() {
            return;
        }
        let keep = inner.count.min(new_capacity);
        let capacity = inner.data.len();
        let mut newest: Vec<T> = Vec::with_capacity(keep);
        for k in 0..keep {
            let idx = (inner.write + capacity - keep + k) % capacity;
            newest.push(inner.data[idx]);
        }
        inner.data = vec![T::default(); new_capacity];
        inner.data[..keep].copy_from_slice(&newest);
        inner.write = keep % new_capacity;
        inner.read = 0;
        inner.count = keep;
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let cap = inner.data.len();
        inner.data = vec![T::default(); cap];
        inner.write = 0;
        inner.read = 0;
        inner.count = 0;
    }

    /// Save the valid range as a 16-bit stereo WAV file. The center
    /// frequency is logged alongside the file for operator reference.
    pub fn save(&self, path: &Path, sample_rate: u32, center_frequency: u64) -> Result<()> {
        let inner = self.inner.lock();
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;

        let capacity = inner.data.len();
        let start = (inner.write + capacity - inner.count) % capacity;
        let mut k = 0;
        while k + 1 < inner.count {
            let l = inner.data[(start + k) % capacity].to_wav_i16();
            let r = inner.data[(start + k + 1) % capacity].to_wav_i16();
            writer
                .write_sample(l)
                .and_then(|_| writer.write_sample(r))
                .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
            k += 2;
        }
        writer
            .finalize()
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        log::info!(
            "saved {} IQ pairs at {} Hz (centre {} Hz) to {}",
            inner.count / 2,
            sample_rate,
            center_frequency,
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_what_was_written() {
        let buf: ReplayBuffer<i16> = ReplayBuffer::new(64);
        let x: Vec<i16> = (0..32).collect();
        buf.write(&x);
        buf.set_read_offset(x.len());
        let mut out = vec![0i16; 32];
        assert_eq!(buf.read(&mut out), 32);
        assert_eq!(out, x);
    }

    #[test]
    fn loop_mode_preserves_the_snapshot() {
        let buf: ReplayBuffer<i16> = ReplayBuffer::new(32);
        let x: Vec<i16> = (100..116).collect();
        buf.write(&x);
        buf.set_loop(true);
        // Live writes keep arriving but must not disturb the snapshot
        for _ in 0..10 {
            buf.write(&[0i16; 32]);
            buf.set_read_offset(16);
            let mut out = vec![0i16; 16];
            buf.read(&mut out);
            assert_eq!(out, x);
        }
    }

    #[test]
    fn offset_clamps_to_oldest_valid_sample() {
        let buf: ReplayBuffer<i16> = ReplayBuffer::new(32);
        buf.write(&[7i16; 8]);
        buf.set_read_offset(1000);
        let mut out = vec![0i16; 8];
        buf.read(&mut out);
        assert_eq!(out, [7i16; 8]);
    }

    #[test]
    fn wrap_around_keeps_most_recent() {
        let buf: ReplayBuffer<i16> = ReplayBuffer::new(16);
        let x: Vec<i16> = (0..20).collect();
        buf.write(&x);
        buf.set_read_offset(8);
        let mut out = vec![0i16; 8];
        buf.read(&mut out);
        assert_eq!(out, (12..20).collect::<Vec<i16>>());
    }

    #[test]
    fn resize_keeps_newest_data() {
        let buf: ReplayBuffer<i16> = ReplayBuffer::new(16);
        buf.write(&(0..16).collect::<Vec<i16>>());
        // shrink to 8 components at 4 Hz: 1 second * 4 * 2
        buf.set_size(1.0, 4);
        assert_eq!(buf.capacity(), 8);
        buf.set_read_offset(8);
        let mut out = vec![0i16; 8];
        buf.read(&mut out);
        assert_eq!(out, (8..16).collect::<Vec<i16>>());
    }

    #[test]
    fn save_writes_a_wav_file() {
        let buf: ReplayBuffer<i32> = ReplayBuffer::new(64);
        let x: Vec<i32> = (0..64).map(|k| k << 10).collect();
        buf.write(&x);
        let dir = std::env::temp_dir().join("sdra-stream-replay-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("replay.wav");
        buf.save(&path, 48_000, 7_100_000).unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 48_000);
        assert_eq!(reader.len(), 64);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn wav_sample_conversions() {
        assert_eq!(128u8.to_wav_i16(), 0);
        assert_eq!(255u8.to_wav_i16(), 127 << 8);
        assert_eq!((-32768i16).to_wav_i16(), -32768);
        assert_eq!((8_388_607i32).to_wav_i16(), 32767);
        assert_eq!(0.5f32.to_wav_i16(), 16384);
    }
}
