//! Streaming FLAC for the IQ transport.
//!
//! - Encoder: pure Rust via `flacenc`, driven one fixed-size block at a
//!   time so every encoded frame maps onto exactly one `dataIQFLAC` wire
//!   frame.
//! - Decoder: Symphonia, pulled by a dedicated thread whose reads block
//!   on a byte queue filled from the network.
//!
//! The stream header is not taken from the encoder: it is assembled
//! explicitly so its length is fixed, and cached so a client that joins
//! mid-stream can be sent a well-formed stream start before the next
//! audio frame.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flacenc::bitsink::ByteSink;
use flacenc::component::BitRepr;
use flacenc::component::StreamInfo;
use flacenc::error::Verify;
use flacenc::source::Fill;
use flacenc::source::FrameBuf;
use parking_lot::{Condvar, Mutex};

use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_FLAC};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::CodecError;

/// Magic + STREAMINFO block + vendor block.
pub const FLAC_HEADER_SIZE: usize = 4 + 38 + 51;

/// Container sample-rate ceiling. The format nominally allows 655350 Hz
/// but rates above this are not streamable, so the header lies about the
/// rate for fast channels; the real rate still drives the pipeline.
pub const FLAC_MAX_CONTAINER_RATE: u32 = 176_400;

/// Block sizes above this are outside the streamable subset.
pub const FLAC_MAX_BLOCK_SIZE: usize = 16_384;
pub const FLAC_FALLBACK_BLOCK_SIZE: usize = 4_096;

/// 39 bytes, sized so the vendor block body is exactly 47 bytes.
const VENDOR_STRING: &str = "sdra-stream flacenc streaming container";

/// Clamp a requested block size to the FLAC streamable subset, falling
/// back to 4096 when the request is out of range. Rates at or below
/// 48 kHz additionally cap the block size at 4608.
pub fn streamable_block_size(block_size: usize, sample_rate: u32) -> usize {
    let max = if sample_rate <= 48_000 {
        4_608
    } else {
        FLAC_MAX_BLOCK_SIZE
    };
    if block_size >= 16 && block_size <= max {
        block_size
    } else {
        FLAC_FALLBACK_BLOCK_SIZE
    }
}

fn build_header(sample_rate: u32, sample_bits: u32, block_size: usize) -> Vec<u8> {
    let mut h = Vec::with_capacity(FLAC_HEADER_SIZE);
    h.extend_from_slice(b"fLaC");

    // STREAMINFO, 34-byte body, not last
    h.extend_from_slice(&[0x00, 0x00, 0x00, 0x22]);
    h.extend_from_slice(&(block_size as u16).to_be_bytes()); // min block
    h.extend_from_slice(&(block_size as u16).to_be_bytes()); // max block
    h.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // frame sizes unknown
    let ch = 2u32;
    h.push((sample_rate >> 12) as u8);
    h.push((sample_rate >> 4) as u8);
    h.push((((sample_rate & 0xF) << 4) | ((ch - 1) << 1) | ((sample_bits - 1) >> 4)) as u8);
    h.push((((sample_bits - 1) & 0xF) << 4) as u8); // total samples unknown
    h.extend_from_slice(&[0, 0, 0, 0]);
    h.extend_from_slice(&[0u8; 16]); // MD5 unknown for a live stream

    // VORBIS_COMMENT, 47-byte body, last
    h.extend_from_slice(&[0x84, 0x00, 0x00, 0x2F]);
    h.extend_from_slice(&(VENDOR_STRING.len() as u32).to_le_bytes());
    h.extend_from_slice(VENDOR_STRING.as_bytes());
    h.extend_from_slice(&0u32.to_le_bytes());

    debug_assert_eq!(h.len(), FLAC_HEADER_SIZE);
    h
}

/// Stereo (I/Q as left/right) streaming encoder.
pub struct FlacEncoder {
    config: flacenc::error::Verified<flacenc::config::Encoder>,
    stream_info: StreamInfo,
    header: Vec<u8>,
    pending: Vec<i32>,
    block_size: usize,
    sample_bits: u32,
    frame_number: usize,
}

impl FlacEncoder {
    /// `sample_rate` is the channel rate; it is clamped to the container
    /// ceiling for the header only. `sample_bits` is the wire depth.
    pub fn new(sample_rate: u32, sample_bits: u32, block_size: usize) -> Result<Self, CodecError> {
        if !matches!(sample_bits, 8 | 16 | 24) {
            return Err(CodecError::Other(format!(
                "FLAC transport supports 8/16/24-bit samples, got {}",
                sample_bits
            )));
        }
        let container_rate = sample_rate.min(FLAC_MAX_CONTAINER_RATE);
        let block_size = streamable_block_size(block_size, container_rate);

        let mut cfg = flacenc::config::Encoder::default();
        cfg.block_size = block_size;
        let config = cfg
            .into_verified()
            .map_err(|_| CodecError::Other("invalid FLAC encoder configuration".into()))?;
        let stream_info = StreamInfo::new(container_rate as usize, 2, sample_bits as usize)
            .map_err(|_| CodecError::Other("invalid FLAC stream parameters".into()))?;

        Ok(FlacEncoder {
            config,
            stream_info,
            header: build_header(container_rate, sample_bits, block_size),
            pending: Vec::with_capacity(block_size * 2),
            block_size,
            sample_bits,
            frame_number: 0,
        })
    }

    /// The fixed 93-byte stream header, cached for late joiners.
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn sample_bits(&self) -> u32 {
        self.sample_bits
    }

    /// Append one IQ pair. Returns one encoded frame's bytes whenever a
    /// full block has accumulated.
    pub fn push_pair(&mut self, i: i32, q: i32) -> Result<Option<Vec<u8>>, CodecError> {
        self.pending.push(i);
        self.pending.push(q);
        if self.pending.len() < self.block_size * 2 {
            return Ok(None);
        }
        self.encode_block().map(Some)
    }

    fn encode_block(&mut self) -> Result<Vec<u8>, CodecError> {
        let mut framebuf = FrameBuf::with_size(2, self.block_size)
            .map_err(|e| CodecError::Library(format!("FrameBuf: {:?}", e)))?;
        framebuf
            .fill_interleaved(&self.pending)
            .map_err(|e| CodecError::Library(format!("fill: {:?}", e)))?;
        let frame = flacenc::encode_fixed_size_frame(
            &self.config,
            &framebuf,
            self.frame_number,
            &self.stream_info,
        )
        .map_err(|e| CodecError::Library(format!("encode: {:?}", e)))?;
        let mut sink = ByteSink::new();
        frame
            .write(&mut sink)
            .map_err(|e| CodecError::Library(format!("write: {:?}", e)))?;
        self.frame_number += 1;
        self.pending.clear();
        Ok(sink.as_slice().to_vec())
    }

    /// Drop any partially accumulated block. Used after a runtime
    /// failure so the next frame starts clean.
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

struct QueueState {
    buf: VecDeque<u8>,
    closed: bool,
}

/// Blocking byte queue between the network tick and the decoder thread.
#[derive(Clone)]
pub struct ByteQueue {
    inner: Arc<(Mutex<QueueState>, Condvar)>,
}

impl ByteQueue {
    pub fn new() -> ByteQueue {
        ByteQueue {
            inner: Arc::new((
                Mutex::new(QueueState {
                    buf: VecDeque::new(),
                    closed: false,
                }),
                Condvar::new(),
            )),
        }
    }

    pub fn push(&self, bytes: &[u8]) {
        let (lock, cond) = &*self.inner;
        let mut state = lock.lock();
        state.buf.extend(bytes);
        cond.notify_one();
    }

    /// Wake the reader with end-of-stream.
    pub fn close(&self) {
        let (lock, cond) = &*self.inner;
        lock.lock().closed = true;
        cond.notify_all();
    }

    fn reader(&self) -> ByteQueueReader {
        ByteQueueReader {
            inner: self.inner.clone(),
        }
    }
}

impl Default for ByteQueue {
    fn default() -> Self {
        ByteQueue::new()
    }
}

struct ByteQueueReader {
    inner: Arc<(Mutex<QueueState>, Condvar)>,
}

impl Read for ByteQueueReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let (lock, cond) = &*self.inner;
        let mut state = lock.lock();
        while state.buf.is_empty() {
            if state.closed {
                return Ok(0);
            }
            cond.wait(&mut state);
        }
        let mut n = 0;
        while n < out.len() {
            match state.buf.pop_front() {
                Some(b) => {
                    out[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

/// Pull-model FLAC stream decoder. Bytes received from the wire are
/// pushed in; decoded samples (full-scale 32-bit, interleaved I/Q) are
/// handed to the sink callback on the decoder thread.
pub struct FlacStreamDecoder {
    queue: ByteQueue,
    thread: Option<JoinHandle<()>>,
}

impl FlacStreamDecoder {
    pub fn start<F>(on_samples: F) -> FlacStreamDecoder
    where
        F: FnMut(&[i32]) + Send + 'static,
    {
        let queue = ByteQueue::new();
        let reader = queue.reader();
        let thread = thread::spawn(move || decode_loop(reader, on_samples));
        FlacStreamDecoder {
            queue,
            thread: Some(thread),
        }
    }

    /// Feed wire bytes (header first, then frame bodies, in order).
    pub fn push(&self, bytes: &[u8]) {
        self.queue.push(bytes);
    }

    pub fn stop(&mut self) {
        self.queue.close();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for FlacStreamDecoder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn decode_loop<F>(reader: ByteQueueReader, mut on_samples: F)
where
    F: FnMut(&[i32]),
{
    let source = ReadOnlySource::new(reader);
    let mss = MediaSourceStream::new(Box::new(source), Default::default());

    let mut hint = Hint::new();
    hint.with_extension("flac");

    let probed = match symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    ) {
        Ok(p) => p,
        Err(e) => {
            log::warn!("FLAC stream probe failed: {}", e);
            return;
        }
    };
    let mut format = probed.format;

    let track = match format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec == CODEC_TYPE_FLAC)
    {
        Some(t) => t,
        None => {
            log::warn!("no FLAC track in stream");
            return;
        }
    };
    let track_id = track.id;

    let mut decoder = match symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
    {
        Ok(d) => d,
        Err(e) => {
            log::warn!("FLAC decoder init failed: {}", e);
            return;
        }
    };

    let mut interleaved: Vec<i32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(_)) => break, // stream closed
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(_) => break,
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(AudioBufferRef::S32(buf)) => {
                let channels = buf.spec().channels.count();
                let frames = buf.frames();
                interleaved.clear();
                interleaved.reserve(frames * channels);
                for f in 0..frames {
                    for c in 0..channels {
                        interleaved.push(buf.chan(c)[f]);
                    }
                }
                on_samples(&interleaved);
            }
            Ok(_) => {}
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn header_is_93_bytes_and_well_formed() {
        let enc = FlacEncoder::new(48_000, 16, 4_096).unwrap();
        let h = enc.header();
        assert_eq!(h.len(), FLAC_HEADER_SIZE);
        assert_eq!(&h[0..4], b"fLaC");
        // STREAMINFO block, not last, length 34
        assert_eq!(&h[4..8], &[0x00, 0x00, 0x00, 0x22]);
        // min == max == block size
        assert_eq!(u16::from_be_bytes([h[8], h[9]]), 4_096);
        assert_eq!(u16::from_be_bytes([h[10], h[11]]), 4_096);
        // vendor block is marked last
        assert_eq!(h[42] & 0x80, 0x80);
    }

    #[test]
    fn container_rate_is_clamped() {
        let enc = FlacEncoder::new(10_000_000, 16, 8_192).unwrap();
        let h = enc.header();
        let sr = ((h[18] as u32) << 12) | ((h[19] as u32) << 4) | ((h[20] as u32) >> 4);
        assert_eq!(sr, FLAC_MAX_CONTAINER_RATE);
    }

    #[test]
    fn block_size_subset_rule() {
        assert_eq!(streamable_block_size(4_096, 48_000), 4_096);
        assert_eq!(streamable_block_size(8_192, 48_000), FLAC_FALLBACK_BLOCK_SIZE);
        assert_eq!(streamable_block_size(8_192, 96_000), 8_192);
        assert_eq!(streamable_block_size(65_536, 96_000), FLAC_FALLBACK_BLOCK_SIZE);
    }

    #[test]
    fn thirty_two_bit_is_rejected() {
        assert!(FlacEncoder::new(48_000, 32, 4_096).is_err());
    }

    #[test]
    fn encoder_emits_one_frame_per_block() {
        let mut enc = FlacEncoder::new(48_000, 16, 256).unwrap();
        let mut frames = 0;
        for k in 0..1024i32 {
            if enc.push_pair(k % 256, -(k % 256)).unwrap().is_some() {
                frames += 1;
            }
        }
        assert_eq!(frames, 4);
    }

    #[test]
    fn encode_decode_round_trip() {
        let block = 256usize;
        let mut enc = FlacEncoder::new(48_000, 16, block).unwrap();

        // Two blocks of a ramp
        let total = 2 * block;
        let mut wire: Vec<Vec<u8>> = Vec::new();
        let mut reference: Vec<i32> = Vec::new();
        for k in 0..total as i32 {
            let i = (k % 1000) - 500;
            let q = 500 - (k % 1000);
            reference.push(i);
            reference.push(q);
            if let Some(frame) = enc.push_pair(i, q).unwrap() {
                wire.push(frame);
            }
        }
        assert_eq!(wire.len(), 2);

        let (tx, rx) = mpsc::channel();
        let mut dec = FlacStreamDecoder::start(move |samples: &[i32]| {
            for &s in samples {
                // full scale 32-bit back down to the 16-bit wire value
                let _ = tx.send(s >> 16);
            }
        });
        dec.push(enc.header());
        for frame in &wire {
            dec.push(frame);
        }
        dec.stop();

        let decoded: Vec<i32> = rx.try_iter().collect();
        assert_eq!(decoded.len(), reference.len());
        let matching = decoded
            .iter()
            .zip(reference.iter())
            .filter(|(a, b)| a == b)
            .count();
        assert_eq!(matching, reference.len(), "FLAC must be lossless");
    }
}
