//! Block-oriented deflate transport.
//!
//! Quantised IQ bytes accumulate in a block buffer; once the configured
//! block size is reached the whole buffer is compressed as one complete
//! zlib stream and emitted. Every wire frame is therefore independently
//! decodable, which is what lets the server drop frames under
//! backpressure without corrupting the stream.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression as Level;

use super::CodecError;

pub struct ZlibBlockEncoder {
    block_size: usize,
    level: u32,
    in_buf: Vec<u8>,
}

impl ZlibBlockEncoder {
    pub fn new(block_size: usize, level: u32) -> Result<ZlibBlockEncoder, CodecError> {
        if block_size == 0 {
            return Err(CodecError::InvalidInput);
        }
        Ok(ZlibBlockEncoder {
            block_size,
            level: level.min(9),
            in_buf: Vec::with_capacity(block_size + 8),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Append quantised bytes; emits one compressed block once at least
    /// `block_size` bytes have accumulated. The block boundary lands on
    /// the trailing IQ pair, so blocks can exceed `block_size` by up to
    /// one pair.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Option<Vec<u8>>, CodecError> {
        self.in_buf.extend_from_slice(bytes);
        if self.in_buf.len() < self.block_size {
            return Ok(None);
        }
        let mut encoder = ZlibEncoder::new(Vec::new(), Level::new(self.level));
        encoder
            .write_all(&self.in_buf)
            .map_err(|e| CodecError::Library(format!("deflate: {}", e)))?;
        let out = encoder
            .finish()
            .map_err(|e| CodecError::Library(format!("deflate finish: {}", e)))?;
        self.in_buf.clear();
        Ok(Some(out))
    }

    /// Drop the partial block. Used after a runtime failure.
    pub fn reset(&mut self) {
        self.in_buf.clear();
    }
}

/// Inflate one independently compressed block.
pub fn inflate_block(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Library(format!("inflate: {}", e)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_round_trip_byte_for_byte() {
        let block = 512usize;
        let mut enc = ZlibBlockEncoder::new(block, 6).unwrap();
        let input: Vec<u8> = (0..4 * block).map(|k| (k % 251) as u8).collect();

        let mut inflated = Vec::new();
        for chunk in input.chunks(4) {
            if let Some(frame) = enc.push(chunk).unwrap() {
                inflated.extend_from_slice(&inflate_block(&frame).unwrap());
            }
        }
        assert_eq!(inflated, input);
    }

    #[test]
    fn each_frame_is_independent() {
        let mut enc = ZlibBlockEncoder::new(64, 9).unwrap();
        let mut frames = Vec::new();
        for k in 0..256u32 {
            if let Some(f) = enc.push(&k.to_le_bytes()).unwrap() {
                frames.push(f);
            }
        }
        assert!(frames.len() >= 2);
        // Decode the last frame first: no shared dictionary allowed
        let last = inflate_block(frames.last().unwrap()).unwrap();
        assert_eq!(last.len(), 64);
    }

    #[test]
    fn partial_block_is_held_back() {
        let mut enc = ZlibBlockEncoder::new(1024, 1).unwrap();
        assert!(enc.push(&[0u8; 1000]).unwrap().is_none());
        assert!(enc.push(&[0u8; 24]).unwrap().is_some());
    }

    #[test]
    fn reset_drops_partial_block() {
        let mut enc = ZlibBlockEncoder::new(100, 1).unwrap();
        enc.push(&[1u8; 60]).unwrap();
        enc.reset();
        assert!(enc.push(&[2u8; 60]).unwrap().is_none());
    }

    #[test]
    fn zero_block_size_rejected() {
        assert!(ZlibBlockEncoder::new(0, 5).is_err());
    }
}
