//! Sample format conversion between the internal fixed point and the wire.
//!
//! Internally samples are 24-bit signed fixed point carried in `i32`
//! (full scale 2^23). The wire carries 8-bit unsigned (offset binary,
//! bias 128), 16/24/32-bit signed little-endian, or - in spy-server mode
//! only - IEEE-754 floats normalized to +/-1.0.

/// Internal fixed-point width in bits.
pub const INTERNAL_BITS: u32 = 24;
/// Full scale of the internal fixed point.
pub const FULL_SCALE: f32 = 8_388_608.0; // 2^23

/// Local fixed-point width on the client side. Mirrors the two sample
/// sizes the downstream DSP can be built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalWidth {
    S16,
    S24,
}

pub fn clamp8(x: i32) -> i32 {
    x.clamp(-128, 127)
}

pub fn clamp16(x: i32) -> i32 {
    x.clamp(-32768, 32767)
}

pub fn clamp24(x: i32) -> i32 {
    x.clamp(-8_388_608, 8_388_607)
}

/// Bytes used by one interleaved IQ pair at the given wire depth.
pub fn bytes_per_iq_pair(sample_bits: u32) -> usize {
    2 * sample_bits as usize / 8
}

/// Quantise one IQ pair from the internal fixed point into wire bytes.
/// Returns the number of bytes written (2, 4, 6 or 8).
pub fn quantize_pair(i: f32, q: f32, sample_bits: u32, out: &mut [u8; 8]) -> usize {
    match sample_bits {
        8 => {
            // rtl_tcp style interleaved unsigned 8-bit
            out[0] = (clamp8((i / 65536.0) as i32) + 128) as u8;
            out[1] = (clamp8((q / 65536.0) as i32) + 128) as u8;
            2
        }
        16 => {
            let iv = clamp16((i / 256.0) as i32) as i16;
            let qv = clamp16((q / 256.0) as i32) as i16;
            out[0..2].copy_from_slice(&iv.to_le_bytes());
            out[2..4].copy_from_slice(&qv.to_le_bytes());
            4
        }
        24 => {
            let iv = clamp24(i as i32);
            let qv = clamp24(q as i32);
            out[0] = iv as u8;
            out[1] = (iv >> 8) as u8;
            out[2] = (iv >> 16) as u8;
            out[3] = qv as u8;
            out[4] = (qv >> 8) as u8;
            out[5] = (qv >> 16) as u8;
            6
        }
        _ => {
            let iv = i as i32;
            let qv = q as i32;
            out[0..4].copy_from_slice(&iv.to_le_bytes());
            out[4..8].copy_from_slice(&qv.to_le_bytes());
            8
        }
    }
}

/// Quantise one IQ pair into signed integers for the FLAC encoder.
/// Same scaling as the raw path, but without the 8-bit unsigned bias:
/// FLAC carries signed samples at every depth.
pub fn quantize_pair_signed(i: f32, q: f32, sample_bits: u32) -> [i32; 2] {
    match sample_bits {
        8 => [clamp8((i / 65536.0) as i32), clamp8((q / 65536.0) as i32)],
        16 => [clamp16((i / 256.0) as i32), clamp16((q / 256.0) as i32)],
        24 => [clamp24(i as i32), clamp24(q as i32)],
        _ => [i as i32, q as i32],
    }
}

/// Widen wire bytes into the local fixed point. `input` must hold whole
/// samples (a multiple of `sample_bits/8` bytes); output is one `i32`
/// per sample component, scaled to `width`.
pub fn widen(input: &[u8], sample_bits: u32, width: LocalWidth, out: &mut Vec<i32>) {
    match (sample_bits, width) {
        (8, LocalWidth::S16) => {
            for &b in input {
                out.push(((b as i32) - 128) << 8);
            }
        }
        (8, LocalWidth::S24) => {
            for &b in input {
                out.push(((b as i32) - 128) << 16);
            }
        }
        (16, LocalWidth::S16) => {
            for c in input.chunks_exact(2) {
                out.push(i16::from_le_bytes([c[0], c[1]]) as i32);
            }
        }
        (16, LocalWidth::S24) => {
            for c in input.chunks_exact(2) {
                out.push((i16::from_le_bytes([c[0], c[1]]) as i32) << 8);
            }
        }
        (24, LocalWidth::S16) => {
            for c in input.chunks_exact(3) {
                out.push((((c[2] as i32) << 8) | (c[1] as i32)) as i16 as i32);
            }
        }
        (24, LocalWidth::S24) => {
            for c in input.chunks_exact(3) {
                let v = ((c[2] as i32) << 16) | ((c[1] as i32) << 8) | (c[0] as i32);
                out.push((v << 8) >> 8); // sign extend 24 bits
            }
        }
        (32, LocalWidth::S16) => {
            for c in input.chunks_exact(4) {
                out.push(i32::from_le_bytes([c[0], c[1], c[2], c[3]]) >> 8);
            }
        }
        (32, LocalWidth::S24) => {
            for c in input.chunks_exact(4) {
                out.push(i32::from_le_bytes([c[0], c[1], c[2], c[3]]));
            }
        }
        _ => {}
    }
}

/// Widen normalized floats (spy-server 32-bit mode) into the local
/// fixed point.
pub fn widen_floats(input: &[u8], width: LocalWidth, out: &mut Vec<i32>) {
    for c in input.chunks_exact(4) {
        let v = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
        let scaled = (v * FULL_SCALE).round() as i32;
        out.push(match width {
            LocalWidth::S24 => scaled,
            LocalWidth::S16 => scaled >> 8,
        });
    }
}

/// Widen decoded FLAC samples. Symphonia emits full-scale 32-bit values
/// (decoded sample shifted left by `32 - bits_per_sample`).
pub fn widen_flac_s32(input: &[i32], width: LocalWidth, out: &mut Vec<i32>) {
    let shift = match width {
        LocalWidth::S24 => 8,
        LocalWidth::S16 => 16,
    };
    for &v in input {
        out.push(v >> shift);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widen_one(bytes: &[u8], bits: u32, width: LocalWidth) -> i32 {
        let mut out = Vec::new();
        widen(bytes, bits, width, &mut out);
        out[0]
    }

    #[test]
    fn quantize_widen_within_half_lsb() {
        // One wire LSB expressed at the internal 24-bit scale
        for &bits in &[8u32, 16, 24, 32] {
            let step = match bits {
                8 => 65536.0f32,
                16 => 256.0,
                _ => 1.0,
            };
            for &x in &[-8_000_000.0f32, -12_345.0, 0.0, 999.0, 8_000_000.0] {
                let mut wire = [0u8; 8];
                let n = quantize_pair(x, 0.0, bits, &mut wire);
                let mut out = Vec::new();
                widen(&wire[..n], bits, LocalWidth::S24, &mut out);
                let err = (out[0] as f32 - x).abs();
                assert!(
                    err <= step,
                    "bits {} x {} widened {} err {}",
                    bits,
                    x,
                    out[0],
                    err
                );
            }
        }
    }

    #[test]
    fn quantize_saturates_at_endpoints() {
        let mut wire = [0u8; 8];
        // Far out of range positive and negative
        quantize_pair(1e9, -1e9, 8, &mut wire);
        assert_eq!(wire[0], 255);
        assert_eq!(wire[1], 0);

        quantize_pair(1e9, -1e9, 16, &mut wire);
        assert_eq!(i16::from_le_bytes([wire[0], wire[1]]), 32767);
        assert_eq!(i16::from_le_bytes([wire[2], wire[3]]), -32768);

        quantize_pair(1e9, -1e9, 24, &mut wire);
        assert_eq!(widen_one(&wire[0..3], 24, LocalWidth::S24), 8_388_607);
        assert_eq!(widen_one(&wire[3..6], 24, LocalWidth::S24), -8_388_608);
    }

    #[test]
    fn eight_bit_is_offset_binary() {
        let mut wire = [0u8; 8];
        quantize_pair(0.0, 0.0, 8, &mut wire);
        assert_eq!(&wire[..2], &[128, 128]);
    }

    #[test]
    fn cross_width_to_s16() {
        // 8 -> 16: (v - 128) << 8
        assert_eq!(widen_one(&[128], 8, LocalWidth::S16), 0);
        assert_eq!(widen_one(&[255], 8, LocalWidth::S16), 127 << 8);
        // 24 -> 16: top two bytes
        assert_eq!(widen_one(&[0x00, 0x34, 0x12], 24, LocalWidth::S16), 0x1234);
        // negative 24-bit value keeps its sign
        assert_eq!(widen_one(&[0x00, 0x00, 0x80], 24, LocalWidth::S16), -32768);
        // 32 -> 16 drops the low byte then the next (>> 8 at 24-bit scale)
        let v: i32 = 0x123456;
        assert_eq!(
            widen_one(&v.to_le_bytes(), 32, LocalWidth::S16),
            v >> 8
        );
    }

    #[test]
    fn signed_quantize_for_flac_has_no_bias() {
        assert_eq!(quantize_pair_signed(0.0, 0.0, 8), [0, 0]);
        assert_eq!(quantize_pair_signed(65536.0, -65536.0, 8), [1, -1]);
        assert_eq!(quantize_pair_signed(1e9, -1e9, 16), [32767, -32768]);
    }

    #[test]
    fn float_widening_scales_to_full_scale() {
        let mut out = Vec::new();
        let one: f32 = 0.5;
        widen_floats(&one.to_le_bytes(), LocalWidth::S24, &mut out);
        assert_eq!(out[0], (0.5 * FULL_SCALE) as i32);
    }

    #[test]
    fn flac_s32_widening() {
        let mut out = Vec::new();
        widen_flac_s32(&[0x7FFF_FF00u32 as i32], LocalWidth::S24, &mut out);
        assert_eq!(out[0], 0x007F_FFFF);
    }
}
