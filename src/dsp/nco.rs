//! Numerically controlled oscillator for the channel frequency shift.

use std::f64::consts::TAU;

use super::Complex;

/// Phase-accumulator oscillator. The accumulator runs in f64 so the
/// phase stays exact over long streams.
pub struct Nco {
    phase: f64,
    step: f64,
}

impl Nco {
    pub fn new() -> Nco {
        Nco {
            phase: 0.0,
            step: 0.0,
        }
    }

    /// Set the oscillator frequency. A negative frequency rotates the
    /// spectrum down, which is what the sink uses to centre a channel
    /// above the capture centre.
    pub fn set_freq(&mut self, freq_hz: i32, sample_rate: u32) {
        if sample_rate == 0 {
            self.step = 0.0;
        } else {
            self.step = TAU * freq_hz as f64 / sample_rate as f64;
        }
    }

    /// Next unit phasor.
    pub fn next_iq(&mut self) -> Complex {
        let out = Complex::new(self.phase.cos() as f32, self.phase.sin() as f32);
        self.phase += self.step;
        if self.phase > TAU {
            self.phase -= TAU;
        } else if self.phase < -TAU {
            self.phase += TAU;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_frequency_is_identity() {
        let mut nco = Nco::new();
        nco.set_freq(0, 48_000);
        for _ in 0..16 {
            let p = nco.next_iq();
            assert!((p.re - 1.0).abs() < 1e-6);
            assert!(p.im.abs() < 1e-6);
        }
    }

    #[test]
    fn phasor_stays_on_unit_circle() {
        let mut nco = Nco::new();
        nco.set_freq(-12_345, 48_000);
        for _ in 0..10_000 {
            let p = nco.next_iq();
            assert!((p.magsq() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn quarter_rate_cycles_in_four_samples() {
        let mut nco = Nco::new();
        nco.set_freq(12_000, 48_000);
        let first = nco.next_iq();
        nco.next_iq();
        nco.next_iq();
        nco.next_iq();
        let fifth = nco.next_iq();
        assert!((first.re - fifth.re).abs() < 1e-4);
        assert!((first.im - fifth.im).abs() < 1e-4);
    }
}
