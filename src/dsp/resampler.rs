//! Fractional sample-rate converter between the input rate and the
//! channel rate.
//!
//! Contract: for input rate Ri and output rate Ro it emits exactly one
//! output for every Ri/Ro inputs when decimating, and Ro/Ri outputs per
//! input when interpolating, with deterministic fractional-phase
//! accumulation. Interpolation is linear between the last two input
//! samples.

use super::Complex;

pub struct FractionalResampler {
    /// Input samples consumed per output sample (Ri / Ro).
    distance: f64,
    /// Fractional position within the input stream, relative to `prev`.
    position: f64,
    prev: Complex,
    curr: Complex,
    primed: bool,
}

impl FractionalResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> FractionalResampler {
        let mut r = FractionalResampler {
            distance: 1.0,
            position: 0.0,
            prev: Complex::ZERO,
            curr: Complex::ZERO,
            primed: false,
        };
        r.set_rates(input_rate, output_rate);
        r
    }

    /// Reconfigure the ratio. Phase restarts from zero so the first
    /// output after a rate change is aligned to the next input sample.
    pub fn set_rates(&mut self, input_rate: u32, output_rate: u32) {
        self.distance = if output_rate == 0 {
            1.0
        } else {
            input_rate as f64 / output_rate as f64
        };
        self.position = 0.0;
        self.primed = false;
    }

    /// Pass-through ratio check, used to skip the interpolation cost.
    pub fn is_unity(&self) -> bool {
        self.distance == 1.0
    }

    /// Feed one input sample; push the produced output samples.
    pub fn process(&mut self, input: Complex, out: &mut Vec<Complex>) {
        if self.distance == 1.0 {
            out.push(input);
            return;
        }

        self.prev = self.curr;
        self.curr = input;
        if !self.primed {
            self.prev = input;
            self.primed = true;
        }

        // Emit every output whose position falls before the new sample.
        while self.position < 1.0 {
            let frac = self.position as f32;
            out.push(Complex::new(
                self.prev.re + frac * (self.curr.re - self.prev.re),
                self.prev.im + frac * (self.curr.im - self.prev.im),
            ));
            self.position += self.distance;
        }
        self.position -= 1.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(r: &mut FractionalResampler, n: usize) -> Vec<Complex> {
        let mut out = Vec::new();
        for k in 0..n {
            r.process(Complex::new(k as f32, 0.0), &mut out);
        }
        out
    }

    #[test]
    fn unity_ratio_is_pass_through() {
        let mut r = FractionalResampler::new(48_000, 48_000);
        let out = run(&mut r, 100);
        assert_eq!(out.len(), 100);
        assert_eq!(out[42].re, 42.0);
    }

    #[test]
    fn two_to_one_decimation_halves_the_count() {
        let mut r = FractionalResampler::new(96_000, 48_000);
        let out = run(&mut r, 1000);
        assert_eq!(out.len(), 500);
    }

    #[test]
    fn one_to_two_interpolation_doubles_the_count() {
        let mut r = FractionalResampler::new(24_000, 48_000);
        let out = run(&mut r, 1000);
        assert_eq!(out.len(), 2000);
    }

    #[test]
    fn fractional_ratio_converges_to_exact_rate() {
        // 48000 -> 44100 over one second of input
        let mut r = FractionalResampler::new(48_000, 44_100);
        let out = run(&mut r, 48_000);
        let expected = 44_100i64;
        assert!((out.len() as i64 - expected).abs() <= 1, "got {}", out.len());
    }

    #[test]
    fn interpolated_values_lie_between_neighbours() {
        let mut r = FractionalResampler::new(32_000, 48_000);
        let out = run(&mut r, 64);
        for w in out.windows(2) {
            assert!(w[1].re + 1e-3 >= w[0].re);
        }
    }
}
