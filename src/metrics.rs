//! Bandwidth and buffer-fill reporting.

use std::time::Instant;

/// Server-side per-second traffic report.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BandwidthReport {
    /// Pre-compression bandwidth in bits per second.
    pub uncompressed_bps: f64,
    /// On-the-wire bandwidth in bits per second.
    pub network_bps: f64,
    pub bytes_uncompressed: u64,
    pub bytes_compressed: u64,
    pub bytes_transmitted: u64,
}

/// Client-side buffer health, reported every tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BufferReport {
    pub socket_bytes: u64,
    pub socket_capacity: u64,
    pub socket_seconds: f32,
    pub fifo_fill: u64,
    pub fifo_capacity: u64,
    pub fifo_seconds: f32,
}

/// Byte counters shared between the DSP and network threads. Reset on
/// every report.
#[derive(Debug, Default)]
pub struct Counters {
    pub bytes_uncompressed: u64,
    pub bytes_compressed: u64,
    pub bytes_transmitted: u64,
}

/// Emits one report for every observed second. Timer ticks are not
/// guaranteed to be on time, so the wall clock decides.
pub struct BandwidthMeter {
    window_start: Option<Instant>,
    window_bytes: u64,
}

impl BandwidthMeter {
    pub fn new() -> BandwidthMeter {
        BandwidthMeter {
            window_start: None,
            window_bytes: 0,
        }
    }

    /// Account `block_bytes` of freshly produced (uncompressed) data.
    /// Returns a report once at least a second has elapsed, consuming
    /// and resetting the counters.
    pub fn tick(&mut self, block_bytes: u64, counters: &mut Counters) -> Option<BandwidthReport> {
        let now = Instant::now();
        let start = match self.window_start {
            Some(t) => t,
            None => {
                self.window_start = Some(now);
                self.window_bytes = block_bytes;
                return None;
            }
        };

        let elapsed = now.duration_since(start);
        if elapsed.as_millis() < 1000 {
            self.window_bytes += block_bytes;
            return None;
        }

        let secs = elapsed.as_secs_f64();
        let report = BandwidthReport {
            uncompressed_bps: 8.0 * self.window_bytes as f64 / secs,
            network_bps: 8.0 * counters.bytes_transmitted as f64 / secs,
            bytes_uncompressed: counters.bytes_uncompressed,
            bytes_compressed: counters.bytes_compressed,
            bytes_transmitted: counters.bytes_transmitted,
        };
        self.window_start = Some(now);
        self.window_bytes = block_bytes;
        counters.bytes_uncompressed = 0;
        counters.bytes_compressed = 0;
        counters.bytes_transmitted = 0;
        Some(report)
    }
}

impl Default for BandwidthMeter {
    fn default() -> Self {
        BandwidthMeter::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_report_before_a_second() {
        let mut meter = BandwidthMeter::new();
        let mut counters = Counters::default();
        assert!(meter.tick(100, &mut counters).is_none());
        assert!(meter.tick(100, &mut counters).is_none());
    }

    #[test]
    fn report_resets_counters() {
        let mut meter = BandwidthMeter::new();
        let mut counters = Counters {
            bytes_uncompressed: 1000,
            bytes_compressed: 400,
            bytes_transmitted: 405,
        };
        meter.tick(0, &mut counters);
        // Force the window back past a second
        meter.window_start = Some(Instant::now() - std::time::Duration::from_millis(1100));
        let report = meter.tick(0, &mut counters).unwrap();
        assert_eq!(report.bytes_compressed, 400);
        assert_eq!(report.bytes_transmitted, 405);
        assert!(report.network_bps > 0.0);
        assert_eq!(counters.bytes_transmitted, 0);
    }
}
