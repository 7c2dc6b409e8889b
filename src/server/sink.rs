//! Server DSP pipeline: channel shift, rate conversion, gain, squelch,
//! quantisation and dispatch to clients.
//!
//! `feed` runs on the DSP thread and holds the shared-state lock for one
//! whole block, not per sample. Everything it touches (roster,
//! compressor, counters) lives in [`super::ServerShared`].

use crate::codec::flac::FlacEncoder;
use crate::codec::zlib::ZlibBlockEncoder;
use crate::codec::Compression;
use crate::config::ServerSettings;
use crate::convert::{self, FULL_SCALE};
use crate::dsp::{Complex, DelayLine, FractionalResampler, MovingAverage, Nco};
use crate::metrics::Counters;
use crate::protocol::{self, Command};
use crate::server::session::ClientSession;
use crate::server::{ServerEvent, ServerShared};

/// Power-meter window, in channel samples.
const MAGSQ_WINDOW: usize = 16_384;

/// Active wire compressor. `None` also covers the demoted state after a
/// failed compressor init.
pub enum Compressor {
    None,
    Flac(FlacEncoder),
    Zlib(ZlibBlockEncoder),
}

impl Compressor {
    /// Build the compressor for the current settings. On failure the
    /// session is demoted to raw and the reason returned, so no data is
    /// lost.
    pub fn build(settings: &ServerSettings) -> (Compressor, Option<String>) {
        match settings.compression {
            Compression::None => (Compressor::None, None),
            Compression::Flac => {
                match FlacEncoder::new(
                    settings.channel_sample_rate,
                    settings.sample_bits,
                    settings.block_size,
                ) {
                    Ok(enc) => (Compressor::Flac(enc), None),
                    Err(e) => (
                        Compressor::None,
                        Some(format!("FLAC init failed, sending raw IQ: {}", e)),
                    ),
                }
            }
            Compression::Zlib => {
                match ZlibBlockEncoder::new(settings.block_size, settings.compression_level) {
                    Ok(enc) => (Compressor::Zlib(enc), None),
                    Err(e) => (
                        Compressor::None,
                        Some(format!("zlib init failed, sending raw IQ: {}", e)),
                    ),
                }
            }
        }
    }

    pub fn flac_header(&self) -> Option<&[u8]> {
        match self {
            Compressor::Flac(enc) => Some(enc.header()),
            _ => None,
        }
    }
}

/// Per-sample DSP state. Lives under the shared mutex so the control
/// plane can retune it between blocks.
pub struct DspState {
    pub input_rate: u32,
    nco: Nco,
    resampler: FractionalResampler,
    delay: DelayLine,
    moving_average: MovingAverage,
    linear_gain: f32,
    squelch_level: f64,
    squelch_count: i32,
    pub squelch_open: bool,
    pub magsq: f64,
    pub magsq_sum: f64,
    pub magsq_peak: f64,
    pub magsq_count: u64,
    /// Scratch for the resampler output, reused across blocks.
    resampled: Vec<Complex>,
}

impl DspState {
    pub fn new(settings: &ServerSettings, input_rate: u32) -> DspState {
        let mut state = DspState {
            input_rate,
            nco: Nco::new(),
            resampler: FractionalResampler::new(input_rate, settings.channel_sample_rate),
            delay: DelayLine::new(delay_len(settings)),
            moving_average: MovingAverage::new(MAGSQ_WINDOW),
            linear_gain: settings.linear_gain(),
            squelch_level: settings.squelch_level(),
            squelch_count: 0,
            squelch_open: false,
            magsq: 0.0,
            magsq_sum: 0.0,
            magsq_peak: 0.0,
            magsq_count: 0,
            resampled: Vec::new(),
        };
        state.nco.set_freq(-settings.channel_freq_offset, input_rate);
        state
    }

    pub fn set_input_rate(&mut self, settings: &ServerSettings, input_rate: u32) {
        self.input_rate = input_rate;
        self.nco.set_freq(-settings.channel_freq_offset, input_rate);
        self.resampler
            .set_rates(input_rate, settings.channel_sample_rate);
        self.delay.resize(delay_len(settings));
    }

    pub fn retune(&mut self, settings: &ServerSettings) {
        self.nco
            .set_freq(-settings.channel_freq_offset, self.input_rate);
        self.resampler
            .set_rates(self.input_rate, settings.channel_sample_rate);
    }

    pub fn set_gain(&mut self, settings: &ServerSettings) {
        self.linear_gain = settings.linear_gain();
    }

    pub fn reset_squelch(&mut self, settings: &ServerSettings) {
        self.squelch_level = settings.squelch_level();
        self.moving_average.reset();
        self.squelch_count = 0;
    }

    /// Resize the pre-trigger delay line, keeping what it holds.
    pub fn resize_squelch_gate(&mut self, settings: &ServerSettings) {
        self.delay.resize(delay_len(settings));
    }

    pub fn power_levels(&mut self) -> (f64, f64, u64) {
        let out = (
            if self.magsq_count > 0 {
                self.magsq_sum / self.magsq_count as f64
            } else {
                0.0
            },
            self.magsq_peak,
            self.magsq_count,
        );
        self.magsq_sum = 0.0;
        self.magsq_peak = 0.0;
        self.magsq_count = 0;
        out
    }
}

fn delay_len(settings: &ServerSettings) -> usize {
    (settings.squelch_gate_secs as f64 * settings.channel_sample_rate as f64) as usize + 1
}

/// Feed one block of baseband samples through the pipeline. Caller is
/// the DSP thread; the lock is held for the duration of the block.
pub(crate) fn feed(shared: &mut ServerShared, input: &[Complex]) {
    if shared.clients.is_empty() {
        return;
    }

    let ServerShared {
        settings,
        clients,
        compressor,
        dsp,
        counters,
        meter,
        events,
        ..
    } = shared;

    let mut resampled = std::mem::take(&mut dsp.resampled);
    resampled.clear();
    for &s in input {
        let shifted = s.mul(dsp.nco.next_iq());
        dsp.resampler.process(shifted, &mut resampled);
    }

    let mut block_bytes = 0u64;
    for k in 0..resampled.len() {
        block_bytes += process_one(resampled[k], settings, dsp, compressor, clients, counters, events) as u64;
    }
    dsp.resampled = resampled;

    for client in clients.iter_mut() {
        if client.is_closing() {
            continue;
        }
        if client.flush().is_err() {
            client.close();
        }
    }

    if let Some(report) = meter.tick(block_bytes, counters) {
        let _ = events.try_send(ServerEvent::Bandwidth(report));
    }
}

/// Run one channel-rate sample through gain, the meter, the squelch and
/// out to the wire. Returns the uncompressed byte count it produced.
fn process_one(
    mut ci: Complex,
    settings: &ServerSettings,
    dsp: &mut DspState,
    compressor: &mut Compressor,
    clients: &mut [ClientSession],
    counters: &mut Counters,
    events: &crossbeam_channel::Sender<ServerEvent>,
) -> usize {
    ci = ci.scale(dsp.linear_gain);

    let magsq = (ci.magsq() / (FULL_SCALE * FULL_SCALE)) as f64;
    dsp.moving_average.feed(magsq);
    dsp.magsq = dsp.moving_average.average();
    dsp.magsq_sum += magsq;
    dsp.magsq_peak = dsp.magsq_peak.max(magsq);
    dsp.magsq_count += 1;

    if settings.squelch_enabled {
        let gate_samples =
            (settings.squelch_gate_secs as f64 * settings.channel_sample_rate as f64) as i32;

        dsp.delay.write(ci);

        if magsq < dsp.squelch_level {
            dsp.squelch_open = dsp.squelch_count > 0;
            if dsp.squelch_count > 0 {
                dsp.squelch_count -= 1;
            }
        } else {
            dsp.squelch_count = gate_samples;
            dsp.squelch_open = true;
        }

        ci = if dsp.squelch_open {
            dsp.delay.read_back(gate_samples as usize)
        } else {
            Complex::ZERO
        };
    }

    let pair_bytes = convert::bytes_per_iq_pair(settings.sample_bits);

    match compressor {
        Compressor::Flac(enc) => {
            let [i, q] = convert::quantize_pair_signed(ci.re, ci.im, settings.sample_bits);
            counters.bytes_uncompressed += pair_bytes as u64;
            match enc.push_pair(i, q) {
                Ok(Some(frame)) => {
                    counters.bytes_compressed += (protocol::CMD_LEN + frame.len()) as u64;
                    broadcast_frame(clients, Command::DataIqFlac, &frame, counters);
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("FLAC encode failed, dropping block: {}", e);
                    enc.reset();
                    let _ = events.try_send(ServerEvent::Warning(format!(
                        "compressor error: {}",
                        e
                    )));
                }
            }
        }
        Compressor::Zlib(enc) => {
            let mut wire = [0u8; 8];
            let n = convert::quantize_pair(ci.re, ci.im, settings.sample_bits, &mut wire);
            counters.bytes_uncompressed += n as u64;
            match enc.push(&wire[..n]) {
                Ok(Some(frame)) => {
                    counters.bytes_compressed += (protocol::CMD_LEN + frame.len()) as u64;
                    broadcast_frame(clients, Command::DataIqZlib, &frame, counters);
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("deflate failed, dropping block: {}", e);
                    enc.reset();
                    let _ = events.try_send(ServerEvent::Warning(format!(
                        "compressor error: {}",
                        e
                    )));
                }
            }
        }
        Compressor::None => {
            let mut wire = [0u8; 8];
            let n = convert::quantize_pair(ci.re, ci.im, settings.sample_bits, &mut wire);
            counters.bytes_uncompressed += n as u64;
            for client in clients.iter_mut() {
                if client.is_active() && client.send_frame(&wire[..n]) {
                    counters.bytes_transmitted += n as u64;
                }
            }
        }
    }

    pair_bytes
}

/// Send one framed message to every Active client.
fn broadcast_frame(
    clients: &mut [ClientSession],
    cmd: Command,
    body: &[u8],
    counters: &mut Counters,
) {
    let header = protocol::encode_frame_header(cmd, body.len() as u32);
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(body);
    for client in clients.iter_mut() {
        if client.is_active() && client.send_frame(&frame) {
            counters.bytes_transmitted += frame.len() as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceControl, TestDevice};
    use crate::metrics::BandwidthMeter;
    use crate::server::session::AdmissionState;
    use crate::server::ServerShared;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};

    fn shared_with_one_client(
        settings: ServerSettings,
    ) -> (
        ServerShared,
        TcpStream,
        crossbeam_channel::Receiver<ServerEvent>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        let mut session = ClientSession::from_tcp(server_side, 1 << 20).unwrap();
        session.state = AdmissionState::Active;

        let device = TestDevice::default();
        let last_device_state = device.state();
        let (events, events_rx) = crossbeam_channel::bounded(64);
        let (compressor, _) = Compressor::build(&settings);
        let dsp = DspState::new(&settings, settings.channel_sample_rate);
        let shared = ServerShared {
            settings,
            clients: vec![session],
            compressor,
            dsp,
            device: Box::new(device),
            last_device_state,
            counters: Counters::default(),
            meter: BandwidthMeter::new(),
            events,
            restart_pending: false,
            local_addr: None,
        };
        (shared, peer, events_rx)
    }

    fn read_all_pairs_16(peer: &mut TcpStream, pairs: usize) -> Vec<(i16, i16)> {
        let mut buf = vec![0u8; pairs * 4];
        peer.read_exact(&mut buf).unwrap();
        buf.chunks_exact(4)
            .map(|c| {
                (
                    i16::from_le_bytes([c[0], c[1]]),
                    i16::from_le_bytes([c[2], c[3]]),
                )
            })
            .collect()
    }

    #[test]
    fn squelch_closes_after_the_gate_expires() {
        // -50 dBFS threshold, 10 ms gate at 48 kHz: 480 tail samples
        let settings = ServerSettings {
            squelch_enabled: true,
            squelch_db: -50.0,
            squelch_gate_secs: 0.01,
            channel_sample_rate: 48_000,
            sample_bits: 16,
            ..Default::default()
        };
        let (mut shared, mut peer, _events) = shared_with_one_client(settings);
        peer.set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();

        // magsq = 2 * (0.01)^2 = 2e-4 of full scale: above threshold
        let strong = Complex::new(FULL_SCALE * 0.01, FULL_SCALE * 0.01);
        // magsq ~ 2.8e-8: below the 1e-5 threshold
        let low = Complex::new(1000.0, 1000.0);

        feed(&mut shared, &vec![strong; 1000]);
        feed(&mut shared, &vec![low; 600]);

        let pairs = read_all_pairs_16(&mut peer, 1600);
        // Strong samples delayed by the gate reach the wire
        assert_ne!(pairs[999], (0, 0));
        // Low samples 1..=480 replay the pre-trigger tail
        assert_ne!(pairs[1000], (0, 0));
        assert_ne!(pairs[1479], (0, 0));
        // The 481st below-threshold sample onward is gated to zero
        for &p in &pairs[1480..] {
            assert_eq!(p, (0, 0));
        }
    }

    #[test]
    fn raw_dispatch_quantizes_at_the_wire_depth() {
        let settings = ServerSettings {
            channel_sample_rate: 48_000,
            sample_bits: 16,
            ..Default::default()
        };
        let (mut shared, mut peer, _events) = shared_with_one_client(settings);
        peer.set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();

        let sample = Complex::new(25_600.0, -25_600.0);
        feed(&mut shared, &vec![sample; 10]);

        let pairs = read_all_pairs_16(&mut peer, 10);
        for &(i, q) in &pairs {
            assert_eq!(i, 100); // 25600 / 256
            assert_eq!(q, -100);
        }
    }

    #[test]
    fn flac_mode_emits_framed_output_only() {
        let settings = ServerSettings {
            channel_sample_rate: 48_000,
            sample_bits: 16,
            compression: crate::codec::Compression::Flac,
            block_size: 256,
            ..Default::default()
        };
        let (mut shared, mut peer, _events) = shared_with_one_client(settings);
        peer.set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();

        let sample = Complex::new(1024.0, -1024.0);
        feed(&mut shared, &vec![sample; 256]);

        // One complete FLAC frame: opcode + BE length + body
        let mut header = [0u8; 5];
        peer.read_exact(&mut header).unwrap();
        assert_eq!(header[0], Command::DataIqFlac as u8);
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        assert!(len > 0);
        let mut body = vec![0u8; len];
        peer.read_exact(&mut body).unwrap();
    }

    #[test]
    fn no_clients_means_no_work() {
        let settings = ServerSettings::default();
        let (mut shared, _peer, _events) = shared_with_one_client(settings);
        shared.clients.clear();
        feed(&mut shared, &[Complex::new(1.0, 1.0); 64]);
        assert_eq!(shared.counters.bytes_uncompressed, 0);
    }
}
