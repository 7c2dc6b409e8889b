//! Client connection handler.
//!
//! One thread owns the socket and runs the state machine
//! `Disconnected -> Connecting -> ReadingMeta -> Streaming`, with a
//! fixed 500 ms reconnect after any socket error. A ~50 ms tick drains
//! the socket into the sample FIFO under the prefill discipline;
//! decompression and widening happen on the way through.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::codec::flac::FlacStreamDecoder;
use crate::codec::zlib;
use crate::config::{ClientProtocol, ClientSettings};
use crate::convert::{self, LocalWidth};
use crate::metrics::BufferReport;
use crate::protocol::{self, spy, Command, Device, SdraMetadata, CMD_LEN};

use super::fifo::SampleWriter;
use super::replay::ReplayBuffer;
use super::ClientEvent;

/// Tick period while connected.
const TICK: Duration = Duration::from_millis(50);
/// Fixed reconnect backoff; no exponential growth.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// Re-prime when the socket buffer drops below this fraction of the
/// prefill level.
const REPRIME_FRACTION: f32 = 0.1;

pub(super) enum ControlMsg {
    SendChat { text: String, broadcast: bool },
    Apply(ClientSettings),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    ReadingMeta,
    Streaming,
}

/// Spy-server receive framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpyPhase {
    Header,
    Body,
}

pub(super) struct Handler {
    settings: ClientSettings,
    local_width: LocalWidth,
    events: Sender<ClientEvent>,
    ctrl: Receiver<ControlMsg>,
    writer: SampleWriter,
    replay: Arc<ReplayBuffer<i32>>,

    state: State,
    socket: Option<TcpStream>,
    recv_buf: VecDeque<u8>,
    fill_buffer: bool,
    prev_tick: Option<Instant>,
    reconnect_at: Option<Instant>,

    /// Negotiated: SDRA extended stream (vs bare rtl_tcp).
    sdra: bool,
    /// Negotiated: framed stream (compressed IQ and inline commands).
    framed: bool,
    spy_phase: SpyPhase,
    spy_header: spy::Header,
    flac: Option<FlacStreamDecoder>,
    widen_buf: Vec<i32>,
}

impl Handler {
    pub(super) fn new(
        settings: ClientSettings,
        local_width: LocalWidth,
        events: Sender<ClientEvent>,
        ctrl: Receiver<ControlMsg>,
        writer: SampleWriter,
        replay: Arc<ReplayBuffer<i32>>,
    ) -> Handler {
        Handler {
            settings,
            local_width,
            events,
            ctrl,
            writer,
            replay,
            state: State::Disconnected,
            socket: None,
            recv_buf: VecDeque::new(),
            fill_buffer: true,
            prev_tick: None,
            reconnect_at: Some(Instant::now()),
            sdra: false,
            framed: false,
            spy_phase: SpyPhase::Header,
            spy_header: spy::Header::default(),
            flac: None,
            widen_buf: Vec::new(),
        }
    }

    pub(super) fn run(mut self) {
        loop {
            while let Ok(msg) = self.ctrl.try_recv() {
                match msg {
                    ControlMsg::Stop => {
                        self.disconnect("stopped");
                        return;
                    }
                    ControlMsg::SendChat { text, broadcast } => {
                        let frame =
                            protocol::encode_chat(&self.settings.callsign, &text, broadcast);
                        self.send_bytes(&frame);
                    }
                    ControlMsg::Apply(new) => self.apply_settings(new),
                }
            }

            match self.state {
                State::Disconnected => {
                    if self.reconnect_at.map_or(false, |t| Instant::now() >= t) {
                        self.connect();
                    }
                }
                State::Connecting => {} // connect() completes synchronously
                State::ReadingMeta => {
                    if self.fill_recv_buf() {
                        self.read_metadata();
                    }
                }
                State::Streaming => {
                    if self.fill_recv_buf() {
                        self.process_data();
                    }
                }
            }

            std::thread::sleep(TICK);
        }
    }

    // -----------------------------------------------------------------
    // Connection management
    // -----------------------------------------------------------------

    fn connect(&mut self) {
        self.state = State::Connecting;
        let target = format!(
            "{}:{}",
            self.settings.server_address, self.settings.server_port
        );
        let addrs: Vec<SocketAddr> = match target.to_socket_addrs() {
            Ok(a) => a.collect(),
            Err(e) => {
                log::warn!("cannot resolve {}: {}", target, e);
                self.schedule_reconnect("resolve failed");
                return;
            }
        };
        let mut socket = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(s) => {
                    socket = Some(s);
                    break;
                }
                Err(e) => log::debug!("connect {} failed: {}", addr, e),
            }
        }
        let socket = match socket {
            Some(s) => s,
            None => {
                self.schedule_reconnect("connect failed");
                return;
            }
        };
        let _ = socket.set_nodelay(true);
        if socket.set_nonblocking(true).is_err() {
            self.schedule_reconnect("socket setup failed");
            return;
        }

        log::info!("connected to {}", target);
        self.socket = Some(socket);
        self.recv_buf.clear();
        self.fill_buffer = true;
        self.prev_tick = None;
        self.sdra = false;
        self.framed = false;
        self.spy_phase = SpyPhase::Header;
        self.state = State::ReadingMeta;
        let _ = self.events.try_send(ClientEvent::Connected);

        if self.settings.protocol == ClientProtocol::SpyServer {
            let hello = spy::encode_hello("sdra-stream");
            self.send_bytes(&hello);
        }
    }

    fn schedule_reconnect(&mut self, reason: &str) {
        self.disconnect(reason);
        self.reconnect_at = Some(Instant::now() + RECONNECT_DELAY);
    }

    /// Tear the connection down and stop the downstream pipeline so it
    /// cannot emit stale samples.
    fn disconnect(&mut self, reason: &str) {
        if let Some(mut flac) = self.flac.take() {
            flac.stop();
        }
        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown(std::net::Shutdown::Both);
        }
        if self.state != State::Disconnected {
            log::info!("disconnected: {}", reason);
            let _ = self.events.try_send(ClientEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
        self.state = State::Disconnected;
        self.recv_buf.clear();
        self.fill_buffer = true;
        self.prev_tick = None;
        self.reconnect_at = None;
    }

    /// Drain the socket into the local receive buffer. Returns false
    /// when the connection died (a reconnect is then scheduled).
    fn fill_recv_buf(&mut self) -> bool {
        let mut failure: Option<String> = None;
        let mut chunk = [0u8; 65536];
        match self.socket.as_mut() {
            Some(socket) => loop {
                match socket.read(&mut chunk) {
                    Ok(0) => {
                        failure = Some("server closed the connection".to_string());
                        break;
                    }
                    Ok(n) => self.recv_buf.extend(&chunk[..n]),
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        failure = Some(format!("read error: {}", e));
                        break;
                    }
                }
            },
            None => return false,
        }
        if let Some(reason) = failure {
            self.schedule_reconnect(&reason);
            return false;
        }
        true
    }

    fn send_bytes(&mut self, bytes: &[u8]) {
        let mut failure: Option<String> = None;
        if let Some(socket) = self.socket.as_mut() {
            let mut off = 0;
            let deadline = Instant::now() + Duration::from_millis(100);
            while off < bytes.len() {
                match socket.write(&bytes[off..]) {
                    Ok(n) => off += n,
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        if Instant::now() >= deadline {
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        failure = Some(format!("write error: {}", e));
                        break;
                    }
                }
            }
        }
        if let Some(reason) = failure {
            self.schedule_reconnect(&reason);
        }
    }

    fn send_cmd(&mut self, cmd: Command, value: u32) {
        let buf = protocol::encode_cmd(cmd, value);
        self.send_bytes(&buf);
    }

    fn send_cmd_f32(&mut self, cmd: Command, value: f32) {
        let buf = protocol::encode_cmd_f32(cmd, value);
        self.send_bytes(&buf);
    }

    // -----------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------

    fn read_metadata(&mut self) {
        if self.settings.protocol == ClientProtocol::SpyServer {
            self.read_spy_metadata();
            return;
        }
        if self.recv_buf.len() < 4 {
            return;
        }
        let magic: Vec<u8> = self.recv_buf.iter().take(4).copied().collect();
        if magic == protocol::RTL0_MAGIC {
            if self.recv_buf.len() < protocol::RTL0_META_SIZE {
                return;
            }
            let block = self.take_bytes(protocol::RTL0_META_SIZE);
            match protocol::Rtl0Metadata::decode(&block) {
                Ok(meta) => {
                    self.sdra = false;
                    self.framed = false;
                    // rtl_tcp streams are always raw unsigned 8-bit
                    self.settings.sample_bits = 8;
                    let _ = self.events.try_send(ClientEvent::RemoteDevice {
                        device: meta.device,
                        protocol: "RTL0".to_string(),
                    });
                    self.enter_streaming();
                }
                Err(e) => self.schedule_reconnect(&format!("bad RTL0 metadata: {}", e)),
            }
        } else if magic == protocol::SDRA_MAGIC {
            if self.recv_buf.len() < protocol::SDRA_META_SIZE {
                return;
            }
            let block = self.take_bytes(protocol::SDRA_META_SIZE);
            match SdraMetadata::decode(&block) {
                Ok(meta) => {
                    self.sdra = true;
                    self.framed = meta.flags.framed_data;
                    let _ = self.events.try_send(ClientEvent::RemoteDevice {
                        device: meta.device,
                        protocol: "SDRA".to_string(),
                    });
                    if self.settings.override_remote_settings {
                        self.push_all_settings();
                    } else {
                        self.adopt_remote_settings(&meta);
                    }
                    let _ = self.events.try_send(ClientEvent::MetaReceived(meta));
                    self.enter_streaming();
                }
                Err(e) => self.schedule_reconnect(&format!("bad SDRA metadata: {}", e)),
            }
        } else {
            self.schedule_reconnect(&format!(
                "unknown protocol magic {:02x?}",
                &magic[..]
            ));
        }
    }

    fn enter_streaming(&mut self) {
        self.state = State::Streaming;
        self.fill_buffer = true;
        self.prev_tick = None;
    }

    /// Copy every negotiated field from the metadata into the local
    /// settings store.
    fn adopt_remote_settings(&mut self, meta: &SdraMetadata) {
        let s = &mut self.settings;
        s.center_frequency = meta.center_frequency;
        s.ppm_correction = meta.ppm_correction;
        s.bias_tee = meta.flags.bias_tee;
        s.direct_sampling = meta.flags.direct_sampling;
        s.agc = meta.flags.agc;
        s.dc_block = meta.flags.dc_offset_removal;
        s.iq_correction = meta.flags.iq_correction;
        s.squelch_enabled = meta.flags.squelch_enabled;
        s.device_sample_rate = meta.device_sample_rate;
        s.log2_decim = meta.log2_decim;
        s.gain = meta.gain;
        s.rf_bandwidth = meta.rf_bandwidth;
        s.channel_freq_offset = meta.channel_freq_offset;
        s.channel_gain = meta.channel_gain;
        s.channel_sample_rate = meta.channel_sample_rate;
        s.sample_bits = meta.sample_bits;
        s.squelch_db = meta.squelch_db;
        s.squelch_gate_secs = meta.squelch_gate_secs;
        let _ = self
            .events
            .try_send(ClientEvent::SettingsChanged(self.settings.clone()));
    }

    /// Push the full local settings to the server (the user opted to
    /// override whatever the remote was doing).
    fn push_all_settings(&mut self) {
        let s = self.settings.clone();
        self.send_cmd(Command::SetCenterFrequency, s.center_frequency as u32);
        self.send_cmd(Command::SetFrequencyCorrection, s.ppm_correction as u32);
        self.send_cmd(Command::SetDcOffsetRemoval, s.dc_block as u32);
        self.send_cmd(Command::SetIqCorrection, s.iq_correction as u32);
        self.send_cmd(Command::SetBiasTee, s.bias_tee as u32);
        self.send_cmd(Command::SetDirectSampling, s.direct_sampling as u32);
        self.send_cmd(Command::SetDecimation, s.log2_decim);
        self.send_cmd(Command::SetSampleRate, s.device_sample_rate);
        self.send_cmd(Command::SetAgcMode, s.agc as u32);
        self.send_cmd(Command::SetTunerGainMode, 1);
        self.send_cmd(Command::SetTunerGain, s.gain[0] as u32);
        for stage in 1..3u32 {
            let packed = (stage << 16) | (s.gain[stage as usize] as u16 as u32);
            self.send_cmd(Command::SetTunerIfGain, packed);
        }
        self.send_cmd(Command::SetTunerBandwidth, s.rf_bandwidth);
        self.send_cmd(Command::SetChannelFreqOffset, s.channel_freq_offset as u32);
        self.send_cmd(Command::SetChannelGain, s.channel_gain as u32);
        self.send_cmd(Command::SetChannelSampleRate, s.channel_sample_rate);
        self.send_cmd(Command::SetSampleBitDepth, s.sample_bits);
        self.send_cmd(Command::SetIqSquelchEnabled, s.squelch_enabled as u32);
        self.send_cmd_f32(Command::SetIqSquelch, s.squelch_db);
        self.send_cmd_f32(Command::SetIqSquelchGate, s.squelch_gate_secs);
    }

    /// Diff a new settings value against the current one and send the
    /// matching commands.
    fn apply_settings(&mut self, new: ClientSettings) {
        let old = self.settings.clone();
        if self.socket.is_some() && self.state == State::Streaming {
            if self.settings.protocol == ClientProtocol::SpyServer {
                if new.center_frequency != old.center_frequency {
                    let b = spy::encode_set(
                        spy::SET_CENTER_FREQUENCY,
                        new.center_frequency as u32,
                    );
                    self.send_bytes(&b);
                }
                if new.sample_bits != old.sample_bits {
                    let b = spy::encode_set(
                        spy::SET_IQ_FORMAT,
                        spy::iq_format_for_bits(new.sample_bits),
                    );
                    self.send_bytes(&b);
                    self.recv_buf.clear();
                    self.fill_buffer = true;
                }
                if new.log2_decim != old.log2_decim {
                    let b = spy::encode_set(spy::SET_IQ_DECIMATION, new.log2_decim);
                    self.send_bytes(&b);
                }
                if new.gain[0] != old.gain[0] {
                    let b = spy::encode_set(spy::SET_GAIN, (new.gain[0] / 10) as u32);
                    self.send_bytes(&b);
                }
            } else {
                if new.center_frequency != old.center_frequency {
                    self.send_cmd(Command::SetCenterFrequency, new.center_frequency as u32);
                }
                if new.ppm_correction != old.ppm_correction {
                    self.send_cmd(Command::SetFrequencyCorrection, new.ppm_correction as u32);
                }
                if new.bias_tee != old.bias_tee {
                    self.send_cmd(Command::SetBiasTee, new.bias_tee as u32);
                }
                if new.direct_sampling != old.direct_sampling {
                    self.send_cmd(Command::SetDirectSampling, new.direct_sampling as u32);
                }
                if new.agc != old.agc {
                    self.send_cmd(Command::SetAgcMode, new.agc as u32);
                }
                if new.gain[0] != old.gain[0] {
                    self.send_cmd(Command::SetTunerGain, new.gain[0] as u32);
                }
                if new.device_sample_rate != old.device_sample_rate {
                    self.send_cmd(Command::SetSampleRate, new.device_sample_rate);
                }
                if self.sdra {
                    if new.dc_block != old.dc_block {
                        self.send_cmd(Command::SetDcOffsetRemoval, new.dc_block as u32);
                    }
                    if new.iq_correction != old.iq_correction {
                        self.send_cmd(Command::SetIqCorrection, new.iq_correction as u32);
                    }
                    if new.log2_decim != old.log2_decim {
                        self.send_cmd(Command::SetDecimation, new.log2_decim);
                    }
                    if new.channel_freq_offset != old.channel_freq_offset {
                        self.send_cmd(
                            Command::SetChannelFreqOffset,
                            new.channel_freq_offset as u32,
                        );
                    }
                    if new.channel_gain != old.channel_gain {
                        self.send_cmd(Command::SetChannelGain, new.channel_gain as u32);
                    }
                    if new.channel_sample_rate != old.channel_sample_rate {
                        self.send_cmd(Command::SetChannelSampleRate, new.channel_sample_rate);
                        self.recv_buf.clear();
                        self.fill_buffer = true;
                    }
                    if new.sample_bits != old.sample_bits {
                        self.send_cmd(Command::SetSampleBitDepth, new.sample_bits);
                        self.recv_buf.clear();
                        self.fill_buffer = true;
                    }
                    if new.squelch_enabled != old.squelch_enabled {
                        self.send_cmd(Command::SetIqSquelchEnabled, new.squelch_enabled as u32);
                    }
                    if new.squelch_db != old.squelch_db {
                        self.send_cmd_f32(Command::SetIqSquelch, new.squelch_db);
                    }
                    if new.squelch_gate_secs != old.squelch_gate_secs {
                        self.send_cmd_f32(Command::SetIqSquelchGate, new.squelch_gate_secs);
                    }
                }
            }
        }

        let reconnect = new.server_address != old.server_address
            || new.server_port != old.server_port
            || new.protocol != old.protocol;
        self.settings = new;
        if reconnect {
            self.schedule_reconnect("server endpoint changed");
        }
    }

    // -----------------------------------------------------------------
    // Spy-server handshake
    // -----------------------------------------------------------------

    fn read_spy_metadata(&mut self) {
        loop {
            match self.spy_phase {
                SpyPhase::Header => {
                    if self.recv_buf.len() < spy::HEADER_SIZE {
                        return;
                    }
                    let block = self.take_bytes(spy::HEADER_SIZE);
                    match spy::Header::decode(&block) {
                        Ok(h) => {
                            self.spy_header = h;
                            self.spy_phase = SpyPhase::Body;
                        }
                        Err(e) => {
                            self.schedule_reconnect(&format!("bad spy header: {}", e));
                            return;
                        }
                    }
                }
                SpyPhase::Body => {
                    let size = self.spy_header.size as usize;
                    if self.recv_buf.len() < size {
                        return;
                    }
                    let block = self.take_bytes(size);
                    match self.spy_header.message {
                        spy::MSG_DEVICE => {
                            if let Ok(dev) = spy::DeviceInfo::decode(&block) {
                                self.on_spy_device(&dev);
                            }
                            self.spy_phase = SpyPhase::Header;
                        }
                        spy::MSG_STATE => {
                            if let Ok(state) = spy::State::decode(&block) {
                                self.on_spy_state(&state, true);
                            }
                            // Metadata done: configure the stream format
                            let fmt = spy::iq_format_for_bits(self.settings.sample_bits);
                            let b = spy::encode_set(spy::SET_IQ_FORMAT, fmt);
                            self.send_bytes(&b);
                            let b = spy::encode_set(spy::SET_STREAMING_MODE, 1);
                            self.send_bytes(&b);
                            let b = spy::encode_set(spy::SET_STREAMING_ENABLED, 1);
                            self.send_bytes(&b);
                            self.spy_phase = SpyPhase::Header;
                            self.enter_streaming();
                            return;
                        }
                        other => {
                            log::debug!("unexpected spy message {} during metadata", other);
                            self.spy_phase = SpyPhase::Header;
                        }
                    }
                }
            }
        }
    }

    fn on_spy_device(&mut self, dev: &spy::DeviceInfo) {
        let device = match dev.device {
            1 => Device::Airspy,
            2 => Device::AirspyHf,
            3 => {
                if dev.max_gain_index == 14 {
                    Device::RtlsdrE4000
                } else {
                    Device::RtlsdrR820t
                }
            }
            _ => Device::Unknown,
        };
        let _ = self.events.try_send(ClientEvent::RemoteDevice {
            device,
            protocol: "Spy Server".to_string(),
        });
        // The device rate cannot be changed over this protocol
        self.settings.device_sample_rate = dev.sample_rate;
        if !self.settings.override_remote_settings
            || self.settings.log2_decim < dev.min_decimation
        {
            self.settings.log2_decim = dev.min_decimation;
        }
        let _ = self
            .events
            .try_send(ClientEvent::SettingsChanged(self.settings.clone()));
    }

    fn on_spy_state(&mut self, state: &spy::State, initial: bool) {
        if initial && state.controllable != 0 && self.settings.override_remote_settings {
            let b = spy::encode_set(
                spy::SET_CENTER_FREQUENCY,
                self.settings.center_frequency as u32,
            );
            self.send_bytes(&b);
            let b = spy::encode_set(spy::SET_GAIN, (self.settings.gain[0] / 10) as u32);
            self.send_bytes(&b);
            return;
        }
        let mut changed = false;
        if self.settings.center_frequency != state.iq_center_frequency as u64 {
            self.settings.center_frequency = state.iq_center_frequency as u64;
            changed = true;
        }
        if self.settings.gain[0] != state.gain as i16 {
            self.settings.gain[0] = state.gain as i16;
            changed = true;
        }
        if changed {
            let _ = self
                .events
                .try_send(ClientEvent::SettingsChanged(self.settings.clone()));
        }
    }

    // -----------------------------------------------------------------
    // Streaming
    // -----------------------------------------------------------------

    fn process_data(&mut self) {
        let bytes_per_pair = self.settings.bytes_per_iq_pair();
        let bytes_per_second = self.settings.bytes_per_second().max(1);
        let prefill_bytes =
            (self.settings.prefill_seconds * bytes_per_second as f32) as usize;
        let available = self.recv_buf.len();

        if available < (REPRIME_FRACTION * prefill_bytes as f32) as usize {
            if !self.fill_buffer {
                log::debug!("buffering: {} bytes available", available);
            }
            self.fill_buffer = true;
        }

        self.report_buffers(bytes_per_second, prefill_bytes);

        let mut factor = 0.0f32;
        if self.fill_buffer {
            if available >= prefill_bytes {
                log::debug!("buffer primed: {} bytes available", available);
                self.fill_buffer = false;
                self.prev_tick = Some(Instant::now());
                // Ease in; a full-rate burst would be dropped downstream
                factor = 0.25;
            }
        } else {
            let now = Instant::now();
            factor = self
                .prev_tick
                .map_or(0.0, |t| now.duration_since(t).as_secs_f32());
            self.prev_tick = Some(now);
        }
        if self.fill_buffer {
            return;
        }

        // Per-tick budget: elapsed real time at the channel rate,
        // clamped to one second and to the FIFO's free space
        let budget_pairs = ((factor.min(1.0) * self.settings.channel_sample_rate as f32)
            as usize)
            .min(self.writer.vacant() / 2);

        if self.settings.protocol == ClientProtocol::SpyServer {
            self.process_spy_data(budget_pairs * bytes_per_pair);
        } else if self.framed {
            self.process_framed();
        } else {
            self.process_raw(budget_pairs);
        }
    }

    /// Raw mode: the stream is nothing but interleaved IQ at the known
    /// width.
    fn process_raw(&mut self, budget_pairs: usize) {
        let bytes_per_pair = self.settings.bytes_per_iq_pair();
        let have_pairs = self.recv_buf.len() / bytes_per_pair;
        let pairs = have_pairs.min(budget_pairs);
        if pairs == 0 {
            return;
        }
        let bytes = self.take_bytes(pairs * bytes_per_pair);
        self.deliver_wire_samples(&bytes);
    }

    /// Framed mode: demultiplex data frames and server-pushed commands
    /// by the leading opcode byte.
    fn process_framed(&mut self) {
        loop {
            if self.recv_buf.len() < CMD_LEN {
                return;
            }
            let op = *self.recv_buf.front().expect("checked non-empty");
            let cmd = match Command::from_u8(op) {
                Ok(c) => c,
                Err(e) => {
                    self.schedule_reconnect(&format!("stream desync: {}", e));
                    return;
                }
            };

            if cmd.is_framed() {
                let header: Vec<u8> = self.recv_buf.iter().take(CMD_LEN).copied().collect();
                let len = match protocol::get_u32_be(&header, 1) {
                    Ok(l) => l as usize,
                    Err(_) => return,
                };
                if self.recv_buf.len() < CMD_LEN + len {
                    return; // body still in flight
                }
                self.take_bytes(CMD_LEN);
                let body = self.take_bytes(len);
                self.handle_frame(cmd, &body);
            } else {
                let bytes = self.take_bytes(CMD_LEN);
                match protocol::decode_cmd(&bytes) {
                    Ok((cmd, value)) => self.handle_pushed_command(cmd, value),
                    Err(e) => {
                        self.schedule_reconnect(&format!("stream desync: {}", e));
                        return;
                    }
                }
            }
            if self.state != State::Streaming {
                return;
            }
        }
    }

    fn handle_frame(&mut self, cmd: Command, body: &[u8]) {
        match cmd {
            Command::DataIqFlac => {
                if self.flac.is_none() {
                    self.flac = Some(self.start_flac_decoder());
                }
                if let Some(flac) = &self.flac {
                    flac.push(body);
                }
            }
            Command::DataIqZlib => match zlib::inflate_block(body) {
                Ok(raw) => self.deliver_wire_samples(&raw),
                Err(e) => log::warn!("dropping undecodable zlib frame: {}", e),
            },
            Command::DataPosition => {
                if let Ok((latitude, longitude, altitude)) = protocol::decode_position(body) {
                    let _ = self.events.try_send(ClientEvent::Position {
                        latitude,
                        longitude,
                        altitude,
                    });
                }
            }
            Command::DataDirection => {
                if let Ok((isotropic, azimuth, elevation)) = protocol::decode_direction(body) {
                    let _ = self.events.try_send(ClientEvent::Direction {
                        isotropic,
                        azimuth,
                        elevation,
                    });
                }
            }
            Command::SendMessage => {
                if let Ok((broadcast, callsign, text)) = protocol::decode_chat(body) {
                    let _ = self.events.try_send(ClientEvent::Chat {
                        callsign,
                        text,
                        broadcast,
                    });
                }
            }
            _ => {}
        }
    }

    fn handle_pushed_command(&mut self, cmd: Command, value: u32) {
        match cmd {
            Command::SendBlacklistedMessage => {
                let _ = self.events.try_send(ClientEvent::Blacklisted);
                return;
            }
            Command::SetCenterFrequency => self.settings.center_frequency = value as u64,
            Command::SetSampleRate => self.settings.device_sample_rate = value,
            Command::SetFrequencyCorrection => self.settings.ppm_correction = value as i32,
            Command::SetTunerGain => self.settings.gain[0] = value as i16,
            Command::SetTunerIfGain => {
                let stage = ((value >> 16) & 0xffff) as usize;
                if stage < 4 {
                    self.settings.gain[stage] = (value & 0xffff) as u16 as i16;
                }
            }
            Command::SetAgcMode => self.settings.agc = value != 0,
            Command::SetDirectSampling => self.settings.direct_sampling = value != 0,
            Command::SetBiasTee => self.settings.bias_tee = value != 0,
            Command::SetTunerBandwidth => self.settings.rf_bandwidth = value,
            Command::SetDcOffsetRemoval => self.settings.dc_block = value != 0,
            Command::SetIqCorrection => self.settings.iq_correction = value != 0,
            Command::SetDecimation => self.settings.log2_decim = value,
            Command::SetChannelSampleRate => {
                self.settings.channel_sample_rate = value;
                self.fill_buffer = true; // rate changed, re-prime
            }
            Command::SetChannelFreqOffset => self.settings.channel_freq_offset = value as i32,
            Command::SetChannelGain => self.settings.channel_gain = value as i32,
            Command::SetSampleBitDepth => {
                self.settings.sample_bits = value;
                self.fill_buffer = true;
            }
            Command::SetIqSquelchEnabled => self.settings.squelch_enabled = value != 0,
            Command::SetIqSquelch => self.settings.squelch_db = f32::from_bits(value),
            Command::SetIqSquelchGate => {
                self.settings.squelch_gate_secs = f32::from_bits(value)
            }
            _ => {
                log::debug!("ignoring pushed command {:?}", cmd);
                return;
            }
        }
        let _ = self
            .events
            .try_send(ClientEvent::SettingsChanged(self.settings.clone()));
    }

    /// Spy-server streaming: header/body framing with IQ and state
    /// messages interleaved.
    fn process_spy_data(&mut self, mut budget_bytes: usize) {
        loop {
            match self.spy_phase {
                SpyPhase::Header => {
                    if self.recv_buf.len() < spy::HEADER_SIZE {
                        return;
                    }
                    let block = self.take_bytes(spy::HEADER_SIZE);
                    match spy::Header::decode(&block) {
                        Ok(h) => {
                            self.spy_header = h;
                            self.spy_phase = SpyPhase::Body;
                        }
                        Err(e) => {
                            self.schedule_reconnect(&format!("bad spy header: {}", e));
                            return;
                        }
                    }
                }
                SpyPhase::Body => {
                    let remaining = self.spy_header.size as usize;
                    if self.spy_header.is_iq() {
                        let pair = self.settings.bytes_per_iq_pair();
                        let want = remaining.min(budget_bytes.max(pair));
                        // Consume whole IQ pairs only; a split pair would
                        // shift every later sample
                        let take = (want.min(self.recv_buf.len()) / pair) * pair;
                        if take == 0 {
                            return;
                        }
                        let bytes = self.take_bytes(take);
                        self.deliver_spy_samples(&bytes);
                        budget_bytes = budget_bytes.saturating_sub(take);
                        self.spy_header.size -= take as u32;
                        if self.spy_header.size == 0 {
                            self.spy_phase = SpyPhase::Header;
                        }
                        if budget_bytes == 0 {
                            return;
                        }
                    } else {
                        if self.recv_buf.len() < remaining {
                            return;
                        }
                        let block = self.take_bytes(remaining);
                        if self.spy_header.message == spy::MSG_STATE {
                            if let Ok(state) = spy::State::decode(&block) {
                                self.on_spy_state(&state, false);
                            }
                        }
                        self.spy_phase = SpyPhase::Header;
                    }
                }
            }
        }
    }

    /// Widen wire bytes to the local fixed point and hand them to the
    /// replay history and the FIFO.
    fn deliver_wire_samples(&mut self, bytes: &[u8]) {
        self.widen_buf.clear();
        convert::widen(
            bytes,
            self.settings.sample_bits,
            self.local_width,
            &mut self.widen_buf,
        );
        self.replay.write(&self.widen_buf);
        self.writer.push(&self.widen_buf);
    }

    fn deliver_spy_samples(&mut self, bytes: &[u8]) {
        self.widen_buf.clear();
        if self.settings.sample_bits == 32 {
            // Spy-server 32-bit mode carries normalized floats
            convert::widen_floats(bytes, self.local_width, &mut self.widen_buf);
        } else {
            convert::widen(
                bytes,
                self.settings.sample_bits,
                self.local_width,
                &mut self.widen_buf,
            );
        }
        self.replay.write(&self.widen_buf);
        self.writer.push(&self.widen_buf);
    }

    fn start_flac_decoder(&self) -> FlacStreamDecoder {
        let writer = self.writer.clone();
        let replay = self.replay.clone();
        let width = self.local_width;
        let mut widened: Vec<i32> = Vec::new();
        FlacStreamDecoder::start(move |samples| {
            widened.clear();
            convert::widen_flac_s32(samples, width, &mut widened);
            replay.write(&widened);
            writer.push(&widened);
        })
    }

    fn report_buffers(&mut self, bytes_per_second: usize, prefill_bytes: usize) {
        let available = self.recv_buf.len() as u64;
        let capacity = available.max(prefill_bytes as u64);
        let fifo_fill = self.writer.fill() as u64;
        let fifo_capacity = self.writer.capacity() as u64;
        let fifo_pairs_per_sec = self.settings.channel_sample_rate.max(1) as u64;
        let report = BufferReport {
            socket_bytes: available,
            socket_capacity: capacity,
            socket_seconds: available as f32 / bytes_per_second as f32,
            fifo_fill,
            fifo_capacity,
            fifo_seconds: (fifo_fill / 2) as f32 / fifo_pairs_per_sec as f32,
        };
        let _ = self.events.try_send(ClientEvent::Buffer(report));
    }

    /// Pop exactly `n` bytes off the front of the receive buffer.
    fn take_bytes(&mut self, n: usize) -> Vec<u8> {
        self.recv_buf.drain(..n).collect()
    }
}
