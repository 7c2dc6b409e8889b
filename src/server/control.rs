//! Server control plane: inbound command dispatch, chat routing,
//! live settings changes and the device change detector.

use std::net::SocketAddr;

use crate::codec::Compression;
use crate::config::{ServerProtocol, ServerSettings};
use crate::error::{Error, Result};
use crate::protocol::{self, Command, CMD_LEN};
use crate::server::sink::Compressor;
use crate::server::{ServerEvent, ServerShared};

/// Upper bound on a chat tail; anything larger is a framing error.
const MAX_CHAT_LEN: usize = 4096;

/// Parse and dispatch every complete command in a client's input
/// buffer. `Truncated`/`UnknownOpcode` errors propagate and the caller
/// disconnects the offender - the protocol cannot resynchronise.
pub(crate) fn process_inbound(shared: &mut ServerShared, idx: usize) -> Result<()> {
    let mut buf = std::mem::take(&mut shared.clients[idx].inbuf);
    let peer = shared.clients[idx].peer_addr();
    let mut consumed = 0;

    let result = (|| -> Result<()> {
        while buf.len() - consumed >= CMD_LEN {
            if buf[consumed] == Command::SendMessage as u8 {
                let len = protocol::get_u32_be(&buf, consumed + 1)? as usize;
                if len > MAX_CHAT_LEN {
                    return Err(Error::DecodeMismatch(format!(
                        "oversized chat tail ({} bytes)",
                        len
                    )));
                }
                if buf.len() - consumed < CMD_LEN + len {
                    break; // tail still in flight
                }
                let tail = &buf[consumed + CMD_LEN..consumed + CMD_LEN + len];
                let (broadcast, callsign, text) = protocol::decode_chat(tail)?;
                consumed += CMD_LEN + len;
                route_chat(shared, peer, &callsign, &text, broadcast);
                continue;
            }

            let (cmd, value) = protocol::decode_cmd(&buf[consumed..consumed + CMD_LEN])?;
            consumed += CMD_LEN;

            if !shared.settings.remote_control {
                log::debug!("ignoring {:?} from {}: remote control disabled", cmd, peer);
                continue;
            }
            dispatch(shared, cmd, value);
        }
        Ok(())
    })();

    buf.drain(..consumed);
    shared.clients[idx].inbuf = buf;
    result
}

/// Apply one inbound command. Device-bound commands go to the capture
/// device; channel commands update the live settings.
fn dispatch(shared: &mut ServerShared, cmd: Command, value: u32) {
    log::debug!("command {:?} value {}", cmd, value);
    let mut settings = shared.settings.clone();
    match cmd {
        Command::SetCenterFrequency => shared.device.set_center_frequency(value as u64),
        Command::SetSampleRate => {
            shared.device.set_sample_rate(value);
            if shared.settings.protocol == ServerProtocol::Rtl0 {
                // rtl_tcp has no channel plane: match the channel rate
                // to the device rate with no decimation
                shared.device.set_log2_decim(0);
                settings.channel_sample_rate = value.min(settings.max_sample_rate);
            }
        }
        Command::SetTunerGainMode => {} // tuner gain is always manual here
        Command::SetTunerGain => shared.device.set_gain(0, value as i16),
        Command::SetFrequencyCorrection => shared.device.set_ppm_correction(value as i32),
        Command::SetTunerIfGain => {
            let stage = (value >> 16) & 0xffff;
            let gain = (value & 0xffff) as u16 as i16;
            shared.device.set_gain(stage, gain);
        }
        Command::SetAgcMode => shared.device.set_agc(value != 0),
        Command::SetDirectSampling => shared.device.set_direct_sampling(value != 0),
        Command::SetBiasTee => shared.device.set_bias_tee(value != 0),
        Command::SetTunerBandwidth => shared.device.set_rf_bandwidth(value),
        Command::SetDecimation => shared.device.set_log2_decim(value),
        Command::SetDcOffsetRemoval => shared.device.set_dc_offset_removal(value != 0),
        Command::SetIqCorrection => shared.device.set_iq_correction(value != 0),
        Command::SetChannelSampleRate => {
            if value > settings.max_sample_rate {
                // Pin to the maximum and force every client to
                // renegotiate at the pinned rate
                settings.channel_sample_rate = settings.max_sample_rate;
                shared.restart_pending = true;
            } else {
                settings.channel_sample_rate = value;
            }
        }
        Command::SetChannelFreqOffset => settings.channel_freq_offset = value as i32,
        Command::SetChannelGain => settings.channel_gain = value as i32,
        Command::SetSampleBitDepth => settings.sample_bits = value,
        Command::SetIqSquelchEnabled => settings.squelch_enabled = value != 0,
        Command::SetIqSquelch => settings.squelch_db = f32::from_bits(value),
        Command::SetIqSquelchGate => settings.squelch_gate_secs = f32::from_bits(value),
        _ => log::debug!("unhandled command {:?}", cmd),
    }

    // The change detector baseline tracks what clients already know;
    // an inbound device command is knowledge they have, so it is not
    // echoed back on the next tick.
    shared.last_device_state = shared.device.state();

    apply_settings(shared, settings);
}

/// Diff `new` against the live settings and apply: retune the DSP
/// state, rebuild the compressor, notify clients, or schedule a
/// restart when the wire format changed.
pub(crate) fn apply_settings(shared: &mut ServerShared, new: ServerSettings) {
    let old = shared.settings.clone();

    let stream_invalidated = new.sample_bits != old.sample_bits
        || new.compression != old.compression
        || new.protocol != old.protocol
        || (new.compression == Compression::Flac
            && (new.channel_sample_rate != old.channel_sample_rate
                || new.block_size != old.block_size
                || new.compression_level != old.compression_level));

    let rebuild_compressor = stream_invalidated
        || (new.compression == Compression::Zlib
            && (new.block_size != old.block_size
                || new.compression_level != old.compression_level));

    shared.settings = new.clone();

    if new.channel_gain != old.channel_gain {
        shared.dsp.set_gain(&new);
        push_cmd(shared, Command::SetChannelGain, new.channel_gain as u32);
    }
    if new.channel_sample_rate != old.channel_sample_rate
        || new.channel_freq_offset != old.channel_freq_offset
    {
        shared.dsp.retune(&new);
        if new.channel_sample_rate != old.channel_sample_rate {
            push_cmd(shared, Command::SetChannelSampleRate, new.channel_sample_rate);
        }
        if new.channel_freq_offset != old.channel_freq_offset {
            push_cmd(
                shared,
                Command::SetChannelFreqOffset,
                new.channel_freq_offset as u32,
            );
        }
    }
    if new.squelch_db != old.squelch_db || new.squelch_enabled != old.squelch_enabled {
        shared.dsp.reset_squelch(&new);
        if new.squelch_enabled != old.squelch_enabled {
            push_cmd(shared, Command::SetIqSquelchEnabled, new.squelch_enabled as u32);
        }
        if new.squelch_db != old.squelch_db {
            push_cmd_f32(shared, Command::SetIqSquelch, new.squelch_db);
        }
    }
    if new.squelch_gate_secs != old.squelch_gate_secs
        || new.channel_sample_rate != old.channel_sample_rate
    {
        shared.dsp.resize_squelch_gate(&new);
        if new.squelch_gate_secs != old.squelch_gate_secs {
            push_cmd_f32(shared, Command::SetIqSquelchGate, new.squelch_gate_secs);
        }
    }
    if new.sample_bits != old.sample_bits {
        push_cmd(shared, Command::SetSampleBitDepth, new.sample_bits);
    }
    if (new.position != old.position || new.direction != old.direction)
        && shared.settings.framed_stream()
    {
        let p = new.position;
        let position_frame = protocol::encode_position(p.latitude, p.longitude, p.altitude);
        send_to_all(shared, &position_frame);
        let direction_frame = match new.direction {
            crate::config::DirectionMode::Isotropic => {
                protocol::encode_direction(true, f32::NAN, f32::NAN)
            }
            crate::config::DirectionMode::Fixed { azimuth, elevation } => {
                protocol::encode_direction(false, azimuth, elevation)
            }
        };
        send_to_all(shared, &direction_frame);
    }

    if rebuild_compressor {
        let (compressor, demoted) = Compressor::build(&shared.settings);
        shared.compressor = compressor;
        if let Some(msg) = demoted {
            log::warn!("{}", msg);
            let _ = shared.events.try_send(ServerEvent::Warning(msg));
        }
        shared.counters.bytes_uncompressed = 0;
        shared.counters.bytes_compressed = 0;
    }

    if stream_invalidated && !shared.clients.is_empty() {
        shared.restart_pending = true;
    }

    if new.max_clients != old.max_clients || new.time_limit != old.time_limit {
        super::listener::rebalance(shared);
    }
}

/// Poll the capture device and push one unsolicited command per field
/// that changed since the last poll, so client UIs track reality.
pub(crate) fn check_device_settings(shared: &mut ServerShared) {
    if shared.settings.protocol == ServerProtocol::Rtl0 || !shared.settings.framed_stream() {
        return;
    }
    let current = shared.device.state();
    let last = shared.last_device_state;
    if current == last {
        return;
    }

    if current.center_frequency != last.center_frequency {
        push_cmd(
            shared,
            Command::SetCenterFrequency,
            current.center_frequency as u32,
        );
    }
    if current.ppm_correction != last.ppm_correction {
        push_cmd(
            shared,
            Command::SetFrequencyCorrection,
            current.ppm_correction as u32,
        );
    }
    if current.sample_rate != last.sample_rate {
        push_cmd(shared, Command::SetSampleRate, current.sample_rate);
    }
    if current.log2_decim != last.log2_decim {
        push_cmd(shared, Command::SetDecimation, current.log2_decim);
    }
    if current.gain[0] != last.gain[0] {
        push_cmd(shared, Command::SetTunerGain, current.gain[0] as u32);
    }
    for stage in 1..4u32 {
        if current.gain[stage as usize] != last.gain[stage as usize] {
            let packed = (stage << 16) | (current.gain[stage as usize] as u16 as u32);
            push_cmd(shared, Command::SetTunerIfGain, packed);
        }
    }
    if current.rf_bandwidth != last.rf_bandwidth {
        push_cmd(shared, Command::SetTunerBandwidth, current.rf_bandwidth);
    }
    if current.bias_tee != last.bias_tee {
        push_cmd(shared, Command::SetBiasTee, current.bias_tee as u32);
    }
    if current.direct_sampling != last.direct_sampling {
        push_cmd(
            shared,
            Command::SetDirectSampling,
            current.direct_sampling as u32,
        );
    }
    if current.agc != last.agc {
        push_cmd(shared, Command::SetAgcMode, current.agc as u32);
    }
    if current.dc_offset_removal != last.dc_offset_removal {
        push_cmd(
            shared,
            Command::SetDcOffsetRemoval,
            current.dc_offset_removal as u32,
        );
    }
    if current.iq_correction != last.iq_correction {
        push_cmd(shared, Command::SetIqCorrection, current.iq_correction as u32);
    }

    shared.last_device_state = current;
}

/// Push an unsolicited command to every connected client. Only framed
/// streams can interleave commands with IQ payload; on a raw stream a
/// command byte would be indistinguishable from sample data.
fn push_cmd(shared: &mut ServerShared, cmd: Command, value: u32) {
    if !shared.settings.framed_stream() {
        return;
    }
    let buf = protocol::encode_cmd(cmd, value);
    send_to_all(shared, &buf);
}

fn push_cmd_f32(shared: &mut ServerShared, cmd: Command, value: f32) {
    if !shared.settings.framed_stream() {
        return;
    }
    let buf = protocol::encode_cmd_f32(cmd, value);
    send_to_all(shared, &buf);
}

fn send_to_all(shared: &mut ServerShared, frame: &[u8]) {
    for client in shared.clients.iter_mut() {
        if client.is_closing() {
            continue;
        }
        if client.send_frame(frame) {
            shared.counters.bytes_transmitted += frame.len() as u64;
        }
    }
}

/// Deliver a chat message. Broadcast goes to every client except the
/// sender; directed messages go to the matching peer only. Active
/// clients on a raw stream are skipped (no frame delimiters), queued
/// clients always receive chat.
pub(crate) fn route_chat(
    shared: &mut ServerShared,
    from: SocketAddr,
    callsign: &str,
    text: &str,
    broadcast: bool,
) {
    let _ = shared.events.try_send(ServerEvent::Chat {
        from,
        callsign: callsign.to_string(),
        text: text.to_string(),
        broadcast,
    });
    let frame = protocol::encode_chat(callsign, text, broadcast);
    let framed_stream = shared.settings.framed_stream();
    for client in shared.clients.iter_mut() {
        if client.is_closing() {
            continue;
        }
        let address_match = client.peer_addr() == from;
        if (broadcast && !address_match) || (!broadcast && address_match) {
            if client.is_active() && !framed_stream {
                continue;
            }
            if client.send_frame(&frame) {
                shared.counters.bytes_transmitted += frame.len() as u64;
            }
        }
    }
}

/// Chat originated by the server itself (station announcements).
pub(crate) fn server_chat(shared: &mut ServerShared, callsign: &str, text: &str) {
    let frame = protocol::encode_chat(callsign, text, true);
    let framed_stream = shared.settings.framed_stream();
    for client in shared.clients.iter_mut() {
        if client.is_closing() || (client.is_active() && !framed_stream) {
            continue;
        }
        if client.send_frame(&frame) {
            shared.counters.bytes_transmitted += frame.len() as u64;
        }
    }
}

/// Directed administrative chat to one client (queue position, time
/// limit). Same framing rules as [`route_chat`].
pub(crate) fn admin_chat(shared: &mut ServerShared, to: SocketAddr, text: &str) {
    let callsign = shared.settings.callsign.clone();
    let frame = protocol::encode_chat(&callsign, text, false);
    let framed_stream = shared.settings.framed_stream();
    for client in shared.clients.iter_mut() {
        if client.peer_addr() != to || client.is_closing() {
            continue;
        }
        if client.is_active() && !framed_stream {
            continue;
        }
        if client.send_frame(&frame) {
            shared.counters.bytes_transmitted += frame.len() as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceControl, TestDevice};
    use crate::metrics::{BandwidthMeter, Counters};
    use crate::server::session::{AdmissionState, ClientSession};
    use crate::server::sink::{Compressor, DspState};
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};

    fn make_shared(
        settings: ServerSettings,
    ) -> (ServerShared, crossbeam_channel::Receiver<ServerEvent>) {
        let device = TestDevice::default();
        let last_device_state = device.state();
        let (events, events_rx) = crossbeam_channel::bounded(64);
        let (compressor, _) = Compressor::build(&settings);
        let dsp = DspState::new(&settings, settings.channel_sample_rate);
        (
            ServerShared {
                settings,
                clients: Vec::new(),
                compressor,
                dsp,
                device: Box::new(device),
                last_device_state,
                counters: Counters::default(),
                meter: BandwidthMeter::new(),
                events,
                restart_pending: false,
                local_addr: None,
            },
            events_rx,
        )
    }

    fn add_client(shared: &mut ServerShared, state: AdmissionState) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        let mut session = ClientSession::from_tcp(server_side, 1 << 20).unwrap();
        session.state = state;
        shared.clients.push(session);
        peer
    }

    #[test]
    fn channel_rate_above_the_maximum_is_pinned_and_restarts() {
        let settings = ServerSettings {
            max_sample_rate: 1_000_000,
            ..Default::default()
        };
        let (mut shared, _events) = make_shared(settings);
        dispatch(&mut shared, Command::SetChannelSampleRate, 2_000_000);
        assert_eq!(shared.settings.channel_sample_rate, 1_000_000);
        assert!(shared.restart_pending);
    }

    #[test]
    fn channel_rate_within_the_maximum_applies_without_restart() {
        let settings = ServerSettings {
            max_sample_rate: 1_000_000,
            ..Default::default()
        };
        let (mut shared, _events) = make_shared(settings);
        dispatch(&mut shared, Command::SetChannelSampleRate, 96_000);
        assert_eq!(shared.settings.channel_sample_rate, 96_000);
        assert!(!shared.restart_pending);
    }

    #[test]
    fn device_commands_update_the_device_and_the_baseline() {
        let (mut shared, _events) = make_shared(ServerSettings::default());
        dispatch(&mut shared, Command::SetTunerGain, 300);
        assert_eq!(shared.device.state().gain[0], 300);
        // Baseline refreshed: the next detector tick sends no echo
        assert_eq!(shared.last_device_state, shared.device.state());
    }

    #[test]
    fn remote_control_off_drops_everything_but_chat() {
        let settings = ServerSettings {
            remote_control: false,
            ..Default::default()
        };
        let (mut shared, _events) = make_shared(settings);
        let _peer = add_client(&mut shared, AdmissionState::Active);
        shared.clients[0]
            .inbuf
            .extend_from_slice(&protocol::encode_cmd(Command::SetTunerGain, 300));
        process_inbound(&mut shared, 0).unwrap();
        assert_eq!(shared.device.state().gain[0], 0);
    }

    #[test]
    fn unknown_opcode_is_an_error() {
        let (mut shared, _events) = make_shared(ServerSettings::default());
        let _peer = add_client(&mut shared, AdmissionState::Active);
        shared.clients[0].inbuf.extend_from_slice(&[0x7E, 0, 0, 0, 0]);
        assert!(process_inbound(&mut shared, 0).is_err());
    }

    #[test]
    fn partial_chat_waits_for_the_tail() {
        let (mut shared, _events) = make_shared(ServerSettings::default());
        let _peer = add_client(&mut shared, AdmissionState::Active);
        let frame = protocol::encode_chat("K1", "hello", false);
        shared.clients[0].inbuf.extend_from_slice(&frame[..7]);
        process_inbound(&mut shared, 0).unwrap();
        assert_eq!(shared.clients[0].inbuf.len(), 7); // untouched
        shared.clients[0].inbuf.extend_from_slice(&frame[7..]);
        process_inbound(&mut shared, 0).unwrap();
        assert!(shared.clients[0].inbuf.is_empty());
    }

    #[test]
    fn broadcast_chat_skips_the_sender() {
        let settings = ServerSettings {
            compression: crate::codec::Compression::Zlib,
            ..Default::default()
        };
        let (mut shared, _events) = make_shared(settings);
        let mut peer_a = add_client(&mut shared, AdmissionState::Active);
        let mut peer_b = add_client(&mut shared, AdmissionState::Active);
        let sender = shared.clients[0].peer_addr();

        route_chat(&mut shared, sender, "K1", "hi", true);
        for c in shared.clients.iter_mut() {
            let _ = c.flush();
        }

        let expected = protocol::encode_chat("K1", "hi", true);
        peer_b
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let mut got = vec![0u8; expected.len()];
        peer_b.read_exact(&mut got).unwrap();
        assert_eq!(got, expected);

        peer_a
            .set_read_timeout(Some(std::time::Duration::from_millis(100)))
            .unwrap();
        let mut tmp = [0u8; 1];
        assert!(peer_a.read_exact(&mut tmp).is_err());
    }
}
