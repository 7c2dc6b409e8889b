//! Wire protocol shared by the server and client.
//!
//! Based on rtl_tcp for compatibility, with the SDRA extensions for wider
//! device state, channel selection, squelch and chat, plus the spy-server
//! handshake structures.
//!
//! Control-plane integers are big-endian, IQ payload bodies little-endian.
//! This asymmetry is inherited from rtl_tcp and is preserved bit-exact.
//!
//! # Command format
//!
//! ```text
//! ┌────────┬──────────────────────┐
//! │ Opcode │ Payload              │
//! │ 1 byte │ 4 bytes (u32/f32 BE) │
//! └────────┴──────────────────────┘
//! ```
//!
//! `sendMessage` is the one variable-length command: its payload is the
//! big-endian length of a `{broadcast u8, callsign cstr, text cstr}` tail.
//! Data frames (`dataIQFLAC`, `dataIQzlib`, `dataPosition`,
//! `dataDirection`) use the same 5-byte shape with the payload as a body
//! length. Uncompressed IQ is sent raw, with no opcode and no length.

use crate::error::{Error, Result};

/// Command length: opcode byte plus 4-byte payload.
pub const CMD_LEN: usize = 5;

/// Protocol commands and frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    // rtl_tcp compatible
    SetCenterFrequency = 0x01,
    SetSampleRate = 0x02,
    SetTunerGainMode = 0x03,
    SetTunerGain = 0x04,
    SetFrequencyCorrection = 0x05,
    SetTunerIfGain = 0x06,
    SetAgcMode = 0x08,
    SetDirectSampling = 0x09,
    SetBiasTee = 0x0E,
    // librtlsdr extension
    SetTunerBandwidth = 0x40,
    // SDRA extensions
    SetDcOffsetRemoval = 0xC0,
    SetIqCorrection = 0xC1,
    SetDecimation = 0xC2,
    SetChannelSampleRate = 0xC3,
    SetChannelFreqOffset = 0xC4,
    SetChannelGain = 0xC5,
    SetSampleBitDepth = 0xC6,
    SetIqSquelchEnabled = 0xC7,
    SetIqSquelch = 0xC8,
    SetIqSquelchGate = 0xC9,
    SendMessage = 0xD0,
    SendBlacklistedMessage = 0xD1,
    /// Uncompressed IQ. Never sent as a framed opcode, listed for completeness.
    DataIq = 0xF0,
    DataIqFlac = 0xF1,
    DataIqZlib = 0xF2,
    DataPosition = 0xF3,
    DataDirection = 0xF4,
}

impl Command {
    pub fn from_u8(op: u8) -> Result<Command> {
        use Command::*;
        Ok(match op {
            0x01 => SetCenterFrequency,
            0x02 => SetSampleRate,
            0x03 => SetTunerGainMode,
            0x04 => SetTunerGain,
            0x05 => SetFrequencyCorrection,
            0x06 => SetTunerIfGain,
            0x08 => SetAgcMode,
            0x09 => SetDirectSampling,
            0x0E => SetBiasTee,
            0x40 => SetTunerBandwidth,
            0xC0 => SetDcOffsetRemoval,
            0xC1 => SetIqCorrection,
            0xC2 => SetDecimation,
            0xC3 => SetChannelSampleRate,
            0xC4 => SetChannelFreqOffset,
            0xC5 => SetChannelGain,
            0xC6 => SetSampleBitDepth,
            0xC7 => SetIqSquelchEnabled,
            0xC8 => SetIqSquelch,
            0xC9 => SetIqSquelchGate,
            0xD0 => SendMessage,
            0xD1 => SendBlacklistedMessage,
            0xF0 => DataIq,
            0xF1 => DataIqFlac,
            0xF2 => DataIqZlib,
            0xF3 => DataPosition,
            0xF4 => DataDirection,
            other => return Err(Error::UnknownOpcode(other)),
        })
    }

    /// True for frame opcodes that carry a `{length u32 BE, body}` tail.
    pub fn is_framed(self) -> bool {
        matches!(
            self,
            Command::SendMessage
                | Command::DataIqFlac
                | Command::DataIqZlib
                | Command::DataPosition
                | Command::DataDirection
        )
    }
}

/// Tuner/device ids carried in the metadata blocks. The low values are
/// rtl_tcp compatible; 0x80 upwards are SDRA extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Device {
    Unknown = 0,
    RtlsdrE4000 = 1,
    RtlsdrFc0012 = 2,
    RtlsdrFc0013 = 3,
    RtlsdrFc2580 = 4,
    RtlsdrR820t = 5,
    RtlsdrR828d = 6,
    Airspy = 0x80,
    AirspyHf = 0x81,
    AudioInput = 0x82,
    BladeRf1 = 0x83,
    BladeRf2 = 0x84,
    FcdPro = 0x85,
    FcdProPlus = 0x86,
    FileInput = 0x87,
    HackRf = 0x88,
    KiwiSdr = 0x89,
    LimeSdr = 0x8A,
    LocalInput = 0x8B,
    Perseus = 0x8C,
    PlutoSdr = 0x8D,
    RemoteInput = 0x8E,
    RemoteTcpInput = 0x8F,
    SdrPlay1 = 0x90,
    SdrPlayV3Rsp1 = 0x91,
    SdrPlayV3Rsp1a = 0x92,
    SdrPlayV3Rsp2 = 0x93,
    SdrPlayV3RspDuo = 0x94,
    SdrPlayV3RspDx = 0x95,
    SigMfFileInput = 0x96,
    SoapySdr = 0x97,
    TestSource = 0x98,
    Usrp = 0x99,
    Xtrx = 0x9A,
    SdrPlayV3Rsp1b = 0x9B,
}

impl Device {
    pub fn from_u32(id: u32) -> Device {
        use Device::*;
        match id {
            1 => RtlsdrE4000,
            2 => RtlsdrFc0012,
            3 => RtlsdrFc0013,
            4 => RtlsdrFc2580,
            5 => RtlsdrR820t,
            6 => RtlsdrR828d,
            0x80 => Airspy,
            0x81 => AirspyHf,
            0x82 => AudioInput,
            0x83 => BladeRf1,
            0x84 => BladeRf2,
            0x85 => FcdPro,
            0x86 => FcdProPlus,
            0x87 => FileInput,
            0x88 => HackRf,
            0x89 => KiwiSdr,
            0x8A => LimeSdr,
            0x8B => LocalInput,
            0x8C => Perseus,
            0x8D => PlutoSdr,
            0x8E => RemoteInput,
            0x8F => RemoteTcpInput,
            0x90 => SdrPlay1,
            0x91 => SdrPlayV3Rsp1,
            0x92 => SdrPlayV3Rsp1a,
            0x93 => SdrPlayV3Rsp2,
            0x94 => SdrPlayV3RspDuo,
            0x95 => SdrPlayV3RspDx,
            0x96 => SigMfFileInput,
            0x97 => SoapySdr,
            0x98 => TestSource,
            0x99 => Usrp,
            0x9A => Xtrx,
            0x9B => SdrPlayV3Rsp1b,
            _ => Unknown,
        }
    }

    /// Display name, as shown in client UIs.
    pub fn name(self) -> &'static str {
        use Device::*;
        match self {
            Unknown => "Unknown",
            RtlsdrE4000 => "E4000",
            RtlsdrFc0012 => "FC0012",
            RtlsdrFc0013 => "FC0013",
            RtlsdrFc2580 => "FC2580",
            RtlsdrR820t => "R820T",
            RtlsdrR828d => "R828D",
            Airspy => "Airspy",
            AirspyHf => "AirspyHF",
            AudioInput => "AudioInput",
            BladeRf1 => "BladeRF1",
            BladeRf2 => "BladeRF2",
            FcdPro => "FCDPro",
            FcdProPlus => "FCDProPlus",
            FileInput => "FileInput",
            HackRf => "HackRF",
            KiwiSdr => "KiwiSDR",
            LimeSdr => "LimeSDR",
            LocalInput => "LocalInput",
            Perseus => "Perseus",
            PlutoSdr => "PlutoSDR",
            RemoteInput => "RemoteInput",
            RemoteTcpInput => "RemoteTCPInput",
            SdrPlay1 => "SDRplay1",
            SdrPlayV3Rsp1 => "RSP1",
            SdrPlayV3Rsp1a => "RSP1A",
            SdrPlayV3Rsp2 => "RSP2",
            SdrPlayV3RspDuo => "RSPduo",
            SdrPlayV3RspDx => "RSPdx",
            SigMfFileInput => "SigMFFileInput",
            SoapySdr => "SoapySDR",
            TestSource => "TestSource",
            Usrp => "USRP",
            Xtrx => "XTRX",
            SdrPlayV3Rsp1b => "RSP1B",
        }
    }
}

// ---------------------------------------------------------------------------
// Big-endian field helpers (control plane and metadata blocks)
// ---------------------------------------------------------------------------

pub fn put_u32_be(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_be_bytes());
}

pub fn put_i32_be(buf: &mut [u8], offset: usize, v: i32) {
    put_u32_be(buf, offset, v as u32);
}

pub fn put_u64_be(buf: &mut [u8], offset: usize, v: u64) {
    buf[offset..offset + 8].copy_from_slice(&v.to_be_bytes());
}

pub fn put_i16_be(buf: &mut [u8], offset: usize, v: i16) {
    buf[offset..offset + 2].copy_from_slice(&v.to_be_bytes());
}

pub fn put_f32_be(buf: &mut [u8], offset: usize, v: f32) {
    put_u32_be(buf, offset, v.to_bits());
}

pub fn get_u32_be(buf: &[u8], offset: usize) -> Result<u32> {
    let b = buf.get(offset..offset + 4).ok_or(Error::Truncated)?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn get_i32_be(buf: &[u8], offset: usize) -> Result<i32> {
    Ok(get_u32_be(buf, offset)? as i32)
}

pub fn get_u64_be(buf: &[u8], offset: usize) -> Result<u64> {
    let b = buf.get(offset..offset + 8).ok_or(Error::Truncated)?;
    Ok(u64::from_be_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ]))
}

pub fn get_i16_be(buf: &[u8], offset: usize) -> Result<i16> {
    let b = buf.get(offset..offset + 2).ok_or(Error::Truncated)?;
    Ok(i16::from_be_bytes([b[0], b[1]]))
}

pub fn get_f32_be(buf: &[u8], offset: usize) -> Result<f32> {
    Ok(f32::from_bits(get_u32_be(buf, offset)?))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Encode a command with a u32 payload.
pub fn encode_cmd(cmd: Command, value: u32) -> [u8; CMD_LEN] {
    let mut buf = [0u8; CMD_LEN];
    buf[0] = cmd as u8;
    put_u32_be(&mut buf, 1, value);
    buf
}

/// Encode a command with an f32 payload (squelch level and gate).
pub fn encode_cmd_f32(cmd: Command, value: f32) -> [u8; CMD_LEN] {
    let mut buf = [0u8; CMD_LEN];
    buf[0] = cmd as u8;
    put_f32_be(&mut buf, 1, value);
    buf
}

/// Decode a 5-byte command. The payload of `sendMessage` and the data
/// frames is a body length; the caller reads the tail separately.
pub fn decode_cmd(buf: &[u8]) -> Result<(Command, u32)> {
    if buf.len() < CMD_LEN {
        return Err(Error::Truncated);
    }
    let cmd = Command::from_u8(buf[0])?;
    let value = get_u32_be(buf, 1)?;
    Ok((cmd, value))
}

/// Decode the payload of a float-valued command.
pub fn decode_cmd_f32(buf: &[u8]) -> Result<(Command, f32)> {
    let (cmd, bits) = decode_cmd(buf)?;
    Ok((cmd, f32::from_bits(bits)))
}

// ---------------------------------------------------------------------------
// Data frames
// ---------------------------------------------------------------------------

/// `{opcode, length}` header preceding a compressed-IQ, position,
/// direction or chat body.
pub fn encode_frame_header(cmd: Command, body_len: u32) -> [u8; CMD_LEN] {
    encode_cmd(cmd, body_len)
}

/// Chat message frame: opcode, tail length, broadcast flag, then two
/// zero-terminated UTF-8 strings.
pub fn encode_chat(callsign: &str, text: &str, broadcast: bool) -> Vec<u8> {
    let tail_len = 1 + callsign.len() + 1 + text.len() + 1;
    let mut buf = Vec::with_capacity(CMD_LEN + tail_len);
    buf.push(Command::SendMessage as u8);
    buf.extend_from_slice(&(tail_len as u32).to_be_bytes());
    buf.push(broadcast as u8);
    buf.extend_from_slice(callsign.as_bytes());
    buf.push(0);
    buf.extend_from_slice(text.as_bytes());
    buf.push(0);
    buf
}

/// Decode a chat tail (the bytes following the 5-byte header).
pub fn decode_chat(tail: &[u8]) -> Result<(bool, String, String)> {
    if tail.is_empty() {
        return Err(Error::Truncated);
    }
    let broadcast = tail[0] != 0;
    let rest = &tail[1..];
    let callsign_end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(Error::Truncated)?;
    let callsign = String::from_utf8_lossy(&rest[..callsign_end]).into_owned();
    let rest = &rest[callsign_end + 1..];
    let text_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    let text = String::from_utf8_lossy(&rest[..text_end]).into_owned();
    Ok((broadcast, callsign, text))
}

/// Blacklist notice: a bare command with a zero length.
pub fn encode_blacklisted() -> [u8; CMD_LEN] {
    encode_cmd(Command::SendBlacklistedMessage, 0)
}

/// Antenna position frame (latitude, longitude, altitude).
pub fn encode_position(latitude: f32, longitude: f32, altitude: f32) -> [u8; CMD_LEN + 12] {
    let mut buf = [0u8; CMD_LEN + 12];
    buf[0] = Command::DataPosition as u8;
    put_u32_be(&mut buf, 1, 12);
    put_f32_be(&mut buf, 5, latitude);
    put_f32_be(&mut buf, 9, longitude);
    put_f32_be(&mut buf, 13, altitude);
    buf
}

/// Antenna direction frame. An isotropic antenna has no direction; the
/// azimuth/elevation fields are then NaN by convention.
pub fn encode_direction(isotropic: bool, azimuth: f32, elevation: f32) -> [u8; CMD_LEN + 12] {
    let mut buf = [0u8; CMD_LEN + 12];
    buf[0] = Command::DataDirection as u8;
    put_u32_be(&mut buf, 1, 12);
    put_u32_be(&mut buf, 5, isotropic as u32);
    put_f32_be(&mut buf, 9, azimuth);
    put_f32_be(&mut buf, 13, elevation);
    buf
}

pub fn decode_position(body: &[u8]) -> Result<(f32, f32, f32)> {
    Ok((
        get_f32_be(body, 0)?,
        get_f32_be(body, 4)?,
        get_f32_be(body, 8)?,
    ))
}

pub fn decode_direction(body: &[u8]) -> Result<(bool, f32, f32)> {
    Ok((
        get_u32_be(body, 0)? != 0,
        get_f32_be(body, 4)?,
        get_f32_be(body, 8)?,
    ))
}

// ---------------------------------------------------------------------------
// Metadata blocks
// ---------------------------------------------------------------------------

pub const RTL0_MAGIC: [u8; 4] = *b"RTL0";
pub const SDRA_MAGIC: [u8; 4] = *b"SDRA";
pub const RTL0_META_SIZE: usize = 12;
pub const SDRA_META_SIZE: usize = 128;
/// 0 = 64-byte metadata, 1 = 128-byte metadata.
pub const SDRA_PROTOCOL_REVISION: u32 = 1;

/// rtl_tcp compatible 12-byte handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rtl0Metadata {
    pub device: Device,
    pub gain_stages: u32,
}

impl Rtl0Metadata {
    pub fn encode(&self) -> [u8; RTL0_META_SIZE] {
        let mut buf = [0u8; RTL0_META_SIZE];
        buf[..4].copy_from_slice(&RTL0_MAGIC);
        put_u32_be(&mut buf, 4, self.device as u32);
        put_u32_be(&mut buf, 8, self.gain_stages);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Rtl0Metadata> {
        if buf.len() < RTL0_META_SIZE {
            return Err(Error::Truncated);
        }
        if buf[..4] != RTL0_MAGIC {
            return Err(Error::DecodeMismatch("bad RTL0 magic".into()));
        }
        Ok(Rtl0Metadata {
            device: Device::from_u32(get_u32_be(buf, 4)?),
            gain_stages: get_u32_be(buf, 8)?,
        })
    }
}

/// Flags bitfield of the SDRA metadata block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SdraFlags {
    pub bias_tee: bool,
    pub direct_sampling: bool,
    pub agc: bool,
    pub dc_offset_removal: bool,
    pub iq_correction: bool,
    pub squelch_enabled: bool,
    pub remote_control: bool,
    /// Set when the stream carries framed data (chat, compressed IQ,
    /// position) in addition to IQ; clear for an IQ-only stream.
    pub framed_data: bool,
}

impl SdraFlags {
    pub fn to_u32(self) -> u32 {
        (self.bias_tee as u32)
            | (self.direct_sampling as u32) << 1
            | (self.agc as u32) << 2
            | (self.dc_offset_removal as u32) << 3
            | (self.iq_correction as u32) << 4
            | (self.squelch_enabled as u32) << 5
            | (self.remote_control as u32) << 6
            | (self.framed_data as u32) << 7
    }

    pub fn from_u32(flags: u32) -> SdraFlags {
        SdraFlags {
            bias_tee: flags & 1 != 0,
            direct_sampling: flags >> 1 & 1 != 0,
            agc: flags >> 2 & 1 != 0,
            dc_offset_removal: flags >> 3 & 1 != 0,
            iq_correction: flags >> 4 & 1 != 0,
            squelch_enabled: flags >> 5 & 1 != 0,
            remote_control: flags >> 6 & 1 != 0,
            framed_data: flags >> 7 & 1 != 0,
        }
    }
}

/// 128-byte SDRA metadata block, sent once on accept.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SdraMetadata {
    pub device: Device,
    pub center_frequency: u64,
    pub ppm_correction: i32,
    pub flags: SdraFlags,
    pub device_sample_rate: u32,
    pub log2_decim: u32,
    pub gain: [i16; 4],
    pub rf_bandwidth: u32,
    pub channel_freq_offset: i32,
    pub channel_gain: i32,
    pub channel_sample_rate: u32,
    pub sample_bits: u32,
    pub squelch_db: f32,
    pub squelch_gate_secs: f32,
}

impl SdraMetadata {
    pub fn encode(&self) -> [u8; SDRA_META_SIZE] {
        let mut buf = [0u8; SDRA_META_SIZE];
        buf[..4].copy_from_slice(&SDRA_MAGIC);
        put_u32_be(&mut buf, 4, self.device as u32);
        put_u64_be(&mut buf, 8, self.center_frequency);
        put_i32_be(&mut buf, 16, self.ppm_correction);
        put_u32_be(&mut buf, 20, self.flags.to_u32());
        put_u32_be(&mut buf, 24, self.device_sample_rate);
        put_u32_be(&mut buf, 28, self.log2_decim);
        put_i16_be(&mut buf, 32, self.gain[0]);
        put_i16_be(&mut buf, 34, self.gain[1]);
        put_i16_be(&mut buf, 36, self.gain[2]);
        put_i16_be(&mut buf, 38, self.gain[3]);
        put_u32_be(&mut buf, 40, self.rf_bandwidth);
        put_i32_be(&mut buf, 44, self.channel_freq_offset);
        put_u32_be(&mut buf, 48, self.channel_gain as u32);
        put_u32_be(&mut buf, 52, self.channel_sample_rate);
        put_u32_be(&mut buf, 56, self.sample_bits);
        put_u32_be(&mut buf, 60, SDRA_PROTOCOL_REVISION);
        put_f32_be(&mut buf, 64, self.squelch_db);
        put_f32_be(&mut buf, 68, self.squelch_gate_secs);
        // 72..128 reserved
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<SdraMetadata> {
        if buf.len() < SDRA_META_SIZE {
            return Err(Error::Truncated);
        }
        if buf[..4] != SDRA_MAGIC {
            return Err(Error::DecodeMismatch("bad SDRA magic".into()));
        }
        Ok(SdraMetadata {
            device: Device::from_u32(get_u32_be(buf, 4)?),
            center_frequency: get_u64_be(buf, 8)?,
            ppm_correction: get_i32_be(buf, 16)?,
            flags: SdraFlags::from_u32(get_u32_be(buf, 20)?),
            device_sample_rate: get_u32_be(buf, 24)?,
            log2_decim: get_u32_be(buf, 28)?,
            gain: [
                get_i16_be(buf, 32)?,
                get_i16_be(buf, 34)?,
                get_i16_be(buf, 36)?,
                get_i16_be(buf, 38)?,
            ],
            rf_bandwidth: get_u32_be(buf, 40)?,
            channel_freq_offset: get_i32_be(buf, 44)?,
            channel_gain: get_u32_be(buf, 48)? as i32,
            channel_sample_rate: get_u32_be(buf, 52)?,
            sample_bits: get_u32_be(buf, 56)?,
            squelch_db: get_f32_be(buf, 64)?,
            squelch_gate_secs: get_f32_be(buf, 68)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Spy-server protocol (little-endian throughout)
// ---------------------------------------------------------------------------

pub mod spy {
    use crate::error::{Error, Result};

    pub const PROTOCOL_ID: u32 = (2 << 24) | 1700;
    pub const HEADER_SIZE: usize = 20;
    pub const DEVICE_SIZE: usize = 48;
    pub const STATE_SIZE: usize = 36;

    // Command message ids (client to server)
    pub const CMD_HELLO: u32 = 0;
    pub const CMD_SET_SETTING: u32 = 2;

    // Setting ids for CMD_SET_SETTING
    pub const SET_STREAMING_MODE: u32 = 0;
    pub const SET_STREAMING_ENABLED: u32 = 1;
    pub const SET_GAIN: u32 = 2;
    pub const SET_IQ_FORMAT: u32 = 100;
    pub const SET_CENTER_FREQUENCY: u32 = 101;
    pub const SET_IQ_DECIMATION: u32 = 102;

    // Message kinds (server to client)
    pub const MSG_DEVICE: u32 = 0;
    pub const MSG_STATE: u32 = 1;
    pub const MSG_IQ8: u32 = 100;
    pub const MSG_IQ16: u32 = 101;
    pub const MSG_IQ24: u32 = 102;
    pub const MSG_IQ32: u32 = 103;

    fn get_u32_le(buf: &[u8], offset: usize) -> Result<u32> {
        let b = buf.get(offset..offset + 4).ok_or(Error::Truncated)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Fixed header preceding every spy-server message.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Header {
        pub id: u32,
        pub message: u32,
        pub size: u32,
    }

    impl Header {
        pub fn decode(buf: &[u8]) -> Result<Header> {
            if buf.len() < HEADER_SIZE {
                return Err(Error::Truncated);
            }
            Ok(Header {
                id: get_u32_le(buf, 0)?,
                message: get_u32_le(buf, 4)?,
                size: get_u32_le(buf, 16)?,
            })
        }

        pub fn encode(&self) -> [u8; HEADER_SIZE] {
            let mut buf = [0u8; HEADER_SIZE];
            buf[0..4].copy_from_slice(&self.id.to_le_bytes());
            buf[4..8].copy_from_slice(&self.message.to_le_bytes());
            buf[16..20].copy_from_slice(&self.size.to_le_bytes());
            buf
        }

        pub fn is_iq(&self) -> bool {
            (MSG_IQ8..=MSG_IQ32).contains(&self.message)
        }
    }

    /// Device description body.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DeviceInfo {
        pub device: u32,
        pub serial: u32,
        pub sample_rate: u32,
        pub decimation_stages: u32,
        pub max_gain_index: u32,
        pub min_frequency: u32,
        pub max_frequency: u32,
        pub sample_bits: u32,
        pub min_decimation: u32,
    }

    impl DeviceInfo {
        pub fn decode(buf: &[u8]) -> Result<DeviceInfo> {
            if buf.len() < DEVICE_SIZE {
                return Err(Error::Truncated);
            }
            Ok(DeviceInfo {
                device: get_u32_le(buf, 0)?,
                serial: get_u32_le(buf, 4)?,
                sample_rate: get_u32_le(buf, 8)?,
                decimation_stages: get_u32_le(buf, 16)?,
                max_gain_index: get_u32_le(buf, 24)?,
                min_frequency: get_u32_le(buf, 28)?,
                max_frequency: get_u32_le(buf, 32)?,
                sample_bits: get_u32_le(buf, 36)?,
                min_decimation: get_u32_le(buf, 40)?,
            })
        }
    }

    /// Streaming state body.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct State {
        pub controllable: u32,
        pub gain: u32,
        pub device_center_frequency: u32,
        pub iq_center_frequency: u32,
    }

    impl State {
        pub fn decode(buf: &[u8]) -> Result<State> {
            if buf.len() < STATE_SIZE {
                return Err(Error::Truncated);
            }
            Ok(State {
                controllable: get_u32_le(buf, 0)?,
                gain: get_u32_le(buf, 4)?,
                device_center_frequency: get_u32_le(buf, 8)?,
                iq_center_frequency: get_u32_le(buf, 12)?,
            })
        }
    }

    /// Initial hello carrying the protocol id and a client name.
    pub fn encode_hello(client_name: &str) -> Vec<u8> {
        let body_len = 4 + client_name.len() + 1;
        let mut buf = Vec::with_capacity(8 + body_len);
        buf.extend_from_slice(&CMD_HELLO.to_le_bytes());
        buf.extend_from_slice(&(body_len as u32).to_le_bytes());
        buf.extend_from_slice(&PROTOCOL_ID.to_le_bytes());
        buf.extend_from_slice(client_name.as_bytes());
        buf.push(0);
        buf
    }

    /// `setXxx` command with a single u32 value.
    pub fn encode_set(setting: u32, value: u32) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0..4].copy_from_slice(&CMD_SET_SETTING.to_le_bytes());
        buf[4..8].copy_from_slice(&8u32.to_le_bytes());
        buf[8..12].copy_from_slice(&setting.to_le_bytes());
        buf[12..16].copy_from_slice(&value.to_le_bytes());
        buf
    }

    /// Map a wire bit depth onto the spy-server IQ format id.
    pub fn iq_format_for_bits(sample_bits: u32) -> u32 {
        match sample_bits {
            8 => 1,
            16 => 2,
            24 => 3,
            32 => 4, // float
            _ => 1,
        }
    }
}
