//! Server and client configuration.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::codec::Compression;

/// Which handshake the server speaks on accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerProtocol {
    /// rtl_tcp compatible: 12-byte metadata, raw unsigned 8-bit IQ.
    Rtl0,
    /// SDRA over plain TCP.
    #[default]
    Sdra,
    /// SDRA over WebSocket with TLS.
    SdraWss,
}

impl ServerProtocol {
    pub fn parse(s: &str) -> Option<ServerProtocol> {
        match s {
            "rtl0" => Some(ServerProtocol::Rtl0),
            "sdra" => Some(ServerProtocol::Sdra),
            "sdra-wss" | "wss" => Some(ServerProtocol::SdraWss),
            _ => None,
        }
    }
}

/// Antenna radiation pattern reported to clients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DirectionMode {
    Isotropic,
    Fixed { azimuth: f32, elevation: f32 },
}

impl DirectionMode {
    /// The original settings key appears with both spellings; treat them
    /// as one setting.
    pub fn parse(s: &str, azimuth: f32, elevation: f32) -> DirectionMode {
        if s.contains("isotropic") || s.contains("isotrophic") {
            DirectionMode::Isotropic
        } else {
            DirectionMode::Fixed { azimuth, elevation }
        }
    }
}

/// Geographic antenna position sent in `dataPosition` frames.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub latitude: f32,
    pub longitude: f32,
    pub altitude: f32,
}

/// Everything the server needs, both launch-time and live-tunable.
/// Live reconfiguration flows through the control plane and produces a
/// new value of this struct.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub protocol: ServerProtocol,
    pub listen_address: IpAddr,
    pub listen_port: u16,
    pub certificate: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub max_clients: usize,
    /// Per-session time limit; `None` disables it.
    pub time_limit: Option<Duration>,
    pub max_sample_rate: u32,
    pub channel_sample_rate: u32,
    pub channel_freq_offset: i32,
    /// Channel gain in tenths of a dB.
    pub channel_gain: i32,
    pub sample_bits: u32,
    pub compression: Compression,
    pub compression_level: u32,
    pub block_size: usize,
    pub squelch_enabled: bool,
    pub squelch_db: f32,
    pub squelch_gate_secs: f32,
    pub remote_control: bool,
    pub iq_only: bool,
    pub ip_blacklist: Vec<IpAddr>,
    /// Station callsign used for chat messages.
    pub callsign: String,
    pub position: Position,
    pub direction: DirectionMode,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            protocol: ServerProtocol::Sdra,
            listen_address: IpAddr::from([0, 0, 0, 0]),
            listen_port: 1234,
            certificate: None,
            key: None,
            max_clients: 4,
            time_limit: None,
            max_sample_rate: 10_000_000,
            channel_sample_rate: 48_000,
            channel_freq_offset: 0,
            channel_gain: 0,
            sample_bits: 16,
            compression: Compression::None,
            compression_level: 6,
            block_size: 16_384,
            squelch_enabled: false,
            squelch_db: -150.0,
            squelch_gate_secs: 0.001,
            remote_control: true,
            iq_only: false,
            ip_blacklist: Vec::new(),
            callsign: String::new(),
            position: Position::default(),
            direction: DirectionMode::Isotropic,
        }
    }
}

impl ServerSettings {
    /// True when the stream carries framed messages alongside IQ, which
    /// is the only mode in which the server may push unsolicited
    /// commands or chat to Active clients.
    pub fn framed_stream(&self) -> bool {
        !self.iq_only && self.compression != Compression::None
    }

    pub fn linear_gain(&self) -> f32 {
        10.0f32.powf(self.channel_gain as f32 / 200.0)
    }

    /// Squelch threshold as linear power relative to full scale.
    pub fn squelch_level(&self) -> f64 {
        10f64.powf(self.squelch_db as f64 / 10.0)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !matches!(self.sample_bits, 8 | 16 | 24 | 32) {
            return Err(format!("invalid bit depth {}", self.sample_bits));
        }
        if self.compression == Compression::Flac && self.sample_bits == 32 {
            return Err("FLAC compression supports 8/16/24-bit samples only".into());
        }
        if self.max_clients == 0 {
            return Err("max-clients must be at least 1".into());
        }
        if self.channel_sample_rate == 0 || self.max_sample_rate == 0 {
            return Err("sample rates must be non-zero".into());
        }
        if self.block_size < 256 || self.block_size > 65_536 {
            return Err(format!("block size {} out of range 256..65536", self.block_size));
        }
        if self.compression_level > 9 {
            return Err(format!("compression level {} out of range 0..9", self.compression_level));
        }
        if self.protocol == ServerProtocol::SdraWss
            && (self.certificate.is_none() || self.key.is_none())
        {
            return Err("wss protocol requires --cert-path and --key-path".into());
        }
        Ok(())
    }
}

/// Remote protocol the client expects on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientProtocol {
    /// rtl_tcp or SDRA; distinguished by the received magic.
    #[default]
    RtlTcp,
    SpyServer,
}

/// Client-side settings store. In SDRA mode the remote metadata block
/// overwrites these unless `override_remote_settings` is set, in which
/// case they are pushed to the server instead.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub server_address: String,
    pub server_port: u16,
    pub protocol: ClientProtocol,
    pub override_remote_settings: bool,
    pub center_frequency: u64,
    pub ppm_correction: i32,
    pub bias_tee: bool,
    pub direct_sampling: bool,
    pub agc: bool,
    pub dc_block: bool,
    pub iq_correction: bool,
    pub device_sample_rate: u32,
    pub log2_decim: u32,
    pub gain: [i16; 4],
    pub rf_bandwidth: u32,
    pub channel_freq_offset: i32,
    pub channel_gain: i32,
    pub channel_sample_rate: u32,
    pub sample_bits: u32,
    pub squelch_enabled: bool,
    pub squelch_db: f32,
    pub squelch_gate_secs: f32,
    /// Seconds of sample-rate-equivalent bytes required before the
    /// first samples are emitted downstream.
    pub prefill_seconds: f32,
    /// Replay history length; zero disables the replay buffer.
    pub replay_length_secs: f32,
    pub callsign: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings {
            server_address: "127.0.0.1".into(),
            server_port: 1234,
            protocol: ClientProtocol::RtlTcp,
            override_remote_settings: false,
            center_frequency: 100_000_000,
            ppm_correction: 0,
            bias_tee: false,
            direct_sampling: false,
            agc: false,
            dc_block: false,
            iq_correction: false,
            device_sample_rate: 2_048_000,
            log2_decim: 0,
            gain: [0; 4],
            rf_bandwidth: 0,
            channel_freq_offset: 0,
            channel_gain: 0,
            channel_sample_rate: 48_000,
            sample_bits: 16,
            squelch_enabled: false,
            squelch_db: -150.0,
            squelch_gate_secs: 0.001,
            prefill_seconds: 1.0,
            replay_length_secs: 0.0,
            callsign: String::new(),
        }
    }
}

impl ClientSettings {
    pub fn bytes_per_iq_pair(&self) -> usize {
        crate::convert::bytes_per_iq_pair(self.sample_bits)
    }

    pub fn bytes_per_second(&self) -> usize {
        self.channel_sample_rate as usize * self.bytes_per_iq_pair()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_accepts_both_spellings() {
        assert_eq!(
            DirectionMode::parse("isotropic", 0.0, 0.0),
            DirectionMode::Isotropic
        );
        assert_eq!(
            DirectionMode::parse("isotrophic", 0.0, 0.0),
            DirectionMode::Isotropic
        );
        assert_eq!(
            DirectionMode::parse("rotator", 10.0, 20.0),
            DirectionMode::Fixed {
                azimuth: 10.0,
                elevation: 20.0
            }
        );
    }

    #[test]
    fn flac_at_32_bits_is_invalid() {
        let settings = ServerSettings {
            compression: Compression::Flac,
            sample_bits: 32,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn wss_requires_cert_and_key() {
        let settings = ServerSettings {
            protocol: ServerProtocol::SdraWss,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn gain_is_tenths_of_db() {
        let settings = ServerSettings {
            channel_gain: 200,
            ..Default::default()
        };
        assert!((settings.linear_gain() - 10.0).abs() < 1e-5);
    }

    #[test]
    fn framed_stream_requires_compression_and_not_iq_only() {
        let mut s = ServerSettings::default();
        assert!(!s.framed_stream());
        s.compression = Compression::Flac;
        assert!(s.framed_stream());
        s.iq_only = true;
        assert!(!s.framed_stream());
    }
}
