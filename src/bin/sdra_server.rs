//! Standalone IQ streaming server.
//!
//! Serves a built-in test tone (the capture hardware is out of scope
//! for the core); everything on the wire - protocol negotiation,
//! admission, compression, squelch, remote control - is the real
//! pipeline.

use std::f32::consts::TAU;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;

use sdra_stream::codec::Compression;
use sdra_stream::config::{DirectionMode, Position, ServerProtocol, ServerSettings};
use sdra_stream::convert::FULL_SCALE;
use sdra_stream::device::TestDevice;
use sdra_stream::dsp::Complex;
use sdra_stream::error::Error;
use sdra_stream::server::{RemoteSink, ServerEvent};

const EXIT_INVALID_CONFIG: u8 = 2;
const EXIT_BIND_FAILED: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "sdra-server", about = "Remote IQ streaming server")]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    listen_address: IpAddr,

    #[arg(long, default_value_t = 1234)]
    listen_port: u16,

    /// Protocol served on accept: rtl0, sdra or sdra-wss
    #[arg(long, default_value = "sdra")]
    protocol: String,

    /// TLS certificate (PEM), required for sdra-wss
    #[arg(long)]
    cert_path: Option<PathBuf>,

    /// TLS private key (PEM), required for sdra-wss
    #[arg(long)]
    key_path: Option<PathBuf>,

    #[arg(long, default_value_t = 4)]
    max_clients: usize,

    /// Disconnect sessions after this many minutes; 0 disables
    #[arg(long, default_value_t = 0)]
    time_limit_minutes: u64,

    #[arg(long, default_value_t = 10_000_000)]
    max_sample_rate: u32,

    #[arg(long, default_value_t = 48_000)]
    channel_sample_rate: u32,

    /// Wire bit depth: 8, 16, 24 or 32
    #[arg(long, default_value_t = 16)]
    bit_depth: u32,

    /// none, flac or zlib
    #[arg(long, default_value = "none")]
    compression: String,

    #[arg(long, default_value_t = 6)]
    compression_level: u32,

    #[arg(long, default_value_t = 16_384)]
    block_size: usize,

    /// on/off: whether clients may control the device
    #[arg(long, default_value = "on")]
    remote_control: String,

    /// on/off: restrict the stream to IQ only (no chat, no pushes)
    #[arg(long, default_value = "off")]
    iq_only: String,

    /// Comma separated list of blocked client addresses
    #[arg(long, value_delimiter = ',')]
    ip_blacklist: Vec<IpAddr>,

    /// Station callsign used in chat messages
    #[arg(long, default_value = "NOCALL")]
    callsign: String,

    /// Antenna pattern: isotropic, or fixed (uses --azimuth/--elevation)
    #[arg(long, default_value = "isotropic")]
    antenna: String,

    #[arg(long, default_value_t = 0.0)]
    azimuth: f32,

    #[arg(long, default_value_t = 0.0)]
    elevation: f32,

    #[arg(long, default_value_t = 0.0)]
    latitude: f32,

    #[arg(long, default_value_t = 0.0)]
    longitude: f32,

    /// Test tone frequency in Hz
    #[arg(long, default_value_t = 1_000)]
    tone_hz: u32,
}

fn on_off(s: &str) -> Option<bool> {
    match s {
        "on" | "true" | "1" => Some(true),
        "off" | "false" | "0" => Some(false),
        _ => None,
    }
}

fn settings_from_args(args: &Args) -> Result<ServerSettings, String> {
    let protocol = ServerProtocol::parse(&args.protocol)
        .ok_or_else(|| format!("unknown protocol '{}'", args.protocol))?;
    let compression = Compression::parse(&args.compression)
        .ok_or_else(|| format!("unknown compression '{}'", args.compression))?;
    let remote_control =
        on_off(&args.remote_control).ok_or_else(|| "remote-control must be on|off".to_string())?;
    let iq_only = on_off(&args.iq_only).ok_or_else(|| "iq-only must be on|off".to_string())?;

    let settings = ServerSettings {
        protocol,
        listen_address: args.listen_address,
        listen_port: args.listen_port,
        certificate: args.cert_path.clone(),
        key: args.key_path.clone(),
        max_clients: args.max_clients,
        time_limit: (args.time_limit_minutes > 0)
            .then(|| Duration::from_secs(args.time_limit_minutes * 60)),
        max_sample_rate: args.max_sample_rate,
        channel_sample_rate: args.channel_sample_rate.min(args.max_sample_rate),
        sample_bits: args.bit_depth,
        compression,
        compression_level: args.compression_level,
        block_size: args.block_size,
        remote_control,
        iq_only,
        ip_blacklist: args.ip_blacklist.clone(),
        callsign: args.callsign.clone(),
        position: Position {
            latitude: args.latitude,
            longitude: args.longitude,
            altitude: 0.0,
        },
        direction: DirectionMode::parse(&args.antenna, args.azimuth, args.elevation),
        ..Default::default()
    };
    settings.validate()?;
    Ok(settings)
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let settings = match settings_from_args(&args) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("invalid configuration: {}", e);
            return ExitCode::from(EXIT_INVALID_CONFIG);
        }
    };

    let input_rate = settings.channel_sample_rate;
    let (mut sink, events) = RemoteSink::new(settings, Box::new(TestDevice::default()), input_rate);
    if let Err(e) = sink.start() {
        eprintln!("{}", e);
        return match e {
            Error::BindFailed(_) => ExitCode::from(EXIT_BIND_FAILED),
            Error::TlsConfig(_) => ExitCode::from(EXIT_INVALID_CONFIG),
            _ => ExitCode::from(EXIT_BIND_FAILED),
        };
    }

    std::thread::spawn(move || {
        for event in events {
            match event {
                ServerEvent::ClientConnected { addr, clients } => {
                    log::info!("client {} connected ({} total)", addr, clients)
                }
                ServerEvent::ClientDisconnected { addr, clients } => {
                    log::info!("client {} disconnected ({} total)", addr, clients)
                }
                ServerEvent::Chat {
                    from,
                    callsign,
                    text,
                    ..
                } => log::info!("chat from {} <{}>: {}", from, callsign, text),
                ServerEvent::Bandwidth(report) => log::info!(
                    "bandwidth {:.1} kb/s raw, {:.1} kb/s wire",
                    report.uncompressed_bps / 1000.0,
                    report.network_bps / 1000.0
                ),
                ServerEvent::Warning(msg) => log::warn!("{}", msg),
            }
        }
    });

    // Test-tone DSP loop: 20 ms blocks at the channel rate
    let block = (input_rate / 50).max(1) as usize;
    let mut phase = 0.0f32;
    let step = TAU * args.tone_hz as f32 / input_rate as f32;
    let amplitude = FULL_SCALE * 0.5;
    let mut samples = vec![Complex::ZERO; block];
    let mut next = Instant::now();
    loop {
        for s in samples.iter_mut() {
            *s = Complex::new(phase.cos() * amplitude, phase.sin() * amplitude);
            phase += step;
            if phase > TAU {
                phase -= TAU;
            }
        }
        sink.feed(&samples);
        next += Duration::from_millis(20);
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }
    }
}
