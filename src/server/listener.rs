//! Listening sockets, the network thread and admission control.

use std::fs::File;
use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::codec::Compression;
use crate::config::{DirectionMode, ServerProtocol, ServerSettings};
use crate::error::{Error, Result};
use crate::protocol::{self, Rtl0Metadata, SdraFlags, SdraMetadata};
use crate::server::session::{AdmissionState, ClientSession, WssStream};
use crate::server::{control, ServerEvent, ServerShared};

/// Network thread cadence.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Change-detector cadence.
const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// TLS/WebSocket handshake deadline.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) enum Listeners {
    Tcp(TcpListener),
    Wss {
        listener: TcpListener,
        tls: Arc<rustls::ServerConfig>,
        ready_tx: Sender<(WssStream, SocketAddr)>,
        ready_rx: Receiver<(WssStream, SocketAddr)>,
    },
}

impl Listeners {
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Listeners::Tcp(l) => l.local_addr().expect("bound listener has an address"),
            Listeners::Wss { listener, .. } => {
                listener.local_addr().expect("bound listener has an address")
            }
        }
    }
}

/// Bind the listening socket for the configured transport. A TLS
/// problem fails only the WSS transport; a plain TCP server with the
/// same settings would still run.
pub(crate) fn bind(settings: &ServerSettings) -> Result<Listeners> {
    let addr = SocketAddr::new(settings.listen_address, settings.listen_port);
    let listener = TcpListener::bind(addr).map_err(Error::BindFailed)?;
    listener.set_nonblocking(true).map_err(Error::Io)?;
    log::info!("listening on {}", listener.local_addr().map_err(Error::Io)?);

    match settings.protocol {
        ServerProtocol::Rtl0 | ServerProtocol::Sdra => Ok(Listeners::Tcp(listener)),
        ServerProtocol::SdraWss => {
            let cert_path = settings
                .certificate
                .as_ref()
                .ok_or_else(|| Error::TlsConfig("wss requires a certificate".into()))?;
            let key_path = settings
                .key
                .as_ref()
                .ok_or_else(|| Error::TlsConfig("wss requires a private key".into()))?;
            let tls = load_tls(cert_path, key_path)?;
            let (ready_tx, ready_rx) = unbounded();
            Ok(Listeners::Wss {
                listener,
                tls,
                ready_tx,
                ready_rx,
            })
        }
    }
}

fn load_tls(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
) -> Result<Arc<rustls::ServerConfig>> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut cert_reader = BufReader::new(
        File::open(cert_path)
            .map_err(|e| Error::TlsConfig(format!("{}: {}", cert_path.display(), e)))?,
    );
    let certs: std::result::Result<Vec<_>, _> = rustls_pemfile::certs(&mut cert_reader).collect();
    let certs =
        certs.map_err(|e| Error::TlsConfig(format!("{}: {}", cert_path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::TlsConfig(format!(
            "{}: no certificates found",
            cert_path.display()
        )));
    }

    let mut key_reader = BufReader::new(
        File::open(key_path)
            .map_err(|e| Error::TlsConfig(format!("{}: {}", key_path.display(), e)))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| Error::TlsConfig(format!("{}: {}", key_path.display(), e)))?
        .ok_or_else(|| Error::TlsConfig(format!("{}: no private key found", key_path.display())))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::TlsConfig(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Network thread main loop.
pub(crate) fn run(
    shared: Arc<Mutex<ServerShared>>,
    running: Arc<AtomicBool>,
    mut listeners: Listeners,
) {
    let mut last_device_poll = Instant::now();

    while running.load(Ordering::SeqCst) {
        accept_new(&mut listeners, &shared);

        {
            let mut shared = shared.lock();

            service_clients(&mut shared);
            check_deadlines(&mut shared);

            if shared.restart_pending {
                restart_stream(&mut shared);
            }

            reap(&mut shared);

            if last_device_poll.elapsed() >= DEVICE_POLL_INTERVAL {
                control::check_device_settings(&mut shared);
                last_device_poll = Instant::now();
            }
        }

        std::thread::sleep(POLL_INTERVAL);
    }

    // Orderly shutdown: each close runs the normal disconnect path
    let mut shared = shared.lock();
    for client in shared.clients.iter_mut() {
        client.close();
    }
    reap(&mut shared);
}

fn accept_new(listeners: &mut Listeners, shared: &Arc<Mutex<ServerShared>>) {
    match listeners {
        Listeners::Tcp(listener) => loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    log::debug!("client connected from {}", peer);
                    let mut shared = shared.lock();
                    let budget = shared.write_budget();
                    match ClientSession::from_tcp(stream, budget) {
                        Ok(session) => admit(&mut shared, session),
                        Err(e) => log::warn!("failed to set up session for {}: {}", peer, e),
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    break;
                }
            }
        },
        Listeners::Wss {
            listener,
            tls,
            ready_tx,
            ready_rx,
        } => {
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        let tls = tls.clone();
                        let tx = ready_tx.clone();
                        std::thread::spawn(move || wss_handshake(stream, peer, tls, tx));
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::warn!("accept failed: {}", e);
                        break;
                    }
                }
            }
            while let Ok((ws, peer)) = ready_rx.try_recv() {
                log::debug!("wss client connected from {}", peer);
                let mut shared = shared.lock();
                let budget = shared.write_budget();
                match ClientSession::from_wss(ws, peer, budget) {
                    Ok(session) => admit(&mut shared, session),
                    Err(e) => log::warn!("failed to set up session for {}: {}", peer, e),
                }
            }
        }
    }
}

/// TLS + WebSocket handshake, off the network thread so a slow peer
/// cannot stall the server.
fn wss_handshake(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Arc<rustls::ServerConfig>,
    ready: Sender<(WssStream, SocketAddr)>,
) {
    let _ = stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT));
    let _ = stream.set_write_timeout(Some(HANDSHAKE_TIMEOUT));
    let conn = match rustls::ServerConnection::new(tls) {
        Ok(c) => c,
        Err(e) => {
            log::warn!("TLS session setup failed for {}: {}", peer, e);
            return;
        }
    };
    let tls_stream = rustls::StreamOwned::new(conn, stream);
    let mut config = tungstenite::protocol::WebSocketConfig::default();
    config.max_write_buffer_size = 16 * 1024 * 1024;
    match tungstenite::accept_with_config(tls_stream, Some(config)) {
        Ok(ws) => {
            let _ = ready.send((ws, peer));
        }
        Err(e) => log::warn!("websocket handshake failed for {}: {}", peer, e),
    }
}

/// Admit a new connection: send metadata, assign Active or Queued,
/// replay the FLAC header, apply the blacklist and announce the event.
pub(crate) fn admit(shared: &mut ServerShared, mut session: ClientSession) {
    let peer = session.peer_addr();

    let metadata: Vec<u8> = match shared.settings.protocol {
        ServerProtocol::Rtl0 => Rtl0Metadata {
            device: shared.device.device_id(),
            gain_stages: shared.device.gain_stages(),
        }
        .encode()
        .to_vec(),
        _ => {
            let state = shared.device.state();
            SdraMetadata {
                device: shared.device.device_id(),
                center_frequency: state.center_frequency,
                ppm_correction: state.ppm_correction,
                flags: SdraFlags {
                    bias_tee: state.bias_tee,
                    direct_sampling: state.direct_sampling,
                    agc: state.agc,
                    dc_offset_removal: state.dc_offset_removal,
                    iq_correction: state.iq_correction,
                    squelch_enabled: shared.settings.squelch_enabled,
                    remote_control: shared.settings.remote_control,
                    framed_data: shared.settings.framed_stream(),
                },
                device_sample_rate: state.sample_rate,
                log2_decim: state.log2_decim,
                gain: state.gain,
                rf_bandwidth: state.rf_bandwidth,
                channel_freq_offset: shared.settings.channel_freq_offset,
                channel_gain: shared.settings.channel_gain,
                channel_sample_rate: shared.settings.channel_sample_rate,
                sample_bits: shared.settings.sample_bits,
                squelch_db: shared.settings.squelch_db,
                squelch_gate_secs: shared.settings.squelch_gate_secs,
            }
            .encode()
            .to_vec()
        }
    };
    if session.send_frame(&metadata) {
        shared.counters.bytes_transmitted += metadata.len() as u64;
    }
    let _ = session.flush();

    let active_count = shared
        .clients
        .iter()
        .filter(|c| c.is_active())
        .count();
    if active_count < shared.settings.max_clients {
        session.state = AdmissionState::Active;
        session.deadline = shared.settings.time_limit.map(|limit| Instant::now() + limit);
    } else {
        let position = shared
            .clients
            .iter()
            .filter(|c| matches!(c.state, AdmissionState::Queued(_)))
            .count()
            + 1;
        session.state = AdmissionState::Queued(position);
    }

    // Late joiner header replay: the decoder must see the stream start
    if shared.settings.framed_stream() && shared.settings.compression == Compression::Flac {
        if let Some(header) = shared.compressor.flac_header() {
            let mut frame =
                Vec::with_capacity(protocol::CMD_LEN + header.len());
            frame.extend_from_slice(&protocol::encode_frame_header(
                protocol::Command::DataIqFlac,
                header.len() as u32,
            ));
            frame.extend_from_slice(header);
            if session.send_frame(&frame) {
                shared.counters.bytes_transmitted += frame.len() as u64;
                session.flac_header_sent = true;
            }
        }
    }

    let queued_position = match session.state {
        AdmissionState::Queued(p) => Some(p),
        _ => None,
    };
    let blacklisted = shared
        .settings
        .ip_blacklist
        .iter()
        .any(|ip| *ip == peer.ip());

    shared.clients.push(session);
    let clients = shared.clients.len();
    let _ = shared
        .events
        .try_send(ServerEvent::ClientConnected { addr: peer, clients });

    if let Some(position) = queued_position {
        control::admin_chat(
            shared,
            peer,
            &format!("Server busy. You are number {} in the queue.", position),
        );
    }

    if shared.settings.protocol != ServerProtocol::Rtl0 && shared.settings.framed_stream() {
        send_position_and_direction(shared, peer);
    }

    if blacklisted {
        log::info!("disconnecting {}: blacklisted", peer);
        if shared.settings.framed_stream() {
            let frame = protocol::encode_blacklisted();
            if let Some(c) = shared.clients.iter_mut().find(|c| c.peer_addr() == peer) {
                if c.send_frame(&frame) {
                    shared.counters.bytes_transmitted += frame.len() as u64;
                }
                let _ = c.flush();
            }
        }
        if let Some(c) = shared.clients.iter_mut().find(|c| c.peer_addr() == peer) {
            c.close();
        }
    }

    if let Some(c) = shared.clients.iter_mut().find(|c| c.peer_addr() == peer) {
        let _ = c.flush();
    }
}

fn send_position_and_direction(shared: &mut ServerShared, to: SocketAddr) {
    let p = shared.settings.position;
    let position_frame = protocol::encode_position(p.latitude, p.longitude, p.altitude);
    let direction_frame = match shared.settings.direction {
        DirectionMode::Isotropic => protocol::encode_direction(true, f32::NAN, f32::NAN),
        DirectionMode::Fixed { azimuth, elevation } => {
            protocol::encode_direction(false, azimuth, elevation)
        }
    };
    if let Some(c) = shared.clients.iter_mut().find(|c| c.peer_addr() == to) {
        if c.send_frame(&position_frame) {
            shared.counters.bytes_transmitted += position_frame.len() as u64;
        }
        if c.send_frame(&direction_frame) {
            shared.counters.bytes_transmitted += direction_frame.len() as u64;
        }
    }
}

/// Read and dispatch inbound traffic for every client.
fn service_clients(shared: &mut ServerShared) {
    for idx in 0..shared.clients.len() {
        if shared.clients[idx].is_closing() {
            continue;
        }
        match shared.clients[idx].read_available() {
            Ok(0) => continue,
            Ok(_) => {
                if let Err(e) = control::process_inbound(shared, idx) {
                    let peer = shared.clients[idx].peer_addr();
                    match e {
                        Error::SocketClosed => {}
                        ref e => log::warn!("disconnecting {}: {}", peer, e),
                    }
                    shared.clients[idx].close();
                }
            }
            Err(Error::SocketClosed) => shared.clients[idx].close(),
            Err(e) => {
                log::warn!(
                    "read error from {}: {}",
                    shared.clients[idx].peer_addr(),
                    e
                );
                shared.clients[idx].close();
            }
        }
    }

    for client in shared.clients.iter_mut() {
        if !client.is_closing() && client.flush().is_err() {
            client.close();
        }
    }
}

/// Enforce per-session time limits.
fn check_deadlines(shared: &mut ServerShared) {
    let now = Instant::now();
    let expired: Vec<SocketAddr> = shared
        .clients
        .iter()
        .filter(|c| !c.is_closing() && c.deadline.map_or(false, |d| now >= d))
        .map(|c| c.peer_addr())
        .collect();
    for peer in expired {
        log::info!("disconnecting {}: time limit reached", peer);
        control::admin_chat(shared, peer, "Time limit reached.");
        if let Some(c) = shared.clients.iter_mut().find(|c| c.peer_addr() == peer) {
            let _ = c.flush();
            c.close();
        }
    }
}

/// The negotiated stream is no longer valid (rate pinned, bit depth or
/// compression changed): disconnect everyone so they reconnect and
/// renegotiate.
fn restart_stream(shared: &mut ServerShared) {
    log::info!(
        "stream format changed; disconnecting {} client(s) for renegotiation",
        shared.clients.len()
    );
    for client in shared.clients.iter_mut() {
        client.close();
    }
    shared.restart_pending = false;
}

/// Remove closed sessions and promote queued ones.
pub(crate) fn reap(shared: &mut ServerShared) {
    let mut removed = false;
    let mut idx = 0;
    while idx < shared.clients.len() {
        if shared.clients[idx].is_closing() {
            let session = shared.clients.remove(idx);
            removed = true;
            let clients = shared.clients.len();
            log::debug!("client {} disconnected", session.peer_addr());
            let _ = shared.events.try_send(ServerEvent::ClientDisconnected {
                addr: session.peer_addr(),
                clients,
            });
        } else {
            idx += 1;
        }
    }
    if removed {
        rebalance(shared);
    }
}

/// Recompute admission states after a roster or limit change: the first
/// `max_clients` sessions are Active, the rest are Queued with
/// contiguous positions. Newly promoted sessions get their time-limit
/// deadline armed; sessions whose queue position changed are told.
pub(crate) fn rebalance(shared: &mut ServerShared) {
    let max_clients = shared.settings.max_clients;
    let time_limit = shared.settings.time_limit;

    let mut notifications: Vec<(SocketAddr, usize)> = Vec::new();
    let mut slot = 0usize;
    let mut position = 0usize;
    for client in shared.clients.iter_mut() {
        if client.is_closing() {
            continue;
        }
        if slot < max_clients {
            if !client.is_active() {
                client.state = AdmissionState::Active;
                client.deadline = time_limit.map(|limit| Instant::now() + limit);
            } else if time_limit.is_none() {
                client.deadline = None;
            } else if client.deadline.is_none() {
                client.deadline = time_limit.map(|limit| Instant::now() + limit);
            }
        } else {
            position += 1;
            let new_state = AdmissionState::Queued(position);
            if client.state != new_state {
                client.state = new_state;
                notifications.push((client.peer_addr(), position));
            }
        }
        slot += 1;
    }

    for (peer, position) in notifications {
        control::admin_chat(
            shared,
            peer,
            &format!("Server busy. You are number {} in the queue.", position),
        );
    }
}
