//! Remote IQ server: listener, per-client sessions, DSP sink and
//! control plane.
//!
//! Two threads cooperate: the DSP thread calls [`RemoteSink::feed`] with
//! baseband blocks, and a network thread owns the listening socket and
//! every client socket. They share one mutex over [`ServerShared`]; the
//! DSP thread takes it per block, the network thread per event.

pub mod control;
pub mod listener;
pub mod session;
pub mod sink;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::config::ServerSettings;
use crate::device::{DeviceControl, DeviceState};
use crate::dsp::Complex;
use crate::error::Result;
use crate::metrics::{BandwidthMeter, BandwidthReport, Counters};
use session::ClientSession;
use sink::{Compressor, DspState};

/// Events surfaced to the embedding application.
#[derive(Debug)]
pub enum ServerEvent {
    ClientConnected { addr: SocketAddr, clients: usize },
    ClientDisconnected { addr: SocketAddr, clients: usize },
    Chat {
        from: SocketAddr,
        callsign: String,
        text: String,
        broadcast: bool,
    },
    Bandwidth(BandwidthReport),
    Warning(String),
}

/// State shared between the DSP and network threads.
pub(crate) struct ServerShared {
    pub settings: ServerSettings,
    pub clients: Vec<ClientSession>,
    pub compressor: Compressor,
    pub dsp: DspState,
    pub device: Box<dyn DeviceControl>,
    pub last_device_state: DeviceState,
    pub counters: Counters,
    pub meter: BandwidthMeter,
    pub events: Sender<ServerEvent>,
    /// Set when a change invalidates the negotiated stream; the network
    /// thread then disconnects every client so they renegotiate.
    pub restart_pending: bool,
    pub local_addr: Option<SocketAddr>,
}

impl ServerShared {
    /// Outbound budget per client: two seconds of wire data, with a
    /// floor for slow channels.
    pub fn write_budget(&self) -> usize {
        let bps = self.settings.channel_sample_rate as usize
            * crate::convert::bytes_per_iq_pair(self.settings.sample_bits);
        (2 * bps).max(256 * 1024)
    }
}

/// The server half: owns the shared state and the network thread.
pub struct RemoteSink {
    shared: Arc<Mutex<ServerShared>>,
    running: Arc<AtomicBool>,
    net_thread: Option<JoinHandle<()>>,
}

impl RemoteSink {
    /// `input_rate` is the rate of the baseband blocks later passed to
    /// [`feed`]. Settings must have passed
    /// [`ServerSettings::validate`].
    pub fn new(
        settings: ServerSettings,
        device: Box<dyn DeviceControl>,
        input_rate: u32,
    ) -> (RemoteSink, Receiver<ServerEvent>) {
        let (tx, rx) = bounded(1024);
        let (compressor, demoted) = Compressor::build(&settings);
        if let Some(msg) = demoted {
            log::warn!("{}", msg);
            let _ = tx.try_send(ServerEvent::Warning(msg));
        }
        let dsp = DspState::new(&settings, input_rate);
        let last_device_state = device.state();
        let shared = ServerShared {
            settings,
            clients: Vec::new(),
            compressor,
            dsp,
            device,
            last_device_state,
            counters: Counters::default(),
            meter: BandwidthMeter::new(),
            events: tx,
            restart_pending: false,
            local_addr: None,
        };
        (
            RemoteSink {
                shared: Arc::new(Mutex::new(shared)),
                running: Arc::new(AtomicBool::new(false)),
                net_thread: None,
            },
            rx,
        )
    }

    /// Bind the listener and start the network thread.
    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let listeners = {
            let shared = self.shared.lock();
            listener::bind(&shared.settings)?
        };
        self.shared.lock().local_addr = Some(listeners.local_addr());
        self.running.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        let running = self.running.clone();
        self.net_thread = Some(std::thread::spawn(move || {
            listener::run(shared, running, listeners);
        }));
        Ok(())
    }

    /// The local address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.lock().local_addr
    }

    /// Feed one block of baseband samples from the DSP thread.
    pub fn feed(&self, input: &[Complex]) {
        sink::feed(&mut self.shared.lock(), input);
    }

    /// Reconfigure for a new baseband input rate.
    pub fn set_input_rate(&self, input_rate: u32) {
        let mut shared = self.shared.lock();
        let settings = shared.settings.clone();
        shared.dsp.set_input_rate(&settings, input_rate);
    }

    /// Apply new settings; diffs propagate to the DSP state, the
    /// compressor, connected clients, or force a restart as needed.
    pub fn update_settings(&self, new: ServerSettings) {
        control::apply_settings(&mut self.shared.lock(), new);
    }

    /// Send a chat message from the station operator to every client.
    pub fn broadcast_chat(&self, text: &str) {
        let mut shared = self.shared.lock();
        let callsign = shared.settings.callsign.clone();
        control::server_chat(&mut shared, &callsign, text);
    }

    pub fn client_count(&self) -> usize {
        self.shared.lock().clients.len()
    }

    /// Snapshot of the capture device state (as the control plane and
    /// change detector see it).
    pub fn device_state(&self) -> DeviceState {
        self.shared.lock().device.state()
    }

    /// Average and peak channel power since the last call.
    pub fn power_levels(&self) -> (f64, f64, u64) {
        self.shared.lock().dsp.power_levels()
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(t) = self.net_thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for RemoteSink {
    fn drop(&mut self) {
        self.stop();
    }
}
