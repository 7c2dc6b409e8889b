//! Remote IQ client: connection handler, sample FIFO and replay
//! history.

pub mod fifo;
mod handler;
pub mod replay;

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::config::ClientSettings;
use crate::convert::LocalWidth;
use crate::metrics::BufferReport;
use crate::protocol::{Device, SdraMetadata};

pub use fifo::{sample_fifo, SampleReader, SampleWriter, DEFAULT_FIFO_PAIRS};
pub use replay::ReplayBuffer;

use handler::{ControlMsg, Handler};

/// Events surfaced to the embedding application.
#[derive(Debug)]
pub enum ClientEvent {
    Connected,
    Disconnected { reason: String },
    RemoteDevice { device: Device, protocol: String },
    MetaReceived(SdraMetadata),
    SettingsChanged(ClientSettings),
    Chat {
        callsign: String,
        text: String,
        broadcast: bool,
    },
    Blacklisted,
    Position {
        latitude: f32,
        longitude: f32,
        altitude: f32,
    },
    Direction {
        isotropic: bool,
        azimuth: f32,
        elevation: f32,
    },
    Buffer(BufferReport),
}

/// The client half: owns the handler thread. Samples come out of the
/// [`SampleReader`] returned by [`RemoteClient::start`]; everything
/// else is events.
pub struct RemoteClient {
    ctrl: Sender<ControlMsg>,
    thread: Option<JoinHandle<()>>,
    replay: Arc<ReplayBuffer<i32>>,
}

impl RemoteClient {
    /// Connect (and keep reconnecting) to the configured server.
    /// `local_width` selects the fixed point the downstream DSP runs
    /// at.
    pub fn start(
        settings: ClientSettings,
        local_width: LocalWidth,
    ) -> (RemoteClient, SampleReader, Receiver<ClientEvent>) {
        let (events_tx, events_rx) = bounded(1024);
        let (ctrl_tx, ctrl_rx) = unbounded();
        let (writer, reader) = sample_fifo(DEFAULT_FIFO_PAIRS);
        let replay = Arc::new(if settings.replay_length_secs > 0.0 {
            ReplayBuffer::for_duration(settings.replay_length_secs, settings.channel_sample_rate)
        } else {
            ReplayBuffer::new(2)
        });

        let handler = Handler::new(
            settings,
            local_width,
            events_tx,
            ctrl_rx,
            writer,
            replay.clone(),
        );
        let thread = std::thread::spawn(move || handler.run());

        (
            RemoteClient {
                ctrl: ctrl_tx,
                thread: Some(thread),
                replay,
            },
            reader,
            events_rx,
        )
    }

    /// Send a chat message to the server operator (or all clients when
    /// `broadcast` is set).
    pub fn send_chat(&self, text: &str, broadcast: bool) {
        let _ = self.ctrl.send(ControlMsg::SendChat {
            text: text.to_string(),
            broadcast,
        });
    }

    /// Apply new settings; the handler diffs them and sends the
    /// corresponding commands.
    pub fn update_settings(&self, settings: ClientSettings) {
        let _ = self.ctrl.send(ControlMsg::Apply(settings));
    }

    /// The replay history fed alongside the live FIFO.
    pub fn replay(&self) -> &Arc<ReplayBuffer<i32>> {
        &self.replay
    }

    pub fn stop(&mut self) {
        let _ = self.ctrl.send(ControlMsg::Stop);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        self.stop();
    }
}
