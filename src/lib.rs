//! Remote IQ streaming over TCP or secure WebSocket.
//!
//! A server/client pair that exposes an SDR front-end across a network
//! link. The wire protocol is rtl_tcp compatible, with the extended
//! SDRA variant (device state, channel selection, squelch, chat,
//! antenna geometry) and spy-server support on the client side.
//!
//! - [`server::RemoteSink`]: down-converts, gain-adjusts, optionally
//!   squelches and compresses a baseband stream, and multicasts it to
//!   admitted clients with queueing, time limits and an IP blacklist.
//! - [`client::RemoteClient`]: connects, negotiates metadata,
//!   decompresses and widens samples back to the local fixed point,
//!   and feeds a jitter-buffered FIFO with replay history.

pub mod client;
pub mod codec;
pub mod config;
pub mod convert;
pub mod device;
pub mod dsp;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod server;

pub use client::{ClientEvent, RemoteClient};
pub use config::{ClientSettings, ServerProtocol, ServerSettings};
pub use error::{Error, Result};
pub use server::{RemoteSink, ServerEvent};
