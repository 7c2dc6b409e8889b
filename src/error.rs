//! Common error type for the streaming core.

use std::fmt;
use std::io;

/// Errors raised by the protocol codec, server and client.
#[derive(Debug)]
pub enum Error {
    /// Malformed or short frame; the protocol has no resync point.
    Truncated,
    /// Opcode byte not assigned by the protocol.
    UnknownOpcode(u8),
    /// Missing or invalid TLS certificate/key material.
    TlsConfig(String),
    /// Could not bind the listen socket.
    BindFailed(io::Error),
    /// Peer closed the connection. Normal termination, not a fault.
    SocketClosed,
    /// Compressor could not be constructed; session is demoted to raw.
    CompressorInit(String),
    /// Compressor failed mid-stream; encoder state is reset, block dropped.
    CompressorRuntime(String),
    /// Peer exceeded its allowed rate or time budget.
    RateLimited,
    /// Peer address is on the IP blacklist.
    Blacklisted,
    /// No queue slot available for a new session.
    QueueFull,
    /// Received data did not match the negotiated stream format.
    DecodeMismatch(String),
    /// Underlying socket error other than an orderly close.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Truncated => write!(f, "truncated frame"),
            Error::UnknownOpcode(op) => write!(f, "unknown opcode 0x{:02x}", op),
            Error::TlsConfig(msg) => write!(f, "TLS configuration error: {}", msg),
            Error::BindFailed(e) => write!(f, "failed to bind listen socket: {}", e),
            Error::SocketClosed => write!(f, "socket closed"),
            Error::CompressorInit(msg) => write!(f, "compressor init failed: {}", msg),
            Error::CompressorRuntime(msg) => write!(f, "compressor error: {}", msg),
            Error::RateLimited => write!(f, "rate limited"),
            Error::Blacklisted => write!(f, "address is blacklisted"),
            Error::QueueFull => write!(f, "connection queue is full"),
            Error::DecodeMismatch(msg) => write!(f, "stream decode mismatch: {}", msg),
            Error::Io(e) => write!(f, "socket error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Error::SocketClosed,
            _ => Error::Io(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
