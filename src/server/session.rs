//! Per-client connection state on the server.
//!
//! A session wraps either a plain TCP socket or a WebSocket-over-TLS
//! connection behind one non-blocking byte interface. Outbound data goes
//! through a bounded pending-write budget: a frame that does not fit is
//! dropped whole, never split, so the byte stream a client observes
//! stays aligned on frame boundaries.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Instant;

use rustls::{ServerConnection, StreamOwned};
use tungstenite::{Message, WebSocket};

use crate::error::{Error, Result};

pub type WssStream = WebSocket<StreamOwned<ServerConnection, TcpStream>>;

pub enum ClientStream {
    Tcp(TcpStream),
    Wss(Box<WssStream>),
}

/// Admission state of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionState {
    /// Receives IQ payload.
    Active,
    /// Connected, administrative messages only. Position is 1-based.
    Queued(usize),
    /// Scheduled for removal on the next reap.
    Closing,
}

pub struct ClientSession {
    stream: ClientStream,
    peer: SocketAddr,
    pub state: AdmissionState,
    /// Armed when the session becomes Active and a time limit is set.
    pub deadline: Option<Instant>,
    /// Whether this client has been sent the current FLAC stream header.
    pub flac_header_sent: bool,
    /// Inbound command bytes awaiting a complete message.
    pub inbuf: Vec<u8>,
    pending: VecDeque<u8>,
    budget: usize,
    pub frames_dropped: u64,
}

impl ClientSession {
    pub fn from_tcp(stream: TcpStream, budget: usize) -> Result<ClientSession> {
        let peer = stream.peer_addr()?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(ClientSession {
            stream: ClientStream::Tcp(stream),
            peer,
            state: AdmissionState::Closing, // listener assigns on admit
            deadline: None,
            flac_header_sent: false,
            inbuf: Vec::new(),
            pending: VecDeque::new(),
            budget,
            frames_dropped: 0,
        })
    }

    /// Wrap a completed WSS handshake. The websocket's own write buffer
    /// is the pending budget in this mode.
    pub fn from_wss(ws: WssStream, peer: SocketAddr, budget: usize) -> Result<ClientSession> {
        ws.get_ref().sock.set_nonblocking(true)?;
        Ok(ClientSession {
            stream: ClientStream::Wss(Box::new(ws)),
            peer,
            state: AdmissionState::Closing,
            deadline: None,
            flac_header_sent: false,
            inbuf: Vec::new(),
            pending: VecDeque::new(),
            budget,
            frames_dropped: 0,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_active(&self) -> bool {
        self.state == AdmissionState::Active
    }

    pub fn is_closing(&self) -> bool {
        self.state == AdmissionState::Closing
    }

    /// Queue one whole frame for transmission. Returns false when the
    /// pending budget cannot take it; the frame is then dropped, not
    /// truncated.
    pub fn send_frame(&mut self, bytes: &[u8]) -> bool {
        match &mut self.stream {
            ClientStream::Tcp(_) => {
                if self.pending.len() + bytes.len() > self.budget {
                    self.frames_dropped += 1;
                    return false;
                }
                self.pending.extend(bytes);
                true
            }
            ClientStream::Wss(ws) => match ws.write(Message::binary(bytes.to_vec())) {
                Ok(()) => true,
                Err(tungstenite::Error::WriteBufferFull(_)) => {
                    self.frames_dropped += 1;
                    true // connection still healthy, frame dropped
                }
                Err(tungstenite::Error::Io(ref e))
                    if e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    true
                }
                Err(_) => false,
            },
        }
    }

    /// Push pending bytes into the socket without blocking. Returns the
    /// number of bytes that left the pending buffer.
    pub fn flush(&mut self) -> Result<usize> {
        match &mut self.stream {
            ClientStream::Tcp(sock) => {
                let mut written = 0;
                while !self.pending.is_empty() {
                    let (head, _) = self.pending.as_slices();
                    match sock.write(head) {
                        Ok(0) => return Err(Error::SocketClosed),
                        Ok(n) => {
                            self.pending.drain(..n);
                            written += n;
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(written)
            }
            ClientStream::Wss(ws) => match ws.flush() {
                Ok(()) => Ok(0),
                Err(tungstenite::Error::Io(ref e))
                    if e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    Ok(0)
                }
                Err(tungstenite::Error::ConnectionClosed)
                | Err(tungstenite::Error::AlreadyClosed) => Err(Error::SocketClosed),
                Err(e) => Err(Error::DecodeMismatch(format!("websocket: {}", e))),
            },
        }
    }

    /// Drain everything the socket currently has into `inbuf`.
    pub fn read_available(&mut self) -> Result<usize> {
        let mut total = 0;
        match &mut self.stream {
            ClientStream::Tcp(sock) => {
                let mut buf = [0u8; 4096];
                loop {
                    match sock.read(&mut buf) {
                        Ok(0) => {
                            return if total > 0 {
                                Ok(total)
                            } else {
                                Err(Error::SocketClosed)
                            }
                        }
                        Ok(n) => {
                            self.inbuf.extend_from_slice(&buf[..n]);
                            total += n;
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            ClientStream::Wss(ws) => loop {
                match ws.read() {
                    Ok(Message::Binary(data)) => {
                        self.inbuf.extend_from_slice(&data);
                        total += data.len();
                    }
                    Ok(Message::Close(_)) => return Err(Error::SocketClosed),
                    Ok(_) => {}
                    Err(tungstenite::Error::Io(ref e))
                        if e.kind() == std::io::ErrorKind::WouldBlock =>
                    {
                        break
                    }
                    Err(tungstenite::Error::ConnectionClosed)
                    | Err(tungstenite::Error::AlreadyClosed) => return Err(Error::SocketClosed),
                    Err(e) => {
                        return Err(Error::DecodeMismatch(format!("websocket: {}", e)))
                    }
                }
            },
        }
        Ok(total)
    }

    /// Orderly close. Safe to call more than once.
    pub fn close(&mut self) {
        self.state = AdmissionState::Closing;
        match &mut self.stream {
            ClientStream::Tcp(sock) => {
                let _ = sock.shutdown(Shutdown::Both);
            }
            ClientStream::Wss(ws) => {
                let _ = ws.close(None);
                let _ = ws.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    #[test]
    fn frames_are_dropped_whole_when_over_budget() {
        let (_peer, server_side) = socket_pair();
        let mut session = ClientSession::from_tcp(server_side, 10).unwrap();
        assert!(session.send_frame(&[1, 2, 3, 4, 5, 6]));
        assert!(!session.send_frame(&[7; 6])); // would exceed 10
        assert_eq!(session.frames_dropped, 1);
        assert!(session.send_frame(&[8, 9])); // small frame still fits
    }

    #[test]
    fn flush_moves_bytes_to_the_peer() {
        let (mut peer, server_side) = socket_pair();
        let mut session = ClientSession::from_tcp(server_side, 1024).unwrap();
        assert!(session.send_frame(b"hello"));
        session.flush().unwrap();

        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn read_available_collects_inbound_bytes() {
        let (mut peer, server_side) = socket_pair();
        let mut session = ClientSession::from_tcp(server_side, 1024).unwrap();
        peer.write_all(&[1, 2, 3]).unwrap();
        // Give the loopback a moment
        std::thread::sleep(std::time::Duration::from_millis(20));
        session.read_available().unwrap();
        assert_eq!(session.inbuf, vec![1, 2, 3]);
    }

    #[test]
    fn closed_peer_reports_socket_closed() {
        let (peer, server_side) = socket_pair();
        let mut session = ClientSession::from_tcp(server_side, 1024).unwrap();
        drop(peer);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(matches!(session.read_available(), Err(Error::SocketClosed)));
    }

    #[test]
    fn close_is_idempotent() {
        let (_peer, server_side) = socket_pair();
        let mut session = ClientSession::from_tcp(server_side, 16).unwrap();
        session.close();
        session.close();
        assert!(session.is_closing());
    }
}
