//! End-to-end scenarios over localhost sockets: handshakes, admission,
//! chat routing, header replay and the full client pipeline.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use sdra_stream::codec::flac::FlacStreamDecoder;
use sdra_stream::codec::Compression;
use sdra_stream::config::{ClientSettings, ServerProtocol, ServerSettings};
use sdra_stream::convert::{quantize_pair_signed, LocalWidth, FULL_SCALE};
use sdra_stream::device::TestDevice;
use sdra_stream::dsp::Complex;
use sdra_stream::protocol::{self, Command, Device};
use sdra_stream::server::{RemoteSink, ServerEvent};
use sdra_stream::{ClientEvent, RemoteClient};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

fn start_server(
    settings: ServerSettings,
    device: TestDevice,
) -> (
    RemoteSink,
    SocketAddr,
    crossbeam_channel::Receiver<ServerEvent>,
) {
    let rate = settings.channel_sample_rate;
    let (mut sink, events) = RemoteSink::new(settings, Box::new(device), rate);
    sink.start().expect("server start");
    let addr = sink.local_addr().expect("bound address");
    (sink, addr, events)
}

fn test_settings() -> ServerSettings {
    ServerSettings {
        listen_address: "127.0.0.1".parse().unwrap(),
        listen_port: 0,
        callsign: "TEST".into(),
        ..Default::default()
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

fn read_exact_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).expect("read");
    buf
}

/// Read one `{opcode, length, body}` frame.
fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let header = read_exact_n(stream, 5);
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    (header[0], read_exact_n(stream, len))
}

/// Read frames until the given opcode shows up.
fn read_frame_of_kind(stream: &mut TcpStream, opcode: u8) -> Vec<u8> {
    for _ in 0..32 {
        let (op, body) = read_frame(stream);
        if op == opcode {
            return body;
        }
    }
    panic!("frame 0x{:02x} never arrived", opcode);
}

fn no_data_within(stream: &mut TcpStream, window: Duration) -> bool {
    stream.set_read_timeout(Some(window)).unwrap();
    let mut byte = [0u8; 1];
    let quiet = matches!(
        stream.read(&mut byte),
        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock
            || e.kind() == std::io::ErrorKind::TimedOut
    );
    stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
    quiet
}

#[test]
fn rtl0_handshake_is_byte_exact() {
    let settings = ServerSettings {
        protocol: ServerProtocol::Rtl0,
        sample_bits: 8,
        ..test_settings()
    };
    let (_sink, addr, _events) = start_server(settings, TestDevice::new(Device::RtlsdrR820t));

    let mut stream = connect(addr);
    let meta = read_exact_n(&mut stream, 12);
    assert_eq!(
        meta,
        [0x52, 0x54, 0x4C, 0x30, 0x00, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x01]
    );
    let decoded = protocol::Rtl0Metadata::decode(&meta).unwrap();
    assert_eq!(decoded.device.name(), "R820T");
}

#[test]
fn sdra_metadata_reflects_the_negotiated_state() {
    let settings = ServerSettings {
        channel_sample_rate: 96_000,
        sample_bits: 24,
        ..test_settings()
    };
    let (_sink, addr, _events) = start_server(settings, TestDevice::default());

    let mut stream = connect(addr);
    let meta = read_exact_n(&mut stream, 128);
    let decoded = protocol::SdraMetadata::decode(&meta).unwrap();
    assert_eq!(decoded.channel_sample_rate, 96_000);
    assert_eq!(decoded.sample_bits, 24);
    assert_eq!(decoded.device, Device::TestSource);
    assert!(decoded.flags.remote_control);
}

#[test]
fn queue_positions_and_promotion() {
    let settings = ServerSettings {
        max_clients: 2,
        ..test_settings()
    };
    let (_sink, addr, _events) = start_server(settings, TestDevice::default());

    let mut c1 = connect(addr);
    read_exact_n(&mut c1, 128);
    let mut c2 = connect(addr);
    read_exact_n(&mut c2, 128);
    let mut c3 = connect(addr);
    read_exact_n(&mut c3, 128);

    // Third client is over the limit: queued at position 1
    let (op, body) = read_frame(&mut c3);
    assert_eq!(op, Command::SendMessage as u8);
    let (broadcast, callsign, text) = protocol::decode_chat(&body).unwrap();
    assert!(!broadcast);
    assert_eq!(callsign, "TEST");
    assert!(text.contains("number 1 in the queue"), "got: {}", text);

    // First client leaves; the queued client is promoted silently
    drop(c1);
    std::thread::sleep(Duration::from_millis(200));
    assert!(no_data_within(&mut c3, Duration::from_millis(300)));

    // A new connection lands back in the queue at position 1
    let mut c4 = connect(addr);
    read_exact_n(&mut c4, 128);
    let (op, body) = read_frame(&mut c4);
    assert_eq!(op, Command::SendMessage as u8);
    let (_, _, text) = protocol::decode_chat(&body).unwrap();
    assert!(text.contains("number 1 in the queue"));
}

#[test]
fn lowering_max_clients_requeues_the_newest_session() {
    let settings = ServerSettings {
        max_clients: 2,
        ..test_settings()
    };
    let (sink, addr, _events) = start_server(settings.clone(), TestDevice::default());

    let mut c1 = connect(addr);
    read_exact_n(&mut c1, 128);
    let mut c2 = connect(addr);
    read_exact_n(&mut c2, 128);

    sink.update_settings(ServerSettings {
        max_clients: 1,
        ..settings
    });

    let (op, body) = read_frame(&mut c2);
    assert_eq!(op, Command::SendMessage as u8);
    let (_, _, text) = protocol::decode_chat(&body).unwrap();
    assert!(text.contains("number 1 in the queue"));
}

#[test]
fn blacklisted_peer_is_notified_and_dropped() {
    let settings = ServerSettings {
        compression: Compression::Zlib,
        ip_blacklist: vec!["127.0.0.1".parse().unwrap()],
        ..test_settings()
    };
    let (_sink, addr, _events) = start_server(settings, TestDevice::default());

    let mut stream = connect(addr);
    read_exact_n(&mut stream, 128);
    // Skip position/direction; expect the blacklist notice
    let body = read_frame_of_kind(&mut stream, Command::SendBlacklistedMessage as u8);
    assert!(body.is_empty());
    // Server closes after the notice
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest);
    assert!(rest.is_empty());
}

#[test]
fn time_limited_session_is_told_and_closed() {
    let settings = ServerSettings {
        compression: Compression::Zlib,
        time_limit: Some(Duration::from_millis(300)),
        ..test_settings()
    };
    let (_sink, addr, _events) = start_server(settings, TestDevice::default());

    let mut stream = connect(addr);
    read_exact_n(&mut stream, 128);
    let body = read_frame_of_kind(&mut stream, Command::SendMessage as u8);
    let (_, _, text) = protocol::decode_chat(&body).unwrap();
    assert_eq!(text, "Time limit reached.");
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest);
    assert!(rest.is_empty());
}

#[test]
fn gain_command_reaches_the_device_without_echo() {
    let settings = ServerSettings {
        compression: Compression::Zlib,
        ..test_settings()
    };
    let (sink, addr, _events) = start_server(settings, TestDevice::default());

    let mut stream = connect(addr);
    read_exact_n(&mut stream, 128);
    // Drain the admission-time position/direction frames
    read_frame_of_kind(&mut stream, Command::DataDirection as u8);

    // setTunerGain 300 == 30.0 dB
    stream
        .write_all(&[0x04, 0x00, 0x00, 0x01, 0x2C])
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if sink.device_state().gain[0] == 300 {
            break;
        }
        assert!(Instant::now() < deadline, "gain never applied");
        std::thread::sleep(Duration::from_millis(20));
    }

    // Longer than a change-detector period: no echo may arrive
    assert!(no_data_within(&mut stream, Duration::from_millis(700)));
}

#[test]
fn broadcast_chat_reaches_everyone_but_the_sender() {
    let settings = ServerSettings {
        compression: Compression::Zlib,
        ..test_settings()
    };
    let (_sink, addr, _events) = start_server(settings, TestDevice::default());

    let mut c1 = connect(addr);
    let mut c2 = connect(addr);
    let mut c3 = connect(addr);
    for c in [&mut c1, &mut c2, &mut c3] {
        read_exact_n(c, 128);
        read_frame_of_kind(c, Command::DataDirection as u8);
    }

    let chat = protocol::encode_chat("K1", "hi", true);
    c2.write_all(&chat).unwrap();

    for c in [&mut c1, &mut c3] {
        let body = read_frame_of_kind(c, Command::SendMessage as u8);
        let (broadcast, callsign, text) = protocol::decode_chat(&body).unwrap();
        assert!(broadcast);
        assert_eq!(callsign, "K1");
        assert_eq!(text, "hi");
    }
    assert!(no_data_within(&mut c2, Duration::from_millis(300)));
}

#[test]
fn flac_header_replay_for_late_joiners() {
    let settings = ServerSettings {
        compression: Compression::Flac,
        block_size: 256,
        sample_bits: 16,
        ..test_settings()
    };
    let (sink, addr, _events) = start_server(settings, TestDevice::default());

    let mut a = connect(addr);
    read_exact_n(&mut a, 128);
    let header_a = read_frame_of_kind(&mut a, Command::DataIqFlac as u8);
    assert_eq!(header_a.len(), 93);
    assert_eq!(&header_a[..4], b"fLaC");

    // Stream two blocks while only A is connected
    let ramp: Vec<Complex> = (0..512)
        .map(|k| Complex::new((k * 7 % 4000) as f32 - 2000.0, 2000.0 - (k * 5 % 4000) as f32))
        .collect();
    sink.feed(&ramp);
    read_frame_of_kind(&mut a, Command::DataIqFlac as u8);
    read_frame_of_kind(&mut a, Command::DataIqFlac as u8);

    // B joins late and must get the same header before any frame
    let mut b = connect(addr);
    read_exact_n(&mut b, 128);
    let header_b = read_frame_of_kind(&mut b, Command::DataIqFlac as u8);
    assert_eq!(header_b, header_a);

    // The next block reaches B as a decodable continuation
    let block: Vec<Complex> = (0..256)
        .map(|k| Complex::new((k as f32) * 8.0 - 1024.0, 1024.0 - (k as f32) * 8.0))
        .collect();
    sink.feed(&block);
    let frame = read_frame_of_kind(&mut b, Command::DataIqFlac as u8);

    let (tx, rx) = std::sync::mpsc::channel();
    let mut decoder = FlacStreamDecoder::start(move |samples: &[i32]| {
        for &s in samples {
            let _ = tx.send(s >> 16);
        }
    });
    decoder.push(&header_b);
    decoder.push(&frame);
    decoder.stop();
    let decoded: Vec<i32> = rx.try_iter().collect();
    assert_eq!(decoded.len(), 512);

    let mut matches = 0usize;
    for (k, s) in block.iter().enumerate() {
        let [i, q] = quantize_pair_signed(s.re, s.im, 16);
        if decoded[2 * k] == i && decoded[2 * k + 1] == q {
            matches += 1;
        }
    }
    // FLAC is lossless; every sample of the joined frame must match
    assert_eq!(matches, block.len());
}

#[test]
fn remote_client_streams_samples_end_to_end() {
    let settings = ServerSettings {
        compression: Compression::Zlib,
        block_size: 1024,
        sample_bits: 16,
        ..test_settings()
    };
    let (sink, addr, _events) = start_server(settings, TestDevice::default());

    let client_settings = ClientSettings {
        server_address: "127.0.0.1".into(),
        server_port: addr.port(),
        prefill_seconds: 0.001,
        replay_length_secs: 1.0,
        ..Default::default()
    };
    let (mut client, mut reader, events) = RemoteClient::start(client_settings, LocalWidth::S24);

    // Feed a recognizable constant until the client has produced output
    let block = vec![Complex::new(25_600.0, -25_600.0); 960];
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut out = vec![0i32; 4096];
    let mut got = 0usize;
    while got == 0 {
        assert!(Instant::now() < deadline, "no samples reached the client");
        sink.feed(&block);
        std::thread::sleep(Duration::from_millis(20));
        got = reader.read(&mut out);
    }

    // 16-bit wire value 100, widened to the 24-bit local fixed point
    assert_eq!(out[0], 100 << 8);
    assert_eq!(out[1], -100 << 8);

    let mut connected = false;
    let mut meta = false;
    while let Ok(event) = events.try_recv() {
        match event {
            ClientEvent::Connected => connected = true,
            ClientEvent::MetaReceived(m) => {
                meta = true;
                assert_eq!(m.sample_bits, 16);
                assert_eq!(m.channel_sample_rate, 48_000);
            }
            _ => {}
        }
    }
    assert!(connected);
    assert!(meta);

    // The replay history saw the same stream
    assert!(client.replay().len() > 0);
    client.stop();
}

#[test]
fn raw_sdra_stream_counts_bytes_not_frames() {
    let settings = ServerSettings {
        compression: Compression::None,
        sample_bits: 16,
        ..test_settings()
    };
    let (sink, addr, _events) = start_server(settings, TestDevice::default());

    let mut stream = connect(addr);
    read_exact_n(&mut stream, 128);

    // Raw mode: nothing but IQ bytes after the metadata
    let amplitude = FULL_SCALE * 0.1;
    sink.feed(&vec![Complex::new(amplitude, -amplitude); 100]);
    let bytes = read_exact_n(&mut stream, 400);
    let i = i16::from_le_bytes([bytes[0], bytes[1]]);
    let q = i16::from_le_bytes([bytes[2], bytes[3]]);
    assert_eq!(i as i32, (amplitude / 256.0) as i32);
    assert_eq!(q as i32, -(amplitude / 256.0) as i32);
}
