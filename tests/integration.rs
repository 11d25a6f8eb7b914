//! End-to-end scenarios driven against a real `TcpListener`-bound server,
//! matching the six literal scenarios in SPEC_FULL.md §8.

use std::time::Duration;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use topicsocket::{start_server_with_config, ServerEvent};

async fn connect_and_handshake(addr: std::net::SocketAddr, path: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let key = BASE64_STANDARD.encode(rand::thread_rng().gen::<[u8; 16]>());
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: 127.0.0.1\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Origin: http://127.0.0.1\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = vec![0u8; 4096];
    let mut total = 0;
    loop {
        let n = stream.read(&mut buf[total..]).await.unwrap();
        total += n;
        if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    assert!(buf.starts_with(b"HTTP/1.1 101"));
    stream
}

fn write_masked_frame_bytes(opcode: u8, fin: bool, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
    let mut frame = vec![(if fin { 0x80 } else { 0x00 }) | opcode];
    let len = payload.len();
    if len <= 125 {
        frame.push(0x80 | len as u8);
    } else {
        frame.push(0x80 | 126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    }
    frame.extend_from_slice(&key);
    for (i, byte) in payload.iter().enumerate() {
        frame.push(byte ^ key[i % 4]);
    }
    frame
}

async fn read_frame_header_and_payload(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.unwrap();
    let opcode = header[0] & 0x0F;
    let len7 = header[1] & 0x7F;
    let len = match len7 {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).await.unwrap();
            u16::from_be_bytes(ext) as usize
        }
        n => n as usize,
    };
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    (opcode, payload)
}

#[tokio::test]
async fn small_text_echo_round_trips_through_the_configured_topic() {
    let (facade, mut events) = start_server_with_config("127.0.0.1:19001", Default::default())
        .await
        .unwrap();

    let mut stream = connect_and_handshake("127.0.0.1:19001".parse().unwrap(), "/chat").await;

    let id = match events.recv().await.unwrap() {
        ServerEvent::Open { id } => id,
        other => panic!("expected open, got {other:?}"),
    };

    // Literal bytes from SPEC_FULL.md §8 scenario 2: masked "Hello".
    let wire = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
    stream.write_all(&wire).await.unwrap();

    match events.recv().await.unwrap() {
        ServerEvent::Message { topic, message, .. } => {
            assert_eq!(topic, "/chat");
            assert_eq!(message, topicsocket::Message::Text("Hello".into()));
        }
        other => panic!("expected a message event, got {other:?}"),
    }

    let _ = facade.close(id).await;
}

#[tokio::test]
async fn fragmented_text_reassembles_before_emitting() {
    let (_facade, mut events) = start_server_with_config("127.0.0.1:19002", Default::default())
        .await
        .unwrap();
    let mut stream = connect_and_handshake("127.0.0.1:19002".parse().unwrap(), "/").await;
    let _ = events.recv().await.unwrap(); // open

    stream
        .write_all(&write_masked_frame_bytes(0x1, false, b"A", [1, 2, 3, 4]))
        .await
        .unwrap();
    stream
        .write_all(&write_masked_frame_bytes(0x0, true, b"B", [5, 6, 7, 8]))
        .await
        .unwrap();

    match events.recv().await.unwrap() {
        ServerEvent::Message { topic, message, .. } => {
            assert_eq!(topic, "message");
            assert_eq!(message, topicsocket::Message::Text("AB".into()));
        }
        other => panic!("expected a message event, got {other:?}"),
    }
}

#[tokio::test]
async fn oversize_message_closes_with_1009() {
    let mut config = topicsocket::config::Config::default();
    config.set_max_payload(4);
    let (_facade, mut events) = start_server_with_config("127.0.0.1:19003", config).await.unwrap();
    let mut stream = connect_and_handshake("127.0.0.1:19003".parse().unwrap(), "/").await;
    let _ = events.recv().await.unwrap(); // open

    stream
        .write_all(&write_masked_frame_bytes(0x1, true, b"Hello", [9, 9, 9, 9]))
        .await
        .unwrap();

    match events.recv().await.unwrap() {
        ServerEvent::Close { reason, .. } => assert_eq!(reason.code, 1009),
        other => panic!("expected a close event, got {other:?}"),
    }
}

#[tokio::test]
async fn per_ip_cap_rejects_with_429() {
    let mut config = topicsocket::config::Config::default();
    config.set_limit_by_ip(1);
    let (_facade, mut events) = start_server_with_config("127.0.0.1:19004", config).await.unwrap();

    let _first = connect_and_handshake("127.0.0.1:19004".parse().unwrap(), "/").await;
    let _ = events.recv().await.unwrap(); // open

    let mut second = TcpStream::connect("127.0.0.1:19004").await.unwrap();
    let key = BASE64_STANDARD.encode(rand::thread_rng().gen::<[u8; 16]>());
    let request = format!(
        "GET / HTTP/1.1\r\n\
         Host: 127.0.0.1\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Origin: http://127.0.0.1\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    second.write_all(request.as_bytes()).await.unwrap();

    let mut buf = vec![0u8; 256];
    let n = second.read(&mut buf).await.unwrap();
    assert!(buf[..n].starts_with(b"HTTP/1.1 429"));
}

#[tokio::test(start_paused = true)]
async fn unanswered_ping_closes_with_1011() {
    let mut config = topicsocket::config::Config::default();
    config.set_ping_delay_ms(50);
    config.set_pong_timeout_ms(100);
    let (_facade, mut events) = start_server_with_config("127.0.0.1:19005", config).await.unwrap();

    let mut stream = connect_and_handshake("127.0.0.1:19005".parse().unwrap(), "/").await;
    let _ = events.recv().await.unwrap(); // open

    // Cross the 50ms ping interval; the periodic task writes an outbound
    // ping and arms the 100ms pong deadline.
    tokio::time::advance(Duration::from_millis(60)).await;
    let _ = read_frame_header_and_payload(&mut stream).await;

    // Never answer it: cross the pong deadline too.
    tokio::time::advance(Duration::from_millis(110)).await;

    match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
        Ok(Some(ServerEvent::Close { reason, .. })) => assert_eq!(reason.code, 1011),
        other => panic!("expected a 1011 close event, got {other:?}"),
    }
}
