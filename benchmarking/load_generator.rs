//! Throughput benchmark against a running `echo_server` instance.
//!
//! The library itself never gains a client-mode API (SPEC_FULL.md §1
//! non-goals), so this benchmark hand-rolls the handshake and masked frame
//! writes it needs, the same way the integration tests do.

use std::time::{Duration, Instant};

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const CONNECTION_COUNT: usize = 100;
const MESSAGE_COUNT: usize = 1000;
const MESSAGE_SIZE: usize = 16 * 1024;

#[tokio::main]
async fn main() {
    let (tx, mut rx) = mpsc::unbounded_channel();

    for _ in 0..CONNECTION_COUNT {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut stream = TcpStream::connect("127.0.0.1:9000").await.unwrap();
            handshake(&mut stream).await;

            let payload = vec![b'a'; MESSAGE_SIZE];
            let start = Instant::now();

            for _ in 0..MESSAGE_COUNT {
                write_masked_frame(&mut stream, 0x1, &payload).await;
                read_one_frame(&mut stream).await;
            }

            tx.send(start.elapsed()).unwrap();
        });
    }
    drop(tx);

    let mut total_duration = Duration::new(0, 0);
    let mut completed = 0;
    while let Some(duration) = rx.recv().await {
        total_duration += duration;
        completed += 1;
    }

    let avg_latency = total_duration / (completed as u32 * MESSAGE_COUNT as u32);
    println!("{completed} connections completed, average per-message latency: {avg_latency:?}");
}

async fn handshake(stream: &mut TcpStream) {
    let key = BASE64_STANDARD.encode(rand::thread_rng().gen::<[u8; 16]>());
    let request = format!(
        "GET / HTTP/1.1\r\n\
         Host: 127.0.0.1:9000\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Origin: http://127.0.0.1:9000\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = vec![0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await.unwrap();
        if buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
}

async fn write_masked_frame(stream: &mut TcpStream, opcode: u8, payload: &[u8]) {
    let key: [u8; 4] = rand::thread_rng().gen();
    let mut frame = vec![0x80 | opcode];
    let len = payload.len();
    if len <= 125 {
        frame.push(0x80 | len as u8);
    } else if len <= 65535 {
        frame.push(0x80 | 126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(0x80 | 127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }
    frame.extend_from_slice(&key);
    for (i, byte) in payload.iter().enumerate() {
        frame.push(byte ^ key[i % 4]);
    }
    stream.write_all(&frame).await.unwrap();
}

async fn read_one_frame(stream: &mut TcpStream) {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.unwrap();
    let len7 = header[1] & 0x7F;
    let len = match len7 {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).await.unwrap();
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).await.unwrap();
            u64::from_be_bytes(ext) as usize
        }
        n => n as usize,
    };
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
}
