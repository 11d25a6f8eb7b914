//! The narrow transport interface the engine consumes (SPEC_FULL.md §2,
//! component 8). The real TCP/TLS plumbing is out of scope (SPEC_FULL.md
//! §1) — this module only wraps *some* `AsyncRead + AsyncWrite` half-pair
//! with the bookkeeping the spec's `ClientRecord.transport` needs: byte
//! counters, a pause flag, and the peer address.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll, Waker};

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use crate::frame::{self, OpCode};

/// `readyState` proxy value (SPEC_FULL.md §4.7). There is no `Connecting`
/// state because a `ClientTransport` is only ever built after the handshake
/// has already completed, and no `Closed` state because once the transport
/// is torn down its `ClientRecord` is gone from the registry too — callers
/// see `FacadeError::NotFound` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Open,
    Closing,
}

/// Byte counters and pause state shared between the read and write halves of
/// one connection.
#[derive(Default)]
pub(crate) struct Counters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    paused: AtomicBool,
    closing: AtomicBool,
    parked_reader: StdMutex<Option<Waker>>,
}

impl Counters {
    fn wake_parked_reader(&self) {
        if let Some(waker) = self.parked_reader.lock().unwrap().take() {
            waker.wake();
        }
    }
}

/// A half-socket wrapper used for outbound writes plus transport inspection.
///
/// Holds only the write half plus shared counters; [`crate::connection`]
/// owns the read half directly since it never needs to share it.
pub struct ClientTransport {
    write_half: Option<tokio::net::tcp::OwnedWriteHalf>,
    counters: Arc<Counters>,
    peer_addr: SocketAddr,
}

impl ClientTransport {
    pub fn new(stream: TcpStream) -> io::Result<(Self, tokio::net::tcp::OwnedReadHalf, Arc<Counters>)> {
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let counters = Arc::new(Counters::default());
        Ok((
            ClientTransport {
                write_half: Some(write_half),
                counters: counters.clone(),
                peer_addr,
            },
            read_half,
            counters,
        ))
    }

    #[cfg(test)]
    pub fn for_test(peer_ip: std::net::IpAddr) -> Self {
        ClientTransport {
            write_half: None,
            counters: Arc::new(Counters::default()),
            peer_addr: SocketAddr::new(peer_ip, 0),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn bytes_read(&self) -> u64 {
        self.counters.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.counters.bytes_written.load(Ordering::Relaxed)
    }

    pub fn is_paused(&self) -> bool {
        self.counters.paused.load(Ordering::Relaxed)
    }

    pub fn ready_state(&self) -> ReadyState {
        if self.counters.closing.load(Ordering::Relaxed) {
            ReadyState::Closing
        } else {
            ReadyState::Open
        }
    }

    /// `setNoDelay`: toggles `TCP_NODELAY` directly through the owned write
    /// half (SPEC_FULL.md §4.7). A no-op on the `for_test` transport.
    pub fn set_nodelay(&self, enabled: bool) -> io::Result<()> {
        match self.write_half.as_ref() {
            Some(write_half) => write_half.as_ref().set_nodelay(enabled),
            None => Ok(()),
        }
    }

    /// `setKeepAlive`: toggles `SO_KEEPALIVE` via `socket2`, the same crate
    /// `snapview-tungstenite-rs` reaches for to touch socket options tokio's
    /// `TcpStream` doesn't expose directly.
    pub fn set_keepalive(&self, enabled: bool) -> io::Result<()> {
        match self.write_half.as_ref() {
            Some(write_half) => {
                let socket = SockRef::from(write_half.as_ref());
                if enabled {
                    socket.set_tcp_keepalive(&TcpKeepalive::new())
                } else {
                    socket.set_keepalive(false)
                }
            }
            None => Ok(()),
        }
    }

    /// Stop delivering `data` events to this client. Timers and outbound
    /// pings keep running (SPEC_FULL.md §5 "Backpressure").
    pub fn pause(&self) {
        self.counters.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.counters.paused.store(false, Ordering::Relaxed);
        self.counters.wake_parked_reader();
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if let Some(write_half) = self.write_half.as_mut() {
            write_half.write_all(bytes).await?;
            self.counters
                .bytes_written
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Encode `payload` under `opcode` and write it out in one shot
    /// (SPEC_FULL.md §4.1: the codec never touches a socket, so every
    /// outbound write funnels through here).
    pub async fn write_frame(&mut self, opcode: OpCode, payload: &[u8]) -> io::Result<()> {
        self.write_all(&frame::encode(payload, opcode)).await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.counters.closing.store(true, Ordering::Relaxed);
        if let Some(write_half) = self.write_half.as_mut() {
            write_half.shutdown().await?;
        }
        Ok(())
    }
}

/// Wraps a read half so every successful `poll_read` also advances the
/// shared `bytes_read` counter and honors the pause flag (returns
/// `Poll::Pending` without ever waking the task while paused, same as the
/// reference implementation's fire-and-forget queue model: resuming is a
/// caller-driven action, not a timer).
pub struct PausableReader<R> {
    inner: R,
    counters: Arc<Counters>,
}

impl<R> PausableReader<R> {
    pub fn new(inner: R, counters: Arc<Counters>) -> Self {
        PausableReader { inner, counters }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PausableReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.counters.paused.load(Ordering::Relaxed) {
            *this.counters.parked_reader.lock().unwrap() = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = buf.filled().len() - before;
                this.counters
                    .bytes_read
                    .fetch_add(read as u64, Ordering::Relaxed);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_state_flips_to_closing_on_shutdown() {
        let mut transport = ClientTransport::for_test([127, 0, 0, 1].into());
        assert_eq!(transport.ready_state(), ReadyState::Open);
        transport.shutdown().await.unwrap();
        assert_eq!(transport.ready_state(), ReadyState::Closing);
    }

    #[test]
    fn set_nodelay_and_set_keepalive_are_a_noop_without_a_real_socket() {
        let transport = ClientTransport::for_test([127, 0, 0, 1].into());
        assert!(transport.set_nodelay(true).is_ok());
        assert!(transport.set_keepalive(true).is_ok());
    }
}
