//! The Connection Reader (SPEC_FULL.md §4.2): owns the per-connection
//! receive buffer, drains it through [`crate::frame::decode`], and hands
//! each decoded frame to the [`crate::handler::FrameHandler`] in order.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;

use crate::frame::{self, DecodeOutcome};
use crate::handler::FrameHandler;
use crate::registry::{ClientId, Registry};
use crate::transport::PausableReader;

const READ_CHUNK_SIZE: usize = 8192;

/// Drives one connection's read side until the transport ends or the
/// handler tears the connection down. Runs as its own `tokio::spawn`ed task
/// (SPEC_FULL.md §4.2 "runs as a task per accepted connection").
pub async fn run<R>(
    id: ClientId,
    mut reader: PausableReader<R>,
    registry: Arc<Registry>,
    mut handler: FrameHandler,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut receive_buffer = BytesMut::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                handler.on_transport_ended(None).await;
                break;
            }
            Ok(n) => n,
            Err(err) => {
                handler.on_transport_ended(Some(err)).await;
                break;
            }
        };

        receive_buffer.extend_from_slice(&chunk[..n]);

        let mut keep_going = true;
        while keep_going {
            match frame::decode(&receive_buffer) {
                DecodeOutcome::Frame { frame, consumed } => {
                    receive_buffer.advance_past(consumed);
                    if handler.on_frame(frame).await.is_closed() {
                        keep_going = false;
                        break;
                    }
                }
                DecodeOutcome::Incomplete => {
                    keep_going = false;
                }
                DecodeOutcome::Invalid(err) => {
                    handler.on_invalid_frame(err).await;
                    keep_going = false;
                }
            }
        }

        if handler.is_closed() {
            break;
        }
    }

    registry.remove(id).await;
}

/// Small helper trait so the decode-drain loop reads as "advance past N
/// bytes" instead of repeating `receive_buffer.split_to` boilerplate.
trait AdvancePast {
    fn advance_past(&mut self, n: usize);
}

impl AdvancePast for BytesMut {
    fn advance_past(&mut self, n: usize) {
        let _ = self.split_to(n);
    }
}
