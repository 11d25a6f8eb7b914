//! Shared connection teardown (SPEC_FULL.md §4.5 "Destruction").
//!
//! A connection can end from several independent places: the frame handler
//! acting on a peer close frame or a protocol violation, the connection
//! reader seeing transport EOF, or the liveness manager's pong-deadline or
//! inbound-ping-flood timers firing from their own spawned tasks. All of
//! them funnel through `close_client` so the registry removal and the
//! emitted `close` event happen exactly once (`Registry::remove` is
//! idempotent and gates everything else here on its result).

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::CloseReason;
use crate::events::{EventSender, ServerEvent};
use crate::registry::{ClientId, ClientRecord, Registry};

/// Tear a client down. `abort_reader_task` must be `false` only when the
/// caller *is* the connection-reader task that owns `reader_task` itself
/// (`FrameHandler::finish`, which already returns to its caller and lets
/// that task exit on its own) — aborting your own running task here would
/// race the `transport.shutdown()`/`events.send` below against Tokio
/// tearing the task down mid-await. Every other call site (the liveness
/// manager's timers, the public facade) runs on a different task than the
/// one reading this client's socket and must pass `true` to unblock a
/// pending read.
pub async fn close_client(
    id: ClientId,
    record: &Arc<Mutex<ClientRecord>>,
    registry: &Registry,
    events: &EventSender,
    reason: CloseReason,
    abort_reader_task: bool,
) -> bool {
    if !registry.remove(id).await {
        return false;
    }

    let mut record = record.lock().await;
    record.ping.clear_deadline();
    record.pong.clear();
    if abort_reader_task {
        if let Some(reader_task) = record.reader_task.take() {
            reader_task.abort();
        }
    }
    let _ = record.transport.shutdown().await;
    drop(record);

    let _ = events.send(ServerEvent::Close { id, reason });
    true
}
