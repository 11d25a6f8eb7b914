//! The Liveness Manager (SPEC_FULL.md §4.4): the server-wide periodic ping
//! dispatcher, per-client pong-deadline timers, and the inbound-ping
//! anti-DoS coalescing pair.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::CloseReason;
use crate::events::{EventSender, ServerEvent};
use crate::frame::OpCode;
use crate::registry::{ClientId, ClientRecord, Registry};
use crate::teardown;

/// How long the server waits after an inbound ping before it writes the
/// coalesced pong echo (SPEC_FULL.md §4.4).
const PONG_EMIT_DELAY: Duration = Duration::from_secs(3);
/// Three times the emit delay: a client that never stops pinging is
/// disconnected once this much time has passed since the last echo.
const PONG_ABORT_DELAY: Duration = Duration::from_secs(9);

pub struct LivenessManager {
    registry: Arc<Registry>,
    config: Arc<Mutex<Config>>,
    events: EventSender,
    periodic: Mutex<Option<JoinHandle<()>>>,
}

impl LivenessManager {
    pub fn new(registry: Arc<Registry>, config: Arc<Mutex<Config>>, events: EventSender) -> Arc<Self> {
        Arc::new(LivenessManager {
            registry,
            config,
            events,
            periodic: Mutex::new(None),
        })
    }

    /// Start the periodic outbound-ping task using the current `ping_delay`.
    pub async fn start(self: &Arc<Self>) {
        self.respawn_periodic().await;
    }

    /// Apply a new `ping_delay` and atomically replace the running periodic
    /// task with one on the new interval (SPEC_FULL.md §4.7 "reschedules the
    /// periodic task atomically").
    pub async fn set_ping_delay_ms(self: &Arc<Self>, value: i64) -> bool {
        let applied = {
            let mut config = self.config.lock().await;
            config.set_ping_delay_ms(value)
        };
        if applied {
            self.respawn_periodic().await;
        }
        applied
    }

    async fn respawn_periodic(self: &Arc<Self>) {
        let mut slot = self.periodic.lock().await;
        if let Some(old) = slot.take() {
            old.abort();
        }

        let delay_ms = self.config.lock().await.ping_delay_ms();
        if delay_ms == 0 {
            return;
        }

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(delay_ms));
            // The first tick fires immediately; consume it so the first
            // real ping still waits a full `ping_delay`.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.ping_all_clients().await;
            }
        });
        *slot = Some(handle);
    }

    async fn ping_all_clients(self: &Arc<Self>) {
        let pong_timeout_ms = self.config.lock().await.pong_timeout_ms();
        for (id, record) in self.registry.snapshot().await {
            self.ping_one(id, record, pong_timeout_ms).await;
        }
    }

    async fn ping_one(self: &Arc<Self>, id: ClientId, record: Arc<Mutex<ClientRecord>>, pong_timeout_ms: u64) {
        // Ping payload is the client's own id (SPEC_FULL.md §4.4 design
        // note): cheap to compare against on pong and easy to read off a
        // packet capture.
        let token = id.to_string().into_bytes();

        let write_result = {
            let mut record = record.lock().await;
            record.ping.clear_deadline();
            record.ping.expected = token.clone();
            record.transport.write_frame(OpCode::Ping, &token).await
        };
        if let Err(err) = write_result {
            let _ = self.events.send(ServerEvent::Error {
                id,
                message: err.to_string(),
            });
            teardown::close_client(id, &record, &self.registry, &self.events, CloseReason::ABNORMAL, true).await;
            return;
        }

        if pong_timeout_ms == 0 {
            return;
        }
        let manager = Arc::clone(self);
        let deadline_record = Arc::clone(&record);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(pong_timeout_ms)).await;
            teardown::close_client(
                id,
                &deadline_record,
                &manager.registry,
                &manager.events,
                CloseReason::UNEXPECTED_CONDITION,
                true,
            )
            .await;
        });
        record.lock().await.ping.deadline = Some(handle);
    }

    /// Engage anti-DoS coalescing for an inbound ping (SPEC_FULL.md §4.4
    /// "Inbound pings"). Calls with the same `id` are always serialized by
    /// the connection reader that owns that client's frame stream, so this
    /// never races against itself.
    pub async fn handle_inbound_ping(
        self: &Arc<Self>,
        id: ClientId,
        record: Arc<Mutex<ClientRecord>>,
        payload: Vec<u8>,
    ) {
        let needs_abort_timer = {
            let mut record = record.lock().await;
            if let Some(old_emit) = record.pong.emit.take() {
                old_emit.abort();
            }
            record.pong.abort.is_none()
        };

        let emit_events = self.events.clone();
        let emit_record = Arc::clone(&record);
        let emit_payload = payload.clone();
        let emit_handle = tokio::spawn(async move {
            tokio::time::sleep(PONG_EMIT_DELAY).await;
            let mut record = emit_record.lock().await;
            if let Err(err) = record.transport.write_frame(OpCode::Pong, &emit_payload).await {
                let _ = emit_events.send(ServerEvent::Error {
                    id,
                    message: err.to_string(),
                });
            }
            if let Some(abort) = record.pong.abort.take() {
                abort.abort();
            }
            record.pong.emit = None;
        });
        record.lock().await.pong.emit = Some(emit_handle);

        if needs_abort_timer {
            let manager = Arc::clone(self);
            let abort_record = Arc::clone(&record);
            let abort_handle = tokio::spawn(async move {
                tokio::time::sleep(PONG_ABORT_DELAY).await;
                teardown::close_client(
                    id,
                    &abort_record,
                    &manager.registry,
                    &manager.events,
                    CloseReason::ABNORMAL,
                    true,
                )
                .await;
            });
            record.lock().await.pong.abort = Some(abort_handle);
        }
    }

    /// Match an inbound pong against the outstanding ping, if any
    /// (SPEC_FULL.md §4.3 opcode-10 row).
    pub async fn handle_inbound_pong(&self, record: &Arc<Mutex<ClientRecord>>, payload: &[u8]) {
        let mut record = record.lock().await;
        if payload == record.ping.expected.as_slice() {
            record.ping.clear_deadline();
            record.ping.expected.clear();
        }
    }
}
