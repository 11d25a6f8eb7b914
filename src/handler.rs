//! The Frame Handler (SPEC_FULL.md §4.3): the per-connection state machine
//! that assembles fragmented messages, enforces the cumulative payload
//! limit, acts on control frames, and emits application events on the
//! connection's topic.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::{Config, Encoding};
use crate::error::{CloseReason, FrameError};
use crate::events::{EventSender, ServerEvent};
use crate::frame::{Frame, OpCode};
use crate::liveness::LivenessManager;
use crate::message::{self, Message};
use crate::registry::{ClientId, ClientRecord, PendingFragments, Registry};
use crate::teardown;

/// What the connection reader should do after handing a frame to the
/// handler: keep draining the buffer, or stop — the connection is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Continue,
    Closed,
}

impl HandlerOutcome {
    pub fn is_closed(self) -> bool {
        matches!(self, HandlerOutcome::Closed)
    }
}

enum ContinuationStep {
    NoPendingFragments,
    TooBig,
    Pushed,
    Completed { is_text: bool, payload: Vec<u8> },
}

pub struct FrameHandler {
    id: ClientId,
    record: Arc<Mutex<ClientRecord>>,
    registry: Arc<Registry>,
    config: Arc<Mutex<Config>>,
    liveness: Arc<LivenessManager>,
    events: EventSender,
    /// Fixed at connection open and never re-derived (SPEC_FULL.md §4.3
    /// "Topic routing").
    topic: String,
    closed: bool,
}

impl FrameHandler {
    pub async fn new(
        id: ClientId,
        record: Arc<Mutex<ClientRecord>>,
        registry: Arc<Registry>,
        config: Arc<Mutex<Config>>,
        liveness: Arc<LivenessManager>,
        events: EventSender,
    ) -> Self {
        let topic = record.lock().await.topic().to_string();
        FrameHandler {
            id,
            record,
            registry,
            config,
            liveness,
            events,
            topic,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub async fn on_frame(&mut self, frame: Frame) -> HandlerOutcome {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => self.on_data_frame(frame).await,
            OpCode::Continuation => self.on_continuation_frame(frame).await,
            OpCode::Close => {
                self.finish(CloseReason::NORMAL).await;
                HandlerOutcome::Closed
            }
            OpCode::Ping => {
                self.liveness
                    .handle_inbound_ping(self.id, Arc::clone(&self.record), frame.payload)
                    .await;
                HandlerOutcome::Continue
            }
            OpCode::Pong => {
                self.liveness.handle_inbound_pong(&self.record, &frame.payload).await;
                HandlerOutcome::Continue
            }
        }
    }

    pub async fn on_invalid_frame(&mut self, err: FrameError) {
        self.finish(CloseReason::from_frame_error(err)).await;
    }

    /// `error` is the transport-level failure that ended the connection, if
    /// any (an `Ok(0)` EOF has none). SPEC_FULL.md §6/§7 require this to
    /// surface as a distinct `error` event before the `close` event that
    /// `finish` emits.
    pub async fn on_transport_ended(&mut self, error: Option<std::io::Error>) {
        let reason = match error {
            Some(err) => {
                let _ = self.events.send(ServerEvent::Error {
                    id: self.id,
                    message: err.to_string(),
                });
                CloseReason::ABNORMAL
            }
            None => CloseReason::NORMAL,
        };
        self.finish(reason).await;
    }

    async fn on_data_frame(&mut self, frame: Frame) -> HandlerOutcome {
        let (max_payload, encoding) = self.config_snapshot().await;

        let already_assembling = self.record.lock().await.pending_fragments.is_some();
        if already_assembling {
            self.finish(CloseReason::UNACCEPTABLE_DATA).await;
            return HandlerOutcome::Closed;
        }

        if exceeds_limit(max_payload, frame.payload.len() as u64) {
            self.finish(CloseReason::MESSAGE_TOO_BIG).await;
            return HandlerOutcome::Closed;
        }

        if frame.fin {
            return self
                .emit_message(frame.opcode == OpCode::Text, frame.payload, encoding)
                .await;
        }

        self.record.lock().await.pending_fragments = Some(PendingFragments {
            opcode_is_text: frame.opcode == OpCode::Text,
            payload: frame.payload,
        });
        HandlerOutcome::Continue
    }

    async fn on_continuation_frame(&mut self, frame: Frame) -> HandlerOutcome {
        let (max_payload, encoding) = self.config_snapshot().await;

        let step = {
            let mut record = self.record.lock().await;
            match record.pending_fragments.as_mut() {
                None => ContinuationStep::NoPendingFragments,
                Some(pending) => {
                    let new_len = pending.payload.len() as u64 + frame.payload.len() as u64;
                    if exceeds_limit(max_payload, new_len) {
                        record.pending_fragments = None;
                        ContinuationStep::TooBig
                    } else {
                        pending.payload.extend_from_slice(&frame.payload);
                        if frame.fin {
                            let pending = record.pending_fragments.take().unwrap();
                            ContinuationStep::Completed {
                                is_text: pending.opcode_is_text,
                                payload: pending.payload,
                            }
                        } else {
                            ContinuationStep::Pushed
                        }
                    }
                }
            }
        };

        match step {
            ContinuationStep::NoPendingFragments => {
                self.finish(CloseReason::UNACCEPTABLE_DATA).await;
                HandlerOutcome::Closed
            }
            ContinuationStep::TooBig => {
                self.finish(CloseReason::MESSAGE_TOO_BIG).await;
                HandlerOutcome::Closed
            }
            ContinuationStep::Pushed => HandlerOutcome::Continue,
            ContinuationStep::Completed { is_text, payload } => {
                self.emit_message(is_text, payload, encoding).await
            }
        }
    }

    async fn emit_message(&mut self, is_text: bool, payload: Vec<u8>, encoding: Encoding) -> HandlerOutcome {
        let message = if is_text {
            match message::decode_text_payload(&payload, encoding) {
                Ok(text) => Message::Text(text),
                Err(err) => {
                    self.finish(CloseReason::from_frame_error(err)).await;
                    return HandlerOutcome::Closed;
                }
            }
        } else {
            Message::Binary(payload)
        };

        let _ = self.events.send(ServerEvent::Message {
            id: self.id,
            topic: self.topic.clone(),
            message,
        });
        HandlerOutcome::Continue
    }

    /// `max_payload` always comes from the server-wide config; `encoding`
    /// prefers this connection's `setEncoding` override, if one was set
    /// (SPEC_FULL.md §4.7), falling back to `Config::encoding`.
    async fn config_snapshot(&self) -> (u64, Encoding) {
        let max_payload = self.config.lock().await.max_payload();
        let default_encoding = self.config.lock().await.encoding();
        let encoding = self.record.lock().await.encoding_override.unwrap_or(default_encoding);
        (max_payload, encoding)
    }

    /// Never aborts `reader_task`: `finish` is always called from inside the
    /// task that owns it, which is already on its way out (see
    /// `teardown::close_client`'s doc comment).
    async fn finish(&mut self, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        teardown::close_client(self.id, &self.record, &self.registry, &self.events, reason, false).await;
    }
}

fn exceeds_limit(max_payload: u64, cumulative: u64) -> bool {
    max_payload > 0 && cumulative > max_payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PingState, PongState};
    use std::net::{IpAddr, Ipv4Addr};
    use url::Url;

    async fn make_handler(max_payload: u64) -> (FrameHandler, tokio::sync::mpsc::UnboundedReceiver<ServerEvent>) {
        let registry = Arc::new(Registry::new());
        let mut config = Config::default();
        config.set_max_payload(max_payload as i64);
        let config = Arc::new(Mutex::new(config));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let liveness = LivenessManager::new(Arc::clone(&registry), Arc::clone(&config), tx.clone());

        let id = registry.generate_unique_id().await;
        let record = registry
            .insert(ClientRecord {
                id,
                transport: crate::transport::ClientTransport::for_test(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                url: Url::parse("ws://localhost/chat").unwrap(),
                peer_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                pending_fragments: None,
                ping: PingState::default(),
                pong: PongState::default(),
                reader_task: None,
                encoding_override: None,
            })
            .await;

        let handler = FrameHandler::new(id, record, registry, config, liveness, tx).await;
        (handler, rx)
    }

    fn text_frame(fin: bool, payload: &[u8]) -> Frame {
        Frame {
            fin,
            opcode: OpCode::Text,
            payload: payload.to_vec(),
        }
    }

    #[tokio::test]
    async fn unfragmented_text_emits_on_the_connection_topic() {
        let (mut handler, mut events) = make_handler(1024).await;
        let outcome = handler.on_frame(text_frame(true, b"Hello")).await;
        assert_eq!(outcome, HandlerOutcome::Continue);

        match events.recv().await {
            Some(ServerEvent::Message { topic, message, .. }) => {
                assert_eq!(topic, "/chat");
                assert_eq!(message, Message::Text("Hello".into()));
            }
            other => panic!("expected a message event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fragmented_text_is_reassembled_in_order() {
        let (mut handler, mut events) = make_handler(1024).await;
        assert_eq!(handler.on_frame(text_frame(false, b"A")).await, HandlerOutcome::Continue);
        let continuation = Frame {
            fin: true,
            opcode: OpCode::Continuation,
            payload: b"B".to_vec(),
        };
        assert_eq!(handler.on_frame(continuation).await, HandlerOutcome::Continue);

        match events.recv().await {
            Some(ServerEvent::Message { message, .. }) => {
                assert_eq!(message, Message::Text("AB".into()));
            }
            other => panic!("expected a message event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_data_frame_while_assembling_is_a_protocol_violation() {
        let (mut handler, mut events) = make_handler(1024).await;
        handler.on_frame(text_frame(false, b"A")).await;
        let outcome = handler.on_frame(text_frame(true, b"B")).await;
        assert_eq!(outcome, HandlerOutcome::Closed);
        assert!(handler.is_closed());

        match events.recv().await {
            Some(ServerEvent::Close { reason, .. }) => {
                assert_eq!(reason, CloseReason::UNACCEPTABLE_DATA);
            }
            other => panic!("expected a close event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn continuation_without_a_pending_fragment_is_a_protocol_violation() {
        let (mut handler, _events) = make_handler(1024).await;
        let continuation = Frame {
            fin: true,
            opcode: OpCode::Continuation,
            payload: b"B".to_vec(),
        };
        assert_eq!(handler.on_frame(continuation).await, HandlerOutcome::Closed);
    }

    #[tokio::test]
    async fn cumulative_payload_over_the_limit_closes_with_1009() {
        let (mut handler, mut events) = make_handler(4).await;
        let outcome = handler.on_frame(text_frame(true, b"Hello")).await;
        assert_eq!(outcome, HandlerOutcome::Closed);

        match events.recv().await {
            Some(ServerEvent::Close { reason, .. }) => {
                assert_eq!(reason, CloseReason::MESSAGE_TOO_BIG);
            }
            other => panic!("expected a close event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_io_error_emits_an_error_event_before_close() {
        let (mut handler, mut events) = make_handler(1024).await;
        let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        handler.on_transport_ended(Some(err)).await;

        match events.recv().await {
            Some(ServerEvent::Error { message, .. }) => assert_eq!(message, "reset by peer"),
            other => panic!("expected an error event, got {other:?}"),
        }
        match events.recv().await {
            Some(ServerEvent::Close { reason, .. }) => assert_eq!(reason, CloseReason::ABNORMAL),
            other => panic!("expected a close event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn peer_close_frame_emits_normal_close() {
        let (mut handler, mut events) = make_handler(1024).await;
        let close_frame = Frame {
            fin: true,
            opcode: OpCode::Close,
            payload: Vec::new(),
        };
        assert_eq!(handler.on_frame(close_frame).await, HandlerOutcome::Closed);

        match events.recv().await {
            Some(ServerEvent::Close { reason, .. }) => assert_eq!(reason, CloseReason::NORMAL),
            other => panic!("expected a close event, got {other:?}"),
        }
    }
}
