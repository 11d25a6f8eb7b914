//! Application-facing events (SPEC_FULL.md §4.7, §6 "Emitted events"),
//! delivered through an `mpsc` channel mirroring the reference
//! implementation's `Event`/`EventStream` pair.

use crate::error::CloseReason;
use crate::message::Message;
use crate::registry::ClientId;

#[derive(Debug, Clone)]
pub enum ServerEvent {
    Open {
        id: ClientId,
    },
    Close {
        id: ClientId,
        reason: CloseReason,
    },
    Error {
        id: ClientId,
        message: String,
    },
    Message {
        id: ClientId,
        topic: String,
        message: Message,
    },
}

pub type EventSender = tokio::sync::mpsc::UnboundedSender<ServerEvent>;
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<ServerEvent>;
