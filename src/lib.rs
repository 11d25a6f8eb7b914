//! A server-side RFC 6455 WebSocket engine for the Tokio stack.
//!
//! Promotes HTTP Upgrade requests into framed, bidirectional channels and
//! exposes a multi-client messaging API keyed by a per-connection topic
//! derived from the request path. Client-mode operation, permessage-deflate,
//! and subprotocol negotiation are out of scope; see `handshake` and
//! `facade` for the surface this crate does expose.

mod connection;
pub mod config;
pub mod error;
pub mod events;
pub mod facade;
pub mod frame;
mod handshake;
mod handler;
mod liveness;
mod message;
mod registry;
mod teardown;
mod transport;
mod utils;

pub use events::ServerEvent;
pub use facade::{start_server, start_server_with_config, Facade};
pub use message::Message;
pub use registry::ClientId;
pub use transport::ReadyState;
