use thiserror::Error;

use crate::registry::ClientId;

/// Errors produced by the frame codec while decoding a byte buffer.
///
/// These map 1:1 onto the wire-level reasons a connection is closed with
/// code 1003 (`Unacceptable Data Type`) once the handler sees them.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("client frame was not masked")]
    NotMasked,

    #[error("frame used a reserved opcode")]
    ReservedOpcode,

    #[error("control frame payload exceeds 125 bytes")]
    ControlFrameTooLarge,

    #[error("control frame must not be fragmented")]
    ControlFrameFragmented,

    #[error("64-bit payload length had non-zero high 32 bits")]
    PayloadLengthOverflow,

    #[error("RSV1, RSV2 or RSV3 set without a negotiated extension")]
    ReservedBitsSet,

    #[error("text payload did not match the configured encoding")]
    InvalidTextEncoding,
}

/// Errors that terminate the handshake before a 101 response is sent.
///
/// Each variant carries the HTTP status the caller should write back; see
/// [`HandshakeError::status_code`].
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("malformed HTTP request")]
    MalformedRequest(#[from] httparse::Error),

    #[error("incomplete HTTP request")]
    IncompleteRequest,

    #[error("Upgrade header missing or not \"websocket\"")]
    NotWebsocketUpgrade,

    #[error("unsupported Sec-WebSocket-Version")]
    UnsupportedVersion,

    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    #[error("Origin header missing or not permitted by policy")]
    OriginNotAllowed,

    #[error("registry rejected the connection: per-IP limit reached")]
    TooManyConnectionsFromIp,

    #[error("transport I/O error during handshake: {0}")]
    Io(#[from] std::io::Error),
}

impl HandshakeError {
    /// The HTTP status line the controller writes back to the peer for this failure.
    pub fn status_line(&self) -> &'static str {
        match self {
            HandshakeError::NotWebsocketUpgrade => "HTTP/1.1 400 Bad Request\r\n\r\n",
            HandshakeError::UnsupportedVersion => {
                "HTTP/1.1 426 Upgrade Required\r\nSec-WebSocket-Version: 13, 8\r\n\r\n"
            }
            HandshakeError::OriginNotAllowed => "HTTP/1.1 403 Forbidden\r\n\r\n",
            HandshakeError::TooManyConnectionsFromIp => "HTTP/1.1 429 Too Many Requests\r\n\r\n",
            HandshakeError::MalformedRequest(_)
            | HandshakeError::IncompleteRequest
            | HandshakeError::MissingKey => "HTTP/1.1 400 Bad Request\r\n\r\n",
            HandshakeError::Io(_) => "",
        }
    }
}

/// Errors surfaced to application code calling the public facade.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacadeError {
    #[error("no client registered under id {0}")]
    NotFound(ClientId),
}

/// The wire close code and human-readable reason attached to a `close` event,
/// per RFC 6455 §7.4. This is the closed enumeration called out in the
/// design notes: every termination path in the crate produces one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub message: &'static str,
}

impl CloseReason {
    pub const NORMAL: CloseReason = CloseReason {
        code: 1000,
        message: "Close Normal",
    };
    pub const ABNORMAL: CloseReason = CloseReason {
        code: 1006,
        message: "Closed Abnormally",
    };
    pub const UNACCEPTABLE_DATA: CloseReason = CloseReason {
        code: 1003,
        message: "Unacceptable Data Type",
    };
    pub const MESSAGE_TOO_BIG: CloseReason = CloseReason {
        code: 1009,
        message: "Message Too Big",
    };
    pub const UNEXPECTED_CONDITION: CloseReason = CloseReason {
        code: 1011,
        message: "Unexpected Condition",
    };

    pub fn from_frame_error(_err: FrameError) -> CloseReason {
        CloseReason::UNACCEPTABLE_DATA
    }
}
