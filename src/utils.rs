//! Small handshake helpers with no state of their own: the accept-key
//! computation and the one cookie this crate cares about.

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub(crate) const STICKY_SESSION_COOKIE: &str = "jadsonlucena-websocket";

/// `base64(SHA-1(clientKey ++ magic GUID))`, RFC 6455 §1.3.
pub(crate) fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

/// Scan a `Cookie` header value for `jadsonlucena-websocket=<value>`.
/// Not a general cookie parser: it only ever looks for this one pair
/// (general cookie parsing is out of scope per SPEC_FULL.md §1).
pub(crate) fn extract_sticky_cookie(cookie_header: &str) -> Option<String> {
    cookie_header.split(';').find_map(|pair| {
        let pair = pair.trim();
        let (name, value) = pair.split_once('=')?;
        if name == STICKY_SESSION_COOKIE {
            Some(value.to_string())
        } else {
            None
        }
    })
}
