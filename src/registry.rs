//! The client registry (SPEC_FULL.md §4.5): identity, per-IP admission, and
//! sticky-session cookie bookkeeping.
//!
//! The reference implementation generates per-connection ids with
//! `rand::rngs::StdRng` seeded `from_rng(thread_rng())` and wraps them in a
//! v8 [`uuid::Uuid`] (`event.rs::generate_new_uuid`); this module keeps that
//! exact generation strategy and builds the registry around it.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use url::Url;
use uuid::Uuid;

use crate::config::Encoding;
use crate::transport::ClientTransport;

/// Short opaque identifier handed out to every admitted client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    fn generate() -> ClientId {
        let mut rng = StdRng::from_rng(rand::thread_rng()).expect("OS RNG must be available");
        ClientId(Uuid::new_v8(rng.gen::<[u8; 16]>()))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ClientId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(ClientId)
    }
}

/// Pending ping liveness state for one client (SPEC_FULL.md §3 `ping`).
#[derive(Default)]
pub struct PingState {
    pub expected: Vec<u8>,
    pub deadline: Option<JoinHandle<()>>,
}

impl PingState {
    pub fn clear_deadline(&mut self) {
        if let Some(handle) = self.deadline.take() {
            handle.abort();
        }
    }
}

/// Anti-DoS inbound-ping coalescing state for one client (SPEC_FULL.md §3 `pong`).
#[derive(Default)]
pub struct PongState {
    pub emit: Option<JoinHandle<()>>,
    pub abort: Option<JoinHandle<()>>,
}

impl PongState {
    pub fn clear(&mut self) {
        if let Some(handle) = self.emit.take() {
            handle.abort();
        }
        if let Some(handle) = self.abort.take() {
            handle.abort();
        }
    }
}

/// First opcode of an in-progress fragmented message, plus the fragments
/// accumulated so far (SPEC_FULL.md §3 `pendingFragments`, invariant I2/I3).
pub struct PendingFragments {
    pub opcode_is_text: bool,
    pub payload: Vec<u8>,
}

/// Everything the engine tracks about one admitted connection.
pub struct ClientRecord {
    pub id: ClientId,
    pub transport: ClientTransport,
    pub url: Url,
    pub peer_ip: IpAddr,
    pub pending_fragments: Option<PendingFragments>,
    pub ping: PingState,
    pub pong: PongState,
    /// Handle to the `connection::run` task reading this client's socket.
    /// `teardown::close_client` only aborts it when told the caller isn't
    /// that same task (a handler-driven close runs inside it already and
    /// exits on its own once it returns).
    pub reader_task: Option<JoinHandle<()>>,
    /// Per-connection override of `Config::encoding`, set by
    /// `Facade::set_encoding(id, ...)` (SPEC_FULL.md §4.7 `setEncoding`).
    /// `None` falls back to the server-wide default.
    pub encoding_override: Option<Encoding>,
}

impl ClientRecord {
    pub fn topic(&self) -> &str {
        match self.url.path() {
            "/" => "message",
            path => path,
        }
    }
}

struct StickySession {
    id: ClientId,
    expires_at: Instant,
}

/// Mapping `clientId -> ClientRecord`, plus per-IP counting and sticky
/// session lookups (SPEC_FULL.md §4.5).
pub struct Registry {
    clients: Mutex<HashMap<ClientId, Arc<Mutex<ClientRecord>>>>,
    sessions: Mutex<HashMap<String, StickySession>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            clients: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Number of currently registered clients whose peer IP matches `ip`
    /// (invariant I6). A linear scan, as SPEC_FULL.md §4.5 permits.
    pub async fn count_for_ip(&self, ip: IpAddr) -> usize {
        let clients = self.clients.lock().await;
        let mut count = 0;
        for record in clients.values() {
            if record.lock().await.peer_ip == ip {
                count += 1;
            }
        }
        count
    }

    /// Resolve a sticky id from a session cookie value, if it names a known,
    /// unexpired session that isn't bound to a currently-live connection.
    pub async fn resolve_sticky_id(&self, cookie_value: &str) -> Option<ClientId> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get(cookie_value)?;
        if session.expires_at < Instant::now() {
            sessions.remove(cookie_value);
            return None;
        }
        let id = session.id;
        let clients = self.clients.lock().await;
        if clients.contains_key(&id) {
            None
        } else {
            Some(id)
        }
    }

    /// Allocate a fresh id, retrying on the astronomically unlikely event of
    /// a collision with a currently-registered id.
    pub async fn generate_unique_id(&self) -> ClientId {
        let clients = self.clients.lock().await;
        loop {
            let candidate = ClientId::generate();
            if !clients.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub async fn remember_session(&self, cookie_value: String, id: ClientId, ttl: Duration) {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            cookie_value,
            StickySession {
                id,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub async fn insert(&self, record: ClientRecord) -> Arc<Mutex<ClientRecord>> {
        let id = record.id;
        let shared = Arc::new(Mutex::new(record));
        self.clients.lock().await.insert(id, shared.clone());
        shared
    }

    pub async fn get(&self, id: ClientId) -> Option<Arc<Mutex<ClientRecord>>> {
        self.clients.lock().await.get(&id).cloned()
    }

    /// A point-in-time copy of the `(id, record)` pairs, used by the
    /// liveness manager's periodic sweep so it never holds the map-level
    /// lock while awaiting per-client I/O (SPEC_FULL.md §4.4).
    pub async fn snapshot(&self) -> Vec<(ClientId, Arc<Mutex<ClientRecord>>)> {
        self.clients
            .lock()
            .await
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect()
    }

    /// Remove the record for `id`. Idempotent: returns `true` only the first
    /// time (SPEC_FULL.md §4.5 "Destruction").
    pub async fn remove(&self, id: ClientId) -> bool {
        self.clients.lock().await.remove(&id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_transport() -> ClientTransport {
        ClientTransport::for_test(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)))
    }

    fn test_record(id: ClientId, ip: IpAddr) -> ClientRecord {
        ClientRecord {
            id,
            transport: test_transport(),
            url: Url::parse("ws://localhost/chat").unwrap(),
            peer_ip: ip,
            pending_fragments: None,
            ping: PingState::default(),
            pong: PongState::default(),
            reader_task: None,
            encoding_override: None,
        }
    }

    #[tokio::test]
    async fn topic_defaults_to_message_for_root_path() {
        let record = ClientRecord {
            url: Url::parse("ws://localhost/").unwrap(),
            ..test_record(ClientId::generate(), IpAddr::V4(Ipv4Addr::LOCALHOST))
        };
        assert_eq!(record.topic(), "message");
    }

    #[tokio::test]
    async fn topic_uses_the_request_path_otherwise() {
        let record = test_record(ClientId::generate(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(record.topic(), "/chat");
    }

    #[tokio::test]
    async fn per_ip_count_only_counts_matching_ip() {
        let registry = Registry::new();
        let ip_a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let ip_b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        registry
            .insert(test_record(registry.generate_unique_id().await, ip_a))
            .await;
        registry
            .insert(test_record(registry.generate_unique_id().await, ip_a))
            .await;
        registry
            .insert(test_record(registry.generate_unique_id().await, ip_b))
            .await;

        assert_eq!(registry.count_for_ip(ip_a).await, 2);
        assert_eq!(registry.count_for_ip(ip_b).await, 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = Registry::new();
        let id = registry.generate_unique_id().await;
        registry
            .insert(test_record(id, IpAddr::V4(Ipv4Addr::LOCALHOST)))
            .await;
        assert!(registry.remove(id).await);
        assert!(!registry.remove(id).await);
    }

    #[tokio::test]
    async fn sticky_session_is_not_reused_while_still_live() {
        let registry = Registry::new();
        let id = registry.generate_unique_id().await;
        registry
            .insert(test_record(id, IpAddr::V4(Ipv4Addr::LOCALHOST)))
            .await;
        registry
            .remember_session("cookie-1".into(), id, Duration::from_secs(60))
            .await;

        assert_eq!(registry.resolve_sticky_id("cookie-1").await, None);

        registry.remove(id).await;
        assert_eq!(registry.resolve_sticky_id("cookie-1").await, Some(id));
    }

    #[tokio::test]
    async fn expired_sticky_session_is_dropped() {
        let registry = Registry::new();
        let id = registry.generate_unique_id().await;
        registry
            .remember_session("cookie-1".into(), id, Duration::from_millis(0))
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(registry.resolve_sticky_id("cookie-1").await, None);
    }
}
