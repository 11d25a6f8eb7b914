//! The Handshake Controller (SPEC_FULL.md §4.6): validates an HTTP Upgrade
//! request, admits or rejects the connection, and — on success — hands the
//! accepted socket off to the Connection Reader.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use url::Url;

use crate::config::{AllowOrigin, Config};
use crate::connection;
use crate::error::HandshakeError;
use crate::events::{EventSender, ServerEvent};
use crate::handler::FrameHandler;
use crate::liveness::LivenessManager;
use crate::registry::{ClientId, ClientRecord, PingState, PongState, Registry};
use crate::transport::{ClientTransport, PausableReader};
use crate::utils;

const MAX_REQUEST_HEAD: usize = 16 * 1024;
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

struct ParsedRequest {
    path: String,
    host: Option<String>,
    origin: Option<String>,
    upgrade: Option<String>,
    version: Option<String>,
    key: Option<String>,
    cookie: Option<String>,
}

/// Read, validate and admit one HTTP Upgrade request on `stream`, then spawn
/// its Connection Reader. Returns the newly assigned id on success.
pub async fn accept(
    mut stream: TcpStream,
    registry: Arc<Registry>,
    config: Arc<Mutex<Config>>,
    liveness: Arc<LivenessManager>,
    events: EventSender,
) -> Result<ClientId, HandshakeError> {
    let peer_addr = stream.peer_addr()?;
    let head = read_request_head(&mut stream).await?;
    let request = parse_request(&head)?;

    if let Err(err) = validate_upgrade(&request) {
        write_rejection(&mut stream, &err).await;
        return Err(err);
    }

    let allow_origin = { config.lock().await.allow_origin().clone() };
    if let Err(err) = validate_origin(&request, &allow_origin) {
        write_rejection(&mut stream, &err).await;
        return Err(err);
    }

    let limit_by_ip = { config.lock().await.limit_by_ip() };
    if limit_by_ip > 0 && registry.count_for_ip(peer_addr.ip()).await as u32 >= limit_by_ip {
        let err = HandshakeError::TooManyConnectionsFromIp;
        write_rejection(&mut stream, &err).await;
        return Err(err);
    }

    let key = request.key.clone().ok_or(HandshakeError::MissingKey)?;
    let accept_key = utils::compute_accept_key(&key);

    let session_expires_ms = { config.lock().await.session_expires_ms() };
    let id = resolve_identity(&registry, &request, session_expires_ms).await;

    let host = request.host.clone().unwrap_or_else(|| "localhost".to_string());
    let url = Url::parse(&format!("ws://{host}{}", request.path))
        .unwrap_or_else(|_| Url::parse("ws://localhost/").unwrap());

    write_accept_response(&mut stream, &accept_key, id, session_expires_ms).await?;

    let (transport, read_half, counters) = ClientTransport::new(stream)?;
    let reader = PausableReader::new(read_half, counters);

    let record = ClientRecord {
        id,
        transport,
        url,
        peer_ip: peer_addr.ip(),
        pending_fragments: None,
        ping: PingState::default(),
        pong: PongState::default(),
        reader_task: None,
        encoding_override: None,
    };
    let shared_record = registry.insert(record).await;

    let handler = FrameHandler::new(
        id,
        Arc::clone(&shared_record),
        Arc::clone(&registry),
        Arc::clone(&config),
        liveness,
        events.clone(),
    )
    .await;

    let reader_registry = Arc::clone(&registry);
    let task = tokio::spawn(connection::run(id, reader, reader_registry, handler));
    shared_record.lock().await.reader_task = Some(task);

    let _ = events.send(ServerEvent::Open { id });
    debug!("admitted client {id}");
    Ok(id)
}

async fn read_request_head(stream: &mut TcpStream) -> Result<Vec<u8>, HandshakeError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if buf.len() > MAX_REQUEST_HEAD {
            return Err(HandshakeError::IncompleteRequest);
        }
        let n = timeout(HEADER_READ_TIMEOUT, stream.read(&mut chunk))
            .await
            .map_err(|_| HandshakeError::IncompleteRequest)??;
        if n == 0 {
            return Err(HandshakeError::IncompleteRequest);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(buf);
        }
    }
}

fn parse_request(head: &[u8]) -> Result<ParsedRequest, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(head)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(HandshakeError::IncompleteRequest),
    }

    let path = req.path.unwrap_or("/").to_string();
    let header_value = |name: &str| -> Option<String> {
        req.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| String::from_utf8_lossy(h.value).trim().to_string())
    };

    Ok(ParsedRequest {
        path,
        host: header_value("Host"),
        origin: header_value("Origin").or_else(|| header_value("Sec-WebSocket-Origin")),
        upgrade: header_value("Upgrade"),
        version: header_value("Sec-WebSocket-Version"),
        key: header_value("Sec-WebSocket-Key"),
        cookie: header_value("Cookie"),
    })
}

fn validate_upgrade(request: &ParsedRequest) -> Result<(), HandshakeError> {
    match &request.upgrade {
        Some(value) if value.eq_ignore_ascii_case("websocket") => {}
        _ => return Err(HandshakeError::NotWebsocketUpgrade),
    }
    match request.version.as_deref() {
        Some("13") | Some("8") => Ok(()),
        _ => Err(HandshakeError::UnsupportedVersion),
    }
}

/// SPEC_FULL.md §9: a missing `Origin` is always rejected (the tightened
/// interpretation this crate implements, not the source's looser behavior).
fn validate_origin(request: &ParsedRequest, allow_origin: &AllowOrigin) -> Result<(), HandshakeError> {
    let origin = request.origin.as_deref().ok_or(HandshakeError::OriginNotAllowed)?;

    let host_matches = request
        .host
        .as_deref()
        .map(|host| origin.contains(host))
        .unwrap_or(false);

    let allowed = host_matches
        || match allow_origin {
            AllowOrigin::Any => true,
            AllowOrigin::SameHost => false,
            AllowOrigin::List(list) => list.iter().any(|allowed| allowed == origin),
        };

    if allowed {
        Ok(())
    } else {
        Err(HandshakeError::OriginNotAllowed)
    }
}

async fn resolve_identity(registry: &Registry, request: &ParsedRequest, session_expires_ms: u64) -> ClientId {
    if let Some(cookie_header) = &request.cookie {
        if let Some(cookie_value) = utils::extract_sticky_cookie(cookie_header) {
            if let Some(id) = registry.resolve_sticky_id(&cookie_value).await {
                return id;
            }
        }
    }
    let id = registry.generate_unique_id().await;
    if session_expires_ms > 0 {
        registry
            .remember_session(id.to_string(), id, Duration::from_millis(session_expires_ms))
            .await;
    }
    id
}

async fn write_accept_response(
    stream: &mut TcpStream,
    accept_key: &str,
    id: ClientId,
    session_expires_ms: u64,
) -> Result<(), HandshakeError> {
    let expires = httpdate_after(session_expires_ms);
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: WebSocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\
         Set-Cookie: {}={id}; Expires={expires}\r\n\r\n",
        utils::STICKY_SESSION_COOKIE,
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

fn httpdate_after(ms_from_now: u64) -> String {
    let when = time::OffsetDateTime::now_utc() + time::Duration::milliseconds(ms_from_now as i64);
    when.format(&time::format_description::well_known::Rfc2822)
        .unwrap_or_else(|_| when.to_string())
}

async fn write_rejection(stream: &mut TcpStream, err: &HandshakeError) {
    if err.status_line().is_empty() {
        return;
    }
    if stream.write_all(err.status_line().as_bytes()).await.is_err() {
        warn!("failed writing handshake rejection: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(upgrade: Option<&str>, version: Option<&str>) -> ParsedRequest {
        ParsedRequest {
            path: "/chat".to_string(),
            host: Some("example.com".to_string()),
            origin: Some("http://example.com".to_string()),
            upgrade: upgrade.map(|s| s.to_string()),
            version: version.map(|s| s.to_string()),
            key: Some("dGhlIHNhbXBsZSBub25jZQ==".to_string()),
            cookie: None,
        }
    }

    #[test]
    fn rejects_non_websocket_upgrade() {
        let request = request_with(Some("h2c"), Some("13"));
        assert!(matches!(
            validate_upgrade(&request),
            Err(HandshakeError::NotWebsocketUpgrade)
        ));
    }

    #[test]
    fn rejects_unsupported_version() {
        let request = request_with(Some("websocket"), Some("7"));
        assert!(matches!(
            validate_upgrade(&request),
            Err(HandshakeError::UnsupportedVersion)
        ));
    }

    #[test]
    fn accepts_version_8_and_13() {
        assert!(validate_upgrade(&request_with(Some("websocket"), Some("13"))).is_ok());
        assert!(validate_upgrade(&request_with(Some("websocket"), Some("8"))).is_ok());
    }

    #[test]
    fn missing_origin_is_always_rejected() {
        let mut request = request_with(Some("websocket"), Some("13"));
        request.origin = None;
        assert!(matches!(
            validate_origin(&request, &AllowOrigin::Any),
            Err(HandshakeError::OriginNotAllowed)
        ));
    }

    #[test]
    fn origin_containing_host_is_accepted_under_same_host_policy() {
        let request = request_with(Some("websocket"), Some("13"));
        assert!(validate_origin(&request, &AllowOrigin::SameHost).is_ok());
    }

    #[test]
    fn cross_origin_request_needs_an_explicit_allow() {
        let mut request = request_with(Some("websocket"), Some("13"));
        request.origin = Some("http://evil.example".to_string());
        assert!(validate_origin(&request, &AllowOrigin::SameHost).is_err());
        assert!(validate_origin(&request, &AllowOrigin::Any).is_ok());
        assert!(validate_origin(
            &request,
            &AllowOrigin::List(vec!["http://evil.example".to_string()])
        )
        .is_ok());
    }
}
