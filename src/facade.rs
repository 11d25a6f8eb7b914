//! The Public Facade (SPEC_FULL.md §4.7): starts the listener, exposes
//! per-client operations, and forwards configuration changes to the pieces
//! that need to react to them.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::Mutex;
use url::Url;

use crate::config::{AllowOrigin, Config, Encoding};
use crate::error::{CloseReason, FacadeError};
use crate::events::{EventReceiver, EventSender};
use crate::frame::OpCode;
use crate::handshake;
use crate::liveness::LivenessManager;
use crate::message::Message;
use crate::registry::{ClientId, Registry};
use crate::teardown;
use crate::transport::ReadyState;

/// A cheaply-cloneable handle to a running server: every clone shares the
/// same registry, config, and liveness manager (SPEC_FULL.md §4.7).
#[derive(Clone)]
pub struct Facade {
    registry: Arc<Registry>,
    config: Arc<Mutex<Config>>,
    liveness: Arc<LivenessManager>,
    events: EventSender,
}

/// Bind `addr` and start accepting connections with default configuration.
pub async fn start_server(addr: impl ToSocketAddrs) -> io::Result<(Facade, EventReceiver)> {
    start_server_with_config(addr, Config::default()).await
}

/// Bind `addr` and start accepting connections with `config`.
pub async fn start_server_with_config(
    addr: impl ToSocketAddrs,
    config: Config,
) -> io::Result<(Facade, EventReceiver)> {
    let listener = TcpListener::bind(addr).await?;
    let registry = Arc::new(Registry::new());
    let config = Arc::new(Mutex::new(config));
    let (events, receiver) = tokio::sync::mpsc::unbounded_channel();

    let liveness = LivenessManager::new(Arc::clone(&registry), Arc::clone(&config), events.clone());
    liveness.start().await;

    let facade = Facade {
        registry: Arc::clone(&registry),
        config: Arc::clone(&config),
        liveness: Arc::clone(&liveness),
        events: events.clone(),
    };

    tokio::spawn(accept_loop(listener, registry, config, liveness, events));

    Ok((facade, receiver))
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<Registry>,
    config: Arc<Mutex<Config>>,
    liveness: Arc<LivenessManager>,
    events: EventSender,
) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("accept failed: {err}");
                continue;
            }
        };

        let registry = Arc::clone(&registry);
        let config = Arc::clone(&config);
        let liveness = Arc::clone(&liveness);
        let events = events.clone();
        tokio::spawn(async move {
            if let Err(err) = handshake::accept(stream, registry, config, liveness, events).await {
                warn!("handshake rejected: {err}");
            }
        });
    }
}

impl Facade {
    async fn record_or_not_found(
        &self,
        id: ClientId,
    ) -> Result<Arc<Mutex<crate::registry::ClientRecord>>, FacadeError> {
        self.registry.get(id).await.ok_or(FacadeError::NotFound(id))
    }

    /// `send(id, data)`: opcode 1 for text, 2 for binary (SPEC_FULL.md §4.7).
    pub async fn send(&self, id: ClientId, message: Message) -> Result<(), FacadeError> {
        let record = self.record_or_not_found(id).await?;
        let opcode = match &message {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
        };
        let mut record = record.lock().await;
        let _ = record.transport.write_frame(opcode, message.as_bytes()).await;
        Ok(())
    }

    /// `ping(id, pongTimeout?)`: arms a deadline only when `pong_timeout_ms`
    /// is `Some` and positive.
    pub async fn ping(&self, id: ClientId, pong_timeout_ms: Option<i64>) -> Result<(), FacadeError> {
        let record = self.record_or_not_found(id).await?;
        let token = id.to_string().into_bytes();
        {
            let mut record = record.lock().await;
            record.ping.clear_deadline();
            record.ping.expected = token.clone();
            let _ = record.transport.write_frame(OpCode::Ping, &token).await;
        }

        if let Some(timeout_ms) = pong_timeout_ms.filter(|ms| *ms > 0) {
            let registry = Arc::clone(&self.registry);
            let events = self.events.clone();
            let deadline_record = Arc::clone(&record);
            let handle = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms as u64)).await;
                teardown::close_client(
                    id,
                    &deadline_record,
                    &registry,
                    &events,
                    CloseReason::UNEXPECTED_CONDITION,
                    true,
                )
                .await;
            });
            record.lock().await.ping.deadline = Some(handle);
        }
        Ok(())
    }

    /// `close(id)`: returns `true` if this call performed the destruction,
    /// `false` if another path already had (idempotent per SPEC_FULL.md §4.5).
    pub async fn close(&self, id: ClientId) -> Result<bool, FacadeError> {
        let record = self.record_or_not_found(id).await?;
        Ok(teardown::close_client(id, &record, &self.registry, &self.events, CloseReason::NORMAL, true).await)
    }

    /// `readyState(id)`: whether the transport is still open or already
    /// shutting down (SPEC_FULL.md §4.7).
    pub async fn ready_state(&self, id: ClientId) -> Result<ReadyState, FacadeError> {
        let record = self.record_or_not_found(id).await?;
        let result = record.lock().await.transport.ready_state();
        Ok(result)
    }

    /// `setKeepAlive(id, enabled)`: toggles `SO_KEEPALIVE` on the underlying
    /// socket (SPEC_FULL.md §4.7). A failed `setsockopt` is logged and
    /// otherwise ignored, the same fire-and-forget treatment `send` gives a
    /// failed write.
    pub async fn set_keepalive(&self, id: ClientId, enabled: bool) -> Result<(), FacadeError> {
        let record = self.record_or_not_found(id).await?;
        if let Err(err) = record.lock().await.transport.set_keepalive(enabled) {
            warn!("set_keepalive({id}) failed: {err}");
        }
        Ok(())
    }

    /// `setNoDelay(id, enabled)`: toggles `TCP_NODELAY` on the underlying
    /// socket (SPEC_FULL.md §4.7).
    pub async fn set_nodelay(&self, id: ClientId, enabled: bool) -> Result<(), FacadeError> {
        let record = self.record_or_not_found(id).await?;
        if let Err(err) = record.lock().await.transport.set_nodelay(enabled) {
            warn!("set_nodelay({id}) failed: {err}");
        }
        Ok(())
    }

    pub async fn url(&self, id: ClientId) -> Result<Url, FacadeError> {
        let record = self.record_or_not_found(id).await?;
        let result = record.lock().await.url.clone();
        Ok(result)
    }

    pub async fn bytes_read(&self, id: ClientId) -> Result<u64, FacadeError> {
        let record = self.record_or_not_found(id).await?;
        let result = record.lock().await.transport.bytes_read();
        Ok(result)
    }

    pub async fn bytes_written(&self, id: ClientId) -> Result<u64, FacadeError> {
        let record = self.record_or_not_found(id).await?;
        let result = record.lock().await.transport.bytes_written();
        Ok(result)
    }

    pub async fn is_paused(&self, id: ClientId) -> Result<bool, FacadeError> {
        let record = self.record_or_not_found(id).await?;
        let result = record.lock().await.transport.is_paused();
        Ok(result)
    }

    pub async fn pause(&self, id: ClientId) -> Result<(), FacadeError> {
        let record = self.record_or_not_found(id).await?;
        record.lock().await.transport.pause();
        Ok(())
    }

    pub async fn resume(&self, id: ClientId) -> Result<(), FacadeError> {
        let record = self.record_or_not_found(id).await?;
        record.lock().await.transport.resume();
        Ok(())
    }

    pub async fn set_allow_origin(&self, value: AllowOrigin) {
        self.config.lock().await.set_allow_origin(value);
    }

    /// Sets the server-wide default text decoding mode (SPEC_FULL.md §6
    /// `encoding`). For the per-connection `setEncoding` proxy, see
    /// [`Facade::set_encoding`].
    pub async fn set_default_encoding(&self, value: Encoding) {
        self.config.lock().await.set_encoding(value);
    }

    /// `setEncoding(id, value)`: overrides the text decoding mode for one
    /// connection only, distinct from the server-wide default (SPEC_FULL.md
    /// §4.7).
    pub async fn set_encoding(&self, id: ClientId, value: Encoding) -> Result<(), FacadeError> {
        let record = self.record_or_not_found(id).await?;
        record.lock().await.encoding_override = Some(value);
        Ok(())
    }

    pub async fn set_limit_by_ip(&self, value: i64) -> bool {
        self.config.lock().await.set_limit_by_ip(value)
    }

    pub async fn set_max_payload(&self, value: i64) -> bool {
        self.config.lock().await.set_max_payload(value)
    }

    /// Reschedules the periodic ping task atomically (SPEC_FULL.md §4.7).
    pub async fn set_ping_delay_ms(&self, value: i64) -> bool {
        self.liveness.set_ping_delay_ms(value).await
    }

    pub async fn set_pong_timeout_ms(&self, value: i64) -> bool {
        self.config.lock().await.set_pong_timeout_ms(value)
    }

    pub async fn set_session_expires_ms(&self, value: i64) -> bool {
        self.config.lock().await.set_session_expires_ms(value)
    }
}
