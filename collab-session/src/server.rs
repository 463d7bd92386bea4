//! WebSocket server with room-based session routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── outbound queue A ──► Client A
//!             ├── connection task ──► SessionManager
//! Client B ──┘   (one per socket)    └── outbound queue B ──► Client B
//! ```
//!
//! Each connection task owns its socket. It reads frames, decodes them
//! into [`ClientEvent`]s and dispatches them one at a time; in the same
//! `select!` loop it drains its outbound queue into the socket and sends
//! heartbeat pings. Whatever ends the loop (close frame, transport error,
//! send failure), the disconnect cascade runs before the task exits.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::identity::{bearer_token, Identity, IdentityError, IdentityVerifier};
use crate::manager::SessionManager;
use crate::protocol::{ClientEvent, ConnectionId, ProtocolError, ServerEvent};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum distinct participants per session
    pub max_participants_per_session: usize,
    /// Outbound frames buffered per connection before drops
    pub outbound_capacity: usize,
    /// Transport ping interval in seconds
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_participants_per_session: 100,
            outbound_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl ServerConfig {
    /// Load from `COLLAB_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn parse<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &'static str,
            default: T,
        ) -> Result<T, ConfigError> {
            match lookup(key) {
                Some(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue { key, value }),
                None => Ok(default),
            }
        }

        let defaults = Self::default();
        let config = Self {
            bind_addr: lookup("COLLAB_BIND_ADDR").unwrap_or(defaults.bind_addr),
            max_participants_per_session: parse(
                &lookup,
                "COLLAB_MAX_PARTICIPANTS",
                defaults.max_participants_per_session,
            )?,
            outbound_capacity: parse(&lookup, "COLLAB_OUTBOUND_CAPACITY", defaults.outbound_capacity)?,
            heartbeat_interval_secs: parse(
                &lookup,
                "COLLAB_HEARTBEAT_SECS",
                defaults.heartbeat_interval_secs,
            )?,
        };

        if config.max_participants_per_session == 0 {
            return Err(ConfigError::Zero("COLLAB_MAX_PARTICIPANTS"));
        }
        if config.outbound_capacity == 0 {
            return Err(ConfigError::Zero("COLLAB_OUTBOUND_CAPACITY"));
        }
        if config.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Zero("COLLAB_HEARTBEAT_SECS"));
        }
        Ok(config)
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_events: u64,
    pub malformed_events: u64,
    pub rejected_handshakes: u64,
    pub accept_errors: u64,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How long to pause after a failed accept. Errors that only concern the
/// one pending connection need no pause; anything else (descriptor or
/// memory exhaustion) gets a short back-off.
fn accept_retry_delay(err: &std::io::Error) -> Option<Duration> {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionRefused
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock => None,
        _ => Some(ACCEPT_RETRY_DELAY),
    }
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    manager: Arc<SessionManager>,
    verifier: Option<Arc<dyn IdentityVerifier>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    /// Create a server with its own session manager.
    pub fn new(config: ServerConfig) -> Self {
        let manager = Arc::new(SessionManager::new(config.max_participants_per_session));
        Self::with_manager(config, manager)
    }

    /// Create a server around an existing manager (stores already attached).
    pub fn with_manager(config: ServerConfig, manager: Arc<SessionManager>) -> Self {
        Self {
            config,
            manager,
            verifier: None,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Require a bearer credential on every connection.
    pub fn with_verifier(mut self, verifier: Arc<dyn IdentityVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Bind the configured address and serve. Only a failed bind returns.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collaboration server listening on {}", self.config.bind_addr);
        self.serve(listener).await;
        Ok(())
    }

    /// Serve connections from an already-bound listener, forever.
    ///
    /// Accept errors are logged and counted; the loop backs off briefly when
    /// the process is out of resources and keeps accepting.
    pub async fn serve(&self, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    self.stats.write().await.accept_errors += 1;
                    match accept_retry_delay(&e) {
                        Some(delay) => {
                            log::error!("Accept failed: {e}; retrying in {delay:?}");
                            tokio::time::sleep(delay).await;
                        }
                        None => log::warn!("Accept failed: {e}"),
                    }
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let manager = self.manager.clone();
            let verifier = self.verifier.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, manager, verifier, stats, config).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection from handshake to teardown.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        manager: Arc<SessionManager>,
        verifier: Option<Arc<dyn IdentityVerifier>>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let require_credential = verifier.is_some();
        let mut credential: Option<String> = None;
        let handshake = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
                credential = bearer_token(req);
                if require_credential && credential.is_none() {
                    let mut rejection = ErrorResponse::new(Some(IdentityError::MissingCredential.to_string()));
                    *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                    return Err(rejection);
                }
                Ok(response)
            },
        )
        .await;
        let ws_stream = match handshake {
            Ok(ws) => ws,
            Err(e) => {
                stats.write().await.rejected_handshakes += 1;
                log::warn!("WebSocket handshake with {addr} failed: {e}");
                return Ok(());
            }
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let identity = match (&verifier, credential) {
            (Some(verifier), Some(token)) => match verifier.verify(&token).await {
                Ok(identity) => Some(identity),
                Err(e) => {
                    stats.write().await.rejected_handshakes += 1;
                    log::warn!("Rejected credential from {addr}: {e}");
                    let frame = ServerEvent::error(e.to_string()).encode()?;
                    ws_sender.send(Message::text(frame)).await?;
                    ws_sender.send(Message::Close(None)).await?;
                    return Ok(());
                }
            },
            _ => None,
        };

        let (outbound_tx, mut outbound_rx) = mpsc::channel(config.outbound_capacity);
        let connection_id = manager.connect(outbound_tx).await;
        log::info!("WebSocket connection {connection_id} established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs));
        heartbeat.tick().await;

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                Self::handle_frame(
                                    &manager, &stats, connection_id, identity.as_ref(), text.as_str(),
                                ).await;
                            }
                            Some(Ok(Message::Binary(_))) => {
                                stats.write().await.malformed_events += 1;
                                log::warn!("Dropping frame from {connection_id}: {}", ProtocolError::BinaryFrame);
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection {connection_id} closed by {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::warn!("WebSocket error on {connection_id}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    frame = outbound_rx.recv() => {
                        match frame {
                            Some(frame) => ws_sender.send(Message::text(String::clone(&frame))).await?,
                            None => break,
                        }
                    }

                    _ = heartbeat.tick() => {
                        ws_sender.send(Message::Ping(Vec::new().into())).await?;
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        let cleaned = manager.disconnect_cascade(connection_id).await;
        log::info!("Connection {connection_id} torn down ({cleaned} sessions cleaned up)");
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    async fn handle_frame(
        manager: &SessionManager,
        stats: &RwLock<ServerStats>,
        connection_id: ConnectionId,
        identity: Option<&Identity>,
        text: &str,
    ) {
        stats.write().await.total_events += 1;
        match ClientEvent::decode(text) {
            Ok(event) => manager.dispatch(connection_id, event, identity).await,
            Err(err @ ProtocolError::MissingField { event: "join-session", .. }) => {
                manager.reject(connection_id, err).await;
            }
            Err(ProtocolError::MissingField { event, field }) => {
                log::debug!("Dropping {event} from {connection_id}: missing {field}");
            }
            Err(e) => {
                stats.write().await.malformed_events += 1;
                log::warn!("Dropping malformed frame from {connection_id}: {e}");
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Shared session state.
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }
}
