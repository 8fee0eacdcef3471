//! WebSocket relay server
//!
//! Responsibilities:
//! - Accept TCP/WebSocket connections and derive each one's topic from the
//!   handshake request path
//! - Register the connection with the [`Registry`] and run its receive loop
//! - Decode every inbound frame and fan it out to the other connections on
//!   the same topic
//! - Tear the connection down exactly once, whichever way the loop ends
//! - Drive a cooperative shutdown: stop accepting, close every connection
//!   with code 1000 within a grace period, then release the listener

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, info, warn};
use tungstenite::error::ProtocolError;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::CloseFrame;
use tungstenite::protocol::frame::coding::CloseCode;

use crate::broker::{Connection, ConnectionState, Registry, Topic};
use crate::config::ServerSettings;
use crate::transport::message::decode;
use crate::utils::{RelayError, Result};

/// Server lifecycle broadcast to the accept loop and every connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    /// No new connections; existing ones are being closed gracefully.
    Draining,
    /// Grace period over; remaining receive loops stop.
    Stopped,
}

/// Why a connection's receive loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Closure {
    /// Close handshake with code 1000, or without a status code.
    Normal,
    /// Peer vanished without a close handshake (1006).
    Abnormal,
    /// Close handshake with any other code.
    Application { code: u16, reason: String },
    /// WebSocket protocol violation.
    Protocol(String),
    /// Server shutdown ended the loop.
    Shutdown,
}

impl Closure {
    pub fn from_frame(frame: Option<&CloseFrame>) -> Self {
        let Some(frame) = frame else {
            return Closure::Normal;
        };
        match frame.code {
            CloseCode::Normal => Closure::Normal,
            CloseCode::Abnormal => Closure::Abnormal,
            code => Closure::Application {
                code: code.into(),
                reason: frame.reason.to_string(),
            },
        }
    }

    pub fn from_error(error: &tungstenite::Error) -> Self {
        match error {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Closure::Normal
            }
            tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake)
            | tungstenite::Error::Io(_) => Closure::Abnormal,
            other => Closure::Protocol(other.to_string()),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Closure::Normal | Closure::Shutdown => 1000,
            Closure::Abnormal => 1006,
            Closure::Application { code, .. } => *code,
            Closure::Protocol(_) => 1002,
        }
    }

    /// The error a non-graceful closure amounts to. `None` for a clean close.
    pub fn to_error(&self) -> Option<RelayError> {
        let (code, reason) = match self {
            Closure::Normal | Closure::Shutdown => return None,
            Closure::Abnormal => (1006, "closed without a close handshake".to_string()),
            Closure::Application { code, reason } => (*code, reason.clone()),
            Closure::Protocol(reason) => (1002, reason.clone()),
        };
        Some(RelayError::ConnectionClosed { code, reason })
    }

    fn next_state(&self) -> ConnectionState {
        match self {
            Closure::Normal | Closure::Shutdown => ConnectionState::ClosingNormal,
            Closure::Abnormal => ConnectionState::ClosingAbnormal,
            Closure::Application { .. } | Closure::Protocol(_) => ConnectionState::ClosingError,
        }
    }

    fn log(&self, connection: &Connection) {
        let id = connection.id.as_str();
        let topic = &connection.topic;
        match self {
            Closure::Normal => info!(connection = id, %topic, code = self.code(), "connection closed gracefully"),
            Closure::Shutdown => info!(connection = id, %topic, "connection closed by shutdown"),
            Closure::Abnormal => warn!(connection = id, %topic, code = self.code(), "connection closed abnormally"),
            Closure::Application { code, reason } => {
                warn!(connection = id, %topic, code, reason = %reason, "connection closed with error")
            }
            Closure::Protocol(reason) => {
                warn!(connection = id, %topic, reason = %reason, "connection closed on protocol error")
            }
        }
    }
}

/// Removes the connection from the registry exactly once, however the
/// receive loop exits.
struct LeaveGuard {
    registry: Arc<Registry>,
    connection: Arc<Connection>,
}

impl Drop for LeaveGuard {
    fn drop(&mut self) {
        self.registry
            .leave(&self.connection.topic, &self.connection.id);
        self.connection.force_close();
    }
}

pub struct RelayServer {
    registry: Arc<Registry>,
    settings: ServerSettings,
    listener: Mutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    state: watch::Sender<ServerState>,
    shutdown_started: AtomicBool,
}

impl RelayServer {
    /// Bind the listening socket. Connections are accepted once [`RelayServer::run`] is polled.
    pub async fn bind(settings: ServerSettings, registry: Arc<Registry>) -> Result<Self> {
        let listener = TcpListener::bind(settings.addr()).await?;
        let local_addr = listener.local_addr()?;
        let (state, _) = watch::channel(ServerState::Running);

        info!("WebSocket relay listening on ws://{local_addr}");

        Ok(Self {
            registry,
            settings,
            listener: Mutex::new(Some(Arc::new(listener))),
            local_addr,
            state,
            shutdown_started: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Accept connections until shutdown begins.
    pub async fn run(&self) {
        let Some(listener) = self.listener.lock().clone() else {
            debug!("relay already shut down; not accepting");
            return;
        };
        let mut state_rx = self.state.subscribe();

        loop {
            tokio::select! {
                _ = state_rx.wait_for(|s| *s != ServerState::Running) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let registry = self.registry.clone();
                        let echo_to_sender = self.settings.echo_to_sender;
                        let state_rx = self.state.subscribe();
                        tokio::spawn(async move {
                            serve_connection(stream, peer, registry, echo_to_sender, state_rx).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }

        debug!("accept loop stopped");
    }

    /// Stop accepting, close every connection with code 1000, then release
    /// the listening socket. Only the first call does anything.
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            debug!("shutdown already in progress");
            return;
        }

        info!(
            connections = self.registry.connection_count(),
            "Shutting down WebSocket relay"
        );
        self.state.send_replace(ServerState::Draining);

        self.registry.close_all(self.settings.shutdown_grace()).await;

        self.state.send_replace(ServerState::Stopped);
        self.listener.lock().take();

        info!("WebSocket relay stopped");
    }
}

/// Join `connection` to the registry, then confirm the server is still
/// running. Joining first means a concurrent `close_all` either closes the
/// connection itself or has already left the state this check observes.
/// A refused connection is removed again and closed with 1000.
pub(crate) async fn admit(
    registry: &Registry,
    connection: &Arc<Connection>,
    state_rx: &watch::Receiver<ServerState>,
) -> bool {
    registry.join(connection.clone());
    if *state_rx.borrow() == ServerState::Running {
        return true;
    }

    registry.leave(&connection.topic, &connection.id);
    let _ = connection.close(CloseCode::Normal, "server shutting down").await;
    false
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<Registry>,
    echo_to_sender: bool,
    mut state_rx: watch::Receiver<ServerState>,
) {
    let mut path = String::from(Topic::ROOT);
    let callback = |req: &Request, resp: Response| {
        path = req.uri().path().to_owned();
        Ok::<Response, ErrorResponse>(resp)
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "WebSocket handshake error");
            return;
        }
    };

    let topic = Topic::from_path(&path);
    let (ws_sender, mut ws_receiver) = ws_stream.split();
    let connection = Arc::new(Connection::new(topic.clone(), ws_sender));

    if !admit(&registry, &connection, &state_rx).await {
        debug!(connection = %connection.id, %peer, "refused connection during shutdown");
        return;
    }
    let _guard = LeaveGuard {
        registry: registry.clone(),
        connection: connection.clone(),
    };
    connection.advance(ConnectionState::Reading);
    info!(connection = %connection.id, %peer, %topic, "connection opened");

    let exclude = (!echo_to_sender).then_some(&connection.id);

    let closure = loop {
        let frame = tokio::select! {
            _ = state_rx.wait_for(|s| *s == ServerState::Stopped) => break Closure::Shutdown,
            frame = ws_receiver.next() => frame,
        };

        let decoded = match frame {
            Some(Ok(WsMessage::Text(text))) => decode(text.as_bytes()),
            Some(Ok(WsMessage::Binary(bytes))) => decode(&bytes),
            Some(Ok(WsMessage::Close(frame))) => {
                // the close reply is only queued until the next write
                if let Err(e) = connection.flush().await {
                    debug!(connection = %connection.id, error = %e, "close reply not delivered");
                }
                break Closure::from_frame(frame.as_ref());
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break Closure::from_error(&e),
            None => break Closure::Abnormal,
        };

        match decoded {
            Ok(envelope) => {
                let kind = envelope.kind();
                if !kind.is_known() {
                    debug!(connection = %connection.id, kind = kind.as_str(), "relaying unrecognised event kind");
                }
                let delivered = registry
                    .broadcast_except(&topic, &envelope, exclude)
                    .await;
                debug!(
                    connection = %connection.id,
                    %topic,
                    kind = kind.as_str(),
                    delivered,
                    "relayed envelope"
                );
            }
            Err(e) => {
                warn!(connection = %connection.id, error = %e, "Invalid JSON received");
            }
        }
    };

    connection.advance(closure.next_state());
    closure.log(&connection);
}
