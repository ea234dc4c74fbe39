//! The WebSocket multiplexer: upgrade, registry, fan-out, inbound drain.
//!
//! `/api/v1/status` serves anonymous viewers (state broadcasts only),
//! `/api/v1/control` requires a bearer JWT. Sockets are keyed by
//! `(identity, socket-id)`; a duplicate key kills the previous socket, and
//! per-socket writes are serialized so WebSocket frames never interleave.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cadenzalib::ids::{SocketId, UserId};
use cadenzaplayback::error::Error;

use crate::auth::TokenVerifier;

/// One inbound text frame, annotated with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketData {
    pub text: String,
    pub user: UserId,
    pub socket: SocketId,
}

struct Socket {
    user: UserId,
    id: SocketId,
    /// Write half; the mutex keeps frames whole under concurrent writers.
    writer: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
    kill: CancellationToken,
}

impl Socket {
    async fn write(&self, data: &str) -> Result<(), axum::Error> {
        self.writer
            .lock()
            .await
            .send(Message::Text(data.to_owned().into()))
            .await
    }
}

pub struct SocketManager {
    sockets: RwLock<HashMap<(UserId, SocketId), Arc<Socket>>>,
    read_tx: mpsc::UnboundedSender<SocketData>,
}

impl SocketManager {
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SocketData>) {
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            sockets: RwLock::new(HashMap::new()),
            read_tx,
        });
        (manager, read_rx)
    }

    /// Register the upgraded socket and drain it until close, read error or
    /// a manager-issued kill. Runs as the upgrade callback's future.
    pub async fn open(self: Arc<Self>, ws: WebSocket, user: UserId) {
        let id = Uuid::new_v4();
        let (sink, stream) = ws.split();
        let socket = Arc::new(Socket {
            user,
            id,
            writer: tokio::sync::Mutex::new(sink),
            kill: CancellationToken::new(),
        });

        {
            let mut sockets = self.sockets.write();
            // same-key collisions should not happen, ids are fresh; kill any
            // survivor
            if let Some(previous) = sockets.insert((user, id), Arc::clone(&socket)) {
                previous.kill.cancel();
            }
        }
        info!("socket opened: user {user} socket {id}");

        self.drain(&socket, stream).await;

        self.sockets.write().remove(&(user, id));
        info!("socket closed: user {user} socket {id}");
    }

    async fn drain(&self, socket: &Socket, mut stream: SplitStream<WebSocket>) {
        loop {
            tokio::select! {
                () = socket.kill.cancelled() => break,
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        let _ = self.read_tx.send(SocketData {
                            text: text.to_string(),
                            user: socket.user,
                            socket: socket.id,
                        });
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary/ping/pong carry no commands
                    Some(Err(err)) => {
                        warn!("socket read: user {} socket {}: {err}", socket.user, socket.id);
                        break;
                    }
                }
            }
        }
    }

    /// Targeted write; fails with [`Error::NoSuchSocket`] on an unknown key.
    pub async fn write(&self, data: &str, user: UserId, id: SocketId) -> Result<(), Error> {
        let socket = self
            .sockets
            .read()
            .get(&(user, id))
            .cloned()
            .ok_or(Error::NoSuchSocket)?;
        socket
            .write(data)
            .await
            .map_err(|err| Error::Other(anyhow::anyhow!("write to socket: {err}")))
    }

    /// Broadcast to every open socket; write failures are logged, the socket
    /// itself gets cleaned up by its own read loop.
    pub async fn write_all(&self, data: &str) {
        for socket in self.snapshot(false) {
            if let Err(err) = socket.write(data).await {
                debug!("broadcast to socket {}: {err}", socket.id);
            }
        }
    }

    /// Broadcast to authenticated controllers only.
    pub async fn write_authenticated(&self, data: &str) {
        for socket in self.snapshot(true) {
            if let Err(err) = socket.write(data).await {
                debug!("broadcast to socket {}: {err}", socket.id);
            }
        }
    }

    fn snapshot(&self, authenticated_only: bool) -> Vec<Arc<Socket>> {
        self.sockets
            .read()
            .values()
            .filter(|socket| !authenticated_only || !socket.user.is_anonymous())
            .cloned()
            .collect()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SocketManager>,
    pub verifier: Arc<TokenVerifier>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/status", get(status_socket))
        .route("/api/v1/control", get(control_socket))
        .with_state(state)
}

/// Anonymous, status-only socket.
async fn status_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| state.manager.clone().open(socket, UserId::ANONYMOUS))
}

/// Authenticated control socket; bearer JWT carries the identity.
async fn control_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    match state.verifier.verify_bearer(authorization) {
        Ok(user) => ws.on_upgrade(move |socket| state.manager.clone().open(socket, user)),
        Err(err) => {
            warn!("control socket rejected: {err}");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}
