use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use huddle_protocol::{ClientMessage, ConnectionId, Envelope, ServerMessage, SignalKind};

use crate::registry::{RegistryError, SessionRegistry};
use crate::relay::SignalRelay;

/// Shared state handed to every WebSocket connection.
#[derive(Clone)]
pub struct SignalingState {
    pub registry: Arc<SessionRegistry>,
    pub relay: SignalRelay,
}

impl SignalingState {
    pub fn new() -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let relay = SignalRelay::new(registry.clone());
        Self { registry, relay }
    }
}

impl Default for SignalingState {
    fn default() -> Self {
        Self::new()
    }
}

/// WebSocket upgrade handler for `/ws/:session_id`.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<SignalingState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

/// Drive one endpoint connection until it closes.
///
/// The connection owns its outbound queue: a writer task drains an unbounded
/// channel into the socket, so registry and relay sends never block on a
/// slow peer. Teardown runs `leave` exactly once; an earlier explicit leave
/// makes it a no-op.
async fn handle_socket(socket: WebSocket, session_id: String, state: SignalingState) {
    let connection_id = ConnectionId::generate();
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer_id = connection_id.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    error!(connection_id = %writer_id, error = %err, "failed to encode outbound message");
                }
            }
        }
        debug!(connection_id = %writer_id, "writer task ended");
    });

    debug!(connection_id = %connection_id, session_id, "connection opened");

    // A connection may join at most one session over its lifetime, even
    // after leaving it.
    let mut joined_once = false;

    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(err) => {
                debug!(connection_id = %connection_id, error = %err, "websocket error");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                dispatch_text(
                    text.as_str(),
                    &connection_id,
                    &session_id,
                    &state,
                    &tx,
                    &mut joined_once,
                );
            }
            Message::Binary(data) => {
                // Tolerate JSON arriving in binary frames.
                match std::str::from_utf8(&data) {
                    Ok(text) => dispatch_text(
                        text,
                        &connection_id,
                        &session_id,
                        &state,
                        &tx,
                        &mut joined_once,
                    ),
                    Err(_) => {
                        debug!(connection_id = %connection_id, "ignoring non-UTF8 binary frame");
                    }
                }
            }
            Message::Close(_) => {
                debug!(connection_id = %connection_id, "close frame received");
                break;
            }
            _ => {}
        }
    }

    leave(&state, &connection_id);
    debug!(connection_id = %connection_id, session_id, "connection closed");
}

fn dispatch_text(
    text: &str,
    connection_id: &ConnectionId,
    session_id: &str,
    state: &SignalingState,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    joined_once: &mut bool,
) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => {
            handle_client_message(message, connection_id, session_id, state, tx, joined_once);
        }
        Err(err) => {
            warn!(connection_id = %connection_id, error = %err, "unparseable client message");
            let _ = tx.send(ServerMessage::Error {
                message: format!("invalid message format: {err}"),
            });
        }
    }
}

/// One dispatch table keyed by message type; each arm maps to a registry or
/// relay contract operation.
fn handle_client_message(
    message: ClientMessage,
    connection_id: &ConnectionId,
    session_id: &str,
    state: &SignalingState,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    joined_once: &mut bool,
) {
    match message {
        ClientMessage::Join { display_name } => {
            if *joined_once {
                let _ = tx.send(ServerMessage::JoinError {
                    reason: format!("connection {connection_id} is already a member of a session"),
                });
                return;
            }
            match state
                .registry
                .join(session_id, connection_id.clone(), &display_name, tx.clone())
            {
                Ok(outcome) => {
                    *joined_once = true;
                    let _ = tx.send(ServerMessage::JoinSuccess {
                        connection_id: connection_id.clone(),
                        members: outcome.existing.clone(),
                    });
                    state.relay.announce_joined(&outcome);
                }
                Err(err @ RegistryError::AlreadyJoined(_)) => {
                    let _ = tx.send(ServerMessage::JoinError {
                        reason: err.to_string(),
                    });
                }
                Err(err) => {
                    let _ = tx.send(ServerMessage::Error {
                        message: err.to_string(),
                    });
                }
            }
        }
        ClientMessage::Leave => leave(state, connection_id),
        ClientMessage::Offer { to, payload } => {
            state.relay.relay(Envelope::new(
                SignalKind::Offer,
                connection_id.clone(),
                to,
                payload,
            ));
        }
        ClientMessage::Answer { to, payload } => {
            state.relay.relay(Envelope::new(
                SignalKind::Answer,
                connection_id.clone(),
                to,
                payload,
            ));
        }
        ClientMessage::Candidate { to, payload } => {
            state.relay.relay(Envelope::new(
                SignalKind::Candidate,
                connection_id.clone(),
                to,
                payload,
            ));
        }
        ClientMessage::Ping => {
            let _ = tx.send(ServerMessage::Pong);
        }
    }
}

fn leave(state: &SignalingState, connection_id: &ConnectionId) {
    match state.registry.leave(connection_id) {
        Ok(outcome) => state.relay.announce_left(&outcome),
        Err(RegistryError::NotFound(_)) => {
            debug!(connection_id = %connection_id, "leave for connection with no membership");
        }
        Err(err) => {
            warn!(connection_id = %connection_id, error = %err, "leave failed");
        }
    }
}
