use std::sync::Mutex;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use huddle_protocol::{ClientMessage, ConnectionId, MemberInfo, ServerMessage, SignalKind};

use crate::error::EndpointError;
use crate::link::SignalSink;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Session traffic surfaced to the application after a successful join.
#[derive(Debug)]
pub enum SessionEvent {
    MemberJoined(MemberInfo),
    MemberLeft {
        connection_id: ConnectionId,
        display_name: String,
    },
    Signal {
        kind: SignalKind,
        from: ConnectionId,
        payload: Value,
    },
    /// The signaling connection itself went away.
    Disconnected,
}

/// A joined session: the client handle, the id the server assigned us, the
/// members already present, and the live event stream.
pub struct JoinedSession {
    pub client: std::sync::Arc<SignalingClient>,
    pub connection_id: ConnectionId,
    pub members: Vec<MemberInfo>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Client side of the signaling connection.
///
/// Owns a writer task draining an unbounded channel into the socket, a
/// reader task translating server messages into [`SessionEvent`]s, and a
/// heartbeat task. All tasks are aborted on drop.
pub struct SignalingClient {
    connection_id: ConnectionId,
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SignalingClient {
    /// Connect to the server, join `session_id`, and wait for the join to be
    /// acknowledged.
    pub async fn connect(
        server_url: &str,
        session_id: &str,
        display_name: &str,
    ) -> Result<JoinedSession, EndpointError> {
        let websocket_url = derive_websocket_url(server_url, session_id)?;
        let (ws_stream, _) = connect_async(websocket_url.as_str())
            .await
            .map_err(|err| EndpointError::Setup(format!("websocket connect failed: {err}")))?;
        debug!(url = %websocket_url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<SessionEvent>();
        let (join_tx, join_rx) =
            oneshot::channel::<Result<(ConnectionId, Vec<MemberInfo>), String>>();

        let writer_handle = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                if let Ok(text) = serde_json::to_string(&message) {
                    if ws_write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
        });

        let reader_handle = tokio::spawn(async move {
            let mut join_tx = Some(join_tx);
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        debug!(error = %err, "signaling websocket error");
                        break;
                    }
                };
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => {
                        if handle_server_message(message, &mut join_tx, &events_tx).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "unparseable server message");
                    }
                }
            }
            let _ = events_tx.send(SessionEvent::Disconnected);
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await; // first tick is immediate, skip it
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        send_tx
            .send(ClientMessage::Join {
                display_name: display_name.to_string(),
            })
            .map_err(|_| EndpointError::ChannelClosed)?;

        let (connection_id, members) = match join_rx.await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(reason)) => {
                writer_handle.abort();
                reader_handle.abort();
                heartbeat_handle.abort();
                return Err(EndpointError::JoinRejected(reason));
            }
            Err(_) => {
                writer_handle.abort();
                heartbeat_handle.abort();
                return Err(EndpointError::ChannelClosed);
            }
        };
        debug!(connection_id = %connection_id, members = members.len(), "joined session");

        let client = std::sync::Arc::new(SignalingClient {
            connection_id: connection_id.clone(),
            send_tx,
            tasks: Mutex::new(vec![writer_handle, reader_handle, heartbeat_handle]),
        });

        Ok(JoinedSession {
            client,
            connection_id,
            members,
            events: events_rx,
        })
    }

    /// The id the server assigned to this connection.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Queue a negotiation signal for `to`. Best effort: the server drops
    /// envelopes whose target has already left.
    pub fn send_signal(
        &self,
        kind: SignalKind,
        to: ConnectionId,
        payload: Value,
    ) -> Result<(), EndpointError> {
        self.send_tx
            .send(ClientMessage::signal(kind, to, payload))
            .map_err(|_| EndpointError::ChannelClosed)
    }

    /// Leave the session without closing the connection.
    pub fn leave(&self) -> Result<(), EndpointError> {
        self.send_tx
            .send(ClientMessage::Leave)
            .map_err(|_| EndpointError::ChannelClosed)
    }
}

impl SignalSink for SignalingClient {
    fn send(&self, kind: SignalKind, to: ConnectionId, payload: Value) -> Result<(), EndpointError> {
        self.send_signal(kind, to, payload)
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

/// Returns Err once the event stream is gone and the reader should stop.
fn handle_server_message(
    message: ServerMessage,
    join_tx: &mut Option<oneshot::Sender<Result<(ConnectionId, Vec<MemberInfo>), String>>>,
    events_tx: &mpsc::UnboundedSender<SessionEvent>,
) -> Result<(), ()> {
    match message {
        ServerMessage::JoinSuccess {
            connection_id,
            members,
        } => {
            if let Some(tx) = join_tx.take() {
                let _ = tx.send(Ok((connection_id, members)));
            }
            Ok(())
        }
        ServerMessage::JoinError { reason } => {
            if let Some(tx) = join_tx.take() {
                let _ = tx.send(Err(reason));
            } else {
                warn!(reason = %reason, "join error after join completed");
            }
            Ok(())
        }
        ServerMessage::MemberJoined { member } => events_tx
            .send(SessionEvent::MemberJoined(member))
            .map_err(drop),
        ServerMessage::MemberLeft {
            connection_id,
            display_name,
        } => events_tx
            .send(SessionEvent::MemberLeft {
                connection_id,
                display_name,
            })
            .map_err(drop),
        ServerMessage::Offer { from, payload } => events_tx
            .send(SessionEvent::Signal {
                kind: SignalKind::Offer,
                from,
                payload,
            })
            .map_err(drop),
        ServerMessage::Answer { from, payload } => events_tx
            .send(SessionEvent::Signal {
                kind: SignalKind::Answer,
                from,
                payload,
            })
            .map_err(drop),
        ServerMessage::Candidate { from, payload } => events_tx
            .send(SessionEvent::Signal {
                kind: SignalKind::Candidate,
                from,
                payload,
            })
            .map_err(drop),
        ServerMessage::Pong => Ok(()),
        ServerMessage::Error { message } => {
            warn!(message = %message, "server reported an error");
            Ok(())
        }
    }
}

fn derive_websocket_url(server_url: &str, session_id: &str) -> Result<Url, EndpointError> {
    if session_id.is_empty() {
        return Err(EndpointError::Setup("session id must be non-empty".into()));
    }
    let base = Url::parse(server_url)
        .map_err(|err| EndpointError::Setup(format!("invalid server url {server_url}: {err}")))?;
    let mut ws = base.clone();
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(EndpointError::Setup(format!(
                "unsupported server url scheme: {other}"
            )))
        }
    };
    ws.set_scheme(scheme)
        .map_err(|_| EndpointError::Setup("invalid websocket scheme".into()))?;
    ws.set_path(&format!("ws/{session_id}"));
    ws.set_query(None);
    ws.set_fragment(None);
    Ok(ws)
}
