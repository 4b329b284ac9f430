use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use metrics::counter;
use serde::Deserialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::auth::{extract_token, Identity};
use crate::protocol::{
    decode_binary_frame, decode_frame, FrameError, Inbound, RoomId, ServerFrame,
};
use crate::registry::ConnectionHandle;
use crate::state::{ConnectionGuard, SignalingState};

const WRITER_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    /// Event the client is watching. Peers can only reach each other inside
    /// the same room.
    #[serde(default)]
    pub room: Option<RoomId>,
    #[serde(default)]
    pub token: Option<String>,
}

/// WebSocket upgrade handler. Credentials are checked before the upgrade so
/// rejected clients never touch the registry.
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<SignalingState>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = extract_token(&headers, query.token.as_deref());
    let identity = match state.authenticator().authenticate(token) {
        Ok(identity) => identity,
        Err(err) => {
            counter!("eventcast_relay_upgrades_rejected_total", "reason" => err.metric_label())
                .increment(1);
            warn!(remote_addr = %remote_addr, error = %err, "rejecting signaling upgrade");
            return err.status().into_response();
        }
    };

    let room = query
        .room
        .map(|room| room.trim().to_string())
        .filter(|room| !room.is_empty());
    ws.on_upgrade(move |socket| handle_socket(socket, state, room, identity, remote_addr))
}

async fn handle_socket(
    socket: WebSocket,
    state: SignalingState,
    room: Option<RoomId>,
    identity: Identity,
    remote_addr: SocketAddr,
) {
    let (mut sender, receiver) = socket.split();

    let (guard, rx) = match state.connect(room.clone(), identity) {
        Ok(registration) => registration,
        Err(err) => {
            error!(remote_addr = %remote_addr, error = %err, "refusing connection");
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    let connection_id = guard.id();

    info!(
        connection_id = %connection_id,
        remote_addr = %remote_addr,
        room = room.as_deref().unwrap_or("-"),
        user = guard.handle().identity.subject.as_deref().unwrap_or("-"),
        "signaling client connected"
    );

    reply(
        guard.handle(),
        ServerFrame::Welcome {
            id: connection_id,
            room,
        },
    );

    let heartbeat = state.settings().heartbeat_interval;
    let mut writer = tokio::spawn(write_frames(sender, rx, heartbeat));
    read_frames(receiver, &state, &guard).await;

    // Unregistering drops the last senders, which lets the writer flush what
    // is queued and close the socket.
    drop(guard);
    if timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }

    info!(connection_id = %connection_id, "signaling client disconnected");
}

async fn write_frames(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerFrame>,
    heartbeat: Duration,
) {
    let mut heartbeat = interval_at(Instant::now() + heartbeat, heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let message = tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                match frame.to_json() {
                    Ok(json) => Message::Text(json),
                    Err(err) => {
                        error!(error = %err, "failed to encode outbound frame");
                        continue;
                    }
                }
            }
            _ = heartbeat.tick() => Message::Ping(Vec::new()),
        };
        if sender.send(message).await.is_err() {
            break;
        }
    }
    let _ = sender.close().await;
}

/// Dispatch inbound frames one at a time until the client goes away, goes
/// idle, or the relay shuts down.
async fn read_frames(
    mut receiver: SplitStream<WebSocket>,
    state: &SignalingState,
    guard: &ConnectionGuard,
) {
    let connection_id = guard.id();
    let idle_timeout = state.settings().idle_timeout;
    let mut shutdown = state.shutdown_signal();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = tokio::select! {
            _ = shutdown.changed() => {
                debug!(connection_id = %connection_id, "relay shutting down");
                break;
            }
            next = timeout(idle_timeout, receiver.next()) => next,
        };

        let message = match next {
            Err(_) => {
                info!(connection_id = %connection_id, "closing idle signaling connection");
                counter!("eventcast_relay_idle_closed_total").increment(1);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                warn!(connection_id = %connection_id, error = %err, "websocket error");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        let decoded = match message {
            Message::Text(text) => decode_frame(&text),
            Message::Binary(data) => decode_binary_frame(&data),
            Message::Close(frame) => {
                debug!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        handle_inbound(decoded, state, guard);
    }
}

fn handle_inbound(
    decoded: Result<Inbound, FrameError>,
    state: &SignalingState,
    guard: &ConnectionGuard,
) {
    let handle = guard.handle();
    match decoded {
        Ok(Inbound::Signal(envelope)) => {
            state.router().route(handle, envelope);
        }
        Ok(Inbound::Ping) => {
            reply(handle, ServerFrame::Pong);
        }
        Ok(Inbound::Unrecognized(kind)) => {
            counter!("eventcast_relay_envelopes_dropped_total", "reason" => "unrecognized_kind")
                .increment(1);
            debug!(
                connection_id = %handle.id,
                kind = %kind,
                "ignoring unrecognized message type"
            );
        }
        Err(err) => {
            counter!("eventcast_relay_malformed_frames_total").increment(1);
            warn!(connection_id = %handle.id, error = %err, "malformed signaling frame");
            reply(
                handle,
                ServerFrame::Error {
                    message: err.to_string(),
                },
            );
        }
    }
}

/// Queue a relay-generated frame for the connection's own client.
fn reply(handle: &ConnectionHandle, frame: ServerFrame) {
    let reason = match handle.tx.try_send(frame) {
        Ok(()) => return,
        Err(TrySendError::Full(_)) => "outbound_full",
        Err(TrySendError::Closed(_)) => "outbound_closed",
    };
    counter!("eventcast_relay_replies_dropped_total", "reason" => reason).increment(1);
    debug!(connection_id = %handle.id, reason, "dropping reply to client");
}
