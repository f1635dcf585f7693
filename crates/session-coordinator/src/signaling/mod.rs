//! WebSocket signaling endpoint.
//!
//! Each connection gets one task that owns the socket. It multiplexes three
//! sources: inbound frames from the participant, pushes queued for the
//! participant through the [`PresenceGateway`], and coordinator shutdown.
//! Replies to requests are written directly and echo the request id;
//! pushes carry none.

mod session;

pub use session::SignalingSession;

use crate::negotiator::SessionNegotiator;
use crate::observability::metrics;
use crate::permissions::PermissionController;
use crate::presence::{PresenceGateway, OUTBOUND_BUFFER};
use crate::registry::RoomRegistry;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use common::signaling::{decode_client_frame, encode_server_frame, ServerMessage};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Largest inbound frame accepted, in bytes.
const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Everything a signaling connection needs.
pub struct SignalingState {
    pub registry: Arc<RoomRegistry>,
    pub negotiator: SessionNegotiator,
    pub permissions: PermissionController,
    pub presence: Arc<PresenceGateway>,
    pub cancel_token: CancellationToken,
}

/// Build the signaling router (`GET /ws`).
pub fn signaling_router(state: Arc<SignalingState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<SignalingState>>) -> Response {
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_failed_upgrade(|error| {
            warn!(target: "sc.signaling", error = %error, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| handle_connection(socket, state))
}

/// Serialize and write one frame. Returns `false` once the socket is gone.
async fn write_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    request_id: Option<u64>,
    message: ServerMessage,
) -> bool {
    let text = match encode_server_frame(request_id, message) {
        Ok(text) => text,
        Err(e) => {
            warn!(target: "sc.signaling", error = %e, "Failed to encode frame");
            return true;
        }
    };
    sink.send(Message::Text(text)).await.is_ok()
}

/// Drive one participant connection until it closes or the coordinator stops.
pub async fn handle_connection(socket: WebSocket, state: Arc<SignalingState>) {
    let connection_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);
    let mut session = SignalingSession::new(Arc::clone(&state), connection_id.clone(), outbound_tx);

    debug!(target: "sc.signaling", connection_id = %connection_id, "Connection opened");

    loop {
        tokio::select! {
            biased;

            () = state.cancel_token.cancelled() => {
                info!(
                    target: "sc.signaling",
                    connection_id = %connection_id,
                    "Coordinator shutting down, closing connection"
                );
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }

            Some(message) = outbound_rx.recv() => {
                session.on_outbound(&message);
                if !write_frame(&mut ws_sender, None, message).await {
                    break;
                }
            }

            frame = ws_receiver.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(
                            target: "sc.signaling",
                            connection_id = %connection_id,
                            error = %e,
                            "WebSocket receive error"
                        );
                        break;
                    }
                };

                let (request_id, reply) = match decode_client_frame(&text) {
                    Ok(envelope) => {
                        let reply = session.handle(envelope.body).await;
                        (envelope.request_id, reply)
                    }
                    Err(rejected) => {
                        metrics::record_error("decode", "validation");
                        debug!(
                            target: "sc.signaling",
                            connection_id = %connection_id,
                            error = %rejected.error,
                            "Rejected inbound frame"
                        );
                        (
                            rejected.request_id,
                            ServerMessage::Error {
                                category: rejected.error.category(),
                                message: rejected.error.to_string(),
                            },
                        )
                    }
                };

                if !write_frame(&mut ws_sender, request_id, reply).await {
                    break;
                }
            }
        }
    }

    session.on_disconnect().await;
    debug!(target: "sc.signaling", connection_id = %connection_id, "Connection closed");
}
