pub mod dispatch;
pub mod protocol;
pub mod rooms;

use std::sync::Arc;
use std::time::Duration;

use atelier_common::protocol::events::{decode_client_event, ServerEvent};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::gate::{authenticate_handshake, HandshakeQuery};
use crate::auth::jwt::{Identity, JwtAccessTokenService};
use crate::error::{request_id_from_headers_or_generate, with_request_id_scope, GateError};
use crate::metrics;
use self::dispatch::{ConnectionContext, EventRouter};
use self::protocol::{
    handshake_rejection, send_server_event, HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS,
    MAX_FRAME_BYTES,
};
use self::rooms::RoomRegistry;

#[derive(Clone)]
pub struct RealtimeState {
    jwt_service: Arc<JwtAccessTokenService>,
    events: EventRouter,
    rooms: RoomRegistry,
}

pub fn router(
    jwt_service: Arc<JwtAccessTokenService>,
    events: EventRouter,
    rooms: RoomRegistry,
) -> Router {
    let state = RealtimeState { jwt_service, events, rooms };

    Router::new().route("/v1/ws", get(ws_upgrade)).with_state(state)
}

pub async fn ws_upgrade(
    State(state): State<RealtimeState>,
    Query(query): Query<HandshakeQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    let admission = authenticate_handshake(&state.jwt_service, &query, &headers);

    ws.max_frame_size(MAX_FRAME_BYTES).max_message_size(MAX_FRAME_BYTES).on_upgrade(
        move |socket| async move {
            with_request_id_scope(request_id, async move {
                match admission {
                    Ok(identity) => handle_socket(state, identity, socket).await,
                    Err(error) => reject_socket(socket, error).await,
                }
            })
            .await;
        },
    )
}

async fn reject_socket(mut socket: WebSocket, error: GateError) {
    let reason = match error {
        GateError::MissingToken => "missing_token",
        GateError::InvalidToken => "invalid_token",
    };
    metrics::record_handshake_rejection(reason);

    let _ = send_server_event(&mut socket, &handshake_rejection(error)).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: error.to_string().into(),
        })))
        .await;
}

async fn handle_socket(state: RealtimeState, identity: Identity, mut socket: WebSocket) {
    let context = Arc::new(ConnectionContext::new(identity));
    let connection_id = context.connection_id;

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerEvent>();
    state.rooms.register(connection_id, outbound_sender).await;
    metrics::connection_opened();
    state.events.connected(&context, Utc::now());
    info!(
        connection_id = %connection_id,
        user_id = %identity.user_id,
        tenant_id = %identity.tenant_id,
        "realtime connection opened",
    );

    // Ping every HEARTBEAT_INTERVAL_MS; a ping left unanswered for
    // HEARTBEAT_TIMEOUT_MS drops the connection.
    let mut heartbeat_interval =
        tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset();
    let heartbeat_timeout = Duration::from_millis(HEARTBEAT_TIMEOUT_MS);
    let mut awaiting_pong_since: Option<Instant> = None;

    loop {
        let pong_deadline = awaiting_pong_since.map(|sent_at| sent_at + heartbeat_timeout);
        tokio::select! {
            _ = heartbeat_interval.tick(), if awaiting_pong_since.is_none() => {
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
                awaiting_pong_since = Some(Instant::now());
            }
            _ = tokio::time::sleep_until(pong_deadline.unwrap_or_else(Instant::now)),
                if pong_deadline.is_some() =>
            {
                warn!(connection_id = %connection_id, "heartbeat timeout, disconnecting");
                break;
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(event) => {
                        if send_server_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        handle_text_frame(&state, &context, raw_message.as_str()).await;
                    }
                    Ok(Message::Binary(_)) => {
                        warn!(connection_id = %connection_id, "dropping binary frame");
                        metrics::record_ws_event("malformed", true);
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        awaiting_pong_since = None;
                    }
                    Ok(Message::Close(_)) => break,
                    Err(error) => {
                        debug!(
                            connection_id = %connection_id,
                            error = %error,
                            "socket read failed"
                        );
                        break;
                    }
                }
            }
        }
    }

    state.rooms.remove(connection_id).await;
    state.events.disconnected(&context, Utc::now()).await;
    metrics::connection_closed();
    info!(
        connection_id = %connection_id,
        user_id = %identity.user_id,
        "realtime connection closed",
    );
}

async fn handle_text_frame(state: &RealtimeState, context: &Arc<ConnectionContext>, raw: &str) {
    match decode_client_event(raw) {
        Ok(event) => state.events.dispatch(context, event, Utc::now()).await,
        Err(error) => {
            warn!(
                connection_id = %context.connection_id,
                error = %error,
                "dropping malformed frame",
            );
            metrics::record_ws_event("malformed", true);
        }
    }
}
