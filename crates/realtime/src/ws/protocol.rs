use axum::extract::ws::{Message, WebSocket};
use atelier_common::protocol::events::{encode_server_event, ServerEvent};

use crate::error::{ErrorCode, GateError};

pub const HEARTBEAT_INTERVAL_MS: u64 = 25_000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 20_000;
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

pub async fn send_server_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let encoded = encode_server_event(event).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

/// The single event a rejected handshake receives before the close frame.
pub fn handshake_rejection(error: GateError) -> ServerEvent {
    ServerEvent::Error {
        code: ErrorCode::AuthInvalidToken.as_str().to_string(),
        message: error.to_string(),
    }
}
