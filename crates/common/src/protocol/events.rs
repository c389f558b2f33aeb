// Event frames for the realtime channel.
//
// Every text frame is `{"event": "<name>", "data": {...}}`. Disconnect is
// not a frame: it is the socket closing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::usage::FeatureModule;

/// Client -> Server events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Join the tenant room and the caller's own user room.
    Join { tenant_id: Uuid, user_id: Uuid },

    /// Fan a payload out to everyone in a tenant room.
    BroadcastMessage {
        tenant_id: Uuid,
        #[serde(flatten)]
        payload: Map<String, Value>,
    },

    /// Deliver a payload to one user's room.
    SendDm {
        recipient_id: Uuid,
        #[serde(flatten)]
        payload: Map<String, Value>,
    },

    /// A feature module became active in a client tab.
    UsageTimeStart(UsageTimePayload),

    /// A feature module stopped being active in a client tab.
    UsageTimeEnd(UsageTimePayload),
}

impl ClientEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::BroadcastMessage { .. } => "broadcast-message",
            Self::SendDm { .. } => "send-dm",
            Self::UsageTimeStart(_) => "usage-time-start",
            Self::UsageTimeEnd(_) => "usage-time-end",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageTimePayload {
    pub module: FeatureModule,
    /// Client-side connection id, one per tab.
    #[serde(rename = "socketId")]
    pub socket_id: String,
}

/// Server -> Client events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Re-emission of a `broadcast-message` payload to the tenant room.
    ReceiveBroadcast(Value),

    /// Re-emission of a `send-dm` payload to the recipient's room.
    ReceiveDm(Value),

    /// Handshake rejection. Nothing else is reported back on the channel.
    Error { code: String, message: String },
}

pub fn decode_client_event(raw: &str) -> Result<ClientEvent, serde_json::Error> {
    serde_json::from_str(raw)
}

pub fn encode_server_event(event: &ServerEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}
