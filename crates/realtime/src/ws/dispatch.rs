// Typed event routing for the realtime channel.
//
// Lifecycle and usage events go to one unbounded queue per family; a worker
// drains each queue and spawns one task per event, so a slow write for one
// user never holds up another. Tasks from the same connection are chained
// so they still apply in arrival order. Room events need no store access
// and are handled inline on the socket's task.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use atelier_common::protocol::events::{ClientEvent, ServerEvent, UsageTimePayload};
use atelier_common::usage::FeatureModule;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::jwt::Identity;
use crate::metrics;
use crate::tracking::log_outcome;
use crate::tracking::module_usage::ModuleUsageTracker;
use crate::tracking::presence::{OpenedSession, PresenceTracker};
use crate::ws::rooms::{Room, RoomRegistry};

/// Per-socket state shared between the socket loop and the workers.
#[derive(Debug)]
pub struct ConnectionContext {
    pub connection_id: Uuid,
    pub identity: Identity,
    presence: Mutex<Option<OpenedSession>>,
    started_modules: Mutex<BTreeSet<(FeatureModule, String)>>,
    /// Last queued task per event family.
    presence_tail: Mutex<Option<JoinHandle<()>>>,
    usage_tail: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionContext {
    pub fn new(identity: Identity) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            identity,
            presence: Mutex::new(None),
            started_modules: Mutex::new(BTreeSet::new()),
            presence_tail: Mutex::new(None),
            usage_tail: Mutex::new(None),
        }
    }

    pub async fn presence_session(&self) -> Option<OpenedSession> {
        *self.presence.lock().await
    }

    async fn take_started_modules(&self) -> Vec<(FeatureModule, String)> {
        std::mem::take(&mut *self.started_modules.lock().await).into_iter().collect()
    }
}

#[derive(Debug)]
pub enum PresenceEvent {
    Connected { context: Arc<ConnectionContext>, at: DateTime<Utc> },
    Disconnected { context: Arc<ConnectionContext>, at: DateTime<Utc> },
}

impl PresenceEvent {
    fn context(&self) -> &Arc<ConnectionContext> {
        match self {
            Self::Connected { context, .. } | Self::Disconnected { context, .. } => context,
        }
    }
}

#[derive(Debug)]
pub enum UsageEvent {
    Start { context: Arc<ConnectionContext>, payload: UsageTimePayload, at: DateTime<Utc> },
    End { context: Arc<ConnectionContext>, payload: UsageTimePayload, at: DateTime<Utc> },
    ConnectionClosed {
        context: Arc<ConnectionContext>,
        started: Vec<(FeatureModule, String)>,
        at: DateTime<Utc>,
    },
}

impl UsageEvent {
    fn context(&self) -> &Arc<ConnectionContext> {
        match self {
            Self::Start { context, .. }
            | Self::End { context, .. }
            | Self::ConnectionClosed { context, .. } => context,
        }
    }
}

#[derive(Clone)]
pub struct EventRouter {
    presence_tx: mpsc::UnboundedSender<PresenceEvent>,
    usage_tx: mpsc::UnboundedSender<UsageEvent>,
    rooms: RoomRegistry,
}

impl EventRouter {
    /// Starts both workers on the current runtime.
    pub fn spawn(
        presence: Arc<PresenceTracker>,
        usage: Arc<ModuleUsageTracker>,
        rooms: RoomRegistry,
    ) -> Self {
        let (presence_tx, presence_rx) = mpsc::unbounded_channel();
        let (usage_tx, usage_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_presence_worker(presence, presence_rx));
        tokio::spawn(run_usage_worker(usage, usage_rx));
        Self { presence_tx, usage_tx, rooms }
    }

    pub fn connected(&self, context: &Arc<ConnectionContext>, at: DateTime<Utc>) {
        self.send_presence(PresenceEvent::Connected { context: context.clone(), at });
    }

    /// Closes the presence session and every module session this connection
    /// left open.
    pub async fn disconnected(&self, context: &Arc<ConnectionContext>, at: DateTime<Utc>) {
        let started = context.take_started_modules().await;
        if !started.is_empty() {
            self.send_usage(UsageEvent::ConnectionClosed { context: context.clone(), started, at });
        }
        self.send_presence(PresenceEvent::Disconnected { context: context.clone(), at });
    }

    pub async fn dispatch(
        &self,
        context: &Arc<ConnectionContext>,
        event: ClientEvent,
        at: DateTime<Utc>,
    ) {
        let name = event.name();

        let accepted = match event {
            ClientEvent::Join { tenant_id, user_id } => {
                self.join(context, tenant_id, user_id).await
            }
            ClientEvent::BroadcastMessage { tenant_id, payload } => {
                self.broadcast(context, tenant_id, payload).await
            }
            ClientEvent::SendDm { recipient_id, payload } => {
                self.send_dm(context, recipient_id, payload).await
            }
            ClientEvent::UsageTimeStart(payload) => {
                context
                    .started_modules
                    .lock()
                    .await
                    .insert((payload.module, payload.socket_id.clone()));
                self.send_usage(UsageEvent::Start { context: context.clone(), payload, at });
                true
            }
            ClientEvent::UsageTimeEnd(payload) => {
                context
                    .started_modules
                    .lock()
                    .await
                    .remove(&(payload.module, payload.socket_id.clone()));
                self.send_usage(UsageEvent::End { context: context.clone(), payload, at });
                true
            }
        };

        metrics::record_ws_event(name, !accepted);
    }

    async fn join(&self, context: &ConnectionContext, tenant_id: Uuid, user_id: Uuid) -> bool {
        let identity = context.identity;
        if tenant_id != identity.tenant_id || user_id != identity.user_id {
            warn!(
                connection_id = %context.connection_id,
                user_id = %identity.user_id,
                requested_tenant_id = %tenant_id,
                requested_user_id = %user_id,
                "dropping join that does not match the token identity",
            );
            return false;
        }

        self.rooms.join(context.connection_id, Room::Tenant(tenant_id)).await;
        self.rooms.join(context.connection_id, Room::User(user_id)).await;
        debug!(
            connection_id = %context.connection_id,
            tenant_id = %tenant_id,
            user_id = %user_id,
            "joined tenant and user rooms",
        );
        true
    }

    async fn broadcast(
        &self,
        context: &ConnectionContext,
        tenant_id: Uuid,
        mut payload: Map<String, Value>,
    ) -> bool {
        if tenant_id != context.identity.tenant_id {
            warn!(
                connection_id = %context.connection_id,
                user_id = %context.identity.user_id,
                tenant_id = %tenant_id,
                "dropping broadcast to a foreign tenant",
            );
            return false;
        }

        payload.insert("tenant_id".into(), Value::String(tenant_id.to_string()));
        let event = ServerEvent::ReceiveBroadcast(Value::Object(payload));
        let delivered = self.rooms.emit_to_room(Room::Tenant(tenant_id), &event).await;
        debug!(tenant_id = %tenant_id, delivered, "broadcast fanned out");
        true
    }

    async fn send_dm(
        &self,
        context: &ConnectionContext,
        recipient_id: Uuid,
        mut payload: Map<String, Value>,
    ) -> bool {
        payload.insert("recipient_id".into(), Value::String(recipient_id.to_string()));
        let event = ServerEvent::ReceiveDm(Value::Object(payload));
        // Only the recipient's sockets inside the sender's tenant.
        let delivered = self
            .rooms
            .emit_to_room_within(
                Room::User(recipient_id),
                Room::Tenant(context.identity.tenant_id),
                &event,
            )
            .await;
        debug!(
            connection_id = %context.connection_id,
            recipient_id = %recipient_id,
            delivered,
            "direct message routed",
        );
        true
    }

    fn send_presence(&self, event: PresenceEvent) {
        if self.presence_tx.send(event).is_err() {
            warn!("presence worker has stopped, dropping event");
        }
    }

    fn send_usage(&self, event: UsageEvent) {
        if self.usage_tx.send(event).is_err() {
            warn!("module usage worker has stopped, dropping event");
        }
    }
}

/// Queues `work` behind the previous task on `tail`.
async fn chain_after<F>(tail: &Mutex<Option<JoinHandle<()>>>, work: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let mut tail = tail.lock().await;
    let previous = tail.take();
    *tail = Some(tokio::spawn(async move {
        if let Some(previous) = previous {
            let _ = previous.await;
        }
        work.await;
    }));
}

async fn run_presence_worker(
    tracker: Arc<PresenceTracker>,
    mut events: mpsc::UnboundedReceiver<PresenceEvent>,
) {
    while let Some(event) = events.recv().await {
        let context = event.context().clone();
        let tracker = tracker.clone();
        chain_after(&context.presence_tail, async move {
            handle_presence_event(&tracker, event).await;
        })
        .await;
    }
}

async fn handle_presence_event(tracker: &PresenceTracker, event: PresenceEvent) {
    match event {
        PresenceEvent::Connected { context, at } => {
            let result = tracker.on_connect_at(context.identity, at).await;
            if let Ok(opened) = &result {
                *context.presence.lock().await = Some(*opened);
                debug!(
                    connection_id = %context.connection_id,
                    record_id = %opened.record_id,
                    session_index = opened.session_index,
                    "presence session opened",
                );
            }
            log_outcome("presence_connect", context.identity, &result);
        }
        PresenceEvent::Disconnected { context, at } => {
            let result = tracker.on_disconnect_at(context.identity, at).await;
            if let Ok(closed) = &result {
                let opened = context.presence_session().await;
                info!(
                    connection_id = %context.connection_id,
                    user_id = %context.identity.user_id,
                    record_id = ?opened.map(|opened| opened.record_id),
                    duration_ms = closed.duration_ms,
                    total_time_ms = closed.total_time,
                    "presence session closed",
                );
            }
            log_outcome("presence_disconnect", context.identity, &result);
        }
    }
}

async fn run_usage_worker(
    tracker: Arc<ModuleUsageTracker>,
    mut events: mpsc::UnboundedReceiver<UsageEvent>,
) {
    while let Some(event) = events.recv().await {
        let context = event.context().clone();
        let tracker = tracker.clone();
        chain_after(&context.usage_tail, async move {
            handle_usage_event(&tracker, event).await;
        })
        .await;
    }
}

async fn handle_usage_event(tracker: &ModuleUsageTracker, event: UsageEvent) {
    match event {
        UsageEvent::Start { context, payload, at } => {
            let identity = context.identity;
            let result = tracker
                .on_usage_start_at(identity, payload.module, &payload.socket_id, at)
                .await;
            log_outcome("module_usage_start", identity, &result);
        }
        UsageEvent::End { context, payload, at } => {
            let identity = context.identity;
            let result =
                tracker.on_usage_end_at(identity, payload.module, &payload.socket_id, at).await;
            log_outcome("module_usage_end", identity, &result);
        }
        UsageEvent::ConnectionClosed { context, started, at } => {
            let identity = context.identity;
            let closed = tracker.on_connection_closed_at(identity, &started, at).await;
            if closed > 0 {
                debug!(user_id = %identity.user_id, closed, "closed module sessions left open");
            }
        }
    }
}
