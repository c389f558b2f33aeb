// Platform-wide presence: one daily record per (user, tenant), one session
// per connection.

use atelier_common::usage::{DailyPresenceRecord, Session};
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::auth::jwt::Identity;
use crate::error::TrackingError;
use crate::store::RecordStore;
use crate::tracking::compactor::compact;
use crate::tracking::day::DayBoundary;
use crate::tracking::reconciler::StaleSessionReconciler;
use crate::tracking::retry::{with_retry, RetryPolicy, Step};

/// Where a connect landed, kept on the connection for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenedSession {
    pub record_id: Uuid,
    pub session_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosedSession {
    pub duration_ms: i64,
    pub total_time: i64,
}

#[derive(Clone)]
pub struct PresenceTracker {
    store: RecordStore,
    reconciler: StaleSessionReconciler,
    day_boundary: DayBoundary,
    retry: RetryPolicy,
}

impl PresenceTracker {
    pub fn new(
        store: RecordStore,
        reconciler: StaleSessionReconciler,
        day_boundary: DayBoundary,
        retry: RetryPolicy,
    ) -> Self {
        Self { store, reconciler, day_boundary, retry }
    }

    pub async fn on_connect(&self, identity: Identity) -> Result<OpenedSession, TrackingError> {
        self.on_connect_at(identity, Utc::now()).await
    }

    pub async fn on_connect_at(
        &self,
        identity: Identity,
        now: DateTime<Utc>,
    ) -> Result<OpenedSession, TrackingError> {
        let date = self.day_boundary.day_of(now);
        self.reconciler.reconcile_at(identity, date, now).await;

        with_retry(
            self.retry,
            "presence_connect",
            || self.store.load_presence(identity.user_id, identity.tenant_id, date),
            |current| {
                let (record, opened) = open_session(current, identity, date, now);
                Ok(Step::Save(record, opened))
            },
            |record| self.store.save_presence(record),
        )
        .await
    }

    pub async fn on_disconnect(&self, identity: Identity) -> Result<ClosedSession, TrackingError> {
        self.on_disconnect_at(identity, Utc::now()).await
    }

    pub async fn on_disconnect_at(
        &self,
        identity: Identity,
        now: DateTime<Utc>,
    ) -> Result<ClosedSession, TrackingError> {
        let date = self.day_boundary.day_of(now);

        with_retry(
            self.retry,
            "presence_disconnect",
            || self.store.load_presence(identity.user_id, identity.tenant_id, date),
            |current| {
                let record = current.ok_or(TrackingError::NotFoundRace("presence record"))?;
                let (record, closed) = close_first_open_session(record, now)?;
                Ok(Step::Save(record, closed))
            },
            |record| self.store.save_presence(record),
        )
        .await
    }
}

/// Appends an open session to today's record, creating the record on the
/// first connect of the day.
pub fn open_session(
    current: Option<DailyPresenceRecord>,
    identity: Identity,
    date: NaiveDate,
    now: DateTime<Utc>,
) -> (DailyPresenceRecord, OpenedSession) {
    let Some(mut record) = current else {
        let record =
            DailyPresenceRecord::first_of_day(identity.user_id, identity.tenant_id, date, now);
        let opened = OpenedSession { record_id: record.id, session_index: 0 };
        return (record, opened);
    };

    let mut sessions = compact(&record.sessions);
    sessions.push(Session::open(now));
    let session_index = sessions.len() - 1;

    record.sessions = sessions;
    record.recompute_total_time();
    record.is_currently_online = true;
    record.last_activity = now;

    let opened = OpenedSession { record_id: record.id, session_index };
    (record, opened)
}

/// Closes the first open session. A record with nothing open is a
/// reconnect race and is left untouched.
pub fn close_first_open_session(
    mut record: DailyPresenceRecord,
    now: DateTime<Utc>,
) -> Result<(DailyPresenceRecord, ClosedSession), TrackingError> {
    let index = record
        .sessions
        .iter()
        .position(Session::is_open)
        .ok_or(TrackingError::NotFoundRace("open presence session"))?;

    let closed = record.sessions[index].close(now);
    let duration_ms = closed.duration_ms();
    record.sessions[index] = closed;
    record.sessions = compact(&record.sessions);
    record.recompute_total_time();
    record.is_currently_online = false;
    record.last_activity = now;

    let closed = ClosedSession { duration_ms, total_time: record.total_time };
    Ok((record, closed))
}
