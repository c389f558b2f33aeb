// Per-feature usage time, keyed by the client's own connection id so that
// two tabs on the same module keep separate sessions.

use atelier_common::usage::{DailyModuleUsageRecord, FeatureModule, ModuleSession};
use chrono::{DateTime, NaiveDate, Utc};

use crate::auth::jwt::Identity;
use crate::error::TrackingError;
use crate::store::RecordStore;
use crate::tracking::day::DayBoundary;
use crate::tracking::log_outcome;
use crate::tracking::retry::{with_retry, RetryPolicy, Step};

pub const MAX_CLIENT_CONNECTION_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Opened { session_index: usize },
    /// The tab already has a session today, open or closed.
    AlreadyTracked { session_index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndOutcome {
    pub session_index: usize,
    pub duration_ms: i64,
    pub total_time: i64,
}

#[derive(Clone)]
pub struct ModuleUsageTracker {
    store: RecordStore,
    day_boundary: DayBoundary,
    retry: RetryPolicy,
}

impl ModuleUsageTracker {
    pub fn new(store: RecordStore, day_boundary: DayBoundary, retry: RetryPolicy) -> Self {
        Self { store, day_boundary, retry }
    }

    pub async fn on_usage_start(
        &self,
        identity: Identity,
        module: FeatureModule,
        client_connection_id: &str,
    ) -> Result<StartOutcome, TrackingError> {
        self.on_usage_start_at(identity, module, client_connection_id, Utc::now()).await
    }

    pub async fn on_usage_start_at(
        &self,
        identity: Identity,
        module: FeatureModule,
        client_connection_id: &str,
        now: DateTime<Utc>,
    ) -> Result<StartOutcome, TrackingError> {
        validate_client_connection_id(client_connection_id)?;
        let date = self.day_boundary.day_of(now);

        with_retry(
            self.retry,
            "module_usage_start",
            || self.store.load_module_usage(identity.user_id, identity.tenant_id, module, date),
            |current| Ok(start_session(current, identity, module, date, client_connection_id, now)),
            |record| self.store.save_module_usage(record),
        )
        .await
    }

    pub async fn on_usage_end(
        &self,
        identity: Identity,
        module: FeatureModule,
        client_connection_id: &str,
    ) -> Result<EndOutcome, TrackingError> {
        self.on_usage_end_at(identity, module, client_connection_id, Utc::now()).await
    }

    pub async fn on_usage_end_at(
        &self,
        identity: Identity,
        module: FeatureModule,
        client_connection_id: &str,
        now: DateTime<Utc>,
    ) -> Result<EndOutcome, TrackingError> {
        validate_client_connection_id(client_connection_id)?;
        let date = self.day_boundary.day_of(now);

        with_retry(
            self.retry,
            "module_usage_end",
            || self.store.load_module_usage(identity.user_id, identity.tenant_id, module, date),
            |current| {
                let record = current.ok_or(TrackingError::NotFoundRace("module usage record"))?;
                let (record, ended) = end_session(record, client_connection_id, now)?;
                Ok(Step::Save(record, ended))
            },
            |record| self.store.save_module_usage(record),
        )
        .await
    }

    /// Ends every module session a dropped connection left open. Returns how
    /// many were closed.
    pub async fn on_connection_closed_at(
        &self,
        identity: Identity,
        started: &[(FeatureModule, String)],
        now: DateTime<Utc>,
    ) -> usize {
        let mut closed = 0;
        for (module, client_connection_id) in started {
            let result = self.on_usage_end_at(identity, *module, client_connection_id, now).await;
            if result.is_ok() {
                closed += 1;
            }
            log_outcome("module_usage_connection_closed", identity, &result);
        }
        closed
    }
}

fn validate_client_connection_id(client_connection_id: &str) -> Result<(), TrackingError> {
    if client_connection_id.trim().is_empty() {
        return Err(TrackingError::ValidationFailure("socketId must not be empty".into()));
    }
    if client_connection_id.len() > MAX_CLIENT_CONNECTION_ID_LEN {
        return Err(TrackingError::ValidationFailure(format!(
            "socketId exceeds {MAX_CLIENT_CONNECTION_ID_LEN} bytes"
        )));
    }
    Ok(())
}

/// Opens a session for `client_connection_id` unless the tab already has one
/// today. A repeated start is reported without producing a record to save.
pub fn start_session(
    current: Option<DailyModuleUsageRecord>,
    identity: Identity,
    module: FeatureModule,
    date: NaiveDate,
    client_connection_id: &str,
    now: DateTime<Utc>,
) -> Step<DailyModuleUsageRecord, StartOutcome> {
    let mut record = current.unwrap_or_else(|| {
        DailyModuleUsageRecord::empty(identity.user_id, identity.tenant_id, module, date, now)
    });

    if let Some(session_index) = record.session_for(client_connection_id) {
        return Step::Done(StartOutcome::AlreadyTracked { session_index });
    }

    record.sessions.push(ModuleSession::open(client_connection_id, now));
    record.socket_ids.insert(client_connection_id.to_string());
    record.last_activity = now;
    record.recompute_total_time();

    let session_index = record.sessions.len() - 1;
    Step::Save(record, StartOutcome::Opened { session_index })
}

/// Closes the session recorded for `client_connection_id`, wherever it sits
/// in the list. A tab whose session is already closed has nothing to end.
pub fn end_session(
    mut record: DailyModuleUsageRecord,
    client_connection_id: &str,
    now: DateTime<Utc>,
) -> Result<(DailyModuleUsageRecord, EndOutcome), TrackingError> {
    let session_index = record
        .session_for(client_connection_id)
        .filter(|index| record.sessions[*index].is_open())
        .ok_or(TrackingError::NotFoundRace("open module session"))?;

    let entry = &mut record.sessions[session_index];
    entry.session = entry.session.close(now);
    let duration_ms = entry.duration_ms();

    record.recompute_total_time();
    record.last_activity = now;

    let ended = EndOutcome { session_index, duration_ms, total_time: record.total_time };
    Ok((record, ended))
}
