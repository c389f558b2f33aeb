// Releases generation tasks abandoned by a user's previous session.

use atelier_common::usage::Session;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, error, info};

use crate::auth::jwt::Identity;
use crate::error::TrackingError;
use crate::metrics;
use crate::store::{RecordStore, TaskPipeline};

/// Most recent disconnect across closed and merged sessions.
pub fn last_disconnect_time(sessions: &[Session]) -> Option<DateTime<Utc>> {
    sessions.iter().filter_map(Session::disconnect_time).max()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// No record today, or nothing closed yet.
    NoHistory,
    /// Last disconnect is within the threshold.
    Recent,
    /// Gap exceeded, but relaxed mode suppressed the reset.
    SkippedRelaxed,
    Cleared { released_tasks: u64 },
    Failed,
}

#[derive(Clone)]
pub struct StaleSessionReconciler {
    store: RecordStore,
    tasks: TaskPipeline,
    threshold: Duration,
    relaxed: bool,
}

impl StaleSessionReconciler {
    pub fn new(
        store: RecordStore,
        tasks: TaskPipeline,
        threshold: Duration,
        relaxed: bool,
    ) -> Self {
        Self { store, tasks, threshold, relaxed }
    }

    pub async fn last_disconnect(
        &self,
        identity: Identity,
        date: NaiveDate,
    ) -> Result<Option<DateTime<Utc>>, TrackingError> {
        let record = self.store.load_presence(identity.user_id, identity.tenant_id, date).await?;
        Ok(record.and_then(|record| last_disconnect_time(&record.sessions)))
    }

    /// Runs before a connect is recorded. Never fails the connect: a store
    /// or pipeline error is logged and reported as [`Reconciliation::Failed`].
    pub async fn reconcile_at(
        &self,
        identity: Identity,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Reconciliation {
        let last = match self.last_disconnect(identity, date).await {
            Ok(Some(last)) => last,
            Ok(None) => return Reconciliation::NoHistory,
            Err(error) => {
                error!(
                    user_id = %identity.user_id,
                    error = %error,
                    "could not load presence history for reconciliation",
                );
                metrics::record_reconciliation("failed", 0);
                return Reconciliation::Failed;
            }
        };

        let gap = now - last;
        if gap <= self.threshold {
            return Reconciliation::Recent;
        }

        if self.relaxed {
            debug!(
                user_id = %identity.user_id,
                gap_minutes = gap.num_minutes(),
                "relaxed mode, keeping in-session tasks",
            );
            metrics::record_reconciliation("skipped_relaxed", 0);
            return Reconciliation::SkippedRelaxed;
        }

        match self.tasks.clear_in_session(identity.user_id).await {
            Ok(released_tasks) => {
                info!(
                    user_id = %identity.user_id,
                    gap_minutes = gap.num_minutes(),
                    released_tasks,
                    "released tasks from stale session",
                );
                metrics::record_reconciliation("cleared", released_tasks);
                Reconciliation::Cleared { released_tasks }
            }
            Err(error) => {
                error!(
                    user_id = %identity.user_id,
                    error = %format!("{error:#}"),
                    "failed to release tasks from stale session",
                );
                metrics::record_reconciliation("failed", 0);
                Reconciliation::Failed
            }
        }
    }
}
