// Optimistic-concurrency retry guard.
//
// One attempt is load -> transform -> save. Only a version conflict on save
// starts another attempt, after sleeping `backoff_step * attempt`. Every
// other failure, including one raised by the transform, ends the operation
// immediately.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::TrackingError;
use crate::metrics;

pub const MAX_ATTEMPTS: u32 = 3;
pub const BACKOFF_STEP_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: MAX_ATTEMPTS, backoff_step: Duration::from_millis(BACKOFF_STEP_MS) }
    }
}

/// What the transform decided for this attempt.
#[derive(Debug)]
pub enum Step<R, T> {
    /// Persist `R`, then report `T`.
    Save(R, T),
    /// Nothing changed; report `T` without writing.
    Done(T),
}

pub async fn with_retry<R, T, L, LF, M, S, SF>(
    policy: RetryPolicy,
    operation: &'static str,
    mut load: L,
    mut transform: M,
    mut save: S,
) -> Result<T, TrackingError>
where
    L: FnMut() -> LF,
    LF: Future<Output = Result<Option<R>, TrackingError>>,
    M: FnMut(Option<R>) -> Result<Step<R, T>, TrackingError>,
    S: FnMut(R) -> SF,
    SF: Future<Output = Result<(), TrackingError>>,
{
    let mut attempt = 1;
    loop {
        let current = load().await?;
        let (record, outcome) = match transform(current)? {
            Step::Save(record, outcome) => (record, outcome),
            Step::Done(outcome) => return Ok(outcome),
        };

        match save(record).await {
            Ok(()) => return Ok(outcome),
            Err(TrackingError::ConcurrencyConflict) if attempt < policy.max_attempts => {
                metrics::increment_retry_conflicts(operation);
                warn!(operation, attempt, "record version conflict, retrying");
                tokio::time::sleep(policy.backoff_step * attempt).await;
                attempt += 1;
            }
            Err(TrackingError::ConcurrencyConflict) => {
                metrics::increment_retry_exhausted(operation);
                return Err(TrackingError::RetriesExhausted { operation, attempts: attempt });
            }
            Err(error) => return Err(error),
        }
    }
}
