// Presence and module-usage tracking engine.
//
// Each tracker owns its record type end to end: load, pure transform, save
// through the retry guard. Handlers never surface failures to the channel;
// `log_outcome` turns them into operational log lines.

pub mod compactor;
pub mod day;
pub mod module_usage;
pub mod presence;
pub mod reconciler;
pub mod retry;

use tracing::{debug, error, warn};

use crate::auth::jwt::Identity;
use crate::error::TrackingError;

pub(crate) fn log_outcome<T>(
    operation: &'static str,
    identity: Identity,
    result: &Result<T, TrackingError>,
) {
    let Err(error) = result else {
        return;
    };

    match error {
        TrackingError::NotFoundRace(what) => debug!(
            operation,
            user_id = %identity.user_id,
            tenant_id = %identity.tenant_id,
            missing = what,
            "nothing to close, treating as reconnect race",
        ),
        TrackingError::ValidationFailure(reason) => warn!(
            operation,
            user_id = %identity.user_id,
            tenant_id = %identity.tenant_id,
            reason = %reason,
            "dropping invalid usage event",
        ),
        TrackingError::RetriesExhausted { attempts, .. } => error!(
            operation,
            user_id = %identity.user_id,
            tenant_id = %identity.tenant_id,
            attempts,
            "abandoning usage write after repeated version conflicts",
        ),
        TrackingError::ConcurrencyConflict | TrackingError::Store(_) => error!(
            operation,
            user_id = %identity.user_id,
            tenant_id = %identity.tenant_id,
            error = %error,
            "usage write failed",
        ),
    }
}
