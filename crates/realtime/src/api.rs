// Read-only reporting over the caller's own daily usage records.

use std::sync::Arc;

use atelier_common::usage::{DailyModuleUsageRecord, DailyPresenceRecord};
use axum::{
    extract::{Extension, Query, State},
    middleware,
    routing::get,
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::auth::jwt::{Identity, JwtAccessTokenService};
use crate::auth::middleware::require_bearer_auth;
use crate::error::{ErrorCode, RealtimeError, TrackingError};
use crate::store::RecordStore;
use crate::tracking::day::DayBoundary;

#[derive(Clone)]
struct UsageApiState {
    store: RecordStore,
    day_boundary: DayBoundary,
}

#[derive(Debug, Default, Deserialize)]
pub struct UsageDayQuery {
    /// `YYYY-MM-DD`; today when absent.
    pub date: Option<String>,
}

#[derive(Serialize)]
struct PresenceEnvelope {
    date: NaiveDate,
    presence: Option<DailyPresenceRecord>,
}

#[derive(Serialize)]
struct ModuleUsageEnvelope {
    date: NaiveDate,
    items: Vec<DailyModuleUsageRecord>,
}

pub fn router(
    store: RecordStore,
    day_boundary: DayBoundary,
    jwt_service: Arc<JwtAccessTokenService>,
) -> Router {
    let state = UsageApiState { store, day_boundary };
    let auth_layer = middleware::from_fn_with_state(jwt_service, require_bearer_auth);

    Router::new()
        .route("/v1/usage/presence", get(get_presence))
        .route("/v1/usage/modules", get(list_module_usage))
        .route_layer(auth_layer)
        .with_state(state)
}

async fn get_presence(
    State(state): State<UsageApiState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<UsageDayQuery>,
) -> Result<Json<PresenceEnvelope>, RealtimeError> {
    let date = resolve_date(&state, &query)?;
    let presence = state
        .store
        .load_presence(identity.user_id, identity.tenant_id, date)
        .await
        .map_err(store_unavailable)?;

    Ok(Json(PresenceEnvelope { date, presence }))
}

async fn list_module_usage(
    State(state): State<UsageApiState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<UsageDayQuery>,
) -> Result<Json<ModuleUsageEnvelope>, RealtimeError> {
    let date = resolve_date(&state, &query)?;
    let items = state
        .store
        .list_module_usage(identity.user_id, identity.tenant_id, date)
        .await
        .map_err(store_unavailable)?;

    Ok(Json(ModuleUsageEnvelope { date, items }))
}

fn resolve_date(state: &UsageApiState, query: &UsageDayQuery) -> Result<NaiveDate, RealtimeError> {
    match query.date.as_deref().map(str::trim) {
        None | Some("") => Ok(state.day_boundary.day_of(Utc::now())),
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
            RealtimeError::new(ErrorCode::ValidationFailed, "date must be formatted as YYYY-MM-DD")
                .with_details(json!({ "field": "date", "value": raw }))
        }),
    }
}

fn store_unavailable(error: TrackingError) -> RealtimeError {
    error!(error = %error, "usage report query failed");
    RealtimeError::from_code(ErrorCode::StoreUnavailable)
}
