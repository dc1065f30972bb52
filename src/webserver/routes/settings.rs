/// Settings and scheduler-status endpoints
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Duration, Utc};

use crate::budget;
use crate::logger::{log, LogTag};
use crate::settings::{self, SwabSettingsUpdate};
use crate::webserver::utils::{error_response, success_response};

/// GET /api/swab/settings
pub async fn get_settings() -> Response {
    let current = settings::get_settings();
    let credits_used_today = budget::BUDGET.used_today();
    success_response(serde_json::json!({
        "auto_check_enabled": current.auto_check_enabled,
        "check_interval_minutes": current.check_interval_minutes,
        "daily_credit_budget": current.daily_credit_budget,
        "stale_threshold_minutes": current.stale_threshold_minutes,
        "min_token_count": current.min_token_count,
        "reconcile_max_positions": current.reconcile_max_positions,
        "reconcile_max_signatures": current.reconcile_max_signatures,
        "last_check_at": current.last_check_at,
        "credits_used_today": credits_used_today,
        "updated_at": current.updated_at,
    }))
}

/// PUT /api/swab/settings
///
/// Validation violations are rejected with 400; nothing is clamped.
pub async fn update_settings(Json(update): Json<SwabSettingsUpdate>) -> Response {
    if let Err(e) = update.validate() {
        return error_response(StatusCode::BAD_REQUEST, &e);
    }
    match settings::update_settings(&update) {
        Ok(updated) => success_response(updated),
        Err(e) => {
            log(LogTag::Webserver, "ERROR", &format!("Settings update failed: {}", e));
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e)
        }
    }
}

/// GET /api/swab/scheduler/status
pub async fn get_scheduler_status() -> Response {
    let current = settings::get_settings();

    let next_check_at = current
        .last_check_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| {
            (t.with_timezone(&Utc) + Duration::minutes(current.check_interval_minutes as i64))
                .to_rfc3339()
        });

    success_response(serde_json::json!({
        "running": current.auto_check_enabled,
        "auto_check_enabled": current.auto_check_enabled,
        "check_interval_minutes": current.check_interval_minutes,
        "last_check_at": current.last_check_at,
        "next_check_at": next_check_at,
    }))
}
