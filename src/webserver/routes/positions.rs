/// Position listing, stats and tracking-control endpoints
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::budget::{self, BALANCE_LOOKUP_COST};
use crate::gate;
use crate::logger::{log, LogTag};
use crate::positions::{self, ledger::touch_position, Position};
use crate::settings;
use crate::webserver::state::AppState;
use crate::webserver::utils::{error_response, success_response};

#[derive(Debug, Deserialize)]
pub struct PositionsQuery {
    /// "holding", "sold", "stale" or "all"
    pub status: Option<String>,
    pub pnl_min: Option<f64>,
    pub pnl_max: Option<f64>,
    pub wallet: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct PositionResponse {
    #[serde(flatten)]
    pub position: Position,
    pub held_balance: f64,
    pub unrealized_ratio: Option<f64>,
}

impl From<Position> for PositionResponse {
    fn from(position: Position) -> Self {
        let held_balance = position.held_balance();
        let unrealized_ratio = position.unrealized_ratio();
        Self {
            position,
            held_balance,
            unrealized_ratio,
        }
    }
}

/// GET /api/swab/positions
pub async fn get_positions(Query(query): Query<PositionsQuery>) -> Response {
    if let Some(status) = query.status.as_deref() {
        if !matches!(status, "holding" | "sold" | "stale" | "all") {
            return error_response(
                StatusCode::BAD_REQUEST,
                "status must be one of holding, sold, stale, all",
            );
        }
    }
    let limit = query.limit.unwrap_or(50);
    if limit == 0 || limit > 500 {
        return error_response(StatusCode::BAD_REQUEST, "limit must be 1-500");
    }

    let filter = positions::db::PositionFilter {
        status: query.status,
        pnl_min: query.pnl_min,
        pnl_max: query.pnl_max,
        wallet: query.wallet,
        limit,
        offset: query.offset.unwrap_or(0),
    };

    match positions::db::query_positions(&filter) {
        Ok(page) => {
            let positions: Vec<PositionResponse> =
                page.positions.into_iter().map(PositionResponse::from).collect();
            success_response(serde_json::json!({
                "positions": positions,
                "total": page.total,
                "limit": page.limit,
                "offset": page.offset,
                "has_more": page.has_more,
            }))
        }
        Err(e) => {
            log(LogTag::Webserver, "ERROR", &format!("Position query failed: {}", e));
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e)
        }
    }
}

/// GET /api/swab/stats
pub async fn get_stats() -> Response {
    let stats = match positions::db::get_tracking_stats() {
        Ok(s) => s,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    };

    let current = settings::get_settings();
    let credits_used_today = budget::BUDGET.used_today();
    let credits_remaining = budget::BUDGET.remaining(current.daily_credit_budget);
    let estimated_check_credits = (stats.holding + stats.stale) * BALANCE_LOOKUP_COST;

    success_response(serde_json::json!({
        "total_positions": stats.total_positions,
        "holding": stats.holding,
        "sold": stats.sold,
        "stale": stats.stale,
        "winners": stats.winners,
        "losers": stats.losers,
        "win_rate": stats.win_rate,
        "avg_pnl_ratio": stats.avg_pnl_ratio,
        "estimated_exits": stats.estimated_exits,
        "unique_wallets": stats.unique_wallets,
        "unique_tokens": stats.unique_tokens,
        "tracked_wallets": gate::tracked_wallet_count(),
        "estimated_check_credits": estimated_check_credits,
        "credits_used_today": credits_used_today,
        "daily_credit_budget": current.daily_credit_budget,
        "credits_remaining": credits_remaining,
    }))
}

/// GET /api/swab/wallets
pub async fn get_wallets() -> Response {
    match positions::db::get_wallet_summaries() {
        Ok(summaries) => success_response(summaries),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchStopRequest {
    pub position_ids: Vec<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}

async fn set_tracking_by_id(id: i64, enabled: bool) -> Result<bool, String> {
    let Some(row) = positions::db::get_position_row_by_id(id)? else {
        return Ok(false);
    };
    touch_position(&row.key(), |p| p.tracking_enabled = enabled).await
}

/// POST /api/swab/positions/batch-stop
pub async fn batch_stop_positions(Json(request): Json<BatchStopRequest>) -> Response {
    let mut stopped = 0usize;
    let mut failed_ids = Vec::new();

    for id in &request.position_ids {
        match set_tracking_by_id(*id, false).await {
            Ok(true) => stopped += 1,
            Ok(false) => failed_ids.push(*id),
            Err(e) => {
                log(LogTag::Webserver, "WARNING", &format!("Batch stop failed for {}: {}", id, e));
                failed_ids.push(*id);
            }
        }
    }

    log(
        LogTag::Webserver,
        "BATCH_STOP",
        &format!(
            "Stopped {} positions ({} failed, reason: {})",
            stopped,
            failed_ids.len(),
            request.reason.as_deref().unwrap_or("manual")
        ),
    );

    success_response(serde_json::json!({
        "success": true,
        "positions_stopped": stopped,
        "failed_ids": failed_ids,
    }))
}

/// POST /api/swab/positions/:id/stop
pub async fn stop_position(Path(id): Path<i64>) -> Response {
    match set_tracking_by_id(id, false).await {
        Ok(true) => success_response(serde_json::json!({
            "success": true,
            "message": format!("Stopped tracking position {}", id),
        })),
        Ok(false) => error_response(StatusCode::NOT_FOUND, &format!("Position {} not found", id)),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

/// POST /api/swab/positions/:id/resume
pub async fn resume_position(Path(id): Path<i64>) -> Response {
    match set_tracking_by_id(id, true).await {
        Ok(true) => success_response(serde_json::json!({
            "success": true,
            "message": format!("Resumed tracking position {}", id),
        })),
        Ok(false) => error_response(StatusCode::NOT_FOUND, &format!("Position {} not found", id)),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

/// POST /api/swab/wallets/:wallet/stop
///
/// Halts new event processing for the wallet and disables tracking on all
/// of its positions. Historical data stays.
pub async fn stop_wallet(State(_state): State<Arc<AppState>>, Path(wallet): Path<String>) -> Response {
    if let Err(e) = gate::untrack_wallet(&wallet) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e);
    }

    let count = match positions::db::set_wallet_tracking(&wallet, false) {
        Ok(c) => c,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    };

    // Mirror the flag into the registry
    for position in positions::all_positions().await {
        if position.wallet_address == wallet {
            let _ = touch_position(&position.key(), |p| p.tracking_enabled = false).await;
        }
    }

    success_response(serde_json::json!({
        "success": true,
        "positions_stopped": count,
    }))
}
