/// Command surface: manual check, PnL refresh, reconciliation, purge,
/// participation ingestion, operation log, webhook callback
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::budget;
use crate::db;
use crate::gate;
use crate::logger::{log, LogTag};
use crate::poller;
use crate::positions::{self, pnl};
use crate::reconcile;
use crate::settings;
use crate::webhook;
use crate::webserver::state::AppState;
use crate::webserver::utils::{error_response, success_response};

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    pub max_positions: Option<usize>,
    pub max_credits: Option<u32>,
}

/// POST /api/swab/check — manual position check, coalesced with any run
/// already in flight
pub async fn trigger_check(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CheckQuery>,
) -> Response {
    let max_positions = query.max_positions.unwrap_or(50);
    if max_positions == 0 || max_positions > 200 {
        return error_response(StatusCode::BAD_REQUEST, "max_positions must be 1-200");
    }

    let current = settings::get_settings();
    let max_credits = query
        .max_credits
        .unwrap_or_else(|| budget::BUDGET.remaining(current.daily_credit_budget));

    log(
        LogTag::Webserver,
        "MANUAL_CHECK",
        &format!(
            "Triggered: max_positions={} max_credits={}",
            max_positions, max_credits
        ),
    );

    // Manual runs include stale positions so an operator can revive them
    match poller::try_run_check(&state.oracle, &state.chain, max_positions, max_credits, true).await
    {
        Ok(outcome) => success_response(outcome),
        Err(e) => error_response(StatusCode::CONFLICT, &e),
    }
}

/// POST /api/swab/update-pnl — free-tier market cap refresh
pub async fn trigger_pnl_update(State(state): State<Arc<AppState>>) -> Response {
    let outcome = pnl::refresh_all_pnl(&state.oracle).await;
    success_response(outcome)
}

#[derive(Debug, Deserialize)]
pub struct ReconcileQuery {
    pub max_positions: Option<usize>,
    pub max_signatures: Option<u32>,
}

/// POST /api/swab/reconcile
pub async fn trigger_reconcile(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReconcileQuery>,
) -> Response {
    let current = settings::get_settings();
    let max_positions = query
        .max_positions
        .unwrap_or(current.reconcile_max_positions as usize);
    let max_signatures = query
        .max_signatures
        .unwrap_or(current.reconcile_max_signatures);

    if max_positions == 0 || max_positions > 200 {
        return error_response(StatusCode::BAD_REQUEST, "max_positions must be 1-200");
    }
    if !(10..=200).contains(&max_signatures) {
        return error_response(StatusCode::BAD_REQUEST, "max_signatures must be 10-200");
    }

    match reconcile::try_run_reconciliation(&state.oracle, &state.chain, max_positions, max_signatures)
        .await
    {
        Ok(outcome) => success_response(outcome),
        Err(e) => error_response(StatusCode::CONFLICT, &e),
    }
}

/// POST /api/swab/purge — wipe all tracking data for a fresh start
pub async fn purge_tracking_data() -> Response {
    match positions::db::purge_all_tracking_data() {
        Ok(result) => {
            positions::state::clear_positions().await;
            gate::clear_gate_state();
            db::record_operation(
                "purge",
                "Purge Tracking Data",
                0,
                &serde_json::json!({ "positions_deleted": result.positions_deleted }),
            );
            log(
                LogTag::Webserver,
                "PURGE",
                &format!(
                    "Purged {} positions, {} wallet metrics",
                    result.positions_deleted, result.metrics_deleted
                ),
            );
            success_response(serde_json::json!({
                "success": true,
                "positions_deleted": result.positions_deleted,
                "metrics_deleted": result.metrics_deleted,
            }))
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ParticipationRequest {
    pub wallet_address: String,
    pub token_address: String,
}

/// POST /api/swab/participations — early-participant feed ingestion
///
/// Accepts one record or an array of them.
pub async fn ingest_participations(Json(payload): Json<Value>) -> Response {
    let records: Vec<ParticipationRequest> = match payload {
        Value::Array(_) => match serde_json::from_value(payload) {
            Ok(r) => r,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &format!("Invalid payload: {}", e)),
        },
        single => match serde_json::from_value(single) {
            Ok(r) => vec![r],
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &format!("Invalid payload: {}", e)),
        },
    };

    let mut recorded = 0u32;
    let mut promoted = 0u32;
    for record in &records {
        if record.wallet_address.is_empty() || record.token_address.is_empty() {
            return error_response(StatusCode::BAD_REQUEST, "wallet_address and token_address are required");
        }
        match gate::record_participation(&record.wallet_address, &record.token_address) {
            Ok(gate::ParticipationOutcome::Promoted { .. }) => {
                recorded += 1;
                promoted += 1;
            }
            Ok(_) => recorded += 1,
            Err(e) => {
                log(LogTag::Webserver, "WARNING", &format!("Participation ingest failed: {}", e));
            }
        }
    }

    success_response(serde_json::json!({
        "success": true,
        "recorded": recorded,
        "wallets_promoted": promoted,
    }))
}

/// GET /api/swab/operations — recent high-level operations
pub async fn get_operations() -> Response {
    match db::get_recent_operations(30) {
        Ok(entries) => success_response(entries),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

/// POST /webhooks/callback — inbound transfer-event push
///
/// Deliveries are idempotent-safe: replays hit the dedupe ledger.
pub async fn webhook_callback(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> Response {
    let summary = webhook::process_payload(&state.oracle, &payload).await;
    success_response(serde_json::json!({
        "status": "success",
        "processed": summary.transactions_processed,
        "updates": summary.buys_applied + summary.reentries_applied + summary.sells_applied,
    }))
}
