use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::webserver::state::AppState;

pub mod control;
pub mod positions;
pub mod settings;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhooks/callback", post(control::webhook_callback))
        .nest("/api/swab", swab_routes())
        .with_state(state)
}

fn swab_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/settings",
            get(settings::get_settings).put(settings::update_settings),
        )
        .route("/scheduler/status", get(settings::get_scheduler_status))
        .route("/stats", get(positions::get_stats))
        .route("/positions", get(positions::get_positions))
        .route("/positions/batch-stop", post(positions::batch_stop_positions))
        .route("/positions/:id/stop", post(positions::stop_position))
        .route("/positions/:id/resume", post(positions::resume_position))
        .route("/wallets", get(positions::get_wallets))
        .route("/wallets/:wallet/stop", post(positions::stop_wallet))
        .route("/check", post(control::trigger_check))
        .route("/update-pnl", post(control::trigger_pnl_update))
        .route("/reconcile", post(control::trigger_reconcile))
        .route("/purge", post(control::purge_tracking_data))
        .route("/participations", post(control::ingest_participations))
        .route("/operations", get(control::get_operations))
}
