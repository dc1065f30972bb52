/// Reconciliation engine: backfills exact exit data for estimated sells
///
/// Sold positions whose proceeds came from price estimates (poller
/// synthesis or oracle outages) are walked against the wallet's recent
/// parsed transaction history. A found sell transfer yields exact USD
/// proceeds which replace the estimate through the ledger's correction
/// path. Sells older than the bounded lookup window stay estimated; that
/// is a terminal state for the position, not a failure.
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::apis::{ChainApi, ParsedTransfer, WSOL_MINT};
use crate::arguments::is_debug_reconcile_enabled;
use crate::budget::{self, ReserveOutcome, HISTORY_LOOKUP_COST};
use crate::logger::{log, LogTag};
use crate::oracle::PriceOracle;
use crate::positions::{self, PositionStatus};

/// Wall-clock ceiling for one reconciliation batch
const RECONCILE_BATCH_TIMEOUT_SECS: u64 = 300;

// Re-triggering while a batch is in flight is rejected, not queued
static RECONCILE_IN_FLIGHT: AtomicBool = AtomicBool::new(false);

struct InFlightGuard;

impl InFlightGuard {
    fn acquire() -> Option<Self> {
        RECONCILE_IN_FLIGHT
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| InFlightGuard)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        RECONCILE_IN_FLIGHT.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileResultItem {
    pub wallet_address: String,
    pub token_address: String,
    /// "reconciled", "not_found_too_old" or "error"
    pub status: String,
    pub old_pnl_ratio: Option<f64>,
    pub new_pnl_ratio: Option<f64>,
    pub tokens_sold: Option<f64>,
    pub usd_received: Option<f64>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileOutcome {
    pub positions_found: u32,
    pub reconciled: u32,
    pub not_found_too_old: u32,
    pub errored: u32,
    pub credits_used: u32,
    /// True when the batch stopped early on budget exhaustion
    pub budget_limited: bool,
    pub duration_ms: u64,
    pub results: Vec<ReconcileResultItem>,
}

/// Run a reconciliation batch if none is in flight
pub async fn try_run_reconciliation(
    oracle: &PriceOracle,
    chain: &Arc<dyn ChainApi>,
    max_positions: usize,
    max_signatures: u32,
) -> Result<ReconcileOutcome, String> {
    let Some(_guard) = InFlightGuard::acquire() else {
        return Err("Reconciliation already in flight".to_string());
    };
    Ok(run_reconciliation(oracle, chain, max_positions, max_signatures).await)
}

async fn run_reconciliation(
    oracle: &PriceOracle,
    chain: &Arc<dyn ChainApi>,
    max_positions: usize,
    max_signatures: u32,
) -> ReconcileOutcome {
    let started = Instant::now();
    let deadline = started + Duration::from_secs(RECONCILE_BATCH_TIMEOUT_SECS);
    let mut outcome = ReconcileOutcome::default();

    // Sold positions still carrying estimates (or whose sell was never
    // recorded at all) are the reconciliation backlog
    let mut backlog: Vec<_> = positions::all_positions()
        .await
        .into_iter()
        .filter(|p| p.status == PositionStatus::Sold && (p.exit_estimated || p.sell_count == 0))
        .collect();
    backlog.sort_by_key(|p| p.exit_detected_at);
    outcome.positions_found = backlog.len() as u32;
    backlog.truncate(max_positions);

    if backlog.is_empty() {
        log(LogTag::Reconcile, "COMPLETE", "No positions need reconciliation");
        return outcome;
    }

    log(
        LogTag::Reconcile,
        "START",
        &format!(
            "Reconciling {} of {} positions (depth {} signatures)",
            backlog.len(),
            outcome.positions_found,
            max_signatures
        ),
    );

    let mut wallets_touched: HashSet<String> = HashSet::new();

    for position in backlog {
        if Instant::now() >= deadline {
            log(
                LogTag::Reconcile,
                "TIMEOUT",
                "Batch wall-clock limit reached; resuming next invocation",
            );
            break;
        }

        match budget::try_reserve(HISTORY_LOOKUP_COST) {
            ReserveOutcome::Reserved => {}
            ReserveOutcome::Exhausted { .. } => {
                outcome.budget_limited = true;
                break;
            }
        }

        let wallet = position.wallet_address.clone();
        let token = position.token_address.clone();
        let old_pnl = position.pnl_ratio;

        let transfers = match chain.get_recent_transfers(&wallet, max_signatures).await {
            Ok(t) => t,
            Err(e) => {
                // Transient: refund, report, retry on the next invocation
                budget::refund(HISTORY_LOOKUP_COST);
                outcome.errored += 1;
                outcome.results.push(ReconcileResultItem {
                    wallet_address: wallet.clone(),
                    token_address: token.clone(),
                    status: "error".to_string(),
                    old_pnl_ratio: old_pnl,
                    new_pnl_ratio: None,
                    tokens_sold: None,
                    usd_received: None,
                    detail: Some(e.clone()),
                });
                log(
                    LogTag::Reconcile,
                    "WARNING",
                    &format!("History lookup failed for {}: {}", wallet, e),
                );
                continue;
            }
        };
        outcome.credits_used += HISTORY_LOOKUP_COST;

        // Newest outgoing transfer of the tracked token is the sell
        let sell_transfer = transfers
            .iter()
            .find(|t| t.mint == token && t.from_wallet.as_deref() == Some(wallet.as_str()));

        let Some(sell_transfer) = sell_transfer else {
            // Scrolled out of the bounded window: terminal, not an error
            outcome.not_found_too_old += 1;
            outcome.results.push(ReconcileResultItem {
                wallet_address: wallet.clone(),
                token_address: token.clone(),
                status: "not_found_too_old".to_string(),
                old_pnl_ratio: old_pnl,
                new_pnl_ratio: None,
                tokens_sold: None,
                usd_received: None,
                detail: Some(format!(
                    "No sell transfer in last {} signatures",
                    max_signatures
                )),
            });
            if is_debug_reconcile_enabled() {
                log(
                    LogTag::Reconcile,
                    "DEBUG",
                    &format!("{}/{}: no transaction found, too old", wallet, token),
                );
            }
            continue;
        };

        let (usd_received, value_estimated) = resolve_proceeds(oracle, &token, sell_transfer).await;
        let Some(usd_received) = usd_received else {
            outcome.not_found_too_old += 1;
            positions::db::record_anomaly(
                &wallet,
                &token,
                "missing_counterpart_value",
                &format!("sell {} has no counterpart value transfer", sell_transfer.signature),
            );
            outcome.results.push(ReconcileResultItem {
                wallet_address: wallet.clone(),
                token_address: token.clone(),
                status: "not_found_too_old".to_string(),
                old_pnl_ratio: old_pnl,
                new_pnl_ratio: None,
                tokens_sold: Some(sell_transfer.token_amount),
                usd_received: None,
                detail: Some("Found sell transfer but no determinable USD value".to_string()),
            });
            continue;
        };

        let event_id = format!("exact:{}:{}", sell_transfer.signature, wallet);
        match positions::apply_exact_exit(
            &wallet,
            &token,
            sell_transfer.token_amount,
            usd_received,
            &event_id,
        )
        .await
        {
            Ok(applied) if applied.was_applied() || applied == positions::ApplyOutcome::Duplicate => {
                outcome.reconciled += 1;
                wallets_touched.insert(wallet.clone());
                let new_pnl = positions::state::get_position(&wallet, &token)
                    .await
                    .and_then(|p| p.pnl_ratio);
                outcome.results.push(ReconcileResultItem {
                    wallet_address: wallet.clone(),
                    token_address: token.clone(),
                    status: "reconciled".to_string(),
                    old_pnl_ratio: old_pnl,
                    new_pnl_ratio: new_pnl,
                    tokens_sold: Some(sell_transfer.token_amount),
                    usd_received: Some(usd_received),
                    detail: value_estimated
                        .then(|| "Proceeds estimated from current price".to_string()),
                });
            }
            Ok(_) => {
                outcome.errored += 1;
                outcome.results.push(ReconcileResultItem {
                    wallet_address: wallet.clone(),
                    token_address: token.clone(),
                    status: "error".to_string(),
                    old_pnl_ratio: old_pnl,
                    new_pnl_ratio: None,
                    tokens_sold: Some(sell_transfer.token_amount),
                    usd_received: Some(usd_received),
                    detail: Some("Position no longer eligible for correction".to_string()),
                });
            }
            Err(e) => {
                outcome.errored += 1;
                outcome.results.push(ReconcileResultItem {
                    wallet_address: wallet.clone(),
                    token_address: token.clone(),
                    status: "error".to_string(),
                    old_pnl_ratio: old_pnl,
                    new_pnl_ratio: None,
                    tokens_sold: Some(sell_transfer.token_amount),
                    usd_received: Some(usd_received),
                    detail: Some(e),
                });
            }
        }
    }

    for wallet in &wallets_touched {
        if let Err(e) = positions::db::calculate_wallet_metrics(wallet) {
            log(LogTag::Reconcile, "WARNING", &e);
        }
    }

    outcome.duration_ms = started.elapsed().as_millis() as u64;
    crate::db::record_operation(
        "reconciliation",
        "Reconciliation",
        outcome.credits_used,
        &serde_json::json!({
            "positions_found": outcome.positions_found,
            "reconciled": outcome.reconciled,
            "not_found_too_old": outcome.not_found_too_old,
            "errored": outcome.errored,
        }),
    );

    log(
        LogTag::Reconcile,
        "COMPLETE",
        &format!(
            "{} reconciled, {} too old, {} errors, {} credits in {}ms",
            outcome.reconciled,
            outcome.not_found_too_old,
            outcome.errored,
            outcome.credits_used,
            outcome.duration_ms
        ),
    );

    outcome
}

/// USD proceeds of a sell transfer: the paired native-asset movement
/// valued at current native price, falling back to valuing the tokens at
/// their current price when no counterpart was exposed
async fn resolve_proceeds(
    oracle: &PriceOracle,
    token: &str,
    transfer: &ParsedTransfer,
) -> (Option<f64>, bool) {
    if let Some(sol) = transfer.counterpart_sol {
        if let Ok(native) = oracle.get(WSOL_MINT).await {
            return (Some(sol * native.price_usd), false);
        }
    }
    if let Ok(market) = oracle.get(token).await {
        if market.price_usd > 0.0 {
            return (Some(transfer.token_amount * market.price_usd), true);
        }
    }
    (None, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::chain::testing::MockChainApi;
    use crate::oracle::testing::MockMarketApi;
    use crate::positions::{apply_buy, apply_sell, state::get_position, BuyEvent, SellEvent};
    use crate::settings::{update_settings, SwabSettingsUpdate};
    use std::collections::HashMap;

    fn raise_budget() {
        let _ = update_settings(&SwabSettingsUpdate {
            daily_credit_budget: Some(10_000),
            ..Default::default()
        });
    }

    async fn seed_estimated_exit(wallet: &str, token: &str) {
        apply_buy(BuyEvent {
            wallet_address: wallet.to_string(),
            token_address: token.to_string(),
            qty: 1000.0,
            usd: 100.0,
            source_event_id: format!("sig-rec-seed-{}-{}", wallet, token),
            estimated: false,
            market_cap: Some(100_000.0),
        })
        .await
        .unwrap();
        apply_sell(SellEvent {
            wallet_address: wallet.to_string(),
            token_address: token.to_string(),
            qty: 1000.0,
            usd: 120.0,
            source_event_id: format!("poll:{}:{}:1", wallet, token),
            estimated: true,
            market_cap: Some(180_000.0),
        })
        .await
        .unwrap();
    }

    fn sell_transfer(wallet: &str, token: &str, signature: &str, sol: Option<f64>) -> ParsedTransfer {
        ParsedTransfer {
            signature: signature.to_string(),
            timestamp: Some(1_700_000_000),
            mint: token.to_string(),
            from_wallet: Some(wallet.to_string()),
            to_wallet: Some("POOLrec".to_string()),
            token_amount: 1000.0,
            counterpart_sol: sol,
        }
    }

    fn oracle_with(prices: &[(&str, f64, f64)]) -> PriceOracle {
        let mut table = HashMap::new();
        for (mint, price, mc) in prices {
            table.insert(
                mint.to_string(),
                crate::apis::MarketData {
                    price_usd: *price,
                    market_cap_usd: Some(*mc),
                },
            );
        }
        PriceOracle::new(Arc::new(MockMarketApi {
            prices: table,
            calls: std::sync::atomic::AtomicU32::new(0),
            fail: false,
        }))
    }

    #[tokio::test]
    async fn test_found_sell_upgrades_estimate_to_exact() {
        let _serial = crate::db::testing::serial_lock();
        crate::db::testing::init_test_database();
        raise_budget();
        seed_estimated_exit("Wrec1", "Trec1").await;

        let chain = MockChainApi::new();
        // 2.5 SOL proceeds at $100/SOL = $250 for 1000 tokens
        chain.set_transfers("Wrec1", vec![sell_transfer("Wrec1", "Trec1", "sig-rec1", Some(2.5))]);
        let chain: Arc<dyn ChainApi> = Arc::new(chain);
        let oracle = oracle_with(&[(WSOL_MINT, 100.0, 0.0), ("Trec1", 0.12, 180_000.0)]);

        let outcome = try_run_reconciliation(&oracle, &chain, 50, 50).await.unwrap();
        assert!(outcome.reconciled >= 1);
        assert!(outcome.credits_used >= HISTORY_LOOKUP_COST);

        let wrec1 = outcome
            .results
            .iter()
            .find(|r| r.wallet_address == "Wrec1")
            .unwrap();
        assert_eq!(wrec1.status, "reconciled");
        assert_eq!(wrec1.usd_received, Some(250.0));

        let p = get_position("Wrec1", "Trec1").await.unwrap();
        assert!(!p.exit_estimated);
        assert!((p.total_sold_usd - 250.0).abs() < 1e-9);
        // Exit $0.25/unit over entry $0.10/unit
        assert!((p.pnl_ratio.unwrap() - 2.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sell_outside_window_is_terminal_not_error() {
        let _serial = crate::db::testing::serial_lock();
        crate::db::testing::init_test_database();
        raise_budget();
        seed_estimated_exit("Wrec2", "Trec2").await;

        let chain = MockChainApi::new();
        // History exists but holds no sell of this token
        chain.set_transfers("Wrec2", vec![]);
        let chain: Arc<dyn ChainApi> = Arc::new(chain);
        let oracle = oracle_with(&[(WSOL_MINT, 100.0, 0.0)]);

        let outcome = try_run_reconciliation(&oracle, &chain, 50, 10).await.unwrap();
        assert!(outcome.not_found_too_old >= 1);

        let wrec2 = outcome
            .results
            .iter()
            .find(|r| r.wallet_address == "Wrec2")
            .unwrap();
        assert_eq!(wrec2.status, "not_found_too_old");

        // Position stays estimated until a future lookup supersedes it
        let p = get_position("Wrec2", "Trec2").await.unwrap();
        assert!(p.exit_estimated);
        assert_eq!(p.pnl_ratio, None);
    }

    #[tokio::test]
    async fn test_lookup_error_refunds_credits_and_continues() {
        let _serial = crate::db::testing::serial_lock();
        crate::db::testing::init_test_database();
        raise_budget();
        seed_estimated_exit("Wrec3", "Trec3").await;

        // MockChainApi errors for wallets with no canned history
        let chain: Arc<dyn ChainApi> = Arc::new(MockChainApi::new());
        let oracle = oracle_with(&[(WSOL_MINT, 100.0, 0.0)]);

        let outcome = try_run_reconciliation(&oracle, &chain, 50, 50).await.unwrap();
        assert!(outcome.errored >= 1);

        let wrec3 = outcome
            .results
            .iter()
            .find(|r| r.wallet_address == "Wrec3")
            .unwrap();
        assert_eq!(wrec3.status, "error");

        // Failed lookups are refunded, so successes alone account for spend
        assert_eq!(outcome.credits_used % HISTORY_LOOKUP_COST, 0);

        // Still estimated, retried on the next invocation
        let p = get_position("Wrec3", "Trec3").await.unwrap();
        assert!(p.exit_estimated);
        assert_eq!(p.pnl_ratio, None);
    }
}
