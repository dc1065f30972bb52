/// Budget-gated balance poller: pull path of the dual event model
///
/// Fallback and cross-check for the webhook path. On a fixed interval it
/// re-reads on-chain balances for tracked positions and turns balance
/// deltas into synthesized estimated buy/sell events, routed through the
/// same ledger as webhook events. Every balance lookup spends from the
/// daily credit budget; a run that cannot fully fit is skipped, not
/// truncated mid-position.
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::sleep;

use crate::apis::ChainApi;
use crate::arguments::is_debug_poller_enabled;
use crate::budget::{self, ReserveOutcome, BALANCE_LOOKUP_COST};
use crate::gate;
use crate::logger::{log, LogTag};
use crate::oracle::PriceOracle;
use crate::positions::{
    self, ledger::touch_position, BuyEvent, PositionStatus, SellEvent, BALANCE_EPSILON,
};
use crate::settings;

/// Service tick; the configured check interval is evaluated against it
const POLLER_TICK_SECS: u64 = 60;

/// Wall-clock ceiling for one check batch; abandoned cleanly between
/// positions and resumed on the next scheduled invocation
const CHECK_BATCH_TIMEOUT_SECS: u64 = 300;

/// Consecutive per-wallet failures before a position is marked stale
const STALE_AFTER_FAILURES: u32 = 3;

/// Default position cap for scheduled runs
const SCHEDULED_MAX_POSITIONS: usize = 50;

// A manual trigger while a check is in flight is rejected, not queued
static CHECK_IN_FLIGHT: AtomicBool = AtomicBool::new(false);

struct InFlightGuard;

impl InFlightGuard {
    fn acquire() -> Option<Self> {
        CHECK_IN_FLIGHT
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| InFlightGuard)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        CHECK_IN_FLIGHT.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckOutcome {
    pub positions_checked: u32,
    pub still_holding: u32,
    pub sold: u32,
    pub buys_detected: u32,
    pub sells_detected: u32,
    pub errors: u32,
    pub credits_used: u32,
    /// True when the run was skipped (or cut short) by the credit budget
    pub budget_limited: bool,
    pub duration_ms: u64,
}

/// Run a position check if none is in flight; a concurrent trigger is
/// coalesced into a rejection
pub async fn try_run_check(
    oracle: &PriceOracle,
    chain: &Arc<dyn ChainApi>,
    max_positions: usize,
    max_credits: u32,
    include_stale: bool,
) -> Result<CheckOutcome, String> {
    let Some(_guard) = InFlightGuard::acquire() else {
        return Err("Position check already in flight".to_string());
    };
    Ok(run_position_check(oracle, chain, max_positions, max_credits, include_stale).await)
}

async fn run_position_check(
    oracle: &PriceOracle,
    chain: &Arc<dyn ChainApi>,
    max_positions: usize,
    max_credits: u32,
    include_stale: bool,
) -> CheckOutcome {
    let started = Instant::now();
    let deadline = started + Duration::from_secs(CHECK_BATCH_TIMEOUT_SECS);
    let stale_threshold_minutes = settings::get_settings().stale_threshold_minutes as i64;
    let mut outcome = CheckOutcome::default();

    // Tracked positions that have not been confirmed recently, most
    // overdue first. Stale positions only join manual runs so an operator
    // can revive them.
    let now = chrono::Utc::now();
    let mut due: Vec<_> = positions::all_positions()
        .await
        .into_iter()
        .filter(|p| {
            p.tracking_enabled
                && p.status != PositionStatus::Sold
                && (include_stale || p.status != PositionStatus::Stale)
                && gate::is_tracked(&p.wallet_address)
                && p.last_checked_at.map_or(true, |t| {
                    (now - t).num_minutes() >= stale_threshold_minutes
                })
        })
        .collect();
    due.sort_by_key(|p| p.last_checked_at);
    due.truncate(max_positions);

    if due.is_empty() {
        log(LogTag::Poller, "CHECK_COMPLETE", "No positions due for checking");
        return outcome;
    }

    // The whole batch must fit the remaining budget or the run is skipped
    let estimated_cost = due.len() as u32 * BALANCE_LOOKUP_COST;
    let spendable = max_credits.min(budget::BUDGET.remaining(settings::get_settings().daily_credit_budget));
    if estimated_cost > spendable {
        outcome.budget_limited = true;
        log(
            LogTag::Poller,
            "BUDGET_SKIP",
            &format!(
                "Run skipped: {} positions need {} credits, {} available",
                due.len(),
                estimated_cost,
                spendable
            ),
        );
        return outcome;
    }

    log(
        LogTag::Poller,
        "CHECK_START",
        &format!("Checking {} positions (~{} credits)", due.len(), estimated_cost),
    );

    let mut wallets_touched: HashSet<String> = HashSet::new();

    for position in due {
        if Instant::now() >= deadline {
            log(
                LogTag::Poller,
                "TIMEOUT",
                "Batch wall-clock limit reached; resuming next interval",
            );
            break;
        }
        if outcome.credits_used + BALANCE_LOOKUP_COST > max_credits {
            outcome.budget_limited = true;
            break;
        }

        // Another job may have spent concurrently since the pre-check
        match budget::try_reserve(BALANCE_LOOKUP_COST) {
            ReserveOutcome::Reserved => {}
            ReserveOutcome::Exhausted { .. } => {
                outcome.budget_limited = true;
                break;
            }
        }

        let key = position.key();
        let wallet = position.wallet_address.clone();
        let token = position.token_address.clone();

        let balance = match chain.get_token_balance(&wallet, &token).await {
            Ok(b) => b,
            Err(e) => {
                budget::refund(BALANCE_LOOKUP_COST);
                outcome.errors += 1;
                log(
                    LogTag::Poller,
                    "WARNING",
                    &format!("Balance lookup failed for {}/{}: {}", wallet, token, e),
                );
                let _ = touch_position(&key, |p| {
                    p.consecutive_failures += 1;
                    if p.consecutive_failures >= STALE_AFTER_FAILURES {
                        p.status = PositionStatus::Stale;
                    }
                })
                .await;
                continue;
            }
        };

        outcome.credits_used += BALANCE_LOOKUP_COST;
        outcome.positions_checked += 1;
        wallets_touched.insert(wallet.clone());

        // Market data is free tier; tolerate its absence
        let market = oracle.get(&token).await.ok();
        let price = market.map(|m| m.price_usd);
        let market_cap = market.and_then(|m| m.market_cap_usd);

        // Fresh read: a webhook may have applied deltas since the snapshot
        let Some(current) = positions::state::get_position_by_key(&key).await else {
            continue;
        };
        let held = current.held_balance();
        let delta = balance - held;

        // Successful confirmation: reset failure streak, revive stale
        let generation = current.poll_generation + 1;
        let _ = touch_position(&key, |p| {
            p.consecutive_failures = 0;
            p.last_checked_at = Some(chrono::Utc::now());
            p.poll_generation = generation;
            if let Some(mc) = market_cap {
                p.current_market_cap = Some(mc);
            }
            if p.status == PositionStatus::Stale && balance > BALANCE_EPSILON {
                p.status = PositionStatus::Holding;
            }
        })
        .await;

        if delta < -BALANCE_EPSILON {
            // Balance dropped without a webhook event: synthesize an
            // estimated sell priced at current market
            let qty = -delta;
            let sell = SellEvent {
                wallet_address: wallet.clone(),
                token_address: token.clone(),
                qty,
                usd: price.map(|p| qty * p).unwrap_or(0.0),
                source_event_id: format!("poll:{}:{}:{}", wallet, token, generation),
                estimated: true,
                market_cap,
            };
            match positions::apply_sell(sell).await {
                Ok(applied) => {
                    outcome.sells_detected += 1;
                    if matches!(
                        applied,
                        positions::ApplyOutcome::Applied {
                            position_closed: true,
                            ..
                        }
                    ) {
                        outcome.sold += 1;
                        log(
                            LogTag::Poller,
                            "SELL_DETECTED",
                            &format!("{}/{} full exit of {:.4} tokens (estimated)", wallet, token, qty),
                        );
                    } else {
                        outcome.still_holding += 1;
                    }
                }
                Err(e) => {
                    outcome.errors += 1;
                    log(LogTag::Poller, "ERROR", &format!("Synthesized sell failed: {}", e));
                }
            }
        } else if delta > BALANCE_EPSILON {
            // Balance grew: an untracked buy
            let buy = BuyEvent {
                wallet_address: wallet.clone(),
                token_address: token.clone(),
                qty: delta,
                usd: price.map(|p| delta * p).unwrap_or(0.0),
                source_event_id: format!("poll:{}:{}:{}", wallet, token, generation),
                estimated: true,
                market_cap,
            };
            match positions::apply_buy(buy).await {
                Ok(_) => {
                    outcome.buys_detected += 1;
                    outcome.still_holding += 1;
                }
                Err(e) => {
                    outcome.errors += 1;
                    log(LogTag::Poller, "ERROR", &format!("Synthesized buy failed: {}", e));
                }
            }
        } else if balance > BALANCE_EPSILON {
            outcome.still_holding += 1;
            if is_debug_poller_enabled() {
                log(
                    LogTag::Poller,
                    "DEBUG",
                    &format!("{}/{} unchanged at {:.4}", wallet, token, balance),
                );
            }
        }
    }

    for wallet in &wallets_touched {
        if let Err(e) = positions::db::calculate_wallet_metrics(wallet) {
            log(LogTag::Poller, "WARNING", &e);
        }
    }

    outcome.duration_ms = started.elapsed().as_millis() as u64;
    settings::record_check_run();
    crate::db::record_operation(
        "position_check",
        "Position Check",
        outcome.credits_used,
        &serde_json::json!({
            "positions_checked": outcome.positions_checked,
            "still_holding": outcome.still_holding,
            "sold": outcome.sold,
            "buys_detected": outcome.buys_detected,
            "sells_detected": outcome.sells_detected,
            "errors": outcome.errors,
        }),
    );

    log(
        LogTag::Poller,
        "CHECK_COMPLETE",
        &format!(
            "{} checked: {} holding, {} sold, {} buys, {} sells, {} errors, {} credits in {}ms",
            outcome.positions_checked,
            outcome.still_holding,
            outcome.sold,
            outcome.buys_detected,
            outcome.sells_detected,
            outcome.errors,
            outcome.credits_used,
            outcome.duration_ms
        ),
    );

    outcome
}

/// Scheduled poller service; honors auto_check_enabled and the configured
/// interval, re-read every tick so settings changes apply without restart
pub async fn start_poller_service(
    shutdown: Arc<Notify>,
    oracle: Arc<PriceOracle>,
    chain: Arc<dyn ChainApi>,
) {
    log(LogTag::Poller, "STARTUP", "Poller service started");
    let mut last_run: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                log(LogTag::Poller, "SHUTDOWN", "Poller service stopping");
                break;
            }
            _ = sleep(Duration::from_secs(POLLER_TICK_SECS)) => {
                let current = settings::get_settings();
                if !current.auto_check_enabled {
                    continue;
                }

                let interval = Duration::from_secs(current.check_interval_minutes as u64 * 60);
                let due = last_run.map_or(true, |t| t.elapsed() >= interval);
                if !due {
                    continue;
                }

                let remaining = budget::BUDGET.remaining(current.daily_credit_budget);
                let max_positions = (remaining / BALANCE_LOOKUP_COST).min(SCHEDULED_MAX_POSITIONS as u32);
                if max_positions == 0 {
                    log(LogTag::Poller, "BUDGET_SKIP", "Daily credit budget exhausted, skipping scheduled check");
                    last_run = Some(Instant::now());
                    continue;
                }

                match try_run_check(&oracle, &chain, max_positions as usize, remaining, false).await {
                    Ok(_) => {}
                    Err(e) => log(LogTag::Poller, "WARNING", &format!("Scheduled check skipped: {}", e)),
                }
                last_run = Some(Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::chain::testing::MockChainApi;
    use crate::oracle::testing::MockMarketApi;
    use crate::positions::{apply_buy, state::get_position};
    use crate::settings::{update_settings, SwabSettingsUpdate};

    fn raise_budget() {
        let _ = update_settings(&SwabSettingsUpdate {
            daily_credit_budget: Some(10_000),
            ..Default::default()
        });
    }

    async fn seed_position(wallet: &str, token: &str, qty: f64, usd: f64) {
        crate::gate::record_participation(wallet, token).unwrap();
        crate::gate::record_participation(wallet, &format!("{}-second", token)).unwrap();
        apply_buy(BuyEvent {
            wallet_address: wallet.to_string(),
            token_address: token.to_string(),
            qty,
            usd,
            source_event_id: format!("sig-seed-{}-{}", wallet, token),
            estimated: false,
            market_cap: Some(100_000.0),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_poller_synthesizes_estimated_sell_on_balance_drop() {
        let _serial = crate::db::testing::serial_lock();
        crate::db::testing::init_test_database();
        raise_budget();
        seed_position("Wpol1", "Tpol1", 1000.0, 100.0).await;

        let chain = MockChainApi::new();
        chain.set_balance("Wpol1", "Tpol1", 0.0);
        let chain: Arc<dyn ChainApi> = Arc::new(chain);
        let oracle = PriceOracle::new(Arc::new(MockMarketApi::with_price("Tpol1", 0.2, 300_000.0)));

        let outcome = try_run_check(&oracle, &chain, 50, 1_000, false).await.unwrap();
        assert!(outcome.sells_detected >= 1);
        assert!(outcome.sold >= 1);

        let p = get_position("Wpol1", "Tpol1").await.unwrap();
        assert_eq!(p.status, PositionStatus::Sold);
        assert!(p.exit_estimated);
        // Estimated exits never claim realized PnL
        assert_eq!(p.pnl_ratio, None);
        // Fumbled ratio from entry 100k to current 300k
        assert!((p.fpnl_ratio.unwrap() - 3.0).abs() < 1e-9);
        assert_eq!(p.poll_generation, 1);
    }

    #[tokio::test]
    async fn test_poller_run_skipped_when_budget_cannot_cover_it() {
        let _serial = crate::db::testing::serial_lock();
        crate::db::testing::init_test_database();
        raise_budget();
        seed_position("Wpol2", "Tpol2", 500.0, 50.0).await;

        let chain = MockChainApi::new();
        chain.set_balance("Wpol2", "Tpol2", 500.0);
        let chain: Arc<dyn ChainApi> = Arc::new(chain);
        let oracle = PriceOracle::new(Arc::new(MockMarketApi::with_price("Tpol2", 0.1, 100_000.0)));

        // One lookup costs 10 credits; allow only 5
        let outcome = try_run_check(&oracle, &chain, 50, 5, false).await.unwrap();
        assert!(outcome.budget_limited);
        assert_eq!(outcome.positions_checked, 0);
        assert_eq!(outcome.credits_used, 0);
    }

    #[tokio::test]
    async fn test_unchanged_balance_refreshes_check_stamp() {
        let _serial = crate::db::testing::serial_lock();
        crate::db::testing::init_test_database();
        raise_budget();
        seed_position("Wpol3", "Tpol3", 800.0, 80.0).await;

        let chain = MockChainApi::new();
        chain.set_balance("Wpol3", "Tpol3", 800.0);
        let chain: Arc<dyn ChainApi> = Arc::new(chain);
        let oracle = PriceOracle::new(Arc::new(MockMarketApi::with_price("Tpol3", 0.1, 140_000.0)));

        try_run_check(&oracle, &chain, 50, 1_000, false).await.unwrap();

        let p = get_position("Wpol3", "Tpol3").await.unwrap();
        assert_eq!(p.status, PositionStatus::Holding);
        assert!(p.last_checked_at.is_some());
        assert_eq!(p.consecutive_failures, 0);
        assert_eq!(p.current_market_cap, Some(140_000.0));
        assert_eq!(p.total_sold, 0.0);
    }
}
