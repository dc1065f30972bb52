/// Ledger accumulator: the single mutation path for position state
///
/// Both event producers (webhook classifier and balance poller) and the
/// reconciliation engine route their deltas through here, which is what
/// keeps the dual-path event model convergent: one critical section per
/// (wallet, token), one dedupe ledger, one write path to storage.
use chrono::Utc;

use super::db;
use super::state::{acquire_position_lock, put_position, POSITIONS};
use super::types::{position_key, Position, PositionStatus, BALANCE_EPSILON};
use crate::arguments::is_debug_ledger_enabled;
use crate::logger::{log, LogTag};

/// A buy delta to apply to a position
#[derive(Debug, Clone)]
pub struct BuyEvent {
    pub wallet_address: String,
    pub token_address: String,
    pub qty: f64,
    pub usd: f64,
    /// Dedupe key: transaction signature, or poll:{wallet}:{token}:{gen}
    pub source_event_id: String,
    /// True when the USD value comes from an estimate (oracle down)
    pub estimated: bool,
    /// Market cap at processing time, used as entry cap for new positions
    pub market_cap: Option<f64>,
}

/// A sell delta to apply to a position
#[derive(Debug, Clone)]
pub struct SellEvent {
    pub wallet_address: String,
    pub token_address: String,
    pub qty: f64,
    pub usd: f64,
    pub source_event_id: String,
    /// True when the proceeds are estimated from current price rather than
    /// confirmed transaction data; keeps pnl_ratio unset until reconciled
    pub estimated: bool,
    /// Market cap at processing time, recorded as exit cap on full drains
    pub market_cap: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied {
        position_closed: bool,
        clamped: bool,
        reentry: bool,
    },
    /// The event id was already applied; state unchanged
    Duplicate,
    /// No position exists to apply a sell/correction against
    NoPosition,
}

impl ApplyOutcome {
    pub fn was_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}

fn validate_amounts(qty: f64, usd: f64) -> Result<(), String> {
    if !qty.is_finite() || !usd.is_finite() {
        return Err("Event quantity/USD must be finite".to_string());
    }
    if qty <= 0.0 {
        return Err(format!("Event quantity must be positive, got {}", qty));
    }
    if usd < 0.0 {
        return Err(format!("Event USD must be non-negative, got {}", usd));
    }
    Ok(())
}

/// Apply a buy delta; creates the position on first buy
///
/// A buy landing on a sold position is a re-entry: the position
/// reactivates, realized PnL resets and the entry cap restarts from the
/// new entry. Totals keep accumulating across rounds.
pub async fn apply_buy(event: BuyEvent) -> Result<ApplyOutcome, String> {
    validate_amounts(event.qty, event.usd)?;

    let key = position_key(&event.wallet_address, &event.token_address);
    let _guard = acquire_position_lock(&key).await;

    if db::is_event_applied(&event.source_event_id)? {
        if is_debug_ledger_enabled() {
            log(
                LogTag::Ledger,
                "DEBUG",
                &format!("Duplicate buy event ignored: {}", event.source_event_id),
            );
        }
        return Ok(ApplyOutcome::Duplicate);
    }

    let existing = POSITIONS.read().await.get(&key).cloned();
    let mut position = existing.unwrap_or_else(|| {
        let mut p = Position::new(&event.wallet_address, &event.token_address);
        p.entry_market_cap = event.market_cap;
        p
    });

    let reentry = position.status == PositionStatus::Sold;
    if reentry {
        // Reactivation: PnL recomputation restarts from the new entry
        position.pnl_ratio = None;
        position.fpnl_ratio = None;
        position.entry_market_cap = event.market_cap.or(position.entry_market_cap);
        position.exit_market_cap = None;
        position.exit_detected_at = None;
        position.exit_estimated = false;
    }

    position.total_bought += event.qty;
    position.total_bought_usd += event.usd;
    position.buy_count += 1;
    position.avg_entry_price = if position.total_bought > 0.0 {
        Some(position.total_bought_usd / position.total_bought)
    } else {
        None
    };
    position.status = PositionStatus::Holding;
    position.last_buy_at = Some(Utc::now());
    if let Some(mc) = event.market_cap {
        position.current_market_cap = Some(mc);
    }

    db::upsert_position(&mut position)?;
    db::mark_event_applied(
        &event.source_event_id,
        &event.wallet_address,
        &event.token_address,
        "buy",
    )?;
    put_position(position).await;

    log(
        LogTag::Ledger,
        if reentry { "RE_ENTRY" } else { "BUY" },
        &format!(
            "{}/{} +{:.4} tokens (${:.2}){}",
            event.wallet_address,
            event.token_address,
            event.qty,
            event.usd,
            if event.estimated { " [estimated]" } else { "" }
        ),
    );

    Ok(ApplyOutcome::Applied {
        position_closed: false,
        clamped: false,
        reentry,
    })
}

/// Apply a sell delta
///
/// Sells beyond the held balance are clamped to the remaining balance and
/// the discrepancy is recorded as a data-quality anomaly. A sell that
/// drains the position marks it sold; confirmed drains set the realized
/// PnL ratio, estimated ones leave it unset for the reconciliation engine.
pub async fn apply_sell(event: SellEvent) -> Result<ApplyOutcome, String> {
    validate_amounts(event.qty, event.usd)?;

    let key = position_key(&event.wallet_address, &event.token_address);
    let _guard = acquire_position_lock(&key).await;

    if db::is_event_applied(&event.source_event_id)? {
        if is_debug_ledger_enabled() {
            log(
                LogTag::Ledger,
                "DEBUG",
                &format!("Duplicate sell event ignored: {}", event.source_event_id),
            );
        }
        return Ok(ApplyOutcome::Duplicate);
    }

    let Some(mut position) = POSITIONS.read().await.get(&key).cloned() else {
        db::record_anomaly(
            &event.wallet_address,
            &event.token_address,
            "sell_without_position",
            &format!("sell of {:.4} tokens with no tracked position", event.qty),
        );
        return Ok(ApplyOutcome::NoPosition);
    };

    let remaining = position.held_balance();
    let clamped = event.qty > remaining + BALANCE_EPSILON;
    let qty_applied = event.qty.min(remaining);

    if clamped {
        db::record_anomaly(
            &event.wallet_address,
            &event.token_address,
            "sell_exceeds_balance",
            &format!(
                "sell of {:.4} exceeds held {:.4}; clamped",
                event.qty, remaining
            ),
        );
    }

    if qty_applied <= 0.0 {
        // Nothing left to drain; mark the event so replays stay silent
        db::mark_event_applied(
            &event.source_event_id,
            &event.wallet_address,
            &event.token_address,
            "sell",
        )?;
        return Ok(ApplyOutcome::Applied {
            position_closed: false,
            clamped: true,
            reentry: false,
        });
    }

    // Scale USD with the clamp so price-per-unit stays intact
    let usd_applied = if clamped && event.qty > 0.0 {
        event.usd * (qty_applied / event.qty)
    } else {
        event.usd
    };

    position.total_sold += qty_applied;
    position.total_sold_usd += usd_applied;
    position.sell_count += 1;
    position.last_sell_at = Some(Utc::now());
    if event.estimated {
        position.exit_estimated = true;
    }
    if let Some(mc) = event.market_cap {
        position.current_market_cap = Some(mc);
    }

    let position_closed = position.is_fully_drained();
    if position_closed {
        position.status = PositionStatus::Sold;
        position.exit_detected_at = Some(Utc::now());
        position.exit_market_cap = event.market_cap.or(position.exit_market_cap);

        // Realized PnL only from confirmed exits; estimated exits surface
        // the fumbled ratio instead until reconciliation upgrades them
        if !position.exit_estimated {
            position.pnl_ratio = match (position.avg_entry_price, position.total_sold) {
                (Some(avg_entry), sold) if avg_entry > 0.0 && sold > 0.0 => {
                    Some((position.total_sold_usd / sold) / avg_entry)
                }
                _ => None,
            };
        }
        position.fpnl_ratio = match (position.entry_market_cap, position.current_market_cap) {
            (Some(entry), Some(current)) if entry > 0.0 => Some(current / entry),
            _ => None,
        };
    }

    db::upsert_position(&mut position)?;
    db::mark_event_applied(
        &event.source_event_id,
        &event.wallet_address,
        &event.token_address,
        "sell",
    )?;

    let pnl_note = position
        .pnl_ratio
        .map(|r| format!(" PnL {:.2}x", r))
        .unwrap_or_default();
    log(
        LogTag::Ledger,
        if position_closed { "FULL_EXIT" } else { "SELL" },
        &format!(
            "{}/{} -{:.4} tokens (${:.2}){}{}",
            event.wallet_address,
            event.token_address,
            qty_applied,
            usd_applied,
            if event.estimated { " [estimated]" } else { "" },
            pnl_note
        ),
    );

    put_position(position).await;

    Ok(ApplyOutcome::Applied {
        position_closed,
        clamped,
        reentry: false,
    })
}

/// Replace an estimated exit with exact figures from transaction history
///
/// Net-zero on quantity: only the USD proceeds and derived price fields
/// change. Used by the reconciliation engine.
pub async fn apply_exact_exit(
    wallet_address: &str,
    token_address: &str,
    qty_sold: f64,
    usd_received: f64,
    source_event_id: &str,
) -> Result<ApplyOutcome, String> {
    if qty_sold <= 0.0 || usd_received < 0.0 {
        return Err(format!(
            "Exact exit requires positive quantity and non-negative USD (qty={}, usd={})",
            qty_sold, usd_received
        ));
    }

    let key = position_key(wallet_address, token_address);
    let _guard = acquire_position_lock(&key).await;

    if db::is_event_applied(source_event_id)? {
        return Ok(ApplyOutcome::Duplicate);
    }

    let Some(mut position) = POSITIONS.read().await.get(&key).cloned() else {
        return Ok(ApplyOutcome::NoPosition);
    };
    if position.status != PositionStatus::Sold {
        return Ok(ApplyOutcome::NoPosition);
    }

    let old_pnl = position.pnl_ratio;
    position.total_sold_usd = usd_received;
    position.sell_count = position.sell_count.max(1);
    position.exit_estimated = false;
    position.pnl_ratio = match position.avg_entry_price {
        Some(avg_entry) if avg_entry > 0.0 => Some((usd_received / qty_sold) / avg_entry),
        _ => None,
    };

    db::upsert_position(&mut position)?;
    db::mark_event_applied(source_event_id, wallet_address, token_address, "exact_exit")?;

    log(
        LogTag::Ledger,
        "EXIT_CONFIRMED",
        &format!(
            "{}/{} exact exit ${:.2} for {:.4} tokens, PnL {:?} -> {:?}",
            wallet_address, token_address, usd_received, qty_sold, old_pnl, position.pnl_ratio
        ),
    );

    put_position(position).await;

    Ok(ApplyOutcome::Applied {
        position_closed: true,
        clamped: false,
        reentry: false,
    })
}

/// Mutate a position outside the buy/sell path (check stamps, cap refresh,
/// stale transitions) under its critical section, with write-through
pub async fn touch_position<F>(key: &str, mutate: F) -> Result<bool, String>
where
    F: FnOnce(&mut Position),
{
    let _guard = acquire_position_lock(key).await;

    let Some(mut position) = POSITIONS.read().await.get(key).cloned() else {
        return Ok(false);
    };

    mutate(&mut position);
    db::upsert_position(&mut position)?;
    put_position(position).await;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::positions::state::get_position;

    fn buy(wallet: &str, token: &str, qty: f64, usd: f64, id: &str) -> BuyEvent {
        BuyEvent {
            wallet_address: wallet.to_string(),
            token_address: token.to_string(),
            qty,
            usd,
            source_event_id: id.to_string(),
            estimated: false,
            market_cap: Some(100_000.0),
        }
    }

    fn sell(wallet: &str, token: &str, qty: f64, usd: f64, id: &str) -> SellEvent {
        SellEvent {
            wallet_address: wallet.to_string(),
            token_address: token.to_string(),
            qty,
            usd,
            source_event_id: id.to_string(),
            estimated: false,
            market_cap: Some(150_000.0),
        }
    }

    #[tokio::test]
    async fn test_replayed_event_is_not_double_counted() {
        crate::db::testing::init_test_database();

        let event = buy("Wled1", "Tled1", 1000.0, 100.0, "sig-led1-buy");
        assert!(apply_buy(event.clone()).await.unwrap().was_applied());
        assert_eq!(
            apply_buy(event.clone()).await.unwrap(),
            ApplyOutcome::Duplicate
        );

        let p = get_position("Wled1", "Tled1").await.unwrap();
        assert_eq!(p.total_bought, 1000.0);
        assert_eq!(p.total_bought_usd, 100.0);
        assert_eq!(p.buy_count, 1);

        // Same for sell deliveries
        let sell_event = sell("Wled1", "Tled1", 400.0, 60.0, "sig-led1-sell");
        assert!(apply_sell(sell_event.clone()).await.unwrap().was_applied());
        assert_eq!(
            apply_sell(sell_event).await.unwrap(),
            ApplyOutcome::Duplicate
        );

        let p = get_position("Wled1", "Tled1").await.unwrap();
        assert_eq!(p.total_sold, 400.0);
        assert_eq!(p.sell_count, 1);
    }

    #[tokio::test]
    async fn test_oversell_is_clamped_and_conserved() {
        crate::db::testing::init_test_database();

        apply_buy(buy("Wled2", "Tled2", 100.0, 50.0, "sig-led2-buy"))
            .await
            .unwrap();

        // Webhook claims a 150-token sell against 100 held
        let outcome = apply_sell(sell("Wled2", "Tled2", 150.0, 90.0, "sig-led2-sell"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                position_closed: true,
                clamped: true,
                reentry: false,
            }
        );

        let p = get_position("Wled2", "Tled2").await.unwrap();
        assert!(p.total_sold <= p.total_bought);
        assert_eq!(p.total_sold, 100.0);
        // USD scaled with the clamp: 90 * (100/150) = 60
        assert!((p.total_sold_usd - 60.0).abs() < 1e-9);
        assert_eq!(p.status, PositionStatus::Sold);
    }

    #[tokio::test]
    async fn test_sell_without_position_records_anomaly_only() {
        crate::db::testing::init_test_database();

        let outcome = apply_sell(sell("Wled3", "Tled3", 10.0, 5.0, "sig-led3-sell"))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::NoPosition);
        assert!(get_position("Wled3", "Tled3").await.is_none());
    }

    #[tokio::test]
    async fn test_status_is_sold_iff_fully_drained() {
        crate::db::testing::init_test_database();

        apply_buy(buy("Wled4", "Tled4", 1000.0, 100.0, "sig-led4-buy"))
            .await
            .unwrap();
        apply_sell(sell("Wled4", "Tled4", 600.0, 90.0, "sig-led4-s1"))
            .await
            .unwrap();

        let p = get_position("Wled4", "Tled4").await.unwrap();
        assert_eq!(p.status, PositionStatus::Holding);
        assert_eq!(p.pnl_ratio, None);

        apply_sell(sell("Wled4", "Tled4", 400.0, 80.0, "sig-led4-s2"))
            .await
            .unwrap();
        let p = get_position("Wled4", "Tled4").await.unwrap();
        assert_eq!(p.status, PositionStatus::Sold);
        assert!(p.is_fully_drained());
        // Aggregate exit price over both sells: $170 / 1000 = 0.17 vs 0.10 entry
        assert!((p.pnl_ratio.unwrap() - 1.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reentry_resets_realized_pnl() {
        crate::db::testing::init_test_database();

        apply_buy(buy("Wled5", "Tled5", 1000.0, 100.0, "sig-led5-buy"))
            .await
            .unwrap();
        apply_sell(sell("Wled5", "Tled5", 1000.0, 200.0, "sig-led5-sell"))
            .await
            .unwrap();

        let p = get_position("Wled5", "Tled5").await.unwrap();
        assert_eq!(p.status, PositionStatus::Sold);
        assert!((p.pnl_ratio.unwrap() - 2.0).abs() < 1e-9);

        // New buy reactivates the position and restarts PnL from the new entry
        let mut reentry = buy("Wled5", "Tled5", 500.0, 150.0, "sig-led5-rebuy");
        reentry.market_cap = Some(400_000.0);
        let outcome = apply_buy(reentry).await.unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                position_closed: false,
                clamped: false,
                reentry: true,
            }
        );

        let p = get_position("Wled5", "Tled5").await.unwrap();
        assert_eq!(p.status, PositionStatus::Holding);
        assert_eq!(p.pnl_ratio, None);
        assert_eq!(p.fpnl_ratio, None);
        assert_eq!(p.entry_market_cap, Some(400_000.0));
        assert_eq!(p.exit_detected_at, None);
    }

    #[tokio::test]
    async fn test_estimated_exit_keeps_pnl_unset_until_confirmed() {
        crate::db::testing::init_test_database();

        apply_buy(buy("Wled6", "Tled6", 1000.0, 100.0, "sig-led6-buy"))
            .await
            .unwrap();

        let mut estimated = sell("Wled6", "Tled6", 1000.0, 180.0, "poll:Wled6:Tled6:1");
        estimated.estimated = true;
        apply_sell(estimated).await.unwrap();

        let p = get_position("Wled6", "Tled6").await.unwrap();
        assert_eq!(p.status, PositionStatus::Sold);
        assert!(p.exit_estimated);
        assert_eq!(p.pnl_ratio, None);
        assert!(p.fpnl_ratio.is_some());

        // Reconciliation finds the real exit: $250 for the same 1000 tokens
        let outcome =
            apply_exact_exit("Wled6", "Tled6", 1000.0, 250.0, "sig-led6-exact").await.unwrap();
        assert!(outcome.was_applied());

        let p = get_position("Wled6", "Tled6").await.unwrap();
        assert!(!p.exit_estimated);
        assert!((p.pnl_ratio.unwrap() - 2.5).abs() < 1e-9);
        // Quantity untouched by the correction
        assert_eq!(p.total_sold, 1000.0);
        assert_eq!(p.total_sold_usd, 250.0);
    }

    #[tokio::test]
    async fn test_negative_amounts_rejected() {
        crate::db::testing::init_test_database();
        assert!(apply_buy(buy("Wled7", "Tled7", -5.0, 1.0, "sig-led7")).await.is_err());
        assert!(apply_buy(buy("Wled7", "Tled7", 5.0, -1.0, "sig-led7b")).await.is_err());
    }
}
