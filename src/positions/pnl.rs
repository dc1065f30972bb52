/// PnL engine: market-cap refresh and derived ratios
///
/// Realized PnL is set by the ledger at confirmed exits; this module keeps
/// `current_market_cap` (and the fumbled ratio of sold positions) fresh so
/// unrealized PnL reads stay meaningful. Market-cap lookups are free tier
/// and consume no tracking credits.
use serde::Serialize;
use std::collections::HashSet;
use std::time::Instant;

use super::ledger::touch_position;
use super::state::all_positions;
use super::types::PositionStatus;
use crate::logger::{log, LogTag};
use crate::oracle::PriceOracle;

#[derive(Debug, Clone, Serialize)]
pub struct PnlRefreshOutcome {
    pub tokens_updated: u32,
    pub tokens_failed: u32,
    pub positions_updated: u32,
    pub duration_ms: u64,
}

/// Refresh current market caps for every token with positions
///
/// Holding positions get their unrealized basis updated; sold positions
/// get their fumbled ratio recomputed. Provider failures skip the token
/// and are retried on the next refresh.
pub async fn refresh_all_pnl(oracle: &PriceOracle) -> PnlRefreshOutcome {
    let started = Instant::now();
    let positions = all_positions().await;

    let tokens: HashSet<String> = positions
        .iter()
        .map(|p| p.token_address.clone())
        .collect();

    let mut tokens_updated = 0u32;
    let mut tokens_failed = 0u32;
    let mut positions_updated = 0u32;

    for token in tokens {
        let market = match oracle.get(&token).await {
            Ok(m) => m,
            Err(e) => {
                log(
                    LogTag::Pnl,
                    "DEBUG",
                    &format!("Market cap refresh skipped for {}: {}", token, e),
                );
                tokens_failed += 1;
                continue;
            }
        };
        let Some(current_mc) = market.market_cap_usd else {
            tokens_failed += 1;
            continue;
        };

        tokens_updated += 1;
        for position in positions.iter().filter(|p| p.token_address == token) {
            let result = touch_position(&position.key(), |p| {
                p.current_market_cap = Some(current_mc);
                if p.status == PositionStatus::Sold {
                    p.fpnl_ratio = match p.entry_market_cap {
                        Some(entry) if entry > 0.0 => Some(current_mc / entry),
                        _ => p.fpnl_ratio,
                    };
                }
            })
            .await;

            match result {
                Ok(true) => positions_updated += 1,
                Ok(false) => {}
                Err(e) => log(
                    LogTag::Pnl,
                    "WARNING",
                    &format!("Failed to refresh {}: {}", position.key(), e),
                ),
            }
        }
    }

    let outcome = PnlRefreshOutcome {
        tokens_updated,
        tokens_failed,
        positions_updated,
        duration_ms: started.elapsed().as_millis() as u64,
    };

    log(
        LogTag::Pnl,
        "REFRESH_COMPLETE",
        &format!(
            "{} positions across {} tokens in {}ms ({} tokens unavailable)",
            outcome.positions_updated,
            outcome.tokens_updated,
            outcome.duration_ms,
            outcome.tokens_failed
        ),
    );

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::testing::MockMarketApi;
    use crate::positions::ledger::{apply_buy, apply_sell, ApplyOutcome, BuyEvent, SellEvent};
    use crate::positions::state::get_position;
    use std::sync::Arc;

    fn buy(wallet: &str, token: &str, qty: f64, usd: f64, id: &str, mc: Option<f64>) -> BuyEvent {
        BuyEvent {
            wallet_address: wallet.to_string(),
            token_address: token.to_string(),
            qty,
            usd,
            source_event_id: id.to_string(),
            estimated: false,
            market_cap: mc,
        }
    }

    fn sell(wallet: &str, token: &str, qty: f64, usd: f64, id: &str, mc: Option<f64>) -> SellEvent {
        SellEvent {
            wallet_address: wallet.to_string(),
            token_address: token.to_string(),
            qty,
            usd,
            source_event_id: id.to_string(),
            estimated: false,
            market_cap: mc,
        }
    }

    #[tokio::test]
    async fn test_unrealized_pnl_tracks_market_cap() {
        crate::db::testing::init_test_database();

        // Buy 1000 units for $100 at a 100k cap
        apply_buy(buy("Wpnl1", "Tpnl1", 1000.0, 100.0, "sig-pnl1-buy", Some(100_000.0)))
            .await
            .unwrap();

        let p = get_position("Wpnl1", "Tpnl1").await.unwrap();
        assert_eq!(p.avg_entry_price, Some(0.1));
        assert_eq!(p.unrealized_ratio(), Some(1.0));

        // Cap triples: unrealized display is 3.0x
        let api = Arc::new(MockMarketApi::with_price("Tpnl1", 0.3, 300_000.0));
        let oracle = PriceOracle::new(api);
        let outcome = refresh_all_pnl(&oracle).await;
        assert!(outcome.positions_updated >= 1);

        let p = get_position("Wpnl1", "Tpnl1").await.unwrap();
        assert_eq!(p.unrealized_ratio(), Some(3.0));
        assert_eq!(p.pnl_ratio, None);
    }

    #[tokio::test]
    async fn test_confirmed_full_exit_sets_realized_pnl() {
        crate::db::testing::init_test_database();

        apply_buy(buy("Wpnl2", "Tpnl2", 1000.0, 100.0, "sig-pnl2-buy", Some(100_000.0)))
            .await
            .unwrap();

        // Confirmed exit: all 1000 units for $250 -> 2.5x
        let outcome = apply_sell(sell(
            "Wpnl2",
            "Tpnl2",
            1000.0,
            250.0,
            "sig-pnl2-sell",
            Some(250_000.0),
        ))
        .await
        .unwrap();
        assert!(matches!(
            outcome,
            ApplyOutcome::Applied {
                position_closed: true,
                ..
            }
        ));

        let p = get_position("Wpnl2", "Tpnl2").await.unwrap();
        assert_eq!(p.status, PositionStatus::Sold);
        assert!((p.pnl_ratio.unwrap() - 2.5).abs() < 1e-9);
        assert!(!p.exit_estimated);
    }

    #[tokio::test]
    async fn test_sold_position_fumbled_ratio_refreshes() {
        crate::db::testing::init_test_database();

        apply_buy(buy("Wpnl3", "Tpnl3", 500.0, 50.0, "sig-pnl3-buy", Some(200_000.0)))
            .await
            .unwrap();
        apply_sell(sell(
            "Wpnl3",
            "Tpnl3",
            500.0,
            60.0,
            "sig-pnl3-sell",
            Some(220_000.0),
        ))
        .await
        .unwrap();

        // Cap keeps running after the exit: fumbled ratio follows it
        let api = Arc::new(MockMarketApi::with_price("Tpnl3", 2.0, 800_000.0));
        let oracle = PriceOracle::new(api);
        refresh_all_pnl(&oracle).await;

        let p = get_position("Wpnl3", "Tpnl3").await.unwrap();
        assert!((p.fpnl_ratio.unwrap() - 4.0).abs() < 1e-9);
        // Realized PnL is untouched by market moves after the exit
        assert!((p.pnl_ratio.unwrap() - 1.2).abs() < 1e-9);
    }
}
