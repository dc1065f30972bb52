/// Webhook event processing: push path of the dual event model
///
/// Deliveries arrive as one transaction object or an array of them; each
/// carries parsed token transfers. Transfers are classified against the
/// tracked set and applied through the ledger, valued at processing-time
/// price from the oracle. When the oracle stays down past its retry
/// budget the delta is applied as an estimate so the quantity survives
/// and the reconciliation engine can upgrade it later.
pub mod classifier;

pub use classifier::{classify, ClassifyContext, IgnoreReason, TransferAction, TransferEvent};

use serde::Serialize;
use serde_json::Value;

use crate::arguments::is_debug_webhook_enabled;
use crate::gate;
use crate::logger::{log, LogTag};
use crate::oracle::PriceOracle;
use crate::positions::{self, BuyEvent, SellEvent};

#[derive(Debug, Clone, Default, Serialize)]
pub struct WebhookSummary {
    pub transactions_processed: u32,
    pub transfers_seen: u32,
    pub buys_applied: u32,
    pub reentries_applied: u32,
    pub sells_applied: u32,
    pub duplicates: u32,
    pub ignored: u32,
}

/// Extract token transfers from a webhook delivery (single object or array)
pub fn parse_payload(payload: &Value) -> Vec<TransferEvent> {
    let transactions: Vec<&Value> = match payload {
        Value::Array(items) => items.iter().collect(),
        single => vec![single],
    };

    let mut events = Vec::new();
    for tx in transactions {
        let signature = tx
            .get("signature")
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string();

        let Some(transfers) = tx.get("tokenTransfers").and_then(|t| t.as_array()) else {
            continue;
        };

        for transfer in transfers {
            let Some(mint) = transfer.get("mint").and_then(|m| m.as_str()) else {
                continue;
            };
            let amount = transfer
                .get("tokenAmount")
                .and_then(|a| a.as_f64())
                .unwrap_or(0.0);

            events.push(TransferEvent {
                signature: signature.clone(),
                token_address: mint.to_string(),
                from_wallet: transfer
                    .get("fromUserAccount")
                    .and_then(|w| w.as_str())
                    .map(String::from),
                to_wallet: transfer
                    .get("toUserAccount")
                    .and_then(|w| w.as_str())
                    .map(String::from),
                amount,
            });
        }
    }
    events
}

/// Process one webhook delivery end to end
pub async fn process_payload(oracle: &PriceOracle, payload: &Value) -> WebhookSummary {
    let mut summary = WebhookSummary::default();
    summary.transactions_processed = match payload {
        Value::Array(items) => items.len() as u32,
        _ => 1,
    };

    let events = parse_payload(payload);
    summary.transfers_seen = events.len() as u32;

    for event in events {
        let ctx = resolve_context(&event).await;
        let actions = classify(&event, &ctx);

        for action in actions {
            match action {
                TransferAction::Ignored { reason } => {
                    summary.ignored += 1;
                    if is_debug_webhook_enabled() {
                        log(
                            LogTag::Webhook,
                            "DEBUG",
                            &format!(
                                "Ignored transfer {} of {}: {:?}",
                                event.signature, event.token_address, reason
                            ),
                        );
                    }
                }
                TransferAction::Sell { wallet, qty } => {
                    apply_sell_action(oracle, &event, &wallet, qty, &mut summary).await;
                }
                TransferAction::Buy { wallet, qty } | TransferAction::ReEntry { wallet, qty } => {
                    apply_buy_action(oracle, &event, &wallet, qty, &mut summary).await;
                }
            }
        }
    }

    if summary.buys_applied + summary.sells_applied + summary.reentries_applied > 0 {
        log(
            LogTag::Webhook,
            "PROCESSED",
            &format!(
                "{} tx: {} buys, {} re-entries, {} sells ({} duplicates, {} ignored)",
                summary.transactions_processed,
                summary.buys_applied,
                summary.reentries_applied,
                summary.sells_applied,
                summary.duplicates,
                summary.ignored
            ),
        );
    }

    summary
}

async fn resolve_context(event: &TransferEvent) -> ClassifyContext {
    let to_prior_status = match event.to_wallet.as_deref() {
        Some(to) => positions::state::get_position(to, &event.token_address)
            .await
            .map(|p| p.status),
        None => None,
    };

    ClassifyContext {
        token_analyzed: gate::is_analyzed_token(&event.token_address),
        from_tracked: event
            .from_wallet
            .as_deref()
            .map(gate::is_tracked)
            .unwrap_or(false),
        to_tracked: event
            .to_wallet
            .as_deref()
            .map(gate::is_tracked)
            .unwrap_or(false),
        to_prior_status,
    }
}

async fn apply_sell_action(
    oracle: &PriceOracle,
    event: &TransferEvent,
    wallet: &str,
    qty: f64,
    summary: &mut WebhookSummary,
) {
    // Value at processing time; exact historical price is the
    // reconciliation engine's job
    let (usd, market_cap, estimated) = match oracle.get_with_retry(&event.token_address).await {
        Ok(m) => (qty * m.price_usd, m.market_cap_usd, false),
        Err(_) => (0.0, None, true),
    };

    let sell = SellEvent {
        wallet_address: wallet.to_string(),
        token_address: event.token_address.clone(),
        qty,
        usd,
        source_event_id: format!("{}:{}", event.signature, wallet),
        estimated,
        market_cap,
    };

    match positions::apply_sell(sell).await {
        Ok(outcome) if outcome.was_applied() => {
            summary.sells_applied += 1;
            if let Err(e) = positions::db::calculate_wallet_metrics(wallet) {
                log(LogTag::Webhook, "WARNING", &e);
            }
        }
        Ok(positions::ApplyOutcome::Duplicate) => summary.duplicates += 1,
        Ok(_) => summary.ignored += 1,
        Err(e) => log(
            LogTag::Webhook,
            "ERROR",
            &format!("Sell apply failed for {}: {}", wallet, e),
        ),
    }
}

async fn apply_buy_action(
    oracle: &PriceOracle,
    event: &TransferEvent,
    wallet: &str,
    qty: f64,
    summary: &mut WebhookSummary,
) {
    let (usd, market_cap, estimated) = match oracle.get_with_retry(&event.token_address).await {
        Ok(m) => (qty * m.price_usd, m.market_cap_usd, false),
        Err(_) => (0.0, None, true),
    };

    let buy = BuyEvent {
        wallet_address: wallet.to_string(),
        token_address: event.token_address.clone(),
        qty,
        usd,
        source_event_id: format!("{}:{}", event.signature, wallet),
        estimated,
        market_cap,
    };

    match positions::apply_buy(buy).await {
        Ok(positions::ApplyOutcome::Applied { reentry, .. }) => {
            if reentry {
                summary.reentries_applied += 1;
            } else {
                summary.buys_applied += 1;
            }
            if let Err(e) = positions::db::calculate_wallet_metrics(wallet) {
                log(LogTag::Webhook, "WARNING", &e);
            }
        }
        Ok(positions::ApplyOutcome::Duplicate) => summary.duplicates += 1,
        Ok(_) => summary.ignored += 1,
        Err(e) => log(
            LogTag::Webhook,
            "ERROR",
            &format!("Buy apply failed for {}: {}", wallet, e),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::testing::MockMarketApi;
    use crate::positions::state::get_position;
    use crate::positions::PositionStatus;
    use serde_json::json;
    use std::sync::Arc;

    fn delivery(signature: &str, mint: &str, from: &str, to: &str, amount: f64) -> Value {
        json!({
            "signature": signature,
            "type": "TRANSFER",
            "tokenTransfers": [{
                "fromUserAccount": from,
                "toUserAccount": to,
                "mint": mint,
                "tokenAmount": amount,
            }]
        })
    }

    #[tokio::test]
    async fn test_webhook_buy_then_sell_round_trip() {
        let _serial = crate::db::testing::serial_lock();
        crate::db::testing::init_test_database();
        crate::gate::record_participation("Wwh1", "Twh1").unwrap();
        crate::gate::record_participation("Wwh1", "Twh1b").unwrap();
        assert!(crate::gate::is_tracked("Wwh1"));

        let api = Arc::new(MockMarketApi::with_price("Twh1", 0.10, 100_000.0));
        let oracle = PriceOracle::new(api);

        let buy = delivery("sig-wh1-buy", "Twh1", "POOLwh", "Wwh1", 1000.0);
        let summary = process_payload(&oracle, &buy).await;
        assert_eq!(summary.buys_applied, 1);

        let p = get_position("Wwh1", "Twh1").await.unwrap();
        assert_eq!(p.total_bought, 1000.0);
        assert!((p.total_bought_usd - 100.0).abs() < 1e-9);
        assert_eq!(p.status, PositionStatus::Holding);

        // Redelivery of the same signature must not double-count
        let summary = process_payload(&oracle, &buy).await;
        assert_eq!(summary.duplicates, 1);
        let p = get_position("Wwh1", "Twh1").await.unwrap();
        assert_eq!(p.total_bought, 1000.0);

        let sell = delivery("sig-wh1-sell", "Twh1", "Wwh1", "POOLwh", 1000.0);
        let summary = process_payload(&oracle, &sell).await;
        assert_eq!(summary.sells_applied, 1);

        let p = get_position("Wwh1", "Twh1").await.unwrap();
        assert_eq!(p.status, PositionStatus::Sold);
        assert!(!p.exit_estimated);
        // Bought $100, sold at the same $0.10 price -> 1.0x
        assert!((p.pnl_ratio.unwrap() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_untracked_transfer_is_ignored_without_writes() {
        let _serial = crate::db::testing::serial_lock();
        crate::db::testing::init_test_database();

        let api = Arc::new(MockMarketApi::with_price("Twh2", 1.0, 1_000.0));
        let oracle = PriceOracle::new(api.clone());

        let payload = delivery("sig-wh2", "Twh2", "POOLwh2", "StrangerWallet", 50.0);
        let summary = process_payload(&oracle, &payload).await;

        assert_eq!(summary.ignored, 1);
        assert_eq!(summary.buys_applied + summary.sells_applied, 0);
        assert!(get_position("StrangerWallet", "Twh2").await.is_none());
        // Ignored events never hit the oracle
        assert_eq!(api.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_oracle_outage_applies_estimated_delta() {
        let _serial = crate::db::testing::serial_lock();
        crate::db::testing::init_test_database();
        crate::gate::record_participation("Wwh3", "Twh3").unwrap();
        crate::gate::record_participation("Wwh3", "Twh3b").unwrap();

        let oracle = PriceOracle::new(Arc::new(MockMarketApi::failing()));

        let buy = delivery("sig-wh3-buy", "Twh3", "POOLwh3", "Wwh3", 750.0);
        let summary = process_payload(&oracle, &buy).await;
        assert_eq!(summary.buys_applied, 1);

        // Quantity preserved despite the outage; USD pending reconciliation
        let p = get_position("Wwh3", "Twh3").await.unwrap();
        assert_eq!(p.total_bought, 750.0);
        assert_eq!(p.total_bought_usd, 0.0);
    }
}
