/// Pure classification of incoming token-transfer events
///
/// One transfer can touch two tracked wallets (source and destination),
/// so classification yields a small list of actions. No storage access
/// happens here; the processor resolves context up front and applies the
/// resulting actions through the ledger.
use serde::Serialize;

use crate::positions::PositionStatus;

/// A single token transfer extracted from a webhook delivery
#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub signature: String,
    pub token_address: String,
    pub from_wallet: Option<String>,
    pub to_wallet: Option<String>,
    pub amount: f64,
}

/// Everything classification needs to know, resolved by the caller
#[derive(Debug, Clone, Default)]
pub struct ClassifyContext {
    pub token_analyzed: bool,
    pub from_tracked: bool,
    pub to_tracked: bool,
    /// Prior status of the destination wallet's position, if one exists
    pub to_prior_status: Option<PositionStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    EmptyAmount,
    TokenNotAnalyzed,
    WalletNotTracked,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferAction {
    Buy { wallet: String, qty: f64 },
    ReEntry { wallet: String, qty: f64 },
    Sell { wallet: String, qty: f64 },
    Ignored { reason: IgnoreReason },
}

/// Classify a transfer relative to the tracked wallet set
pub fn classify(event: &TransferEvent, ctx: &ClassifyContext) -> Vec<TransferAction> {
    if event.amount <= 0.0 {
        return vec![TransferAction::Ignored {
            reason: IgnoreReason::EmptyAmount,
        }];
    }
    if !ctx.token_analyzed {
        return vec![TransferAction::Ignored {
            reason: IgnoreReason::TokenNotAnalyzed,
        }];
    }

    let mut actions = Vec::new();

    if let Some(from) = event.from_wallet.as_deref() {
        if ctx.from_tracked {
            actions.push(TransferAction::Sell {
                wallet: from.to_string(),
                qty: event.amount,
            });
        }
    }

    if let Some(to) = event.to_wallet.as_deref() {
        if ctx.to_tracked {
            // A buy into a sold position reactivates it
            if ctx.to_prior_status == Some(PositionStatus::Sold) {
                actions.push(TransferAction::ReEntry {
                    wallet: to.to_string(),
                    qty: event.amount,
                });
            } else {
                actions.push(TransferAction::Buy {
                    wallet: to.to_string(),
                    qty: event.amount,
                });
            }
        }
    }

    if actions.is_empty() {
        actions.push(TransferAction::Ignored {
            reason: IgnoreReason::WalletNotTracked,
        });
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(from: Option<&str>, to: Option<&str>, amount: f64) -> TransferEvent {
        TransferEvent {
            signature: "sig".to_string(),
            token_address: "MINT".to_string(),
            from_wallet: from.map(String::from),
            to_wallet: to.map(String::from),
            amount,
        }
    }

    #[test]
    fn test_tracked_source_classifies_as_sell() {
        let ctx = ClassifyContext {
            token_analyzed: true,
            from_tracked: true,
            ..Default::default()
        };
        let actions = classify(&transfer(Some("W1"), Some("POOL"), 500.0), &ctx);
        assert_eq!(
            actions,
            vec![TransferAction::Sell {
                wallet: "W1".to_string(),
                qty: 500.0
            }]
        );
    }

    #[test]
    fn test_tracked_destination_classifies_as_buy() {
        let ctx = ClassifyContext {
            token_analyzed: true,
            to_tracked: true,
            ..Default::default()
        };
        let actions = classify(&transfer(Some("POOL"), Some("W2"), 250.0), &ctx);
        assert_eq!(
            actions,
            vec![TransferAction::Buy {
                wallet: "W2".to_string(),
                qty: 250.0
            }]
        );
    }

    #[test]
    fn test_buy_into_sold_position_is_reentry() {
        let ctx = ClassifyContext {
            token_analyzed: true,
            to_tracked: true,
            to_prior_status: Some(PositionStatus::Sold),
            ..Default::default()
        };
        let actions = classify(&transfer(Some("POOL"), Some("W3"), 100.0), &ctx);
        assert_eq!(
            actions,
            vec![TransferAction::ReEntry {
                wallet: "W3".to_string(),
                qty: 100.0
            }]
        );
    }

    #[test]
    fn test_wallet_to_wallet_between_tracked_wallets_yields_both() {
        let ctx = ClassifyContext {
            token_analyzed: true,
            from_tracked: true,
            to_tracked: true,
            ..Default::default()
        };
        let actions = classify(&transfer(Some("W4"), Some("W5"), 10.0), &ctx);
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0], TransferAction::Sell { .. }));
        assert!(matches!(actions[1], TransferAction::Buy { .. }));
    }

    #[test]
    fn test_ignored_reasons() {
        let analyzed = ClassifyContext {
            token_analyzed: true,
            ..Default::default()
        };
        assert_eq!(
            classify(&transfer(Some("W6"), Some("W7"), 10.0), &analyzed),
            vec![TransferAction::Ignored {
                reason: IgnoreReason::WalletNotTracked
            }]
        );

        let unanalyzed = ClassifyContext {
            token_analyzed: false,
            from_tracked: true,
            ..Default::default()
        };
        assert_eq!(
            classify(&transfer(Some("W6"), None, 10.0), &unanalyzed),
            vec![TransferAction::Ignored {
                reason: IgnoreReason::TokenNotAnalyzed
            }]
        );

        assert_eq!(
            classify(&transfer(Some("W6"), None, 0.0), &analyzed),
            vec![TransferAction::Ignored {
                reason: IgnoreReason::EmptyAmount
            }]
        );
    }
}
