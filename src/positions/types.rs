use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Balances below this are treated as fully drained; on-chain dust and
/// float rounding otherwise keep positions open forever
pub const BALANCE_EPSILON: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Holding,
    Sold,
    Stale,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Holding => "holding",
            PositionStatus::Sold => "sold",
            PositionStatus::Stale => "stale",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "holding" => Some(PositionStatus::Holding),
            "sold" => Some(PositionStatus::Sold),
            "stale" => Some(PositionStatus::Stale),
            _ => None,
        }
    }
}

/// Aggregate record of one wallet's activity in one token
///
/// No per-transaction log is retained; every mutation is an incremental
/// delta applied by the ledger under the position's lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Option<i64>,
    pub wallet_address: String,
    pub token_address: String,
    pub status: PositionStatus,

    // Buy side aggregates
    pub total_bought: f64,
    pub total_bought_usd: f64,
    pub buy_count: u32,
    pub avg_entry_price: Option<f64>,

    // Sell side aggregates
    pub total_sold: f64,
    pub total_sold_usd: f64,
    pub sell_count: u32,

    // Market caps
    pub entry_market_cap: Option<f64>,
    pub current_market_cap: Option<f64>,
    pub exit_market_cap: Option<f64>,

    // PnL: realized ratio only (set once per confirmed full exit);
    // fumbled ratio for sold positions
    pub pnl_ratio: Option<f64>,
    pub fpnl_ratio: Option<f64>,

    /// True while the recorded exit figures come from price estimates
    /// rather than confirmed transaction data
    pub exit_estimated: bool,

    pub tracking_enabled: bool,
    pub consecutive_failures: u32,
    /// Monotonic counter used as the dedupe unit for poll-synthesized events
    pub poll_generation: u64,

    pub first_seen_at: DateTime<Utc>,
    pub last_buy_at: Option<DateTime<Utc>>,
    pub last_sell_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub exit_detected_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn new(wallet_address: &str, token_address: &str) -> Self {
        Self {
            id: None,
            wallet_address: wallet_address.to_string(),
            token_address: token_address.to_string(),
            status: PositionStatus::Holding,
            total_bought: 0.0,
            total_bought_usd: 0.0,
            buy_count: 0,
            avg_entry_price: None,
            total_sold: 0.0,
            total_sold_usd: 0.0,
            sell_count: 0,
            entry_market_cap: None,
            current_market_cap: None,
            exit_market_cap: None,
            pnl_ratio: None,
            fpnl_ratio: None,
            exit_estimated: false,
            tracking_enabled: true,
            consecutive_failures: 0,
            poll_generation: 0,
            first_seen_at: Utc::now(),
            last_buy_at: None,
            last_sell_at: None,
            last_checked_at: None,
            exit_detected_at: None,
        }
    }

    pub fn key(&self) -> String {
        position_key(&self.wallet_address, &self.token_address)
    }

    /// Tokens still held according to the applied deltas
    pub fn held_balance(&self) -> f64 {
        (self.total_bought - self.total_sold).max(0.0)
    }

    pub fn is_fully_drained(&self) -> bool {
        self.total_bought > 0.0 && self.held_balance() <= BALANCE_EPSILON
    }

    /// Unrealized PnL for open positions: current cap over entry cap
    pub fn unrealized_ratio(&self) -> Option<f64> {
        if self.status == PositionStatus::Sold {
            return None;
        }
        match (self.entry_market_cap, self.current_market_cap) {
            (Some(entry), Some(current)) if entry > 0.0 => Some(current / entry),
            _ => None,
        }
    }
}

/// Registry key for a position
pub fn position_key(wallet_address: &str, token_address: &str) -> String {
    format!("{}:{}", wallet_address, token_address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_held_balance_and_drain() {
        let mut p = Position::new("W", "T");
        p.total_bought = 1000.0;
        p.total_sold = 999.9995;
        assert!(p.is_fully_drained());
        assert!(p.held_balance() < BALANCE_EPSILON);

        p.total_sold = 400.0;
        assert!(!p.is_fully_drained());
        assert_eq!(p.held_balance(), 600.0);
    }

    #[test]
    fn test_unrealized_ratio() {
        let mut p = Position::new("W", "T");
        p.entry_market_cap = Some(100_000.0);
        p.current_market_cap = Some(300_000.0);
        assert_eq!(p.unrealized_ratio(), Some(3.0));

        p.status = PositionStatus::Sold;
        assert_eq!(p.unrealized_ratio(), None);
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            PositionStatus::Holding,
            PositionStatus::Sold,
            PositionStatus::Stale,
        ] {
            assert_eq!(PositionStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(PositionStatus::from_str("open"), None);
    }
}
