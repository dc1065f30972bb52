/// Daily external-API credit budget
///
/// The one piece of cross-job shared mutable state: the poller and the
/// reconciliation engine both spend from it. All spending goes through
/// an atomic check-and-reserve so concurrent jobs cannot collectively
/// overspend; definitive failures refund their reservation. The counter
/// resets at the UTC day boundary and never goes negative.
use chrono::{NaiveDate, Utc};
use once_cell::sync::Lazy;
use std::sync::Mutex;

use crate::db;
use crate::logger::{log, LogTag};
use crate::settings;

/// Credit cost of one token-balance lookup (poller, per position)
pub const BALANCE_LOOKUP_COST: u32 = 10;

/// Credit cost of one parsed transaction-history lookup (reconciliation, per wallet)
pub const HISTORY_LOOKUP_COST: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Credits reserved; caller may spend
    Reserved,
    /// Not enough remaining budget; operation must be skipped, not truncated
    Exhausted { remaining: u32 },
}

#[derive(Debug)]
struct BudgetState {
    date: NaiveDate,
    used: u32,
}

/// Check-and-reserve credit counter with optional database persistence
pub struct BudgetLedger {
    state: Mutex<BudgetState>,
    persist: bool,
}

impl BudgetLedger {
    pub fn new(persist: bool) -> Self {
        Self {
            state: Mutex::new(BudgetState {
                date: Utc::now().date_naive(),
                used: 0,
            }),
            persist,
        }
    }

    /// Restore today's consumed credits (startup, from the settings row)
    pub fn restore(&self, date: Option<NaiveDate>, used: u32) {
        if let Ok(mut state) = self.state.lock() {
            let today = Utc::now().date_naive();
            if date == Some(today) {
                state.date = today;
                state.used = used;
            }
        }
    }

    /// Atomically reserve `cost` credits against `limit`
    ///
    /// The whole cost must fit in the remaining budget or nothing is
    /// reserved. Rolls the counter over when the UTC day has changed.
    pub fn try_reserve(&self, cost: u32, limit: u32) -> ReserveOutcome {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };

        let today = Utc::now().date_naive();
        if state.date != today {
            state.date = today;
            state.used = 0;
        }

        let remaining = limit.saturating_sub(state.used);
        if cost > remaining {
            return ReserveOutcome::Exhausted { remaining };
        }

        state.used += cost;
        let used = state.used;
        let date = state.date;
        drop(state);

        if self.persist {
            self.persist_state(date, used);
        }
        ReserveOutcome::Reserved
    }

    /// Return credits from a reservation whose operation definitively failed
    pub fn refund(&self, cost: u32) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.used = state.used.saturating_sub(cost);
        let used = state.used;
        let date = state.date;
        drop(state);

        if self.persist {
            self.persist_state(date, used);
        }
    }

    /// Credits consumed so far today
    pub fn used_today(&self) -> u32 {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        let today = Utc::now().date_naive();
        if state.date != today {
            state.date = today;
            state.used = 0;
        }
        state.used
    }

    /// Credits still available against `limit`
    pub fn remaining(&self, limit: u32) -> u32 {
        limit.saturating_sub(self.used_today())
    }

    fn persist_state(&self, date: NaiveDate, used: u32) {
        let result: Result<(), String> = (|| {
            let conn = db::get_connection()?;
            conn.execute(
                "UPDATE swab_settings SET credits_used_today = ?1, credits_reset_date = ?2 WHERE id = 1",
                rusqlite::params![used, date.format("%Y-%m-%d").to_string()],
            )
            .map_err(|e| format!("Failed to persist budget state: {}", e))?;
            Ok(())
        })();
        if let Err(e) = result {
            log(LogTag::Budget, "WARNING", &e);
        }
    }
}

/// Process-wide budget ledger shared by all credit-spending jobs
pub static BUDGET: Lazy<BudgetLedger> = Lazy::new(|| BudgetLedger::new(true));

/// Load today's consumed credits from the settings row into the global ledger
pub fn init_budget() -> Result<(), String> {
    let conn = db::get_connection()?;
    let (used, date): (i64, Option<String>) = conn
        .query_row(
            "SELECT credits_used_today, credits_reset_date FROM swab_settings WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|e| format!("Failed to load budget state: {}", e))?;

    let date = date.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok());
    BUDGET.restore(date, used as u32);

    log(
        LogTag::Budget,
        "INIT",
        &format!("Credits used today: {}", BUDGET.used_today()),
    );
    Ok(())
}

/// Reserve credits against the configured daily budget
pub fn try_reserve(cost: u32) -> ReserveOutcome {
    let limit = settings::get_settings().daily_credit_budget;
    let outcome = BUDGET.try_reserve(cost, limit);
    if let ReserveOutcome::Exhausted { remaining } = outcome {
        log(
            LogTag::Budget,
            "SKIP",
            &format!("Reservation of {} credits denied ({} remaining)", cost, remaining),
        );
    }
    outcome
}

/// Refund credits to the global ledger after a definitive failure
pub fn refund(cost: u32) {
    BUDGET.refund(cost);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_reserve_and_refund() {
        let ledger = BudgetLedger::new(false);
        assert_eq!(ledger.try_reserve(10, 25), ReserveOutcome::Reserved);
        assert_eq!(ledger.try_reserve(10, 25), ReserveOutcome::Reserved);
        assert_eq!(ledger.used_today(), 20);

        // Third reservation does not fit: nothing is partially spent
        assert_eq!(
            ledger.try_reserve(10, 25),
            ReserveOutcome::Exhausted { remaining: 5 }
        );
        assert_eq!(ledger.used_today(), 20);

        ledger.refund(10);
        assert_eq!(ledger.used_today(), 10);
        assert_eq!(ledger.try_reserve(10, 25), ReserveOutcome::Reserved);
    }

    #[test]
    fn test_refund_never_goes_negative() {
        let ledger = BudgetLedger::new(false);
        ledger.refund(100);
        assert_eq!(ledger.used_today(), 0);
        assert_eq!(ledger.remaining(50), 50);
    }

    #[test]
    fn test_zero_budget_rejects_everything() {
        let ledger = BudgetLedger::new(false);
        assert_eq!(
            ledger.try_reserve(1, 0),
            ReserveOutcome::Exhausted { remaining: 0 }
        );
    }

    #[test]
    fn test_concurrent_reservations_never_overspend() {
        let ledger = Arc::new(BudgetLedger::new(false));
        let limit = 100u32;
        let mut handles = Vec::new();

        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(std::thread::spawn(move || {
                let mut reserved = 0u32;
                for _ in 0..10 {
                    if ledger.try_reserve(10, limit) == ReserveOutcome::Reserved {
                        reserved += 10;
                    }
                }
                reserved
            }));
        }

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, limit);
        assert_eq!(ledger.used_today(), limit);
    }
}
