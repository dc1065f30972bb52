/// Tracking gate: promotes wallets into the tracked set
///
/// Fed by the early-participant stream (wallet, token). A wallet is
/// promoted once it has shown up as an early participant in
/// `min_token_count` distinct analyzed tokens; promotion is idempotent.
/// Untracking is explicit and never deletes historical positions, it only
/// halts new event processing for that wallet.
use chrono::Utc;
use once_cell::sync::Lazy;
use rusqlite::params;
use std::collections::HashSet;
use std::sync::RwLock;

use crate::arguments::is_debug_gate_enabled;
use crate::db::get_connection;
use crate::logger::{log, LogTag};
use crate::settings;

pub const SCHEMA_GATE_PARTICIPATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS gate_participations (
    wallet_address TEXT NOT NULL,
    token_address TEXT NOT NULL,
    first_seen_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (wallet_address, token_address)
);
"#;

pub const SCHEMA_ANALYZED_TOKENS: &str = r#"
CREATE TABLE IF NOT EXISTS analyzed_tokens (
    token_address TEXT PRIMARY KEY,
    first_seen_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

pub const SCHEMA_TRACKED_WALLETS: &str = r#"
CREATE TABLE IF NOT EXISTS tracked_wallets (
    wallet_address TEXT PRIMARY KEY,
    promoted_at TEXT NOT NULL,
    tracking_enabled INTEGER NOT NULL DEFAULT 1
);
"#;

// In-memory mirrors for the hot classifier path
static TRACKED_WALLETS: Lazy<RwLock<HashSet<String>>> = Lazy::new(|| RwLock::new(HashSet::new()));
static ANALYZED_TOKENS: Lazy<RwLock<HashSet<String>>> = Lazy::new(|| RwLock::new(HashSet::new()));

/// Load tracked wallets and analyzed tokens into memory at startup
pub fn initialize_gate() -> Result<(), String> {
    let conn = get_connection()?;

    let mut wallets = HashSet::new();
    let mut stmt = conn
        .prepare("SELECT wallet_address FROM tracked_wallets WHERE tracking_enabled = 1")
        .map_err(|e| format!("Failed to prepare tracked wallet load: {}", e))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| format!("Failed to load tracked wallets: {}", e))?;
    for row in rows.flatten() {
        wallets.insert(row);
    }

    let mut tokens = HashSet::new();
    let mut stmt = conn
        .prepare("SELECT token_address FROM analyzed_tokens")
        .map_err(|e| format!("Failed to prepare analyzed token load: {}", e))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| format!("Failed to load analyzed tokens: {}", e))?;
    for row in rows.flatten() {
        tokens.insert(row);
    }

    let wallet_count = wallets.len();
    let token_count = tokens.len();
    if let Ok(mut guard) = TRACKED_WALLETS.write() {
        *guard = wallets;
    }
    if let Ok(mut guard) = ANALYZED_TOKENS.write() {
        *guard = tokens;
    }

    log(
        LogTag::Gate,
        "STARTUP",
        &format!(
            "Gate loaded: {} tracked wallets, {} analyzed tokens",
            wallet_count, token_count
        ),
    );
    Ok(())
}

/// Is this wallet currently in the tracked set?
pub fn is_tracked(wallet_address: &str) -> bool {
    TRACKED_WALLETS
        .read()
        .map(|s| s.contains(wallet_address))
        .unwrap_or(false)
}

/// Has this token ever been analyzed? Events for unknown tokens are ignored.
pub fn is_analyzed_token(token_address: &str) -> bool {
    ANALYZED_TOKENS
        .read()
        .map(|s| s.contains(token_address))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipationOutcome {
    /// Counted, wallet below threshold
    Recorded { distinct_tokens: u32 },
    /// This participation crossed the threshold
    Promoted { distinct_tokens: u32 },
    /// Wallet was already tracked (re-crossing is a no-op)
    AlreadyTracked,
}

/// Record one early-participation observation and promote when warranted
///
/// The token is registered as analyzed as a side effect, which is what
/// admits its transfer events into classification.
pub fn record_participation(
    wallet_address: &str,
    token_address: &str,
) -> Result<ParticipationOutcome, String> {
    let conn = get_connection()?;

    conn.execute(
        "INSERT OR IGNORE INTO analyzed_tokens (token_address) VALUES (?1)",
        params![token_address],
    )
    .map_err(|e| format!("Failed to register analyzed token: {}", e))?;
    if let Ok(mut guard) = ANALYZED_TOKENS.write() {
        guard.insert(token_address.to_string());
    }

    conn.execute(
        "INSERT OR IGNORE INTO gate_participations (wallet_address, token_address) VALUES (?1, ?2)",
        params![wallet_address, token_address],
    )
    .map_err(|e| format!("Failed to record participation: {}", e))?;

    let distinct_tokens: i64 = conn
        .query_row(
            "SELECT COUNT(DISTINCT token_address) FROM gate_participations WHERE wallet_address = ?1",
            params![wallet_address],
            |row| row.get(0),
        )
        .map_err(|e| format!("Failed to count participations: {}", e))?;
    let distinct_tokens = distinct_tokens as u32;

    if is_tracked(wallet_address) {
        return Ok(ParticipationOutcome::AlreadyTracked);
    }

    let threshold = settings::get_settings().min_token_count;
    if distinct_tokens < threshold {
        if is_debug_gate_enabled() {
            log(
                LogTag::Gate,
                "DEBUG",
                &format!(
                    "{} at {}/{} tokens",
                    wallet_address, distinct_tokens, threshold
                ),
            );
        }
        return Ok(ParticipationOutcome::Recorded { distinct_tokens });
    }

    // Idempotent promotion; a previously untracked wallet is not revived
    // here, untracking is an explicit operator decision
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO tracked_wallets (wallet_address, promoted_at) VALUES (?1, ?2)",
            params![wallet_address, Utc::now().to_rfc3339()],
        )
        .map_err(|e| format!("Failed to promote wallet: {}", e))?;

    if inserted == 0 {
        return Ok(ParticipationOutcome::AlreadyTracked);
    }

    if let Ok(mut guard) = TRACKED_WALLETS.write() {
        guard.insert(wallet_address.to_string());
    }

    log(
        LogTag::Gate,
        "PROMOTED",
        &format!(
            "{} tracked after {} distinct tokens",
            wallet_address, distinct_tokens
        ),
    );
    Ok(ParticipationOutcome::Promoted { distinct_tokens })
}

/// Halt event processing for a wallet; historical positions stay intact
pub fn untrack_wallet(wallet_address: &str) -> Result<(), String> {
    let conn = get_connection()?;
    conn.execute(
        "UPDATE tracked_wallets SET tracking_enabled = 0 WHERE wallet_address = ?1",
        params![wallet_address],
    )
    .map_err(|e| format!("Failed to untrack wallet: {}", e))?;

    if let Ok(mut guard) = TRACKED_WALLETS.write() {
        guard.remove(wallet_address);
    }

    log(LogTag::Gate, "UNTRACKED", wallet_address);
    Ok(())
}

/// Clear the in-memory mirrors (purge path; tables are cleared by the
/// positions purge transaction)
pub fn clear_gate_state() {
    if let Ok(mut guard) = TRACKED_WALLETS.write() {
        guard.clear();
    }
    if let Ok(mut guard) = ANALYZED_TOKENS.write() {
        guard.clear();
    }
}

/// Number of currently tracked wallets
pub fn tracked_wallet_count() -> usize {
    TRACKED_WALLETS.read().map(|s| s.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_promotes_at_threshold() {
        crate::db::testing::init_test_database();

        // Default threshold is 2 distinct tokens
        let first = record_participation("WgateA", "Tg1").unwrap();
        assert_eq!(first, ParticipationOutcome::Recorded { distinct_tokens: 1 });
        assert!(!is_tracked("WgateA"));

        // Same token again: still one distinct token
        let repeat = record_participation("WgateA", "Tg1").unwrap();
        assert_eq!(repeat, ParticipationOutcome::Recorded { distinct_tokens: 1 });

        let second = record_participation("WgateA", "Tg2").unwrap();
        assert_eq!(second, ParticipationOutcome::Promoted { distinct_tokens: 2 });
        assert!(is_tracked("WgateA"));

        // Re-crossing is a no-op
        let third = record_participation("WgateA", "Tg3").unwrap();
        assert_eq!(third, ParticipationOutcome::AlreadyTracked);

        // Tokens became analyzed along the way
        assert!(is_analyzed_token("Tg1"));
        assert!(is_analyzed_token("Tg3"));
    }

    #[test]
    fn test_untrack_halts_processing_only() {
        crate::db::testing::init_test_database();

        record_participation("WgateB", "Tg4").unwrap();
        record_participation("WgateB", "Tg5").unwrap();
        assert!(is_tracked("WgateB"));

        untrack_wallet("WgateB").unwrap();
        assert!(!is_tracked("WgateB"));

        // Participations stay recorded; promotion does not resurrect the wallet
        let outcome = record_participation("WgateB", "Tg6").unwrap();
        assert_eq!(outcome, ParticipationOutcome::AlreadyTracked);
        assert!(!is_tracked("WgateB"));
    }
}
