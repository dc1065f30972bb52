/// Persistence layer for position tracking
///
/// Positions live in memory (state.rs) and are written through to SQLite
/// on every applied delta. The dedupe ledger, anomaly records and wallet
/// metrics live here too, so a purge can clear all of it in one
/// transaction.
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::types::{Position, PositionStatus};
use crate::db::get_connection;
use crate::logger::{log, LogTag};

// =============================================================================
// SCHEMA
// =============================================================================

pub const SCHEMA_POSITIONS: &str = r#"
CREATE TABLE IF NOT EXISTS positions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_address TEXT NOT NULL,
    token_address TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'holding', -- 'holding', 'sold', 'stale'
    total_bought REAL NOT NULL DEFAULT 0,
    total_bought_usd REAL NOT NULL DEFAULT 0,
    buy_count INTEGER NOT NULL DEFAULT 0,
    avg_entry_price REAL,
    total_sold REAL NOT NULL DEFAULT 0,
    total_sold_usd REAL NOT NULL DEFAULT 0,
    sell_count INTEGER NOT NULL DEFAULT 0,
    entry_market_cap REAL,
    current_market_cap REAL,
    exit_market_cap REAL,
    pnl_ratio REAL,
    fpnl_ratio REAL,
    exit_estimated INTEGER NOT NULL DEFAULT 0,
    tracking_enabled INTEGER NOT NULL DEFAULT 1,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    poll_generation INTEGER NOT NULL DEFAULT 0,
    first_seen_at TEXT NOT NULL,
    last_buy_at TEXT,
    last_sell_at TEXT,
    last_checked_at TEXT,
    exit_detected_at TEXT,
    UNIQUE(wallet_address, token_address)
);
CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);
CREATE INDEX IF NOT EXISTS idx_positions_wallet ON positions(wallet_address);
"#;

/// Dedupe ledger: one row per applied logical event. Replays are no-ops.
pub const SCHEMA_APPLIED_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS applied_events (
    event_id TEXT PRIMARY KEY,
    wallet_address TEXT NOT NULL,
    token_address TEXT NOT NULL,
    kind TEXT NOT NULL, -- 'buy', 'sell', 'exact_exit'
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Data-quality anomalies: clamped sells, missing counterpart values.
/// Recorded, never fatal.
pub const SCHEMA_ANOMALIES: &str = r#"
CREATE TABLE IF NOT EXISTS anomalies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_address TEXT NOT NULL,
    token_address TEXT NOT NULL,
    kind TEXT NOT NULL,
    detail TEXT,
    observed_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

pub const SCHEMA_WALLET_METRICS: &str = r#"
CREATE TABLE IF NOT EXISTS wallet_metrics (
    wallet_address TEXT PRIMARY KEY,
    total_positions INTEGER NOT NULL DEFAULT 0,
    holding_count INTEGER NOT NULL DEFAULT 0,
    sold_count INTEGER NOT NULL DEFAULT 0,
    win_count INTEGER NOT NULL DEFAULT 0,
    loss_count INTEGER NOT NULL DEFAULT 0,
    win_rate REAL,
    avg_pnl_ratio REAL,
    updated_at TEXT
);
"#;

// =============================================================================
// ROW MAPPING
// =============================================================================

fn ts_to_sql(ts: &Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339())
}

fn sql_to_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

const POSITION_COLUMNS: &str = "id, wallet_address, token_address, status, \
    total_bought, total_bought_usd, buy_count, avg_entry_price, \
    total_sold, total_sold_usd, sell_count, \
    entry_market_cap, current_market_cap, exit_market_cap, \
    pnl_ratio, fpnl_ratio, exit_estimated, tracking_enabled, \
    consecutive_failures, poll_generation, \
    first_seen_at, last_buy_at, last_sell_at, last_checked_at, exit_detected_at";

fn row_to_position(row: &Row) -> rusqlite::Result<Position> {
    let status: String = row.get(3)?;
    let first_seen: String = row.get(20)?;
    Ok(Position {
        id: Some(row.get(0)?),
        wallet_address: row.get(1)?,
        token_address: row.get(2)?,
        status: PositionStatus::from_str(&status).unwrap_or(PositionStatus::Holding),
        total_bought: row.get(4)?,
        total_bought_usd: row.get(5)?,
        buy_count: row.get::<_, i64>(6)? as u32,
        avg_entry_price: row.get(7)?,
        total_sold: row.get(8)?,
        total_sold_usd: row.get(9)?,
        sell_count: row.get::<_, i64>(10)? as u32,
        entry_market_cap: row.get(11)?,
        current_market_cap: row.get(12)?,
        exit_market_cap: row.get(13)?,
        pnl_ratio: row.get(14)?,
        fpnl_ratio: row.get(15)?,
        exit_estimated: row.get::<_, i64>(16)? != 0,
        tracking_enabled: row.get::<_, i64>(17)? != 0,
        consecutive_failures: row.get::<_, i64>(18)? as u32,
        poll_generation: row.get::<_, i64>(19)? as u64,
        first_seen_at: sql_to_ts(Some(first_seen)).unwrap_or_else(Utc::now),
        last_buy_at: sql_to_ts(row.get(21)?),
        last_sell_at: sql_to_ts(row.get(22)?),
        last_checked_at: sql_to_ts(row.get(23)?),
        exit_detected_at: sql_to_ts(row.get(24)?),
    })
}

// =============================================================================
// POSITION PERSISTENCE
// =============================================================================

/// Insert or update a position row; fills in `position.id` on first insert
pub fn upsert_position(position: &mut Position) -> Result<(), String> {
    let conn = get_connection()?;
    conn.execute(
        "INSERT INTO positions (
            wallet_address, token_address, status,
            total_bought, total_bought_usd, buy_count, avg_entry_price,
            total_sold, total_sold_usd, sell_count,
            entry_market_cap, current_market_cap, exit_market_cap,
            pnl_ratio, fpnl_ratio, exit_estimated, tracking_enabled,
            consecutive_failures, poll_generation,
            first_seen_at, last_buy_at, last_sell_at, last_checked_at, exit_detected_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)
        ON CONFLICT(wallet_address, token_address) DO UPDATE SET
            status = excluded.status,
            total_bought = excluded.total_bought,
            total_bought_usd = excluded.total_bought_usd,
            buy_count = excluded.buy_count,
            avg_entry_price = excluded.avg_entry_price,
            total_sold = excluded.total_sold,
            total_sold_usd = excluded.total_sold_usd,
            sell_count = excluded.sell_count,
            entry_market_cap = excluded.entry_market_cap,
            current_market_cap = excluded.current_market_cap,
            exit_market_cap = excluded.exit_market_cap,
            pnl_ratio = excluded.pnl_ratio,
            fpnl_ratio = excluded.fpnl_ratio,
            exit_estimated = excluded.exit_estimated,
            tracking_enabled = excluded.tracking_enabled,
            consecutive_failures = excluded.consecutive_failures,
            poll_generation = excluded.poll_generation,
            last_buy_at = excluded.last_buy_at,
            last_sell_at = excluded.last_sell_at,
            last_checked_at = excluded.last_checked_at,
            exit_detected_at = excluded.exit_detected_at",
        params![
            position.wallet_address,
            position.token_address,
            position.status.as_str(),
            position.total_bought,
            position.total_bought_usd,
            position.buy_count,
            position.avg_entry_price,
            position.total_sold,
            position.total_sold_usd,
            position.sell_count,
            position.entry_market_cap,
            position.current_market_cap,
            position.exit_market_cap,
            position.pnl_ratio,
            position.fpnl_ratio,
            position.exit_estimated,
            position.tracking_enabled,
            position.consecutive_failures,
            position.poll_generation as i64,
            position.first_seen_at.to_rfc3339(),
            ts_to_sql(&position.last_buy_at),
            ts_to_sql(&position.last_sell_at),
            ts_to_sql(&position.last_checked_at),
            ts_to_sql(&position.exit_detected_at),
        ],
    )
    .map_err(|e| format!("Failed to upsert position: {}", e))?;

    if position.id.is_none() {
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM positions WHERE wallet_address = ?1 AND token_address = ?2",
                params![position.wallet_address, position.token_address],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| format!("Failed to read position id: {}", e))?;
        position.id = id;
    }

    Ok(())
}

/// Load every persisted position
pub fn load_all_positions() -> Result<Vec<Position>, String> {
    let conn = get_connection()?;
    let mut stmt = conn
        .prepare(&format!("SELECT {} FROM positions", POSITION_COLUMNS))
        .map_err(|e| format!("Failed to prepare position load: {}", e))?;

    let positions = stmt
        .query_map([], row_to_position)
        .map_err(|e| format!("Failed to load positions: {}", e))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(positions)
}

/// Look up a position row by id (tracking controls address positions by id)
pub fn get_position_row_by_id(id: i64) -> Result<Option<Position>, String> {
    let conn = get_connection()?;
    conn.query_row(
        &format!("SELECT {} FROM positions WHERE id = ?1", POSITION_COLUMNS),
        params![id],
        row_to_position,
    )
    .optional()
    .map_err(|e| format!("Failed to load position {}: {}", id, e))
}

/// Delete all tracking data in one transaction: positions, dedupe ledger,
/// anomalies, wallet metrics, gate counters
pub fn purge_all_tracking_data() -> Result<PurgeResult, String> {
    let mut conn = get_connection()?;
    let tx = conn
        .transaction()
        .map_err(|e| format!("Failed to open purge transaction: {}", e))?;

    let positions_deleted = tx
        .execute("DELETE FROM positions", [])
        .map_err(|e| format!("Purge failed on positions: {}", e))?;
    tx.execute("DELETE FROM applied_events", [])
        .map_err(|e| format!("Purge failed on applied_events: {}", e))?;
    tx.execute("DELETE FROM anomalies", [])
        .map_err(|e| format!("Purge failed on anomalies: {}", e))?;
    let metrics_deleted = tx
        .execute("DELETE FROM wallet_metrics", [])
        .map_err(|e| format!("Purge failed on wallet_metrics: {}", e))?;
    tx.execute("DELETE FROM gate_participations", [])
        .map_err(|e| format!("Purge failed on gate_participations: {}", e))?;
    tx.execute("DELETE FROM tracked_wallets", [])
        .map_err(|e| format!("Purge failed on tracked_wallets: {}", e))?;

    tx.commit()
        .map_err(|e| format!("Purge commit failed: {}", e))?;

    Ok(PurgeResult {
        positions_deleted,
        metrics_deleted,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct PurgeResult {
    pub positions_deleted: usize,
    pub metrics_deleted: usize,
}

// =============================================================================
// DEDUPE LEDGER
// =============================================================================

pub fn is_event_applied(event_id: &str) -> Result<bool, String> {
    let conn = get_connection()?;
    let found: Option<String> = conn
        .query_row(
            "SELECT event_id FROM applied_events WHERE event_id = ?1",
            params![event_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| format!("Failed to check event dedupe: {}", e))?;
    Ok(found.is_some())
}

pub fn mark_event_applied(
    event_id: &str,
    wallet_address: &str,
    token_address: &str,
    kind: &str,
) -> Result<(), String> {
    let conn = get_connection()?;
    conn.execute(
        "INSERT OR IGNORE INTO applied_events (event_id, wallet_address, token_address, kind)
         VALUES (?1, ?2, ?3, ?4)",
        params![event_id, wallet_address, token_address, kind],
    )
    .map_err(|e| format!("Failed to record applied event: {}", e))?;
    Ok(())
}

// =============================================================================
// ANOMALIES
// =============================================================================

/// Record a data-quality anomaly; logged but never fatal
pub fn record_anomaly(wallet_address: &str, token_address: &str, kind: &str, detail: &str) {
    log(
        LogTag::Ledger,
        "ANOMALY",
        &format!("{} {}/{}: {}", kind, wallet_address, token_address, detail),
    );
    let result: Result<(), String> = (|| {
        let conn = get_connection()?;
        conn.execute(
            "INSERT INTO anomalies (wallet_address, token_address, kind, detail) VALUES (?1, ?2, ?3, ?4)",
            params![wallet_address, token_address, kind, detail],
        )
        .map_err(|e| format!("Failed to record anomaly: {}", e))?;
        Ok(())
    })();
    if let Err(e) = result {
        log(LogTag::Ledger, "WARNING", &e);
    }
}

// =============================================================================
// WALLET METRICS
// =============================================================================

/// Recompute a wallet's aggregate win-rate metrics from its positions
pub fn calculate_wallet_metrics(wallet_address: &str) -> Result<(), String> {
    let conn = get_connection()?;

    let (total, holding, sold, wins, losses, avg_pnl): (i64, i64, i64, i64, i64, Option<f64>) =
        conn.query_row(
            "SELECT
                COUNT(*),
                SUM(CASE WHEN status != 'sold' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'sold' THEN 1 ELSE 0 END),
                SUM(CASE WHEN pnl_ratio > 1.0 THEN 1 ELSE 0 END),
                SUM(CASE WHEN pnl_ratio IS NOT NULL AND pnl_ratio <= 1.0 THEN 1 ELSE 0 END),
                AVG(pnl_ratio)
             FROM positions WHERE wallet_address = ?1",
            params![wallet_address],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                    row.get(5)?,
                ))
            },
        )
        .map_err(|e| format!("Failed to compute wallet metrics: {}", e))?;

    let win_rate = if wins + losses > 0 {
        Some(wins as f64 / (wins + losses) as f64)
    } else {
        None
    };

    conn.execute(
        "INSERT INTO wallet_metrics
            (wallet_address, total_positions, holding_count, sold_count, win_count, loss_count, win_rate, avg_pnl_ratio, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(wallet_address) DO UPDATE SET
            total_positions = excluded.total_positions,
            holding_count = excluded.holding_count,
            sold_count = excluded.sold_count,
            win_count = excluded.win_count,
            loss_count = excluded.loss_count,
            win_rate = excluded.win_rate,
            avg_pnl_ratio = excluded.avg_pnl_ratio,
            updated_at = excluded.updated_at",
        params![
            wallet_address,
            total,
            holding,
            sold,
            wins,
            losses,
            win_rate,
            avg_pnl,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(|e| format!("Failed to upsert wallet metrics: {}", e))?;

    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletSummary {
    pub wallet_address: String,
    pub total_positions: u32,
    pub holding_count: u32,
    pub sold_count: u32,
    pub win_count: u32,
    pub loss_count: u32,
    pub win_rate: Option<f64>,
    pub avg_pnl_ratio: Option<f64>,
    pub updated_at: Option<String>,
}

pub fn get_wallet_summaries() -> Result<Vec<WalletSummary>, String> {
    let conn = get_connection()?;
    let mut stmt = conn
        .prepare(
            "SELECT wallet_address, total_positions, holding_count, sold_count,
                    win_count, loss_count, win_rate, avg_pnl_ratio, updated_at
             FROM wallet_metrics ORDER BY win_rate DESC NULLS LAST",
        )
        .map_err(|e| format!("Failed to prepare wallet summaries: {}", e))?;

    let summaries = stmt
        .query_map([], |row| {
            Ok(WalletSummary {
                wallet_address: row.get(0)?,
                total_positions: row.get::<_, i64>(1)? as u32,
                holding_count: row.get::<_, i64>(2)? as u32,
                sold_count: row.get::<_, i64>(3)? as u32,
                win_count: row.get::<_, i64>(4)? as u32,
                loss_count: row.get::<_, i64>(5)? as u32,
                win_rate: row.get(6)?,
                avg_pnl_ratio: row.get(7)?,
                updated_at: row.get(8)?,
            })
        })
        .map_err(|e| format!("Failed to query wallet summaries: {}", e))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(summaries)
}

// =============================================================================
// QUERIES FOR THE DASHBOARD SURFACE
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct PositionFilter {
    /// "holding", "sold", "stale" or "all"
    pub status: Option<String>,
    pub pnl_min: Option<f64>,
    pub pnl_max: Option<f64>,
    pub wallet: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Serialize)]
pub struct PositionPage {
    pub positions: Vec<Position>,
    pub total: u32,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
}

/// Filterable, paginated position listing
pub fn query_positions(filter: &PositionFilter) -> Result<PositionPage, String> {
    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(status) = filter.status.as_deref() {
        if status != "all" {
            clauses.push(format!("status = ?{}", args.len() + 1));
            args.push(Box::new(status.to_string()));
        }
    }
    if let Some(pnl_min) = filter.pnl_min {
        clauses.push(format!("pnl_ratio >= ?{}", args.len() + 1));
        args.push(Box::new(pnl_min));
    }
    if let Some(pnl_max) = filter.pnl_max {
        clauses.push(format!("pnl_ratio <= ?{}", args.len() + 1));
        args.push(Box::new(pnl_max));
    }
    if let Some(wallet) = filter.wallet.as_deref() {
        clauses.push(format!("wallet_address = ?{}", args.len() + 1));
        args.push(Box::new(wallet.to_string()));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let conn = get_connection()?;

    let count_sql = format!("SELECT COUNT(*) FROM positions {}", where_clause);
    let total: i64 = conn
        .query_row(
            &count_sql,
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| row.get(0),
        )
        .map_err(|e| format!("Failed to count positions: {}", e))?;

    let limit = if filter.limit == 0 { 50 } else { filter.limit };
    let list_sql = format!(
        "SELECT {} FROM positions {} ORDER BY first_seen_at DESC LIMIT ?{} OFFSET ?{}",
        POSITION_COLUMNS,
        where_clause,
        args.len() + 1,
        args.len() + 2
    );

    let mut list_args = args;
    list_args.push(Box::new(limit as i64));
    list_args.push(Box::new(filter.offset as i64));

    let mut stmt = conn
        .prepare(&list_sql)
        .map_err(|e| format!("Failed to prepare position query: {}", e))?;

    let positions: Vec<Position> = stmt
        .query_map(
            rusqlite::params_from_iter(list_args.iter().map(|a| a.as_ref())),
            row_to_position,
        )
        .map_err(|e| format!("Failed to query positions: {}", e))?
        .filter_map(|r| r.ok())
        .collect();

    let has_more = filter.offset + positions.len() < total as usize;

    Ok(PositionPage {
        positions,
        total: total as u32,
        limit,
        offset: filter.offset,
        has_more,
    })
}

#[derive(Debug, Serialize)]
pub struct TrackingStats {
    pub total_positions: u32,
    pub holding: u32,
    pub sold: u32,
    pub stale: u32,
    pub winners: u32,
    pub losers: u32,
    pub win_rate: Option<f64>,
    pub avg_pnl_ratio: Option<f64>,
    pub estimated_exits: u32,
    pub unique_wallets: u32,
    pub unique_tokens: u32,
}

/// Overview statistics for the dashboard
pub fn get_tracking_stats() -> Result<TrackingStats, String> {
    let conn = get_connection()?;
    conn.query_row(
        "SELECT
            COUNT(*),
            SUM(CASE WHEN status = 'holding' THEN 1 ELSE 0 END),
            SUM(CASE WHEN status = 'sold' THEN 1 ELSE 0 END),
            SUM(CASE WHEN status = 'stale' THEN 1 ELSE 0 END),
            SUM(CASE WHEN pnl_ratio > 1.0 THEN 1 ELSE 0 END),
            SUM(CASE WHEN pnl_ratio IS NOT NULL AND pnl_ratio <= 1.0 THEN 1 ELSE 0 END),
            AVG(pnl_ratio),
            SUM(CASE WHEN exit_estimated = 1 THEN 1 ELSE 0 END),
            COUNT(DISTINCT wallet_address),
            COUNT(DISTINCT token_address)
         FROM positions",
        [],
        |row| {
            let winners = row.get::<_, Option<i64>>(4)?.unwrap_or(0);
            let losers = row.get::<_, Option<i64>>(5)?.unwrap_or(0);
            let win_rate = if winners + losers > 0 {
                Some(winners as f64 / (winners + losers) as f64)
            } else {
                None
            };
            Ok(TrackingStats {
                total_positions: row.get::<_, i64>(0)? as u32,
                holding: row.get::<_, Option<i64>>(1)?.unwrap_or(0) as u32,
                sold: row.get::<_, Option<i64>>(2)?.unwrap_or(0) as u32,
                stale: row.get::<_, Option<i64>>(3)?.unwrap_or(0) as u32,
                winners: winners as u32,
                losers: losers as u32,
                win_rate,
                avg_pnl_ratio: row.get(6)?,
                estimated_exits: row.get::<_, Option<i64>>(7)?.unwrap_or(0) as u32,
                unique_wallets: row.get::<_, i64>(8)? as u32,
                unique_tokens: row.get::<_, i64>(9)? as u32,
            })
        },
    )
    .map_err(|e| format!("Failed to compute tracking stats: {}", e))
}

/// Flip tracking for all of a wallet's positions; returns affected count
pub fn set_wallet_tracking(wallet_address: &str, enabled: bool) -> Result<usize, String> {
    let conn = get_connection()?;
    conn.execute(
        "UPDATE positions SET tracking_enabled = ?1 WHERE wallet_address = ?2",
        params![enabled, wallet_address],
    )
    .map_err(|e| format!("Failed to update wallet tracking: {}", e))
}
