/// Shared SQLite connection pool and schema initialization
///
/// All tracking state lives in a single database file; each domain module
/// owns its schema constants and row mapping, this module owns the pool
/// and one-shot initialization.
use once_cell::sync::OnceCell;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

use crate::logger::{log, LogTag};

static DB_POOL: OnceCell<Pool<SqliteConnectionManager>> = OnceCell::new();

const POOL_MAX_SIZE: u32 = 8;

/// Operation log: persisted record of high-level runs (checks, reconciles,
/// purges) shown on the dashboard. Pruned to the latest 100 entries.
const SCHEMA_OPERATION_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS operation_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL,
    label TEXT NOT NULL,
    credits INTEGER NOT NULL DEFAULT 0,
    context_json TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Initialize the database: open the pool, apply pragmas, create schemas
///
/// Safe to call more than once; later calls only re-run the idempotent
/// schema statements.
pub fn init_database(path: &str) -> Result<(), String> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create database directory: {}", e))?;
        }
    }

    let pool = DB_POOL.get_or_try_init(|| {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )
        });
        Pool::builder()
            .max_size(POOL_MAX_SIZE)
            .build(manager)
            .map_err(|e| format!("Failed to create database pool: {}", e))
    })?;

    let conn = pool
        .get()
        .map_err(|e| format!("Failed to get connection for schema init: {}", e))?;

    for schema in [
        crate::positions::db::SCHEMA_POSITIONS,
        crate::positions::db::SCHEMA_APPLIED_EVENTS,
        crate::positions::db::SCHEMA_ANOMALIES,
        crate::positions::db::SCHEMA_WALLET_METRICS,
        crate::gate::SCHEMA_GATE_PARTICIPATIONS,
        crate::gate::SCHEMA_ANALYZED_TOKENS,
        crate::gate::SCHEMA_TRACKED_WALLETS,
        crate::settings::SCHEMA_SWAB_SETTINGS,
        SCHEMA_OPERATION_LOG,
    ] {
        conn.execute_batch(schema)
            .map_err(|e| format!("Schema initialization failed: {}", e))?;
    }

    log(LogTag::Db, "INIT", &format!("Database ready at {}", path));
    Ok(())
}

/// Get a pooled connection
pub fn get_connection() -> Result<PooledConnection<SqliteConnectionManager>, String> {
    let pool = DB_POOL
        .get()
        .ok_or_else(|| "Database not initialized".to_string())?;
    pool.get()
        .map_err(|e| format!("Failed to get database connection: {}", e))
}

/// Record a high-level operation to the persistent log and prune old rows
pub fn record_operation(operation: &str, label: &str, credits: u32, context: &serde_json::Value) {
    let result: Result<(), String> = (|| {
        let conn = get_connection()?;
        conn.execute(
            "INSERT INTO operation_log (operation, label, credits, context_json) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![operation, label, credits, context.to_string()],
        )
        .map_err(|e| format!("Failed to insert operation log: {}", e))?;
        conn.execute(
            "DELETE FROM operation_log WHERE id NOT IN (SELECT id FROM operation_log ORDER BY created_at DESC, id DESC LIMIT 100)",
            [],
        )
        .map_err(|e| format!("Failed to prune operation log: {}", e))?;
        Ok(())
    })();

    if let Err(e) = result {
        log(LogTag::Db, "WARNING", &format!("Operation log write failed: {}", e));
    }
}

#[cfg(test)]
pub mod testing {
    use once_cell::sync::Lazy;

    // One scratch database per test process; tests use distinct
    // wallet/token keys so they can share it
    static TEST_DB_DIR: Lazy<tempfile::TempDir> =
        Lazy::new(|| tempfile::tempdir().expect("failed to create test db dir"));

    pub fn init_test_database() {
        let path = TEST_DB_DIR.path().join("swab_test.db");
        super::init_database(path.to_str().expect("utf-8 path")).expect("test db init");
    }

    // Serializes tests that drive the coalesced batch jobs; their
    // in-flight guards are process-wide
    static SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

    pub fn serial_lock() -> std::sync::MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct OperationLogEntry {
    pub id: i64,
    pub operation: String,
    pub label: String,
    pub credits: u32,
    pub context: Option<serde_json::Value>,
    pub created_at: String,
}

/// Get recent high-level operations, newest first
pub fn get_recent_operations(limit: usize) -> Result<Vec<OperationLogEntry>, String> {
    let conn = get_connection()?;
    let mut stmt = conn
        .prepare(
            "SELECT id, operation, label, credits, context_json, created_at
             FROM operation_log ORDER BY created_at DESC, id DESC LIMIT ?1",
        )
        .map_err(|e| format!("Failed to prepare operation query: {}", e))?;

    let rows = stmt
        .query_map([limit as i64], |row| {
            let context_json: Option<String> = row.get(4)?;
            Ok(OperationLogEntry {
                id: row.get(0)?,
                operation: row.get(1)?,
                label: row.get(2)?,
                credits: row.get::<_, i64>(3)? as u32,
                context: context_json.and_then(|s| serde_json::from_str(&s).ok()),
                created_at: row.get(5)?,
            })
        })
        .map_err(|e| format!("Failed to query operations: {}", e))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(rows)
}
