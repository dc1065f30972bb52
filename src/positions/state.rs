use super::types::{position_key, Position};
use crate::arguments::is_debug_ledger_enabled;
use crate::logger::{log, LogTag};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

// Global position registry keyed by "{wallet}:{token}"
pub static POSITIONS: LazyLock<RwLock<HashMap<String, Position>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

// Per-position locks: every mutation runs inside its key's critical section
static POSITION_LOCKS: LazyLock<RwLock<HashMap<String, Arc<Mutex<()>>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

// Position lock guard
#[derive(Debug)]
pub struct PositionLockGuard {
    key: String,
    _owned_guard: OwnedMutexGuard<()>,
}

impl Drop for PositionLockGuard {
    fn drop(&mut self) {
        if is_debug_ledger_enabled() {
            log(
                LogTag::Ledger,
                "DEBUG",
                &format!("Released position lock: {}", self.key),
            );
        }
    }
}

/// Acquire the exclusive critical section for one (wallet, token) position
pub async fn acquire_position_lock(key: &str) -> PositionLockGuard {
    let lock: Arc<Mutex<()>> = {
        let mut locks = POSITION_LOCKS.write().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    };

    let owned_guard = lock.lock_owned().await;

    if is_debug_ledger_enabled() {
        log(
            LogTag::Ledger,
            "DEBUG",
            &format!("Acquired position lock: {}", key),
        );
    }

    PositionLockGuard {
        key: key.to_string(),
        _owned_guard: owned_guard,
    }
}

/// Get a position by (wallet, token)
pub async fn get_position(wallet_address: &str, token_address: &str) -> Option<Position> {
    let positions = POSITIONS.read().await;
    positions
        .get(&position_key(wallet_address, token_address))
        .cloned()
}

/// Get a position by registry key
pub async fn get_position_by_key(key: &str) -> Option<Position> {
    POSITIONS.read().await.get(key).cloned()
}

/// Insert or replace a position in the registry
pub async fn put_position(position: Position) {
    let mut positions = POSITIONS.write().await;
    positions.insert(position.key(), position);
}

/// Snapshot of all positions
pub async fn all_positions() -> Vec<Position> {
    POSITIONS.read().await.values().cloned().collect()
}

pub async fn position_count() -> usize {
    POSITIONS.read().await.len()
}

/// Clear the registry (purge)
pub async fn clear_positions() {
    POSITIONS.write().await.clear();
    POSITION_LOCKS.write().await.clear();
}

/// Load persisted positions into the registry at startup
pub async fn initialize_positions_system() -> Result<(), String> {
    let loaded = super::db::load_all_positions()?;
    let count = loaded.len();

    let mut positions = POSITIONS.write().await;
    positions.clear();
    for position in loaded {
        positions.insert(position.key(), position);
    }
    drop(positions);

    log(
        LogTag::Ledger,
        "STARTUP",
        &format!("Loaded {} positions", count),
    );
    Ok(())
}
