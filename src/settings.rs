/// SWAB tracking settings
///
/// Flat configuration row persisted in SQLite (id = 1) with an in-memory
/// cache, so the dashboard can change tracking behavior at runtime without
/// a restart. Budget consumption counters live in the same row and are
/// maintained by the budget module.
use chrono::Utc;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

use crate::db;
use crate::logger::{log, LogTag};

pub const SCHEMA_SWAB_SETTINGS: &str = r#"
CREATE TABLE IF NOT EXISTS swab_settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    auto_check_enabled INTEGER NOT NULL DEFAULT 0,
    check_interval_minutes INTEGER NOT NULL DEFAULT 30,
    daily_credit_budget INTEGER NOT NULL DEFAULT 500,
    stale_threshold_minutes INTEGER NOT NULL DEFAULT 15,
    min_token_count INTEGER NOT NULL DEFAULT 2,
    reconcile_max_positions INTEGER NOT NULL DEFAULT 50,
    reconcile_max_signatures INTEGER NOT NULL DEFAULT 50,
    last_check_at TEXT,
    credits_used_today INTEGER NOT NULL DEFAULT 0,
    credits_reset_date TEXT,
    updated_at TEXT
);
INSERT OR IGNORE INTO swab_settings (id) VALUES (1);
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwabSettings {
    pub auto_check_enabled: bool,
    pub check_interval_minutes: u32,
    pub daily_credit_budget: u32,
    pub stale_threshold_minutes: u32,
    pub min_token_count: u32,
    pub reconcile_max_positions: u32,
    pub reconcile_max_signatures: u32,
    pub last_check_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Default for SwabSettings {
    fn default() -> Self {
        Self {
            auto_check_enabled: false,
            check_interval_minutes: 30,
            daily_credit_budget: 500,
            stale_threshold_minutes: 15,
            min_token_count: 2,
            reconcile_max_positions: 50,
            reconcile_max_signatures: 50,
            last_check_at: None,
            updated_at: None,
        }
    }
}

/// Partial update coming from the settings endpoint; None = unchanged
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SwabSettingsUpdate {
    pub auto_check_enabled: Option<bool>,
    pub check_interval_minutes: Option<u32>,
    pub daily_credit_budget: Option<u32>,
    pub stale_threshold_minutes: Option<u32>,
    pub min_token_count: Option<u32>,
    pub reconcile_max_positions: Option<u32>,
    pub reconcile_max_signatures: Option<u32>,
}

impl SwabSettingsUpdate {
    /// Range validation; violations are rejected requests, never clamped
    pub fn validate(&self) -> Result<(), String> {
        if let Some(v) = self.check_interval_minutes {
            if !(5..=1440).contains(&v) {
                return Err(format!("check_interval_minutes must be 5-1440, got {}", v));
            }
        }
        if let Some(v) = self.daily_credit_budget {
            if v > 10_000 {
                return Err(format!("daily_credit_budget must be 0-10000, got {}", v));
            }
        }
        if let Some(v) = self.stale_threshold_minutes {
            if !(5..=1440).contains(&v) {
                return Err(format!("stale_threshold_minutes must be 5-1440, got {}", v));
            }
        }
        if let Some(v) = self.min_token_count {
            if !(1..=50).contains(&v) {
                return Err(format!("min_token_count must be 1-50, got {}", v));
            }
        }
        if let Some(v) = self.reconcile_max_positions {
            if !(1..=200).contains(&v) {
                return Err(format!("reconcile_max_positions must be 1-200, got {}", v));
            }
        }
        if let Some(v) = self.reconcile_max_signatures {
            if !(10..=200).contains(&v) {
                return Err(format!("reconcile_max_signatures must be 10-200, got {}", v));
            }
        }
        Ok(())
    }
}

static SETTINGS: Lazy<RwLock<SwabSettings>> = Lazy::new(|| RwLock::new(SwabSettings::default()));

/// Load settings from the database into the in-memory cache
pub fn init_settings() -> Result<(), String> {
    let loaded = load_from_db()?;
    if let Ok(mut guard) = SETTINGS.write() {
        *guard = loaded;
    }
    log(LogTag::Settings, "LOADED", "Tracking settings loaded");
    Ok(())
}

/// Get a copy of the current settings
pub fn get_settings() -> SwabSettings {
    SETTINGS.read().map(|s| s.clone()).unwrap_or_default()
}

/// Apply a validated partial update, persist it, refresh the cache
pub fn update_settings(update: &SwabSettingsUpdate) -> Result<SwabSettings, String> {
    update.validate()?;

    let mut current = get_settings();
    if let Some(v) = update.auto_check_enabled {
        current.auto_check_enabled = v;
    }
    if let Some(v) = update.check_interval_minutes {
        current.check_interval_minutes = v;
    }
    if let Some(v) = update.daily_credit_budget {
        current.daily_credit_budget = v;
    }
    if let Some(v) = update.stale_threshold_minutes {
        current.stale_threshold_minutes = v;
    }
    if let Some(v) = update.min_token_count {
        current.min_token_count = v;
    }
    if let Some(v) = update.reconcile_max_positions {
        current.reconcile_max_positions = v;
    }
    if let Some(v) = update.reconcile_max_signatures {
        current.reconcile_max_signatures = v;
    }
    current.updated_at = Some(Utc::now().to_rfc3339());

    let conn = db::get_connection()?;
    conn.execute(
        "UPDATE swab_settings SET
            auto_check_enabled = ?1,
            check_interval_minutes = ?2,
            daily_credit_budget = ?3,
            stale_threshold_minutes = ?4,
            min_token_count = ?5,
            reconcile_max_positions = ?6,
            reconcile_max_signatures = ?7,
            updated_at = ?8
         WHERE id = 1",
        rusqlite::params![
            current.auto_check_enabled,
            current.check_interval_minutes,
            current.daily_credit_budget,
            current.stale_threshold_minutes,
            current.min_token_count,
            current.reconcile_max_positions,
            current.reconcile_max_signatures,
            current.updated_at,
        ],
    )
    .map_err(|e| format!("Failed to persist settings: {}", e))?;

    if let Ok(mut guard) = SETTINGS.write() {
        *guard = current.clone();
    }

    log(
        LogTag::Settings,
        "UPDATED",
        &format!(
            "interval={}m budget={} stale={}m gate={} auto_check={}",
            current.check_interval_minutes,
            current.daily_credit_budget,
            current.stale_threshold_minutes,
            current.min_token_count,
            current.auto_check_enabled
        ),
    );

    Ok(current)
}

/// Stamp the completion of a check run
pub fn record_check_run() {
    let now = Utc::now().to_rfc3339();
    let result: Result<(), String> = (|| {
        let conn = db::get_connection()?;
        conn.execute(
            "UPDATE swab_settings SET last_check_at = ?1 WHERE id = 1",
            rusqlite::params![now],
        )
        .map_err(|e| format!("Failed to stamp check run: {}", e))?;
        Ok(())
    })();
    if let Err(e) = result {
        log(LogTag::Settings, "WARNING", &e);
    }
    if let Ok(mut guard) = SETTINGS.write() {
        guard.last_check_at = Some(now);
    }
}

fn load_from_db() -> Result<SwabSettings, String> {
    let conn = db::get_connection()?;
    conn.query_row(
        "SELECT auto_check_enabled, check_interval_minutes, daily_credit_budget,
                stale_threshold_minutes, min_token_count, reconcile_max_positions,
                reconcile_max_signatures, last_check_at, updated_at
         FROM swab_settings WHERE id = 1",
        [],
        |row| {
            Ok(SwabSettings {
                auto_check_enabled: row.get::<_, i64>(0)? != 0,
                check_interval_minutes: row.get::<_, i64>(1)? as u32,
                daily_credit_budget: row.get::<_, i64>(2)? as u32,
                stale_threshold_minutes: row.get::<_, i64>(3)? as u32,
                min_token_count: row.get::<_, i64>(4)? as u32,
                reconcile_max_positions: row.get::<_, i64>(5)? as u32,
                reconcile_max_signatures: row.get::<_, i64>(6)? as u32,
                last_check_at: row.get(7)?,
                updated_at: row.get(8)?,
            })
        },
    )
    .map_err(|e| format!("Failed to load settings: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_validation_ranges() {
        let ok = SwabSettingsUpdate {
            check_interval_minutes: Some(5),
            daily_credit_budget: Some(0),
            stale_threshold_minutes: Some(1440),
            min_token_count: Some(50),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());

        let bad_interval = SwabSettingsUpdate {
            check_interval_minutes: Some(4),
            ..Default::default()
        };
        assert!(bad_interval.validate().is_err());

        let bad_budget = SwabSettingsUpdate {
            daily_credit_budget: Some(10_001),
            ..Default::default()
        };
        assert!(bad_budget.validate().is_err());

        let bad_gate = SwabSettingsUpdate {
            min_token_count: Some(0),
            ..Default::default()
        };
        assert!(bad_gate.validate().is_err());

        let bad_signatures = SwabSettingsUpdate {
            reconcile_max_signatures: Some(5),
            ..Default::default()
        };
        assert!(bad_signatures.validate().is_err());
    }

    #[test]
    fn test_defaults() {
        let s = SwabSettings::default();
        assert!(!s.auto_check_enabled);
        assert_eq!(s.check_interval_minutes, 30);
        assert_eq!(s.daily_credit_budget, 500);
        assert_eq!(s.min_token_count, 2);
    }
}
