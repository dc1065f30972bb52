/// Runtime configuration loaded from configs.json
///
/// Holds connection endpoints and the external-API key. Tunable tracking
/// behavior (intervals, budgets, thresholds) lives in the database-backed
/// settings row instead, so the dashboard can change it at runtime.
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configs {
    /// External market-data / chain API key
    pub api_key: String,
    /// Base URL for the market-data provider (price + market cap)
    #[serde(default = "default_market_base_url")]
    pub market_base_url: String,
    /// Base URL for the chain data provider (balances + parsed transactions)
    #[serde(default = "default_chain_base_url")]
    pub chain_base_url: String,
    /// JSON-RPC endpoint for balance lookups
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// Webserver bind host
    #[serde(default = "default_host")]
    pub webserver_host: String,
    /// Webserver bind port
    #[serde(default = "default_port")]
    pub webserver_port: u16,
    /// SQLite database file path
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_market_base_url() -> String {
    "https://api.dexscreener.com".to_string()
}

fn default_chain_base_url() -> String {
    "https://api.helius.xyz".to_string()
}

fn default_rpc_url() -> String {
    "https://mainnet.helius-rpc.com".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5003
}

fn default_database_path() -> String {
    "data/swab.db".to_string()
}

impl Default for Configs {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            market_base_url: default_market_base_url(),
            chain_base_url: default_chain_base_url(),
            rpc_url: default_rpc_url(),
            webserver_host: default_host(),
            webserver_port: default_port(),
            database_path: default_database_path(),
        }
    }
}

/// Global configs, populated once at startup
pub static CONFIGS: Lazy<RwLock<Configs>> = Lazy::new(|| RwLock::new(Configs::default()));

/// Reads configs.json and returns a Configs object
///
/// The API key can be overridden via the SWAB_API_KEY environment variable.
pub fn read_configs<P: AsRef<Path>>(path: P) -> Result<Configs, String> {
    let data = fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read {}: {}", path.as_ref().display(), e))?;

    let mut configs: Configs =
        serde_json::from_str(&data).map_err(|e| format!("Failed to parse configs.json: {}", e))?;

    if let Ok(key) = std::env::var("SWAB_API_KEY") {
        if !key.is_empty() {
            configs.api_key = key;
        }
    }

    Ok(configs)
}

/// Install configs into the global slot
pub fn set_configs(configs: Configs) {
    if let Ok(mut guard) = CONFIGS.write() {
        *guard = configs;
    }
}

/// Get a copy of the current configs
pub fn get_configs() -> Configs {
    CONFIGS.read().map(|c| c.clone()).unwrap_or_default()
}
