/// Market-data provider client (price + market cap)
///
/// Hits the public pair endpoint and reduces the pool list to a single
/// price/market-cap pair, preferring the deepest pool. These lookups are
/// free tier and do not consume tracking credits.
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::logger::{log, LogTag};

const DEFAULT_CHAIN_ID: &str = "solana";

/// Request timeout in seconds - the provider is fast, 10s is sufficient
const TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy)]
pub struct MarketData {
    pub price_usd: f64,
    pub market_cap_usd: Option<f64>,
}

#[async_trait]
pub trait MarketDataApi: Send + Sync {
    /// Current price and market cap for a token
    async fn get_market_data(&self, token_address: &str) -> Result<MarketData, String>;
}

#[derive(Debug, Deserialize)]
struct PairRaw {
    #[serde(rename = "priceUsd")]
    price_usd: Option<String>,
    #[serde(rename = "marketCap")]
    market_cap: Option<f64>,
    fdv: Option<f64>,
    liquidity: Option<LiquidityRaw>,
}

#[derive(Debug, Deserialize)]
struct LiquidityRaw {
    usd: Option<f64>,
}

pub struct HttpMarketDataApi {
    client: Client,
    base_url: String,
}

impl HttpMarketDataApi {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl MarketDataApi for HttpMarketDataApi {
    async fn get_market_data(&self, token_address: &str) -> Result<MarketData, String> {
        let url = format!(
            "{}/token-pairs/v1/{}/{}",
            self.base_url, DEFAULT_CHAIN_ID, token_address
        );

        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| format!("Market data request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("Market data request returned HTTP {}", status));
        }

        let pairs: Vec<PairRaw> = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse market data response: {}", e))?;

        // Deepest pool wins; thin pools report junk prices
        let best = pairs
            .into_iter()
            .filter(|p| p.price_usd.is_some())
            .max_by(|a, b| {
                let la = a.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
                let lb = b.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
                la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .ok_or_else(|| format!("No pairs found for token {}", token_address))?;

        let price_usd = best
            .price_usd
            .as_deref()
            .and_then(|p| p.parse::<f64>().ok())
            .ok_or_else(|| format!("Unparseable price for token {}", token_address))?;

        let market_cap_usd = best.market_cap.or(best.fdv);

        log(
            LogTag::Oracle,
            "DEBUG",
            &format!(
                "Market data for {}: price=${:.8} mc={:?}",
                token_address, price_usd, market_cap_usd
            ),
        );

        Ok(MarketData {
            price_usd,
            market_cap_usd,
        })
    }
}
