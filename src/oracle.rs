/// Price oracle: cached access to the market-data provider
///
/// Every trade valuation and PnL refresh goes through here. Entries are
/// cached with a short TTL so a burst of webhook events for one token
/// costs a single upstream request.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::apis::{MarketData, MarketDataApi};
use crate::logger::{log, LogTag};

/// Cache entry lifetime
const CACHE_TTL_SECS: u64 = 60;

/// Bounded retry for event-time valuations
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 500;

struct CacheEntry {
    data: MarketData,
    fetched_at: Instant,
}

pub struct PriceOracle {
    api: Arc<dyn MarketDataApi>,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl PriceOracle {
    pub fn new(api: Arc<dyn MarketDataApi>) -> Self {
        Self {
            api,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Get market data, serving from cache when fresh
    pub async fn get(&self, token_address: &str) -> Result<MarketData, String> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(token_address) {
                if entry.fetched_at.elapsed() < Duration::from_secs(CACHE_TTL_SECS) {
                    return Ok(entry.data);
                }
            }
        }

        let data = self.api.get_market_data(token_address).await?;

        let mut cache = self.cache.write().await;
        cache.insert(
            token_address.to_string(),
            CacheEntry {
                data,
                fetched_at: Instant::now(),
            },
        );

        Ok(data)
    }

    /// Get market data with bounded retry/backoff
    ///
    /// Used at event-processing time; after exhaustion the caller records
    /// the delta as estimated instead of dropping it.
    pub async fn get_with_retry(&self, token_address: &str) -> Result<MarketData, String> {
        let mut last_error = String::new();
        for attempt in 0..RETRY_ATTEMPTS {
            match self.get(token_address).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    last_error = e;
                    if attempt + 1 < RETRY_ATTEMPTS {
                        let backoff = RETRY_BACKOFF_MS * 2u64.pow(attempt);
                        log(
                            LogTag::Oracle,
                            "DEBUG",
                            &format!(
                                "Retry {}/{} for {} in {}ms: {}",
                                attempt + 1,
                                RETRY_ATTEMPTS,
                                token_address,
                                backoff,
                                last_error
                            ),
                        );
                        sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }

        log(
            LogTag::Oracle,
            "WARNING",
            &format!(
                "Market data unavailable for {} after {} attempts: {}",
                token_address, RETRY_ATTEMPTS, last_error
            ),
        );
        Err(last_error)
    }

    /// Drop a token's cache entry (used by tests and manual refresh)
    pub async fn invalidate(&self, token_address: &str) {
        self.cache.write().await.remove(token_address);
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Mock market API with a fixed price table and call counting
    pub struct MockMarketApi {
        pub prices: HashMap<String, MarketData>,
        pub calls: AtomicU32,
        pub fail: bool,
    }

    impl MockMarketApi {
        pub fn with_price(token: &str, price_usd: f64, market_cap_usd: f64) -> Self {
            let mut prices = HashMap::new();
            prices.insert(
                token.to_string(),
                MarketData {
                    price_usd,
                    market_cap_usd: Some(market_cap_usd),
                },
            );
            Self {
                prices,
                calls: AtomicU32::new(0),
                fail: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                prices: HashMap::new(),
                calls: AtomicU32::new(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl MarketDataApi for MockMarketApi {
        async fn get_market_data(&self, token_address: &str) -> Result<MarketData, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err("mock provider down".to_string());
            }
            self.prices
                .get(token_address)
                .copied()
                .ok_or_else(|| format!("no price for {}", token_address))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockMarketApi;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_cache_hit_avoids_upstream_call() {
        let api = Arc::new(MockMarketApi::with_price("MINT", 0.5, 1_000_000.0));
        let oracle = PriceOracle::new(api.clone());

        let first = oracle.get("MINT").await.unwrap();
        let second = oracle.get("MINT").await.unwrap();

        assert_eq!(first.price_usd, 0.5);
        assert_eq!(second.price_usd, 0.5);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_returns_error() {
        let api = Arc::new(MockMarketApi::failing());
        let oracle = PriceOracle::new(api.clone());

        let result = oracle.get_with_retry("MINT").await;
        assert!(result.is_err());
        assert_eq!(api.calls.load(Ordering::SeqCst), RETRY_ATTEMPTS);
    }
}
