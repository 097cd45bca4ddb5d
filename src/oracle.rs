//! USD price oracle for the settlement currencies.
//!
//! One cache object, constructed at startup and handed to whoever needs it;
//! no module-level globals. A reading older than the TTL triggers a refresh,
//! and a failed refresh falls back to the last-known-good value (flagged
//! stale) rather than erroring. A currency that has never been fetched falls
//! back to a hardcoded constant, also flagged stale.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use rust_decimal::prelude::*;
use tokio::sync::RwLock;

use crate::constants::{FALLBACK_BNB_PRICE_USD, FALLBACK_SOL_PRICE_USD, PRICE_CACHE_TTL};
use crate::models::Chain;

/// Upstream price source. Separated out so tests can inject failures.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn fetch_usd_price(&self, chain: Chain) -> Result<Decimal, String>;
}

/// CoinGecko-compatible `simple/price` feed.
pub struct HttpPriceFeed {
    http: reqwest::Client,
    base_url: String,
}

impl HttpPriceFeed {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self { http, base_url: base_url.into() }
    }

    fn feed_id(chain: Chain) -> &'static str {
        match chain {
            Chain::Solana => "solana",
            Chain::Bsc => "binancecoin",
        }
    }
}

#[async_trait]
impl PriceFeed for HttpPriceFeed {
    async fn fetch_usd_price(&self, chain: Chain) -> Result<Decimal, String> {
        let id = Self::feed_id(chain);
        let url = format!("{}/simple/price?ids={id}&vs_currencies=usd", self.base_url);
        let body: serde_json::Value = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("price feed request failed: {e}"))?
            .error_for_status()
            .map_err(|e| format!("price feed returned error status: {e}"))?
            .json()
            .await
            .map_err(|e| format!("price feed returned invalid JSON: {e}"))?;

        let raw = body[id]["usd"]
            .as_f64()
            .ok_or_else(|| format!("price feed response missing {id}.usd"))?;
        Decimal::from_f64(raw).ok_or_else(|| format!("unrepresentable price: {raw}"))
    }
}

/// A price reading plus an explicit staleness flag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceQuote {
    pub price: Decimal,
    /// True when the value came from an expired cache entry or a hardcoded
    /// fallback instead of a fresh feed reading.
    pub stale: bool,
}

struct CacheEntry {
    price: Decimal,
    fetched_at: Instant,
}

pub struct PriceOracle {
    feed: Arc<dyn PriceFeed>,
    cache: RwLock<HashMap<Chain, CacheEntry>>,
}

impl PriceOracle {
    pub fn new(feed: Arc<dyn PriceFeed>) -> Self {
        Self { feed, cache: RwLock::new(HashMap::new()) }
    }

    fn fallback(chain: Chain) -> Decimal {
        match chain {
            Chain::Solana => FALLBACK_SOL_PRICE_USD,
            Chain::Bsc => FALLBACK_BNB_PRICE_USD,
        }
    }

    /// Current USD price for the chain's native currency. Never fails:
    /// degrades to a stale or hardcoded value with a logged warning.
    pub async fn usd_price(&self, chain: Chain) -> PriceQuote {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&chain) {
                if entry.fetched_at.elapsed() < PRICE_CACHE_TTL {
                    return PriceQuote { price: entry.price, stale: false };
                }
            }
        }
        self.refresh(chain).await
    }

    /// Forced refresh, bypassing the TTL. Falls back to last-known-good on
    /// feed failure.
    pub async fn refresh(&self, chain: Chain) -> PriceQuote {
        match self.feed.fetch_usd_price(chain).await {
            Ok(price) => {
                let mut cache = self.cache.write().await;
                cache.insert(chain, CacheEntry { price, fetched_at: Instant::now() });
                PriceQuote { price, stale: false }
            }
            Err(err) => {
                let cache = self.cache.read().await;
                match cache.get(&chain) {
                    Some(entry) => {
                        tracing::warn!(
                            chain = %chain,
                            error = %err,
                            "price refresh failed, serving stale cached price"
                        );
                        PriceQuote { price: entry.price, stale: true }
                    }
                    None => {
                        tracing::warn!(
                            chain = %chain,
                            error = %err,
                            "price refresh failed with empty cache, serving hardcoded fallback"
                        );
                        PriceQuote { price: Self::fallback(chain), stale: true }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use rust_decimal_macros::dec;

    struct FlakyFeed {
        fail: AtomicBool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl PriceFeed for FlakyFeed {
        async fn fetch_usd_price(&self, _chain: Chain) -> Result<Decimal, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err("feed down".to_string())
            } else {
                Ok(dec!(142.5))
            }
        }
    }

    fn flaky(fail: bool) -> Arc<FlakyFeed> {
        Arc::new(FlakyFeed { fail: AtomicBool::new(fail), calls: AtomicU32::new(0) })
    }

    #[tokio::test]
    async fn serves_fresh_price_and_caches_it() {
        let feed = flaky(false);
        let oracle = PriceOracle::new(feed.clone());

        let quote = oracle.usd_price(Chain::Solana).await;
        assert_eq!(quote, PriceQuote { price: dec!(142.5), stale: false });

        // Second read within the TTL hits the cache, not the feed.
        let again = oracle.usd_price(Chain::Solana).await;
        assert!(!again.stale);
        assert_eq!(feed.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn falls_back_to_stale_cache_when_feed_fails() {
        let feed = flaky(false);
        let oracle = PriceOracle::new(feed.clone());
        oracle.usd_price(Chain::Solana).await;

        feed.fail.store(true, Ordering::SeqCst);
        let quote = oracle.refresh(Chain::Solana).await;
        assert_eq!(quote.price, dec!(142.5));
        assert!(quote.stale);
    }

    #[tokio::test]
    async fn falls_back_to_hardcoded_price_with_empty_cache() {
        let oracle = PriceOracle::new(flaky(true));
        let quote = oracle.usd_price(Chain::Bsc).await;
        assert_eq!(quote.price, FALLBACK_BNB_PRICE_USD);
        assert!(quote.stale);
    }
}
