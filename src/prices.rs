//! Historical USD prices for swap valuation
//!
//! `CoinGeckoClient` asks the public CoinGecko API for the daily price on
//! the day a swap leg happened. `StaticPriceSource` is a fixed table for
//! tests and offline runs.

use crate::error::{LedgerError, LedgerResult};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

const STABLECOINS: [&str; 4] = ["USD", "USDT", "USDC", "DAI"];

#[async_trait]
pub trait PriceSource: Send + Sync {
    /// USD price of one unit of `currency` at `at`; None when unknown
    async fn usd_price_at(&self, currency: &str, at: DateTime<Utc>) -> LedgerResult<Option<Decimal>>;
}

// ============================================================================
// STATIC TABLE
// ============================================================================

#[derive(Debug, Clone)]
pub struct StaticPriceSource {
    prices: HashMap<String, Decimal>,
}

impl StaticPriceSource {
    /// Stablecoins pre-filled at 1 USD
    pub fn new() -> Self {
        let prices = STABLECOINS
            .iter()
            .map(|c| (c.to_string(), Decimal::ONE))
            .collect();
        StaticPriceSource { prices }
    }

    pub fn with_price(mut self, currency: &str, usd: Decimal) -> Self {
        self.prices.insert(currency.trim().to_uppercase(), usd);
        self
    }
}

impl Default for StaticPriceSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceSource for StaticPriceSource {
    async fn usd_price_at(&self, currency: &str, _at: DateTime<Utc>) -> LedgerResult<Option<Decimal>> {
        Ok(self.prices.get(&currency.trim().to_uppercase()).copied())
    }
}

// ============================================================================
// COINGECKO
// ============================================================================

#[derive(Debug, Deserialize)]
struct CoinHistory {
    market_data: Option<MarketData>,
}

#[derive(Debug, Deserialize)]
struct MarketData {
    current_price: HashMap<String, serde_json::Value>,
}

pub struct CoinGeckoClient {
    client: Client,
    base_url: String,
    /// Daily prices already fetched: (coin id, day) -> price
    cache: Mutex<HashMap<(String, NaiveDate), Option<Decimal>>>,
}

impl CoinGeckoClient {
    pub fn new(client: Client, base_url: &str) -> Self {
        CoinGeckoClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// CoinGecko coin id for a ticker
    pub fn coin_id(currency: &str) -> Option<&'static str> {
        match currency.trim().to_uppercase().as_str() {
            "BTC" => Some("bitcoin"),
            "ETH" => Some("ethereum"),
            "TRX" => Some("tron"),
            "USDT" => Some("tether"),
            "USDC" => Some("usd-coin"),
            "DAI" => Some("dai"),
            "WBTC" => Some("wrapped-bitcoin"),
            _ => None,
        }
    }

    fn cached(&self, key: &(String, NaiveDate)) -> Option<Option<Decimal>> {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.get(key).copied()
    }

    fn remember(&self, key: (String, NaiveDate), price: Option<Decimal>) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.insert(key, price);
    }
}

/// JSON numbers may come back in exponent form for tiny prices
fn decimal_from_json(value: &serde_json::Value) -> Option<Decimal> {
    let raw = value.to_string();
    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .ok()
}

#[async_trait]
impl PriceSource for CoinGeckoClient {
    async fn usd_price_at(&self, currency: &str, at: DateTime<Utc>) -> LedgerResult<Option<Decimal>> {
        let Some(id) = Self::coin_id(currency) else {
            return Ok(None);
        };
        let key = (id.to_string(), at.date_naive());
        if let Some(hit) = self.cached(&key) {
            return Ok(hit);
        }

        let url = format!("{}/coins/{}/history", self.base_url, id);
        let date = at.format("%d-%m-%Y").to_string();
        let response = self
            .client
            .get(&url)
            .query(&[("date", date.as_str()), ("localization", "false")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(LedgerError::provider("coingecko", format!("HTTP {} for {} on {}", status, id, date)));
        }
        let history: CoinHistory = response
            .json()
            .await
            .map_err(|e| LedgerError::provider("coingecko", format!("unparsable response: {}", e)))?;

        // No market data = coin didn't trade that day
        let price = history
            .market_data
            .and_then(|m| m.current_price.get("usd").and_then(decimal_from_json));
        debug!(coin = id, %date, ?price, "coingecko price");

        self.remember(key, price);
        Ok(price)
    }
}
