//! Binance venue client: HMAC-SHA256 signed REST calls with a shared rate
//! limiter and bounded retries.
//!
//! The client is the single venue fan-in for every cohort, so the rate
//! limiter sits here rather than in the callers.

use crate::config::ApiConfig;
use crate::domain::ports::VenueClient;
use crate::domain::types::{Kline, OpenOrder, OrderSide};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::TimeZone;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::VecDeque;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const MAINNET_URL: &str = "https://api.binance.com";
const TESTNET_URL: &str = "https://testnet.binance.vision";

/// Sliding-window request limiter shared by all cohort ticks.
struct RateLimiter {
    window: Mutex<VecDeque<Instant>>,
    max_per_minute: u32,
}

impl RateLimiter {
    fn new(max_per_minute: u32) -> Self {
        Self {
            window: Mutex::new(VecDeque::new()),
            max_per_minute,
        }
    }

    /// Wait until a request slot is free, then claim it.
    async fn acquire(&self) {
        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let cutoff = Instant::now() - Duration::from_secs(60);
                while window.front().is_some_and(|t| *t < cutoff) {
                    window.pop_front();
                }
                if (window.len() as u32) < self.max_per_minute {
                    window.push_back(Instant::now());
                    None
                } else {
                    window
                        .front()
                        .map(|oldest| Duration::from_secs(60).saturating_sub(oldest.elapsed()))
                }
            };

            match wait {
                None => return,
                Some(wait) => {
                    debug!("BinanceVenueClient: rate limit reached, waiting {:?}", wait);
                    tokio::time::sleep(wait.max(Duration::from_millis(50))).await;
                }
            }
        }
    }
}

pub struct BinanceVenueClient {
    client: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
    limiter: RateLimiter,
    max_retries: u32,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
}

impl BinanceVenueClient {
    pub fn new(api_key: String, api_secret: String, testnet: bool, api_config: &ApiConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(api_config.timeout_default_secs))
            .connect_timeout(Duration::from_secs(api_config.timeout_default_secs))
            .build()
            .unwrap_or_else(|_| Client::new());

        let base_url = if testnet { TESTNET_URL } else { MAINNET_URL };
        info!("BinanceVenueClient: using {}", base_url);

        Self {
            client,
            api_key,
            api_secret,
            base_url: base_url.to_string(),
            limiter: RateLimiter::new(api_config.venue_requests_per_minute),
            max_retries: api_config.max_retries,
            retry_base_delay: Duration::from_secs_f64(api_config.retry_base_delay_secs),
            retry_max_delay: Duration::from_secs_f64(api_config.retry_max_delay_secs),
        }
    }

    /// HMAC-SHA256 signature over the query string.
    fn sign(&self, query: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts keys of any size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &[(&str, String)]) -> String {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let query: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .chain(std::iter::once(format!("timestamp={}", timestamp)))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query);
        format!("{}&signature={}", query, signature)
    }

    /// Send with exponential backoff. Only transport errors and 5xx/429
    /// responses are retried; 4xx rejections surface immediately.
    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
        what: &str,
    ) -> Result<reqwest::Response> {
        let mut delay = self.retry_base_delay;

        for attempt in 0..=self.max_retries {
            self.limiter.acquire().await;
            let result = build()
                .header("X-MBX-APIKEY", &self.api_key)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let retryable = status.is_server_error() || status.as_u16() == 429;
                    let body = response.text().await.unwrap_or_default();
                    if !retryable || attempt == self.max_retries {
                        anyhow::bail!("{} failed: {} - {}", what, status, body);
                    }
                    warn!(
                        "BinanceVenueClient: {} got {} (attempt {}/{}), retrying",
                        what, status, attempt + 1, self.max_retries
                    );
                }
                Err(e) => {
                    if attempt == self.max_retries {
                        return Err(e).with_context(|| format!("{} failed after retries", what));
                    }
                    warn!(
                        "BinanceVenueClient: {} transport error (attempt {}/{}): {}",
                        what, attempt + 1, self.max_retries, e
                    );
                }
            }

            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.retry_max_delay);
        }

        unreachable!("retry loop always returns or bails")
    }
}

#[async_trait]
impl VenueClient for BinanceVenueClient {
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>> {
        let query = self.signed_query(&[("symbol", symbol.to_string())]);
        let url = format!("{}/api/v3/openOrders?{}", self.base_url, query);

        let response = self
            .send_with_retry(|| self.client.get(&url), "open orders fetch")
            .await?;

        #[derive(Debug, Deserialize)]
        struct BinanceOrder {
            #[serde(rename = "orderId")]
            order_id: i64,
            side: String,
            price: String,
            #[serde(rename = "origQty")]
            orig_qty: String,
            time: i64,
        }

        let orders: Vec<BinanceOrder> = response
            .json()
            .await
            .context("Failed to parse open orders response")?;

        Ok(orders
            .into_iter()
            .filter_map(|o| {
                Some(OpenOrder {
                    order_id: o.order_id.to_string(),
                    symbol: symbol.to_string(),
                    side: OrderSide::from_str(&o.side).ok()?,
                    price: Decimal::from_str(&o.price).ok()?,
                    quantity: Decimal::from_str(&o.orig_qty).ok()?,
                    created_at: chrono::Utc
                        .timestamp_millis_opt(o.time)
                        .single()
                        .unwrap_or_else(chrono::Utc::now),
                })
            })
            .collect())
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<String> {
        let query = self.signed_query(&[
            ("symbol", symbol.to_string()),
            ("side", side.to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", quantity.to_string()),
            ("price", price.to_string()),
        ]);
        let url = format!("{}/api/v3/order?{}", self.base_url, query);

        let response = self
            .send_with_retry(|| self.client.post(&url), "order placement")
            .await?;

        #[derive(Debug, Deserialize)]
        struct OrderAck {
            #[serde(rename = "orderId")]
            order_id: i64,
        }

        let ack: OrderAck = response
            .json()
            .await
            .context("Failed to parse order placement response")?;
        debug!(
            "BinanceVenueClient: placed {} {} {}@{} -> order {}",
            side, symbol, quantity, price, ack.order_id
        );
        Ok(ack.order_id.to_string())
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let query = self.signed_query(&[
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ]);
        let url = format!("{}/api/v3/order?{}", self.base_url, query);

        self.send_with_retry(|| self.client.delete(&url), "order cancellation")
            .await?;
        Ok(())
    }

    async fn get_account_balance(&self, asset: &str) -> Result<Decimal> {
        let query = self.signed_query(&[]);
        let url = format!("{}/api/v3/account?{}", self.base_url, query);

        let response = self
            .send_with_retry(|| self.client.get(&url), "account fetch")
            .await?;

        #[derive(Debug, Deserialize)]
        struct Balance {
            asset: String,
            free: String,
        }

        #[derive(Debug, Deserialize)]
        struct Account {
            balances: Vec<Balance>,
        }

        let account: Account = response
            .json()
            .await
            .context("Failed to parse account response")?;

        Ok(account
            .balances
            .iter()
            .find(|b| b.asset == asset)
            .and_then(|b| Decimal::from_str(&b.free).ok())
            .unwrap_or(Decimal::ZERO))
    }

    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );

        let response = self
            .send_with_retry(|| self.client.get(&url), "klines fetch")
            .await?;

        // Kline format: [openTime, open, high, low, close, volume, ...]
        let raw: Vec<serde_json::Value> = response
            .json()
            .await
            .context("Failed to parse klines response")?;

        Ok(raw
            .into_iter()
            .filter_map(|entry| {
                let fields = entry.as_array()?;
                if fields.len() < 6 {
                    return None;
                }
                Some(Kline {
                    open_time: fields[0].as_i64()? / 1000,
                    open: Decimal::from_str(fields[1].as_str()?).ok()?,
                    high: Decimal::from_str(fields[2].as_str()?).ok()?,
                    low: Decimal::from_str(fields[3].as_str()?).ok()?,
                    close: Decimal::from_str(fields[4].as_str()?).ok()?,
                    volume: fields[5].as_str()?.parse().ok()?,
                })
            })
            .collect())
    }
}
