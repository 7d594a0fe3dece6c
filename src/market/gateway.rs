//! Upstream quote gateway.
//!
//! One trait seam (`QuoteGateway`) plus the production HTTP
//! implementation. Errors are split into transient and permanent so the
//! resilience layer knows what is worth retrying.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::market::types::InstrumentSnapshot;
use crate::resilience::Transient;

#[derive(Error, Debug)]
pub enum FetchError {
    /// Timeout, rate limit, upstream unavailable. Worth retrying.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Unknown symbol or another non-recoverable rejection. Retrying
    /// cannot help.
    #[error("permanent upstream failure: {0}")]
    Permanent(String),
}

impl Transient for FetchError {
    fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(StatusCode::NOT_FOUND) => FetchError::Permanent(format!("unknown symbol: {e}")),
            Some(s) if s.is_client_error() && s != StatusCode::TOO_MANY_REQUESTS => {
                FetchError::Permanent(e.to_string())
            }
            // Timeouts, connection failures, 429 and 5xx all count as
            // transient.
            _ => FetchError::Transient(e.to_string()),
        }
    }
}

/// Fetches one normalized snapshot per instrument. Safe to call
/// concurrently for distinct symbols.
#[async_trait]
pub trait QuoteGateway: Send + Sync + 'static {
    async fn fetch(&self, symbol: &str) -> Result<InstrumentSnapshot, FetchError>;
}

#[derive(Deserialize)]
struct QuoteEnvelope {
    quote: QuoteDto,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteDto {
    symbol: String,
    price: f64,
    volume: u64,
    open: f64,
    high: f64,
    low: f64,
    previous_close: f64,
    #[serde(default)]
    market_cap: Option<f64>,
}

/// HTTP implementation of the quote gateway.
#[derive(Clone)]
pub struct HttpQuoteGateway {
    http: Client,
    url: String,
    source: String,
}

impl HttpQuoteGateway {
    pub fn new(url: String) -> Result<Self, FetchError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(5))
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| FetchError::Permanent(format!("http client build failed: {e}")))?;

        Ok(Self {
            http,
            url,
            source: "primary-feed".to_string(),
        })
    }
}

#[async_trait]
impl QuoteGateway for HttpQuoteGateway {
    #[instrument(skip(self), fields(symbol = %symbol), level = "debug")]
    async fn fetch(&self, symbol: &str) -> Result<InstrumentSnapshot, FetchError> {
        let url = format!("{}/quotes/{}", self.url, symbol);

        let resp = self.http.get(&url).send().await?.error_for_status()?;

        let envelope: QuoteEnvelope = resp.json().await?;
        let q = envelope.quote;

        if q.symbol != symbol {
            return Err(FetchError::Permanent(format!(
                "upstream returned {} for requested symbol {}",
                q.symbol, symbol
            )));
        }

        debug!(price = q.price, volume = q.volume, "quote fetched");

        let change = q.price - q.previous_close;
        let change_percent = if q.previous_close != 0.0 {
            change / q.previous_close * 100.0
        } else {
            0.0
        };

        Ok(InstrumentSnapshot {
            symbol: q.symbol,
            price: q.price,
            change,
            change_percent,
            volume: q.volume,
            open: q.open,
            high: q.high,
            low: q.low,
            previous_close: q.previous_close,
            market_cap: q.market_cap,
            source: self.source.clone(),
            captured_at: Utc::now(),
        })
    }
}
