//! Market data providers behind a uniform read shape.
//!
//! Every provider exposes the same five reads regardless of market:
//! quote, history, info, financials, search. A provider returns `Ok(None)`
//! for data it does not carry; the router falls through to the next one.

pub mod akshare;
pub mod tiingo;
pub mod tushare;
pub mod yahoo;

pub use akshare::AkShareProvider;
pub use tiingo::TiingoProvider;
pub use tushare::TushareProvider;
pub use yahoo::YahooProvider;

use crate::error::AppResult;
use crate::models::Market;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub previous_close: Option<f64>,
    pub change: Option<f64>,
    pub change_percent: Option<f64>,
    pub volume: Option<i64>,
    pub currency: Option<String>,
    pub market_time: Option<DateTime<Utc>>,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryBar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    pub symbol: String,
    pub bars: Vec<HistoryBar>,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyInfo {
    pub symbol: String,
    pub name: String,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub description: Option<String>,
    pub website: Option<String>,
    pub source: String,
}

/// Raw statement payloads; shape differs per provider, consumers pick the
/// fields they understand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Financials {
    pub symbol: String,
    pub statements: serde_json::Value,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolMatch {
    pub symbol: String,
    pub name: String,
    pub market: Market,
    pub exchange: Option<String>,
}

#[async_trait]
pub trait DataProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Providers with missing credentials report unavailable and stay out
    /// of the routing table.
    fn is_available(&self) -> bool {
        true
    }

    async fn quote(&self, symbol: &str, market: Market) -> AppResult<Option<Quote>>;

    async fn history(
        &self,
        symbol: &str,
        market: Market,
        range: &str,
        interval: &str,
    ) -> AppResult<Option<History>>;

    async fn info(&self, symbol: &str, market: Market) -> AppResult<Option<CompanyInfo>>;

    async fn financials(&self, symbol: &str, market: Market) -> AppResult<Option<Financials>>;

    async fn search(&self, query: &str, markets: &[Market]) -> AppResult<Vec<SymbolMatch>>;
}
