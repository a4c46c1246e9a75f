//! AKShare sidecar client. Primary provider for HK and A-share markets.
//!
//! AKShare itself is a library, not an API; deployments run it behind a
//! small HTTP sidecar. This client is unavailable until the sidecar URL is
//! configured.

use crate::error::{AppError, AppResult};
use crate::markets::providers::{
    CompanyInfo, DataProvider, Financials, History, HistoryBar, Quote, SymbolMatch,
};
use crate::models::Market;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::time::Duration;

pub struct AkShareProvider {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl AkShareProvider {
    pub fn new(base_url: Option<String>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .pool_max_idle_per_host(5)
            .build()
            .map_err(|e| AppError::Provider(format!("failed to build akshare client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
        })
    }

    fn base(&self) -> AppResult<&str> {
        self.base_url
            .as_deref()
            .ok_or_else(|| AppError::Provider("akshare sidecar not configured".into()))
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> AppResult<serde_json::Value> {
        let url = format!("{}{}", self.base()?, path);
        let resp = self.client.get(&url).query(query).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(serde_json::Value::Null);
        }
        if !resp.status().is_success() {
            return Err(AppError::Provider(format!(
                "akshare {} returned {}",
                path,
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl DataProvider for AkShareProvider {
    fn name(&self) -> &'static str {
        "akshare"
    }

    fn is_available(&self) -> bool {
        self.base_url.is_some()
    }

    async fn quote(&self, symbol: &str, market: Market) -> AppResult<Option<Quote>> {
        let body = self
            .get_json("/quote", &[("symbol", symbol), ("market", market.as_str())])
            .await?;
        let Some(price) = body["price"].as_f64() else {
            return Ok(None);
        };
        Ok(Some(Quote {
            symbol: symbol.to_string(),
            price,
            previous_close: body["previous_close"].as_f64(),
            change: body["change"].as_f64(),
            change_percent: body["change_percent"].as_f64(),
            volume: body["volume"].as_i64(),
            currency: body["currency"].as_str().map(str::to_string),
            market_time: body["timestamp"]
                .as_i64()
                .and_then(|t| Utc.timestamp_opt(t, 0).single()),
            source: self.name().to_string(),
        }))
    }

    async fn history(
        &self,
        symbol: &str,
        market: Market,
        range: &str,
        interval: &str,
    ) -> AppResult<Option<History>> {
        let body = self
            .get_json(
                "/history",
                &[
                    ("symbol", symbol),
                    ("market", market.as_str()),
                    ("range", range),
                    ("interval", interval),
                ],
            )
            .await?;
        let Some(rows) = body["bars"].as_array() else {
            return Ok(None);
        };
        let bars: Vec<HistoryBar> = rows
            .iter()
            .filter_map(|row| {
                Some(HistoryBar {
                    timestamp: Utc.timestamp_opt(row["timestamp"].as_i64()?, 0).single()?,
                    open: row["open"].as_f64()?,
                    high: row["high"].as_f64()?,
                    low: row["low"].as_f64()?,
                    close: row["close"].as_f64()?,
                    volume: row["volume"].as_i64(),
                })
            })
            .collect();
        if bars.is_empty() {
            return Ok(None);
        }
        Ok(Some(History {
            symbol: symbol.to_string(),
            bars,
            source: self.name().to_string(),
        }))
    }

    async fn info(&self, symbol: &str, market: Market) -> AppResult<Option<CompanyInfo>> {
        let body = self
            .get_json("/info", &[("symbol", symbol), ("market", market.as_str())])
            .await?;
        let Some(name) = body["name"].as_str() else {
            return Ok(None);
        };
        Ok(Some(CompanyInfo {
            symbol: symbol.to_string(),
            name: name.to_string(),
            sector: body["sector"].as_str().map(str::to_string),
            industry: body["industry"].as_str().map(str::to_string),
            description: body["description"].as_str().map(str::to_string),
            website: body["website"].as_str().map(str::to_string),
            source: self.name().to_string(),
        }))
    }

    async fn financials(&self, symbol: &str, market: Market) -> AppResult<Option<Financials>> {
        let body = self
            .get_json(
                "/financials",
                &[("symbol", symbol), ("market", market.as_str())],
            )
            .await?;
        if body.is_null() {
            return Ok(None);
        }
        Ok(Some(Financials {
            symbol: symbol.to_string(),
            statements: body,
            source: self.name().to_string(),
        }))
    }

    async fn search(&self, query: &str, markets: &[Market]) -> AppResult<Vec<SymbolMatch>> {
        let markets_param = markets
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let body = self
            .get_json("/search", &[("q", query), ("markets", &markets_param)])
            .await?;
        let Some(rows) = body["results"].as_array() else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(SymbolMatch {
                    symbol: row["symbol"].as_str()?.to_string(),
                    name: row["name"].as_str()?.to_string(),
                    market: Market::parse(row["market"].as_str()?)?,
                    exchange: row["exchange"].as_str().map(str::to_string),
                })
            })
            .collect())
    }
}
