//! Tiingo provider. Optional US fallback, enabled by API key.

use crate::error::{AppError, AppResult};
use crate::markets::providers::{
    CompanyInfo, DataProvider, Financials, History, HistoryBar, Quote, SymbolMatch,
};
use crate::models::Market;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

const BASE_URL: &str = "https://api.tiingo.com";

pub struct TiingoProvider {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl TiingoProvider {
    pub fn new(api_key: Option<String>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::Provider(format!("failed to build tiingo client: {}", e)))?;
        Ok(Self { client, api_key })
    }

    fn key(&self) -> AppResult<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| AppError::Provider("tiingo API key not configured".into()))
    }

    async fn get_json(&self, path: &str) -> AppResult<serde_json::Value> {
        let resp = self
            .client
            .get(format!("{}{}", BASE_URL, path))
            .header("Authorization", format!("Token {}", self.key()?))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(serde_json::Value::Null);
        }
        if !resp.status().is_success() {
            return Err(AppError::Provider(format!(
                "tiingo {} returned {}",
                path,
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl DataProvider for TiingoProvider {
    fn name(&self) -> &'static str {
        "tiingo"
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn quote(&self, symbol: &str, _market: Market) -> AppResult<Option<Quote>> {
        let body = self.get_json(&format!("/iex/{}", symbol)).await?;
        let Some(row) = body.as_array().and_then(|a| a.first()) else {
            return Ok(None);
        };
        let Some(price) = row["last"].as_f64().or_else(|| row["tngoLast"].as_f64()) else {
            return Ok(None);
        };
        let previous_close = row["prevClose"].as_f64();
        let change = previous_close.map(|pc| price - pc);
        Ok(Some(Quote {
            symbol: symbol.to_string(),
            price,
            previous_close,
            change,
            change_percent: match (change, previous_close) {
                (Some(c), Some(pc)) if pc != 0.0 => Some(c / pc * 100.0),
                _ => None,
            },
            volume: row["volume"].as_i64(),
            currency: Some("USD".to_string()),
            market_time: row["timestamp"]
                .as_str()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc)),
            source: self.name().to_string(),
        }))
    }

    async fn history(
        &self,
        symbol: &str,
        _market: Market,
        range: &str,
        _interval: &str,
    ) -> AppResult<Option<History>> {
        // Tiingo EOD history; range maps to a start date offset.
        let days = match range {
            "5d" => 7,
            "1mo" => 31,
            "3mo" => 92,
            "1y" => 366,
            _ => 31,
        };
        let start = (Utc::now() - chrono::Duration::days(days)).format("%Y-%m-%d");
        let body = self
            .get_json(&format!(
                "/tiingo/daily/{}/prices?startDate={}",
                symbol, start
            ))
            .await?;
        let Some(rows) = body.as_array() else {
            return Ok(None);
        };
        let bars: Vec<HistoryBar> = rows
            .iter()
            .filter_map(|row| {
                Some(HistoryBar {
                    timestamp: DateTime::parse_from_rfc3339(row["date"].as_str()?)
                        .ok()?
                        .with_timezone(&Utc),
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

    async fn info(&self, symbol: &str, _market: Market) -> AppResult<Option<CompanyInfo>> {
        let body = self.get_json(&format!("/tiingo/daily/{}", symbol)).await?;
        let Some(name) = body["name"].as_str() else {
            return Ok(None);
        };
        Ok(Some(CompanyInfo {
            symbol: symbol.to_string(),
            name: name.to_string(),
            sector: None,
            industry: None,
            description: body["description"].as_str().map(str::to_string),
            website: None,
            source: self.name().to_string(),
        }))
    }

    async fn financials(&self, _symbol: &str, _market: Market) -> AppResult<Option<Financials>> {
        // Statements need the fundamentals add-on; let the router fall
        // through to Yahoo.
        Ok(None)
    }

    async fn search(&self, query: &str, markets: &[Market]) -> AppResult<Vec<SymbolMatch>> {
        if !markets.is_empty() && !markets.contains(&Market::Us) {
            return Ok(Vec::new());
        }
        let body = self
            .get_json(&format!("/tiingo/utilities/search?query={}", query))
            .await?;
        let Some(rows) = body.as_array() else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(SymbolMatch {
                    symbol: row["ticker"].as_str()?.to_uppercase(),
                    name: row["name"].as_str()?.to_string(),
                    market: Market::Us,
                    exchange: row["exchange"].as_str().map(str::to_string),
                })
            })
            .collect())
    }
}
