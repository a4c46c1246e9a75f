//! Tushare Pro provider. Optional A-share fallback, enabled by token.

use crate::error::{AppError, AppResult};
use crate::markets::providers::{
    CompanyInfo, DataProvider, Financials, History, HistoryBar, Quote, SymbolMatch,
};
use crate::models::Market;
use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use serde_json::json;
use std::time::Duration;

const API_URL: &str = "http://api.tushare.pro";

pub struct TushareProvider {
    client: reqwest::Client,
    token: Option<String>,
}

impl TushareProvider {
    pub fn new(token: Option<String>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| AppError::Provider(format!("failed to build tushare client: {}", e)))?;
        Ok(Self { client, token })
    }

    /// Tushare codes are `XXXXXX.SH` / `XXXXXX.SZ`.
    fn ts_code(symbol: &str, market: Market) -> String {
        match market {
            Market::Sh => format!("{}.SH", symbol),
            Market::Sz => format!("{}.SZ", symbol),
            _ => symbol.to_string(),
        }
    }

    /// Tushare answers every API through one POST endpoint with
    /// `{api_name, token, params, fields}` and a column/row table back.
    async fn call(
        &self,
        api_name: &str,
        params: serde_json::Value,
    ) -> AppResult<Vec<serde_json::Map<String, serde_json::Value>>> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| AppError::Provider("tushare token not configured".into()))?;

        let resp = self
            .client
            .post(API_URL)
            .json(&json!({
                "api_name": api_name,
                "token": token,
                "params": params,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(AppError::Provider(format!(
                "tushare {} returned {}",
                api_name,
                resp.status()
            )));
        }

        let body: serde_json::Value = resp.json().await?;
        if body["code"].as_i64().unwrap_or(0) != 0 {
            return Err(AppError::Provider(format!(
                "tushare {}: {}",
                api_name,
                body["msg"].as_str().unwrap_or("unknown error")
            )));
        }

        let fields: Vec<String> = body["data"]["fields"]
            .as_array()
            .map(|f| {
                f.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let items = body["data"]["items"].as_array().cloned().unwrap_or_default();

        Ok(items
            .iter()
            .filter_map(|row| {
                let cells = row.as_array()?;
                let mut map = serde_json::Map::new();
                for (field, cell) in fields.iter().zip(cells) {
                    map.insert(field.clone(), cell.clone());
                }
                Some(map)
            })
            .collect())
    }

    fn parse_trade_date(raw: &str) -> Option<chrono::DateTime<Utc>> {
        let date = NaiveDate::parse_from_str(raw, "%Y%m%d").ok()?;
        Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
    }
}

#[async_trait]
impl DataProvider for TushareProvider {
    fn name(&self) -> &'static str {
        "tushare"
    }

    fn is_available(&self) -> bool {
        self.token.is_some()
    }

    async fn quote(&self, symbol: &str, market: Market) -> AppResult<Option<Quote>> {
        let rows = self
            .call("daily", json!({"ts_code": Self::ts_code(symbol, market), "limit": 1}))
            .await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let Some(close) = row.get("close").and_then(|v| v.as_f64()) else {
            return Ok(None);
        };
        let previous_close = row.get("pre_close").and_then(|v| v.as_f64());
        Ok(Some(Quote {
            symbol: symbol.to_string(),
            price: close,
            previous_close,
            change: row.get("change").and_then(|v| v.as_f64()),
            change_percent: row.get("pct_chg").and_then(|v| v.as_f64()),
            volume: row.get("vol").and_then(|v| v.as_f64()).map(|v| v as i64),
            currency: Some("CNY".to_string()),
            market_time: row
                .get("trade_date")
                .and_then(|v| v.as_str())
                .and_then(Self::parse_trade_date),
            source: self.name().to_string(),
        }))
    }

    async fn history(
        &self,
        symbol: &str,
        market: Market,
        _range: &str,
        _interval: &str,
    ) -> AppResult<Option<History>> {
        let rows = self
            .call("daily", json!({"ts_code": Self::ts_code(symbol, market)}))
            .await?;
        let mut bars: Vec<HistoryBar> = rows
            .iter()
            .filter_map(|row| {
                Some(HistoryBar {
                    timestamp: Self::parse_trade_date(row.get("trade_date")?.as_str()?)?,
                    open: row.get("open")?.as_f64()?,
                    high: row.get("high")?.as_f64()?,
                    low: row.get("low")?.as_f64()?,
                    close: row.get("close")?.as_f64()?,
                    volume: row.get("vol").and_then(|v| v.as_f64()).map(|v| v as i64),
                })
            })
            .collect();
        if bars.is_empty() {
            return Ok(None);
        }
        bars.sort_by_key(|b| b.timestamp);
        Ok(Some(History {
            symbol: symbol.to_string(),
            bars,
            source: self.name().to_string(),
        }))
    }

    async fn info(&self, symbol: &str, market: Market) -> AppResult<Option<CompanyInfo>> {
        let rows = self
            .call(
                "stock_basic",
                json!({"ts_code": Self::ts_code(symbol, market)}),
            )
            .await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        Ok(Some(CompanyInfo {
            symbol: symbol.to_string(),
            name: row
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or(symbol)
                .to_string(),
            sector: row.get("industry").and_then(|v| v.as_str()).map(str::to_string),
            industry: row.get("industry").and_then(|v| v.as_str()).map(str::to_string),
            description: None,
            website: None,
            source: self.name().to_string(),
        }))
    }

    async fn financials(&self, symbol: &str, market: Market) -> AppResult<Option<Financials>> {
        let rows = self
            .call(
                "income",
                json!({"ts_code": Self::ts_code(symbol, market), "limit": 8}),
            )
            .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(Financials {
            symbol: symbol.to_string(),
            statements: json!({ "income": rows }),
            source: self.name().to_string(),
        }))
    }

    async fn search(&self, _query: &str, _markets: &[Market]) -> AppResult<Vec<SymbolMatch>> {
        // Tushare has no fuzzy-search API worth exposing here.
        Ok(Vec::new())
    }
}
