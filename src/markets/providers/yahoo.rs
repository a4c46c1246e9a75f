//! Yahoo Finance provider. Primary for US and METAL, last-resort fallback
//! for every other market.

use crate::error::{AppError, AppResult};
use crate::markets::providers::{
    CompanyInfo, DataProvider, Financials, History, HistoryBar, Quote, SymbolMatch,
};
use crate::models::{detect_market, Market};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::time::Duration;

const CHART_BASE: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
const SEARCH_BASE: &str = "https://query2.finance.yahoo.com/v1/finance/search";
const SUMMARY_BASE: &str = "https://query2.finance.yahoo.com/v10/finance/quoteSummary";

pub struct YahooProvider {
    client: reqwest::Client,
}

impl YahooProvider {
    pub fn new() -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .user_agent("Mozilla/5.0 (compatible; newswire/0.1)")
            .build()
            .map_err(|e| AppError::Provider(format!("failed to build yahoo client: {}", e)))?;
        Ok(Self { client })
    }

    /// Yahoo uses `XXXX.SS` / `XXXX.SZ` suffixes for A-shares and
    /// zero-padded `XXXX.HK` codes.
    fn yahoo_symbol(symbol: &str, market: Market) -> String {
        match market {
            Market::Sh => format!("{}.SS", symbol),
            Market::Sz => format!("{}.SZ", symbol),
            Market::Hk if !symbol.to_ascii_uppercase().ends_with(".HK") => {
                format!("{:0>4}.HK", symbol)
            }
            _ => symbol.to_string(),
        }
    }

    async fn chart(
        &self,
        symbol: &str,
        range: &str,
        interval: &str,
    ) -> AppResult<Option<serde_json::Value>> {
        let url = format!("{}/{}", CHART_BASE, symbol);
        let resp = self
            .client
            .get(&url)
            .query(&[("range", range), ("interval", interval)])
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(AppError::Provider(format!(
                "yahoo chart {} returned {}",
                symbol,
                resp.status()
            )));
        }

        let body: serde_json::Value = resp.json().await?;
        Ok(body["chart"]["result"].get(0).cloned())
    }
}

#[async_trait]
impl DataProvider for YahooProvider {
    fn name(&self) -> &'static str {
        "yahoo"
    }

    async fn quote(&self, symbol: &str, market: Market) -> AppResult<Option<Quote>> {
        let ysym = Self::yahoo_symbol(symbol, market);
        let Some(result) = self.chart(&ysym, "1d", "1m").await? else {
            return Ok(None);
        };
        let meta = &result["meta"];
        let Some(price) = meta["regularMarketPrice"].as_f64() else {
            return Ok(None);
        };
        let previous_close = meta["chartPreviousClose"]
            .as_f64()
            .or_else(|| meta["previousClose"].as_f64());
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
            volume: meta["regularMarketVolume"].as_i64(),
            currency: meta["currency"].as_str().map(str::to_string),
            market_time: meta["regularMarketTime"]
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
        let ysym = Self::yahoo_symbol(symbol, market);
        let Some(result) = self.chart(&ysym, range, interval).await? else {
            return Ok(None);
        };

        let timestamps = result["timestamp"].as_array().cloned().unwrap_or_default();
        let quote = &result["indicators"]["quote"][0];
        let series = |key: &str| quote[key].as_array().cloned().unwrap_or_default();
        let (opens, highs, lows, closes, volumes) = (
            series("open"),
            series("high"),
            series("low"),
            series("close"),
            series("volume"),
        );

        let mut bars = Vec::with_capacity(timestamps.len());
        for (i, ts) in timestamps.iter().enumerate() {
            let (Some(ts), Some(open), Some(high), Some(low), Some(close)) = (
                ts.as_i64(),
                opens.get(i).and_then(|v| v.as_f64()),
                highs.get(i).and_then(|v| v.as_f64()),
                lows.get(i).and_then(|v| v.as_f64()),
                closes.get(i).and_then(|v| v.as_f64()),
            ) else {
                continue;
            };
            let Some(timestamp) = Utc.timestamp_opt(ts, 0).single() else {
                continue;
            };
            bars.push(HistoryBar {
                timestamp,
                open,
                high,
                low,
                close,
                volume: volumes.get(i).and_then(|v| v.as_i64()),
            });
        }

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
        let ysym = Self::yahoo_symbol(symbol, market);
        let url = format!("{}/{}", SUMMARY_BASE, ysym);
        let resp = self
            .client
            .get(&url)
            .query(&[("modules", "assetProfile,quoteType")])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let body: serde_json::Value = resp.json().await?;
        let Some(result) = body["quoteSummary"]["result"].get(0) else {
            return Ok(None);
        };
        let profile = &result["assetProfile"];
        let name = result["quoteType"]["longName"]
            .as_str()
            .or_else(|| result["quoteType"]["shortName"].as_str())
            .unwrap_or(symbol)
            .to_string();
        Ok(Some(CompanyInfo {
            symbol: symbol.to_string(),
            name,
            sector: profile["sector"].as_str().map(str::to_string),
            industry: profile["industry"].as_str().map(str::to_string),
            description: profile["longBusinessSummary"].as_str().map(str::to_string),
            website: profile["website"].as_str().map(str::to_string),
            source: self.name().to_string(),
        }))
    }

    async fn financials(&self, symbol: &str, market: Market) -> AppResult<Option<Financials>> {
        let ysym = Self::yahoo_symbol(symbol, market);
        let url = format!("{}/{}", SUMMARY_BASE, ysym);
        let resp = self
            .client
            .get(&url)
            .query(&[(
                "modules",
                "incomeStatementHistory,balanceSheetHistory,cashflowStatementHistory",
            )])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let body: serde_json::Value = resp.json().await?;
        let Some(result) = body["quoteSummary"]["result"].get(0) else {
            return Ok(None);
        };
        Ok(Some(Financials {
            symbol: symbol.to_string(),
            statements: result.clone(),
            source: self.name().to_string(),
        }))
    }

    async fn search(&self, query: &str, markets: &[Market]) -> AppResult<Vec<SymbolMatch>> {
        let resp = self
            .client
            .get(SEARCH_BASE)
            .query(&[("q", query), ("quotesCount", "20"), ("newsCount", "0")])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Ok(Vec::new());
        }
        let body: serde_json::Value = resp.json().await?;
        let quotes = body["quotes"].as_array().cloned().unwrap_or_default();

        Ok(quotes
            .iter()
            .filter_map(|q| {
                let symbol = q["symbol"].as_str()?.to_string();
                let name = q["longname"]
                    .as_str()
                    .or_else(|| q["shortname"].as_str())
                    .unwrap_or(&symbol)
                    .to_string();
                let market = detect_market(&symbol);
                if !markets.is_empty() && !markets.contains(&market) {
                    return None;
                }
                Some(SymbolMatch {
                    symbol,
                    name,
                    market,
                    exchange: q["exchange"].as_str().map(str::to_string),
                })
            })
            .collect())
    }
}
