//! Market-based provider routing with fallback chains.
//!
//! Routing table (priority order):
//! - US     -> yahoo, tiingo (when configured)
//! - METAL  -> yahoo
//! - HK     -> akshare, yahoo
//! - SH/SZ  -> akshare, tushare (when configured), yahoo
//!
//! A result is accepted when it is `Some` and the provider did not error;
//! on error the router logs and falls through. Quote reads go through the
//! cache with stampede protection.

use crate::core::cache::{CacheService, CacheTtl};
use crate::error::AppResult;
use crate::markets::providers::{
    CompanyInfo, DataProvider, Financials, History, Quote, SymbolMatch,
};
use crate::models::Market;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ProviderRouter {
    routing: HashMap<Market, Vec<Arc<dyn DataProvider>>>,
    search_providers: Vec<Arc<dyn DataProvider>>,
    cache: CacheService,
}

impl ProviderRouter {
    pub fn new(
        yahoo: Arc<dyn DataProvider>,
        akshare: Arc<dyn DataProvider>,
        tushare: Option<Arc<dyn DataProvider>>,
        tiingo: Option<Arc<dyn DataProvider>>,
        cache: CacheService,
    ) -> Self {
        let tushare_chain: Vec<_> = tushare
            .iter()
            .filter(|p| p.is_available())
            .cloned()
            .collect();
        let tiingo_chain: Vec<_> = tiingo
            .iter()
            .filter(|p| p.is_available())
            .cloned()
            .collect();
        let akshare_chain: Vec<_> = if akshare.is_available() {
            vec![akshare.clone()]
        } else {
            Vec::new()
        };

        let mut routing: HashMap<Market, Vec<Arc<dyn DataProvider>>> = HashMap::new();
        routing.insert(
            Market::Us,
            [vec![yahoo.clone()], tiingo_chain.clone()].concat(),
        );
        routing.insert(Market::Metal, vec![yahoo.clone()]);
        routing.insert(
            Market::Hk,
            [akshare_chain.clone(), vec![yahoo.clone()]].concat(),
        );
        for market in [Market::Sh, Market::Sz] {
            routing.insert(
                market,
                [
                    akshare_chain.clone(),
                    tushare_chain.clone(),
                    vec![yahoo.clone()],
                ]
                .concat(),
            );
        }

        let mut search_providers: Vec<Arc<dyn DataProvider>> = vec![yahoo];
        search_providers.extend(akshare_chain);
        search_providers.extend(tiingo_chain);

        let names: Vec<&str> = routing
            .values()
            .flatten()
            .map(|p| p.name())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        info!(providers = ?names, "provider router initialized");

        Self {
            routing,
            search_providers,
            cache,
        }
    }

    pub fn providers_for(&self, market: Market) -> &[Arc<dyn DataProvider>] {
        self.routing.get(&market).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Try providers in order until one produces a value.
    async fn try_providers<T, F, Fut>(
        &self,
        market: Market,
        operation: &str,
        call: F,
    ) -> AppResult<Option<T>>
    where
        F: Fn(Arc<dyn DataProvider>) -> Fut,
        Fut: Future<Output = AppResult<Option<T>>>,
    {
        for (i, provider) in self.providers_for(market).iter().enumerate() {
            match call(provider.clone()).await {
                Ok(Some(value)) => {
                    if i > 0 {
                        info!(operation, provider = provider.name(), "fallback succeeded");
                    }
                    return Ok(Some(value));
                }
                Ok(None) => {
                    debug!(operation, provider = provider.name(), "no data, trying next");
                }
                Err(e) => {
                    warn!(operation, provider = provider.name(), error = %e, "provider failed");
                }
            }
        }
        Ok(None)
    }

    /// Quote with cache-aside stampede protection and stale fallback.
    pub async fn quote(&self, symbol: &str, market: Market) -> AppResult<Option<Quote>> {
        let key = format!("stock:quote:{}:{}", market.as_str(), symbol);
        let symbol_owned = symbol.to_string();
        let fetched = self
            .cache
            .get_with_lock(
                &key,
                CacheTtl::REALTIME_QUOTE,
                move || async move {
                    let quote = self
                        .try_providers(market, "quote", |p| {
                            let sym = symbol_owned.clone();
                            async move { p.quote(&sym, market).await }
                        })
                        .await?;
                    match quote {
                        Some(q) => Ok(serde_json::to_value(q)?),
                        None => anyhow::bail!("no provider returned a quote for {}", symbol_owned),
                    }
                },
                5,
            )
            .await;

        match fetched {
            Ok(Some(value)) => Ok(serde_json::from_value(value).ok()),
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(symbol, error = %e, "quote fetch failed with no stale copy");
                Ok(None)
            }
        }
    }

    pub async fn history(
        &self,
        symbol: &str,
        market: Market,
        range: &str,
        interval: &str,
    ) -> AppResult<Option<History>> {
        self.try_providers(market, "history", |p| {
            let sym = symbol.to_string();
            let range = range.to_string();
            let interval = interval.to_string();
            async move { p.history(&sym, market, &range, &interval).await }
        })
        .await
    }

    pub async fn info(&self, symbol: &str, market: Market) -> AppResult<Option<CompanyInfo>> {
        self.try_providers(market, "info", |p| {
            let sym = symbol.to_string();
            async move { p.info(&sym, market).await }
        })
        .await
    }

    pub async fn financials(&self, symbol: &str, market: Market) -> AppResult<Option<Financials>> {
        self.try_providers(market, "financials", |p| {
            let sym = symbol.to_string();
            async move { p.financials(&sym, market).await }
        })
        .await
    }

    /// Search selected providers concurrently and deduplicate by symbol.
    /// First occurrence wins; capped at 50 results.
    pub async fn search(&self, query: &str, markets: &[Market]) -> AppResult<Vec<SymbolMatch>> {
        let futures: Vec<_> = self
            .search_providers
            .iter()
            .map(|p| {
                let provider = p.clone();
                let query = query.to_string();
                let markets = markets.to_vec();
                async move { (provider.name(), provider.search(&query, &markets).await) }
            })
            .collect();

        let outcomes = futures_util::future::join_all(futures).await;

        let mut seen: HashSet<String> = HashSet::new();
        let mut unique: Vec<SymbolMatch> = Vec::new();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(results) => {
                    for result in results {
                        if seen.insert(result.symbol.clone()) {
                            unique.push(result);
                        }
                    }
                }
                Err(e) => warn!(provider = name, error = %e, "search failed"),
            }
        }
        unique.truncate(50);
        Ok(unique)
    }
}
