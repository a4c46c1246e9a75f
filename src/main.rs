//! Newswire - financial news ingestion and enrichment backend.
//!
//! Startup wires the singleton services (database, blob store, cache, LLM
//! gateway, content fetcher, provider router), spawns the pipeline worker
//! pool and the retention sweeper, and serves the HTTP API. Shutdown is
//! explicit: workers drain to their next commit boundary, the gateway
//! closes its cached providers, then the process exits.

use anyhow::{Context, Result};
use axum::{middleware as axum_mw, routing::get, Router};
use chrono::NaiveDate;
use newswire_backend::{
    api::{routes::api_router, AppState},
    core::{
        cache::CacheService, circuit_breaker::CircuitBreakerRegistry, rate_limit::FeatureLimits,
        rate_limit::SlidingWindowLimiter,
    },
    fetch::ContentFetcher,
    llm::{DbUsageRecorder, LlmGateway, ProviderCredentials},
    markets::{
        providers::{AkShareProvider, TiingoProvider, TushareProvider, YahooProvider},
        router::ProviderRouter,
    },
    middleware::{rate_limit_middleware, RateLimitState},
    models::Config,
    pipeline::{queue::PipelineQueue, spawn_retention_sweeper, spawn_workers, NewsPipeline},
    rag::{indexer::EmbeddingIndexer, search::HybridSearch},
    storage::{blob::BlobStore, db::Database},
};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default pricing rows seeded on first boot so cost accounting works out
/// of the box. Admins adjust via the pricing table.
fn seed_default_pricing(db: &Database) -> Result<()> {
    let effective = NaiveDate::from_ymd_opt(2026, 1, 1).expect("valid date");
    let defaults: &[(&str, f64, Option<f64>, f64)] = &[
        ("gpt-4o-mini", 0.15, Some(0.075), 0.60),
        ("gpt-4o", 2.50, Some(1.25), 10.00),
        ("text-embedding-3-small", 0.02, None, 0.0),
        ("claude-3-5-haiku", 0.80, Some(0.08), 4.00),
        ("claude-3-5-sonnet", 3.00, Some(0.30), 15.00),
    ];
    for (model, input, cached, output) in defaults {
        if db.active_pricing(model, effective)?.is_none() {
            db.insert_pricing(model, *input, *cached, *output, effective)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "newswire=info,tower_http=warn".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(port = config.port, workers = config.pipeline_workers, "starting newswire backend");

    // Irrecoverable startup failures exit non-zero.
    let db = Database::open(&config.database_path)
        .with_context(|| format!("failed to open database at {}", config.database_path))?;
    seed_default_pricing(&db).context("failed to seed model pricing")?;
    let blob = Arc::new(
        BlobStore::new(&config.content_dir)
            .with_context(|| format!("failed to create content dir {}", config.content_dir))?,
    );

    let cache = CacheService::new();
    let breakers = Arc::new(CircuitBreakerRegistry::new());
    let feature_limits = FeatureLimits::default();

    let gateway = Arc::new(LlmGateway::new(
        ProviderCredentials::from_env_config(&config),
        breakers.clone(),
    ));
    gateway.set_usage_observer(Arc::new(DbUsageRecorder::new(db.clone())));

    let fetcher = Arc::new(
        ContentFetcher::new(
            config.browser_service_url.clone(),
            config.extract_api_key.clone(),
        )
        .context("failed to build content fetcher")?,
    );

    let indexer = Arc::new(EmbeddingIndexer::new(
        db.clone(),
        gateway.clone(),
        feature_limits.embedding.clone(),
    ));

    let pipeline = Arc::new(
        NewsPipeline::new(
            db.clone(),
            blob.clone(),
            gateway.clone(),
            fetcher.clone(),
            indexer.clone(),
        )
        .context("failed to build pipeline")?,
    );

    // Market data router
    let yahoo = Arc::new(YahooProvider::new().context("yahoo provider")?);
    let akshare = Arc::new(
        AkShareProvider::new(config.akshare_service_url.clone()).context("akshare provider")?,
    );
    let tushare: Arc<TushareProvider> =
        Arc::new(TushareProvider::new(config.tushare_token.clone()).context("tushare provider")?);
    let tiingo: Arc<TiingoProvider> =
        Arc::new(TiingoProvider::new(config.tiingo_api_key.clone()).context("tiingo provider")?);
    let markets = Arc::new(ProviderRouter::new(
        yahoo,
        akshare,
        Some(tushare),
        Some(tiingo),
        cache.clone(),
    ));

    // Pipeline workers + retention sweeper
    let (queue, rx) = PipelineQueue::new(1024);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handles = spawn_workers(
        pipeline.clone(),
        rx,
        config.pipeline_workers,
        shutdown_rx.clone(),
    );
    let sweeper_handle = spawn_retention_sweeper(db.clone(), blob.clone(), shutdown_rx.clone());

    // HTTP surface
    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let state = AppState {
        db: db.clone(),
        blob: blob.clone(),
        queue: queue.clone(),
        search: Arc::new(HybridSearch::new(db.clone())),
        gateway: gateway.clone(),
        markets,
        cache: cache.clone(),
    };

    let limiter = RateLimitState {
        limiter: Arc::new(SlidingWindowLimiter::new(120, Duration::from_secs(60))),
    };
    let cleanup_limiter = limiter.limiter.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(300));
        loop {
            ticker.tick().await;
            cleanup_limiter.cleanup();
        }
    });

    let app = Router::new()
        .merge(api_router())
        .route("/metrics", get(move || async move { prometheus.render() }))
        .layer(axum_mw::from_fn_with_state(limiter, rate_limit_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(%addr, "HTTP server listening");

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .into_future();

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    // Drain: stop picking new tasks, let workers reach their next commit.
    let _ = shutdown_tx.send(true);
    for handle in worker_handles {
        let _ = tokio::time::timeout(Duration::from_secs(30), handle).await;
    }
    sweeper_handle.abort();
    gateway.close();
    info!("newswire backend stopped");
    Ok(())
}
