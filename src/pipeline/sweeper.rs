//! Retention sweeper: deletes articles older than the configured window,
//! cascading into the blob tree and the embedding store.

use crate::error::AppResult;
use crate::storage::blob::BlobStore;
use crate::storage::db::Database;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// One sweep pass. Returns the number of deleted articles.
pub fn run_sweep_once(db: &Database, blob: &BlobStore) -> AppResult<usize> {
    let settings = db.get_settings()?;
    let days = settings.news_retention_days;
    if days <= 0 {
        warn!(days, "retention disabled or misconfigured, skipping sweep");
        return Ok(0);
    }

    let cutoff = Utc::now() - chrono::Duration::days(days);
    let victims = db.delete_articles_older_than(cutoff)?;
    for (id, path) in &victims {
        if let Some(path) = path {
            if !blob.delete(path) {
                warn!(news_id = %id, path, "blob delete failed during sweep");
            }
        }
    }

    // Second pass catches orphaned day directories (rows deleted earlier,
    // files left behind by a crash between DB commit and file delete).
    let orphaned = blob.cleanup_older_than(days)?;

    info!(
        articles = victims.len(),
        orphaned_files = orphaned,
        retention_days = days,
        "retention sweep finished"
    );
    Ok(victims.len())
}

pub fn spawn_retention_sweeper(
    db: Database,
    blob: Arc<BlobStore>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = run_sweep_once(&db, &blob) {
                        warn!(error = %e, "retention sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("retention sweeper stopped");
                    break;
                }
            }
        }
    })
}
