//! Task queue and worker pool for the pipeline.
//!
//! Workers share one mpsc receiver behind a mutex and pull tasks until
//! the channel closes or shutdown is signalled. A worker honouring
//! shutdown finishes its current article to the next commit boundary
//! before exiting.

use crate::models::ArticleRef;
use crate::pipeline::orchestrator::NewsPipeline;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Producer half of the pipeline queue. Enqueue is idempotent downstream:
/// the pipeline resolves articles by URL, so replaying a reference is
/// safe.
#[derive(Clone)]
pub struct PipelineQueue {
    tx: mpsc::Sender<ArticleRef>,
}

impl PipelineQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ArticleRef>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueue a reference. Returns false when the queue is full or the
    /// workers are gone.
    pub fn enqueue(&self, task: ArticleRef) -> bool {
        match self.tx.try_send(task) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to enqueue article task");
                false
            }
        }
    }
}

/// Spawn `worker_count` workers consuming the shared receiver.
pub fn spawn_workers(
    pipeline: Arc<NewsPipeline>,
    rx: mpsc::Receiver<ArticleRef>,
    worker_count: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let shared_rx = Arc::new(Mutex::new(rx));
    let workers = worker_count.max(1);
    let mut handles = Vec::with_capacity(workers);

    for i in 0..workers {
        let pipeline = pipeline.clone();
        let rx = shared_rx.clone();
        let mut shutdown = shutdown.clone();

        handles.push(tokio::spawn(async move {
            loop {
                let job = {
                    let mut rx = rx.lock().await;
                    tokio::select! {
                        job = rx.recv() => job,
                        _ = shutdown.changed() => None,
                    }
                };
                let Some(job) = job else {
                    break;
                };

                match pipeline.process(&job).await {
                    Ok(()) => {
                        metrics::counter!("pipeline_tasks_total", 1, "outcome" => "ok");
                    }
                    Err(e) => {
                        metrics::counter!("pipeline_tasks_total", 1, "outcome" => "failed");
                        warn!(worker = i, url = %job.url, error = %e, kind = e.kind(), "pipeline task failed");
                    }
                }

                if *shutdown.borrow() {
                    break;
                }
            }
            info!(worker = i, "pipeline worker stopped");
        }));
    }

    handles
}
