//! Execution substrate: an in-process channel drained by a pool of workers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::worker::AuditWorker;
use super::WorkItem;
use crate::pipeline::error::JobError;

/// Hands work items to whatever executes them.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, item: WorkItem) -> Result<(), JobError>;
}

/// Bounded `mpsc` queue; enqueue waits while the queue is full.
#[derive(Clone)]
pub struct ChannelQueue {
    sender: mpsc::Sender<WorkItem>,
}

impl ChannelQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<WorkItem>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl JobQueue for ChannelQueue {
    async fn enqueue(&self, item: WorkItem) -> Result<(), JobError> {
        self.sender
            .send(item)
            .await
            .map_err(|_| JobError::QueueUnavailable("worker pool is not running".to_string()))
    }
}

/// Fixed number of workers sharing one receiver.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn spawn(
        receiver: mpsc::Receiver<WorkItem>,
        worker: Arc<AuditWorker>,
        concurrency: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let receiver = Arc::new(Mutex::new(receiver));
        let handles = (0..concurrency.max(1))
            .map(|index| {
                let receiver = receiver.clone();
                let worker = worker.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tracing::debug!(target: "auditor::pipeline::jobs", worker = index, "Worker started");
                    loop {
                        let next = tokio::select! {
                            _ = shutdown.cancelled() => None,
                            item = async { receiver.lock().await.recv().await } => item,
                        };
                        let Some(item) = next else {
                            break;
                        };
                        worker.process(item).await;
                    }
                    tracing::debug!(target: "auditor::pipeline::jobs", worker = index, "Worker stopped");
                })
            })
            .collect();

        tracing::info!(
            target: "auditor::pipeline::jobs",
            "Started {} audit worker(s)",
            concurrency.max(1)
        );

        Self { handles, shutdown }
    }

    /// Stops taking new items and waits for in-flight runs to finish.
    pub async fn shutdown(self, timeout: Duration) {
        self.shutdown.cancel();
        let join_all = futures::future::join_all(self.handles);
        match tokio::time::timeout(timeout, join_all).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        tracing::error!(target: "auditor::pipeline::jobs", "Worker panicked: {}", e);
                    }
                }
                tracing::info!(target: "auditor::pipeline::jobs", "Worker pool stopped");
            }
            Err(_) => {
                tracing::warn!(
                    target: "auditor::pipeline::jobs",
                    "Workers did not finish within {:?}, abandoning in-flight jobs",
                    timeout
                );
            }
        }
    }
}
