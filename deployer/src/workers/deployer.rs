//! Deployment worker

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, info};

use crate::deploy::executor::DeploymentExecutor;
use crate::jobs::queue::JobQueue;

/// Deployer worker pool options
#[derive(Debug, Clone)]
pub struct Options {
    /// Number of workers, i.e. deployments that may run at once
    pub workers: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self { workers: 2 }
    }
}

/// Run one deployer worker until shutdown.
///
/// Shutdown is only observed between jobs; a running deployment is always
/// carried through to its terminal record.
pub async fn run(
    worker_id: usize,
    queue: Arc<JobQueue>,
    executor: Arc<DeploymentExecutor>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Deployer worker {} starting...", worker_id);

    loop {
        let job = tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Deployer worker {} shutting down...", worker_id);
                return;
            }
            job = queue.next_job() => job,
        };

        let key = job.key.clone();
        debug!("Worker {} picked up {}", worker_id, key);
        let record = executor.execute(job).await;
        queue.complete(&key, record).await;
    }
}
