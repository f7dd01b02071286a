//! Deployment executor
//!
//! Runs one admitted job end to end: the pipeline under the job's timeout,
//! rollback for any failure past dependency validation, the terminal status
//! write and the terminal log marker, in that order.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};

use crate::deploy::pipeline::{DeploymentContext, Pipeline, PipelineError, Step};
use crate::deploy::rollback::Rollback;
use crate::jobs::queue::ActiveJob;
use crate::models::deployment::{DeploymentPayload, DeploymentRecord};
use crate::storage::layout::StorageLayout;
use crate::storage::status::StatusStore;
use crate::stream::broadcaster::LogBroadcaster;
use crate::stream::sink::LogSink;

/// Executor settings
#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    /// Applied when the payload does not set its own timeout
    pub default_timeout: Option<Duration>,
}

/// Deployment executor
pub struct DeploymentExecutor {
    pipeline: Pipeline,
    rollback: Rollback,
    store: Arc<StatusStore>,
    logs: Arc<LogBroadcaster>,
    layout: StorageLayout,
    options: ExecutorOptions,
}

impl DeploymentExecutor {
    pub fn new(
        pipeline: Pipeline,
        rollback: Rollback,
        store: Arc<StatusStore>,
        logs: Arc<LogBroadcaster>,
        layout: StorageLayout,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            pipeline,
            rollback,
            store,
            logs,
            layout,
            options,
        }
    }

    /// Timeout for a payload: its own setting wins, `0` disables
    pub fn timeout_for(&self, payload: &DeploymentPayload) -> Option<Duration> {
        match payload.timeout_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => self.options.default_timeout,
        }
    }

    /// Run `job` to a terminal record. Never fails: every error ends up in
    /// the returned record.
    pub async fn execute(&self, job: ActiveJob) -> DeploymentRecord {
        let ActiveJob {
            key,
            payload,
            port,
            mut record,
            tracker,
        } = job;

        let sink = self.logs.sink(&key);
        let ctx = DeploymentContext {
            workdir: self.layout.app_dir(&key),
            key: key.clone(),
            payload,
            port,
        };

        info!("[{}] Deploying to {} on port {}", key, ctx.domain(), port);
        sink.log(format!("Deploying {} to {} on port {}", key, ctx.domain(), port));

        let run = self.pipeline.run(&ctx, &sink, &tracker);
        let outcome = match self.timeout_for(&ctx.payload) {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(outcome) => outcome,
                Err(_) => Err(PipelineError::Timeout(limit)),
            },
            None => run.await,
        };

        match outcome {
            Ok(()) => {
                info!("[{}] Deployment succeeded", key);
                sink.log("Deployment succeeded".to_string());
                record.mark_success(Utc::now());
            }
            Err(e) => {
                error!("[{}] Deployment failed: {}", key, e);
                sink.log(format!("Deployment failed: {}", e));

                let mut message = e.to_string();
                if tracker.has_reached(Step::CheckSource) {
                    let report = self.rollback.run(&ctx, &sink).await;
                    for failure in report.failures {
                        message.push_str("; rollback: ");
                        message.push_str(&failure);
                    }
                }
                record.mark_failed(message, Utc::now());
            }
        }

        record.logs = self.logs.history(&key).unwrap_or_default();
        if let Err(e) = self.store.write(&key, &record).await {
            error!("[{}] Failed to persist terminal record: {}", key, e);
            sink.log(format!("Failed to persist deployment record: {}", e));
            record.mark_failed(format!("failed to persist deployment record: {}", e), Utc::now());
        }

        self.logs.finish(&key, record.status);
        record
    }
}
