//! Application state management

use std::sync::Arc;

use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::deploy::command::{CommandRunner, ProcessRunner};
use crate::deploy::executor::DeploymentExecutor;
use crate::deploy::pipeline::Pipeline;
use crate::deploy::ports::PortAllocator;
use crate::deploy::proxy::ProxyConfigurator;
use crate::deploy::rollback::Rollback;
use crate::deploy::supervisor::Supervisor;
use crate::errors::DeployerError;
use crate::filesys::dir::Dir;
use crate::jobs::queue::JobQueue;
use crate::models::deployment::DeploymentStatus;
use crate::storage::layout::StorageLayout;
use crate::storage::status::StatusStore;
use crate::stream::broadcaster::LogBroadcaster;

/// Main application state
pub struct AppState {
    pub layout: StorageLayout,
    pub store: Arc<StatusStore>,
    pub logs: Arc<LogBroadcaster>,
    pub ports: Arc<PortAllocator>,
    pub queue: Arc<JobQueue>,
    pub executor: Arc<DeploymentExecutor>,
}

impl AppState {
    /// Initialize application state with the real process runner
    pub async fn init(options: &AppOptions) -> Result<Self, DeployerError> {
        Self::with_runner(options, Arc::new(ProcessRunner::new())).await
    }

    /// Initialize application state on top of `runner`
    pub async fn with_runner(options: &AppOptions, runner: Arc<dyn CommandRunner>) -> Result<Self, DeployerError> {
        info!("Initializing application state...");

        let layout = options.storage.clone();
        layout.setup().await?;

        let store = Arc::new(StatusStore::new(layout.status_dir()));
        let records = store.list().await?;
        let interrupted = records
            .iter()
            .filter(|r| r.status == DeploymentStatus::InProgress)
            .count();
        if interrupted > 0 {
            warn!("{} deployment(s) were interrupted by a previous shutdown", interrupted);
        }

        let ports = Arc::new(PortAllocator::new(options.ports.clone()));
        ports.seed(&records);
        let logs = Arc::new(LogBroadcaster::new());

        let toolchain = &options.toolchain;
        let supervisor = Supervisor::new(&toolchain.pm2, &toolchain.npm);
        let proxy = ProxyConfigurator::new(
            &toolchain.nginx,
            Dir::new(&options.proxy.sites_available),
            Dir::new(&options.proxy.sites_enabled),
        );
        let pipeline = Pipeline::new(runner.clone(), toolchain.clone(), supervisor.clone(), proxy.clone());
        let rollback = Rollback::new(runner, supervisor, proxy);

        let executor = Arc::new(DeploymentExecutor::new(
            pipeline,
            rollback,
            store.clone(),
            logs.clone(),
            layout.clone(),
            options.executor.clone(),
        ));
        let queue = Arc::new(JobQueue::new(
            store.clone(),
            logs.clone(),
            ports.clone(),
            options.queue.clone(),
        ));

        Ok(Self {
            layout,
            store,
            logs,
            ports,
            queue,
            executor,
        })
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), DeployerError> {
        info!("Shutting down application state...");
        Ok(())
    }
}
