//! Best-effort cleanup of a failed deployment

use std::sync::Arc;

use tracing::{info, warn};

use crate::deploy::command::CommandRunner;
use crate::deploy::pipeline::DeploymentContext;
use crate::deploy::proxy::ProxyConfigurator;
use crate::deploy::supervisor::Supervisor;
use crate::errors::DeployerError;
use crate::stream::sink::LogSink;

/// Outcome of a rollback. Empty `failures` means every action succeeded or
/// had nothing to do.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub failures: Vec<String>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, action: &str, error: DeployerError, sink: &dyn LogSink) {
        warn!("Rollback of {} failed: {}", action, error);
        sink.log(format!("Failed to remove {}: {}", action, error));
        self.failures.push(format!("{}: {}", action, error));
    }
}

/// Removes the supervised process, the working directory and the proxy
/// config of a failed run. Each action runs regardless of the others.
#[derive(Clone)]
pub struct Rollback {
    runner: Arc<dyn CommandRunner>,
    supervisor: Supervisor,
    proxy: ProxyConfigurator,
}

impl Rollback {
    pub fn new(runner: Arc<dyn CommandRunner>, supervisor: Supervisor, proxy: ProxyConfigurator) -> Self {
        Self {
            runner,
            supervisor,
            proxy,
        }
    }

    pub async fn run(&self, ctx: &DeploymentContext, sink: &dyn LogSink) -> RollbackReport {
        info!("[{}] Rolling back", ctx.key);
        sink.log("Rolling back...".to_string());

        let mut report = RollbackReport::default();

        match self.remove_process(ctx, sink).await {
            Ok(true) => sink.log(format!("Removed process {}", ctx.process_name())),
            Ok(false) => sink.log("No existing process to remove".to_string()),
            Err(e) => report.fail("process", e, sink),
        }

        match ctx.workdir.delete().await {
            Ok(true) => sink.log(format!("Removed working directory {}", ctx.workdir.path().display())),
            Ok(false) => sink.log("No working directory to remove".to_string()),
            Err(e) => report.fail("working directory", e, sink),
        }

        match self.proxy.remove(self.runner.as_ref(), ctx.domain(), sink).await {
            Ok(true) => sink.log(format!("Removed proxy config for {}", ctx.domain())),
            Ok(false) => sink.log("No proxy config to remove".to_string()),
            Err(e) => report.fail("proxy config", e, sink),
        }

        if report.is_clean() {
            sink.log("Rollback complete".to_string());
        } else {
            sink.log(format!("Rollback finished with {} failure(s)", report.failures.len()));
        }
        report
    }

    async fn remove_process(&self, ctx: &DeploymentContext, sink: &dyn LogSink) -> Result<bool, DeployerError> {
        let runner = self.runner.as_ref();
        let name = ctx.process_name();
        if !self.supervisor.exists(runner, &name, sink).await? {
            return Ok(false);
        }
        self.supervisor.remove(runner, &name, sink).await?;
        self.supervisor.save(runner, sink).await?;
        Ok(true)
    }
}
