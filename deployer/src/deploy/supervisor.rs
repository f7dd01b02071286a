//! pm2 process supervisor adapter

use std::path::Path;

use tracing::info;

use crate::deploy::command::{CommandError, CommandRunner, CommandSpec};
use crate::stream::sink::LogSink;

/// Drives the pm2 supervisor through the command runner
#[derive(Debug, Clone)]
pub struct Supervisor {
    pm2: String,
    npm: String,
}

impl Supervisor {
    pub fn new(pm2: impl Into<String>, npm: impl Into<String>) -> Self {
        Self {
            pm2: pm2.into(),
            npm: npm.into(),
        }
    }

    /// Whether pm2 knows a process named `name`.
    ///
    /// `pm2 describe` exits non-zero for unknown names; start failures still
    /// propagate so a missing pm2 is not mistaken for a missing process.
    pub async fn exists(&self, runner: &dyn CommandRunner, name: &str, sink: &dyn LogSink) -> Result<bool, CommandError> {
        let cmd = CommandSpec::new(&self.pm2).args(["describe", name]);
        match runner.run(&cmd, sink).await {
            Ok(_) => Ok(true),
            Err(CommandError::Exit { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Stop and forget the process
    pub async fn remove(&self, runner: &dyn CommandRunner, name: &str, sink: &dyn LogSink) -> Result<(), CommandError> {
        self.run_logged(runner, CommandSpec::new(&self.pm2).args(["delete", name]), sink)
            .await?;
        Ok(())
    }

    /// Start `npm start` in `dir` under pm2, bound to `port`
    pub async fn start(
        &self,
        runner: &dyn CommandRunner,
        name: &str,
        dir: &Path,
        port: u16,
        sink: &dyn LogSink,
    ) -> Result<(), CommandError> {
        info!("Starting supervised process {} on port {}", name, port);
        let cmd = CommandSpec::new(&self.pm2)
            .args(["start", self.npm.as_str(), "--name", name, "--", "start"])
            .current_dir(dir)
            .env("PORT", port.to_string())
            .env("NODE_ENV", "production");
        self.run_logged(runner, cmd, sink).await?;
        Ok(())
    }

    /// Persist the process list so it is resurrected after a reboot
    pub async fn save(&self, runner: &dyn CommandRunner, sink: &dyn LogSink) -> Result<(), CommandError> {
        self.run_logged(runner, CommandSpec::new(&self.pm2).arg("save"), sink)
            .await?;
        Ok(())
    }

    async fn run_logged(&self, runner: &dyn CommandRunner, cmd: CommandSpec, sink: &dyn LogSink) -> Result<String, CommandError> {
        sink.log(format!("$ {}", cmd));
        runner.run(&cmd, sink).await
    }
}
