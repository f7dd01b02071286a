//! Deployment pipeline
//!
//! Runs the eight ordered steps that take a template from its git source to
//! a supervised process behind the reverse proxy. Steps are fail-fast: the
//! first error aborts the run and is reported as a [`PipelineError`] naming
//! the step. Rollback is the caller's decision (see `deploy::executor`).

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::deploy::command::{CommandError, CommandRunner, CommandSpec};
use crate::deploy::proxy::ProxyConfigurator;
use crate::deploy::supervisor::Supervisor;
use crate::errors::DeployerError;
use crate::filesys::dir::Dir;
use crate::models::deployment::{DeploymentKey, DeploymentPayload};
use crate::stream::sink::LogSink;

/// Name of the environment file written into the working directory
pub const ENV_FILE: &str = ".env";

/// External programs the pipeline drives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toolchain {
    #[serde(default = "default_git")]
    pub git: String,
    #[serde(default = "default_npm")]
    pub npm: String,
    #[serde(default = "default_pm2")]
    pub pm2: String,
    #[serde(default = "default_nginx")]
    pub nginx: String,
}

fn default_git() -> String {
    "git".to_string()
}

fn default_npm() -> String {
    "npm".to_string()
}

fn default_pm2() -> String {
    "pm2".to_string()
}

fn default_nginx() -> String {
    "nginx".to_string()
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            git: default_git(),
            npm: default_npm(),
            pm2: default_pm2(),
            nginx: default_nginx(),
        }
    }
}

impl Toolchain {
    /// Version probes, one per required tool
    pub fn probes(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new(&self.git).arg("--version"),
            CommandSpec::new(&self.npm).arg("--version"),
            CommandSpec::new(&self.pm2).arg("--version"),
            CommandSpec::new(&self.nginx).arg("-v"),
        ]
    }
}

/// Pipeline step, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Step {
    CheckDependencies,
    CheckSource,
    Fetch,
    WriteEnv,
    Install,
    Build,
    Supervise,
    ConfigureProxy,
}

impl Step {
    pub const ALL: [Step; 8] = [
        Step::CheckDependencies,
        Step::CheckSource,
        Step::Fetch,
        Step::WriteEnv,
        Step::Install,
        Step::Build,
        Step::Supervise,
        Step::ConfigureProxy,
    ];

    pub const COUNT: usize = Self::ALL.len();

    /// 1-based position
    pub fn number(&self) -> usize {
        *self as usize + 1
    }

    pub fn name(&self) -> &'static str {
        match self {
            Step::CheckDependencies => "dependencies",
            Step::CheckSource => "source",
            Step::Fetch => "fetch",
            Step::WriteEnv => "environment",
            Step::Install => "install",
            Step::Build => "build",
            Step::Supervise => "supervise",
            Step::ConfigureProxy => "proxy",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Step::CheckDependencies => "Checking required tools",
            Step::CheckSource => "Checking source access",
            Step::Fetch => "Fetching source",
            Step::WriteEnv => "Writing environment file",
            Step::Install => "Installing dependencies",
            Step::Build => "Building application",
            Step::Supervise => "Starting supervised process",
            Step::ConfigureProxy => "Configuring reverse proxy",
        }
    }

    /// Step a failure is reported under. The source-access check belongs
    /// to the fetch phase.
    pub fn phase(&self) -> Step {
        match self {
            Step::CheckSource => Step::Fetch,
            step => *step,
        }
    }

    fn from_number(number: u8) -> Option<Step> {
        Self::ALL.get((number as usize).checked_sub(1)?).copied()
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared record of how far a run got, readable after the run's future was dropped
#[derive(Debug, Clone, Default)]
pub struct StepTracker {
    started: Arc<AtomicU8>,
    completed: Arc<AtomicU8>,
}

impl StepTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, step: Step) {
        self.started.store(step.number() as u8, Ordering::SeqCst);
    }

    pub fn complete(&self, step: Step) {
        self.completed.store(step.number() as u8, Ordering::SeqCst);
    }

    /// Last step that was started
    pub fn current(&self) -> Option<Step> {
        Step::from_number(self.started.load(Ordering::SeqCst))
    }

    /// Whether `step` (or a later one) was started
    pub fn has_reached(&self, step: Step) -> bool {
        self.current().is_some_and(|current| current >= step)
    }

    /// Completed steps as a percentage
    pub fn progress(&self) -> u8 {
        let completed = self.completed.load(Ordering::SeqCst) as usize;
        (completed * 100 / Step::COUNT) as u8
    }
}

/// Why a pipeline run failed
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{step} step failed: {source}")]
    Step {
        step: Step,
        #[source]
        source: DeployerError,
    },

    #[error("deployment timed out after {0:?}")]
    Timeout(Duration),
}

impl PipelineError {
    pub fn step(&self) -> Option<Step> {
        match self {
            PipelineError::Step { step, .. } => Some(*step),
            PipelineError::Timeout(_) => None,
        }
    }
}

/// Inputs of a single run
#[derive(Debug, Clone)]
pub struct DeploymentContext {
    pub key: DeploymentKey,
    pub payload: DeploymentPayload,
    pub port: u16,
    pub workdir: Dir,
}

impl DeploymentContext {
    pub fn process_name(&self) -> String {
        self.key.slug()
    }

    pub fn domain(&self) -> &str {
        &self.payload.tenant.domain
    }
}

/// Render the `KEY=VALUE` environment file for a run
pub fn render_env_file(ctx: &DeploymentContext) -> String {
    let tenant = &ctx.payload.tenant;
    let mut lines = vec![
        format!("TENANT_ID={}", tenant.id),
        format!("USER_ID={}", tenant.user_id),
        format!("TRACKING_ID={}", tenant.tracking_id),
        format!("DOMAIN={}", tenant.domain),
        format!("PORT={}", ctx.port),
    ];
    lines.extend(
        ctx.payload
            .template
            .env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value)),
    );
    let mut contents = lines.join("\n");
    contents.push('\n');
    contents
}

/// Verify every tool in the toolchain can be started
pub async fn check_dependencies(
    runner: &dyn CommandRunner,
    toolchain: &Toolchain,
    sink: &dyn LogSink,
) -> Result<(), DeployerError> {
    for probe in toolchain.probes() {
        match runner.run(&probe, sink).await {
            Ok(_) => {}
            Err(CommandError::NotFound { program }) => return Err(DeployerError::MissingTool(program)),
            Err(e) => return Err(DeployerError::MissingTool(format!("{} ({})", probe.program, e))),
        }
    }
    Ok(())
}

/// The deployment pipeline
#[derive(Clone)]
pub struct Pipeline {
    runner: Arc<dyn CommandRunner>,
    toolchain: Toolchain,
    supervisor: Supervisor,
    proxy: ProxyConfigurator,
}

impl Pipeline {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        toolchain: Toolchain,
        supervisor: Supervisor,
        proxy: ProxyConfigurator,
    ) -> Self {
        Self {
            runner,
            toolchain,
            supervisor,
            proxy,
        }
    }

    /// Run all steps in order, logging step boundaries to `sink`
    pub async fn run(
        &self,
        ctx: &DeploymentContext,
        sink: &dyn LogSink,
        tracker: &StepTracker,
    ) -> Result<(), PipelineError> {
        for step in Step::ALL {
            tracker.begin(step);
            info!("[{}] step {}/{}: {}", ctx.key, step.number(), Step::COUNT, step.name());
            sink.log(format!("[{}/{}] {}...", step.number(), Step::COUNT, step.label()));

            self.run_step(step, ctx, sink)
                .await
                .map_err(|source| PipelineError::Step {
                    step: step.phase(),
                    source,
                })?;

            tracker.complete(step);
            sink.log(format!("[{}/{}] {} done", step.number(), Step::COUNT, step.label()));
        }
        Ok(())
    }

    async fn run_step(&self, step: Step, ctx: &DeploymentContext, sink: &dyn LogSink) -> Result<(), DeployerError> {
        match step {
            Step::CheckDependencies => check_dependencies(self.runner.as_ref(), &self.toolchain, sink).await,
            Step::CheckSource => self.check_source(ctx, sink).await,
            Step::Fetch => self.fetch(ctx, sink).await,
            Step::WriteEnv => self.write_env(ctx, sink).await,
            Step::Install => {
                let cmd = CommandSpec::new(&self.toolchain.npm)
                    .arg("install")
                    .current_dir(ctx.workdir.path());
                self.run_logged(cmd, sink).await
            }
            Step::Build => {
                let cmd = CommandSpec::new(&self.toolchain.npm)
                    .args(["run", "build"])
                    .current_dir(ctx.workdir.path())
                    .env("PORT", ctx.port.to_string());
                self.run_logged(cmd, sink).await
            }
            Step::Supervise => self.supervise(ctx, sink).await,
            Step::ConfigureProxy => {
                self.proxy
                    .install(self.runner.as_ref(), ctx.domain(), ctx.port, sink)
                    .await
            }
        }
    }

    async fn check_source(&self, ctx: &DeploymentContext, sink: &dyn LogSink) -> Result<(), DeployerError> {
        let reference = ctx.payload.template.branch.as_deref().unwrap_or("HEAD");
        let cmd = CommandSpec::new(&self.toolchain.git)
            .args(["ls-remote", "--exit-code"])
            .arg(&ctx.payload.template.source_location)
            .arg(reference)
            .env("GIT_TERMINAL_PROMPT", "0");
        sink.log(format!("$ {}", cmd));
        match self.runner.run(&cmd, sink).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_start_failure() => Err(e.into()),
            Err(e) => Err(DeployerError::SourceUnreachable(e.to_string())),
        }
    }

    async fn fetch(&self, ctx: &DeploymentContext, sink: &dyn LogSink) -> Result<(), DeployerError> {
        if ctx.workdir.delete().await? {
            sink.log(format!("Removed existing working directory {}", ctx.workdir.path().display()));
        }
        if let Some(parent) = ctx.workdir.path().parent() {
            Dir::new(parent).create().await?;
        }

        let mut cmd = CommandSpec::new(&self.toolchain.git).args(["clone", "--depth", "1"]);
        if let Some(branch) = &ctx.payload.template.branch {
            cmd = cmd.args(["--branch", branch.as_str()]);
        }
        let cmd = cmd
            .arg(&ctx.payload.template.source_location)
            .arg(ctx.workdir.path().display().to_string())
            .env("GIT_TERMINAL_PROMPT", "0");
        self.run_logged(cmd, sink).await
    }

    async fn write_env(&self, ctx: &DeploymentContext, sink: &dyn LogSink) -> Result<(), DeployerError> {
        let file = ctx.workdir.file(ENV_FILE);
        file.write_string(&render_env_file(ctx)).await?;
        sink.log(format!("Wrote {}", file.path().display()));
        Ok(())
    }

    async fn supervise(&self, ctx: &DeploymentContext, sink: &dyn LogSink) -> Result<(), DeployerError> {
        let runner = self.runner.as_ref();
        let name = ctx.process_name();

        if self.supervisor.exists(runner, &name, sink).await? {
            sink.log(format!("Replacing existing process {}", name));
            self.supervisor.remove(runner, &name, sink).await?;
        }
        self.supervisor
            .start(runner, &name, ctx.workdir.path(), ctx.port, sink)
            .await?;
        self.supervisor.save(runner, sink).await?;
        Ok(())
    }

    async fn run_logged(&self, cmd: CommandSpec, sink: &dyn LogSink) -> Result<(), DeployerError> {
        sink.log(format!("$ {}", cmd));
        self.runner.run(&cmd, sink).await?;
        Ok(())
    }
}
