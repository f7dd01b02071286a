//! Shared test harness: a scripted command runner and an isolated app state

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use tenant_deployer::app::options::{AppOptions, ProxyOptions};
use tenant_deployer::app::state::AppState;
use tenant_deployer::deploy::command::{CommandError, CommandRunner, CommandSpec};
use tenant_deployer::models::deployment::{
    DeploymentKey, DeploymentPayload, DeploymentRecord, DeploymentTarget, TemplateDescriptor,
    TenantDescriptor,
};
use tenant_deployer::storage::layout::StorageLayout;
use tenant_deployer::stream::sink::LogSink;

/// Stands in for git, npm, pm2 and nginx.
///
/// Every invocation is recorded. Commands succeed unless their rendered
/// command line contains a configured failure pattern or their program is
/// marked missing. `git clone` creates the target directory and pm2 process
/// names are tracked so `pm2 describe` answers consistently.
#[derive(Default)]
pub struct ScriptedRunner {
    calls: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
    missing: Mutex<Vec<String>>,
    processes: Mutex<HashSet<String>>,
    gates: Mutex<Vec<(String, Arc<Notify>)>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `pattern` exit with status 1
    pub fn fail_on(&self, pattern: &str) {
        self.failures.lock().unwrap().push(pattern.to_string());
    }

    /// `program` cannot be started
    pub fn missing(&self, program: &str) {
        self.missing.lock().unwrap().push(program.to_string());
    }

    /// Commands containing `pattern` block until the returned handle is notified
    pub fn gate(&self, pattern: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.gates.lock().unwrap().push((pattern.to_string(), notify.clone()));
        notify
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn was_called(&self, pattern: &str) -> bool {
        self.calls().iter().any(|c| c.contains(pattern))
    }

    pub fn has_process(&self, name: &str) -> bool {
        self.processes.lock().unwrap().contains(name)
    }

    fn gate_for(&self, line: &str) -> Option<Arc<Notify>> {
        self.gates
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, notify)| notify.clone())
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &CommandSpec, sink: &dyn LogSink) -> Result<String, CommandError> {
        let line = command.to_string();
        self.calls.lock().unwrap().push(line.clone());

        if let Some(gate) = self.gate_for(&line) {
            gate.notified().await;
        }

        if self.missing.lock().unwrap().contains(&command.program) {
            return Err(CommandError::NotFound {
                program: command.program.clone(),
            });
        }

        let should_fail = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .any(|pattern| line.contains(pattern.as_str()));
        if should_fail {
            let output = format!("{}: simulated failure", command.program);
            sink.log(output.clone());
            return Err(CommandError::Exit {
                program: command.program.clone(),
                code: Some(1),
                output,
            });
        }

        let args: Vec<&str> = command.args.iter().map(String::as_str).collect();
        match (command.program.as_str(), args.first().copied()) {
            ("git", Some("clone")) => {
                let target = args.last().copied().unwrap_or_default();
                std::fs::create_dir_all(target).unwrap();
                std::fs::write(std::path::Path::new(target).join("package.json"), "{}").unwrap();
            }
            ("pm2", Some("describe")) => {
                if !self.has_process(args[1]) {
                    return Err(CommandError::Exit {
                        program: command.program.clone(),
                        code: Some(1),
                        output: format!("[PM2] Process or Namespace {} not found", args[1]),
                    });
                }
            }
            ("pm2", Some("start")) => {
                if let Some(pos) = args.iter().position(|a| *a == "--name") {
                    self.processes.lock().unwrap().insert(args[pos + 1].to_string());
                }
            }
            ("pm2", Some("delete")) => {
                self.processes.lock().unwrap().remove(args[1]);
            }
            _ => {}
        }

        let output = format!("{} ok", command.program);
        sink.log(output.clone());
        Ok(output)
    }
}

/// App state wired to a [`ScriptedRunner`] inside a temp directory
pub struct Harness {
    pub dir: TempDir,
    pub runner: Arc<ScriptedRunner>,
    pub options: AppOptions,
    pub state: AppState,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(|_| {}).await
    }

    pub async fn with_options(configure: impl FnOnce(&mut AppOptions)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut options = AppOptions::default();
        options.storage = StorageLayout::new(dir.path().join("state"));
        options.proxy = ProxyOptions {
            sites_available: dir.path().join("sites-available"),
            sites_enabled: dir.path().join("sites-enabled"),
        };
        options.ports = 41000..=41999;
        options.executor.default_timeout = Some(Duration::from_secs(30));
        configure(&mut options);

        let runner = Arc::new(ScriptedRunner::new());
        let state = AppState::with_runner(&options, runner.clone()).await.unwrap();

        Self {
            dir,
            runner,
            options,
            state,
        }
    }

    /// Run the next queued job to completion on the current task
    pub async fn run_next(&self) -> DeploymentRecord {
        let job = self
            .state
            .queue
            .try_next_job()
            .await
            .expect("a queued job");
        let key = job.key.clone();
        let record = self.state.executor.execute(job).await;
        self.state.queue.complete(&key, record.clone()).await;
        record
    }

    pub fn sites_available(&self) -> std::path::PathBuf {
        self.options.proxy.sites_available.clone()
    }

    pub fn sites_enabled(&self) -> std::path::PathBuf {
        self.options.proxy.sites_enabled.clone()
    }
}

pub fn key(tenant: &str) -> DeploymentKey {
    DeploymentKey::new("t1", tenant).unwrap()
}

pub fn payload(tenant: &str) -> DeploymentPayload {
    let mut env = BTreeMap::new();
    env.insert("API_URL".to_string(), "https://api.example.com".to_string());
    DeploymentPayload {
        template: TemplateDescriptor {
            id: "t1".to_string(),
            source_location: "https://git.example.com/templates/t1.git".to_string(),
            branch: None,
            env,
        },
        tenant: TenantDescriptor {
            id: tenant.to_string(),
            user_id: "u-42".to_string(),
            tracking_id: "G-XYZ".to_string(),
            domain: format!("{}.example.com", tenant),
        },
        timeout_secs: None,
        target: DeploymentTarget::Local,
    }
}

/// Poll `condition` until it holds, failing the test after a few seconds
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
