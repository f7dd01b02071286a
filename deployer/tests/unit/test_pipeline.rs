//! End-to-end deployment scenarios against the scripted runner

use std::sync::Arc;

use tokio_test::assert_ok;

use tenant_deployer::deploy::pipeline::{Step, ENV_FILE};
use tenant_deployer::jobs::queue::Admission;
use tenant_deployer::models::deployment::DeploymentStatus;
use tenant_deployer::models::job::{JobState, Priority};
use tenant_deployer::stream::broadcaster::LogEvent;

use crate::support::{key, payload, wait_for, Harness};

fn count(lines: &[String], needle: &str) -> usize {
    lines.iter().filter(|l| l.contains(needle)).count()
}

fn position(lines: &[String], needle: &str) -> usize {
    lines
        .iter()
        .position(|l| l.contains(needle))
        .unwrap_or_else(|| panic!("no line containing {:?}", needle))
}

#[tokio::test]
async fn test_successful_deployment_runs_all_steps_in_order() {
    let h = Harness::new().await;
    let key = key("biz1");

    assert_ok!(h.state.queue.submit(key.clone(), payload("biz1"), Priority::Normal).await);
    let record = h.run_next().await;

    assert_eq!(record.status, DeploymentStatus::Success);
    assert!(record.completed_at.is_some());
    assert!(record.error.is_none());
    assert!(record.duration.is_some());

    let mut last = 0;
    for step in Step::ALL {
        let started = position(&record.logs, &format!("[{}/8] {}...", step.number(), step.label()));
        let done = position(&record.logs, &format!("[{}/8] {} done", step.number(), step.label()));
        assert!(started >= last && done > started, "step {} out of order", step);
        last = done;
    }
    assert_eq!(count(&record.logs, "Rolling back"), 0);

    // Side effects
    let port = record.port.unwrap();
    let workdir = h.state.layout.app_dir(&key);
    let env = std::fs::read_to_string(workdir.path().join(ENV_FILE)).unwrap();
    assert!(env.contains("TENANT_ID=biz1\n"));
    assert!(env.contains(&format!("PORT={}\n", port)));
    assert!(env.ends_with("API_URL=https://api.example.com\n"));

    assert!(h.runner.has_process("t1_biz1"));
    let vhost = std::fs::read_to_string(h.sites_available().join("biz1.example.com.conf")).unwrap();
    assert!(vhost.contains(&format!("proxy_pass http://127.0.0.1:{};", port)));
    assert!(h.sites_enabled().join("biz1.example.com.conf").exists());

    // Persisted and reported
    assert_eq!(h.state.queue.record(&key).await.unwrap(), Some(record.clone()));
    let job = h.state.queue.status(&key).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.result.unwrap().status, DeploymentStatus::Success);
}

#[tokio::test]
async fn test_fetch_failure_rolls_back_with_noop_lines() {
    let h = Harness::new().await;
    let key = key("biz1");
    h.runner.fail_on("git clone");

    assert_ok!(h.state.queue.submit(key.clone(), payload("biz1"), Priority::Normal).await);
    let record = h.run_next().await;

    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record.failed_at.is_some());
    let error = record.error.clone().unwrap();
    assert!(error.starts_with("fetch step failed"), "{}", error);
    assert!(!error.contains("rollback:"));

    assert_eq!(count(&record.logs, "Rolling back..."), 1);
    assert_eq!(count(&record.logs, "No existing process to remove"), 1);
    assert_eq!(count(&record.logs, "No working directory to remove"), 1);
    assert_eq!(count(&record.logs, "No proxy config to remove"), 1);
    assert!(!h.runner.was_called("npm install"));

    let job = h.state.queue.status(&key).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure_reason.as_deref(), Some(error.as_str()));
}

#[tokio::test]
async fn test_unreachable_source_fails_fetch_with_noop_rollback() {
    let h = Harness::new().await;
    let key = key("biz1");
    h.runner.fail_on("git ls-remote");

    assert_ok!(h.state.queue.submit(key.clone(), payload("biz1"), Priority::Normal).await);
    let record = h.run_next().await;

    assert_eq!(record.status, DeploymentStatus::Failed);
    let error = record.error.clone().unwrap();
    assert!(error.starts_with("fetch step failed: source unreachable"), "{}", error);
    assert!(!error.contains("rollback:"));

    assert_eq!(count(&record.logs, "Rolling back..."), 1);
    assert_eq!(count(&record.logs, "No existing process to remove"), 1);
    assert_eq!(count(&record.logs, "No working directory to remove"), 1);
    assert_eq!(count(&record.logs, "No proxy config to remove"), 1);
    assert_eq!(count(&record.logs, "Rollback complete"), 1);
    assert!(!h.runner.was_called("git clone"));
}

#[tokio::test]
async fn test_rollback_failure_is_appended_to_error() {
    let h = Harness::new().await;
    let key = key("biz1");
    h.runner.fail_on("npm run build");
    h.runner.fail_on("nginx -s reload");

    // Leftover vhost from an earlier run
    std::fs::create_dir_all(h.sites_available()).unwrap();
    std::fs::write(h.sites_available().join("biz1.example.com.conf"), "server {}\n").unwrap();

    assert_ok!(h.state.queue.submit(key.clone(), payload("biz1"), Priority::Normal).await);
    h.run_next().await;

    let record = h.state.queue.record(&key).await.unwrap().unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    let error = record.error.clone().unwrap();
    assert!(error.starts_with("build step failed"), "{}", error);
    assert!(error.contains("; rollback: proxy config: "), "{}", error);

    assert_eq!(count(&record.logs, "Rolling back..."), 1);
    assert_eq!(count(&record.logs, "Removed working directory"), 1);
    assert_eq!(count(&record.logs, "Failed to remove proxy config"), 1);
    assert_eq!(count(&record.logs, "Rollback finished with 1 failure(s)"), 1);

    let job = h.state.queue.status(&key).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
}

#[tokio::test]
async fn test_build_failure_removes_working_directory() {
    let h = Harness::new().await;
    let key = key("biz1");
    h.runner.fail_on("npm run build");

    assert_ok!(h.state.queue.submit(key.clone(), payload("biz1"), Priority::Normal).await);
    h.run_next().await;

    let record = h.state.queue.record(&key).await.unwrap().unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record.error.as_deref().unwrap().starts_with("build step failed"));
    assert_eq!(count(&record.logs, "Removed working directory"), 1);
    assert!(record.logs.iter().any(|l| l == "npm: simulated failure"));
    assert!(!h.state.layout.app_dir(&key).exists().await);
    assert!(!h.runner.was_called("pm2 start"));
}

#[tokio::test]
async fn test_missing_tool_fails_without_rollback() {
    let h = Harness::new().await;
    h.runner.missing("pm2");

    assert_ok!(h.state.queue.submit(key("biz1"), payload("biz1"), Priority::Normal).await);
    let record = h.run_next().await;

    assert_eq!(record.status, DeploymentStatus::Failed);
    let error = record.error.unwrap();
    assert!(error.starts_with("dependencies step failed"), "{}", error);
    assert!(error.contains("pm2"));
    assert_eq!(count(&record.logs, "Rolling back"), 0);
    assert!(!h.runner.was_called("git clone"));
}

#[tokio::test]
async fn test_supervise_replaces_existing_process() {
    let h = Harness::new().await;
    let key = key("biz1");

    h.state.queue.submit(key.clone(), payload("biz1"), Priority::Normal).await.unwrap();
    h.run_next().await;

    // Force a fresh run over the successful one
    let mut record = h.state.store.read(&key).await.unwrap().unwrap();
    record.mark_failed("forced", chrono::Utc::now());
    h.state.store.write(&key, &record).await.unwrap();

    h.state.queue.submit(key.clone(), payload("biz1"), Priority::Normal).await.unwrap();
    let second = h.run_next().await;

    assert_eq!(second.status, DeploymentStatus::Success);
    assert_eq!(second.port, record.port);
    assert!(second.logs.iter().any(|l| l == "Replacing existing process t1_biz1"));
    assert!(h.runner.was_called("pm2 delete t1_biz1"));
    assert!(h.runner.has_process("t1_biz1"));
}

#[tokio::test]
async fn test_proxy_validation_failure_leaves_no_active_config() {
    let h = Harness::new().await;
    let key = key("biz1");
    h.runner.fail_on("nginx -t -q -p");

    h.state.queue.submit(key.clone(), payload("biz1"), Priority::Normal).await.unwrap();
    let record = h.run_next().await;

    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record.error.as_deref().unwrap().starts_with("proxy step failed"));
    assert!(!h.sites_available().join("biz1.example.com.conf").exists());
    assert!(!h.sites_enabled().join("biz1.example.com.conf").exists());
    assert!(!h.runner.was_called("nginx -s reload"));

    // The process started in step 7 is rolled back
    assert_eq!(count(&record.logs, "Removed process t1_biz1"), 1);
    assert!(!h.runner.has_process("t1_biz1"));
}

#[tokio::test]
async fn test_reload_failure_restores_previous_proxy_state() {
    let h = Harness::new().await;
    h.runner.fail_on("nginx -s reload");

    h.state.queue.submit(key("biz1"), payload("biz1"), Priority::Normal).await.unwrap();
    let record = h.run_next().await;

    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record.logs.iter().any(|l| l == "Proxy activation failed, restoring previous config"));
    assert!(!h.sites_available().join("biz1.example.com.conf").exists());
    assert!(!h.sites_enabled().join("biz1.example.com.conf").exists());
    assert_eq!(count(&record.logs, "No proxy config to remove"), 1);
}

#[tokio::test]
async fn test_timeout_fails_job_and_rolls_back() {
    let h = Harness::new().await;
    let key = key("biz1");
    let _gate = h.runner.gate("npm install");

    let mut payload = payload("biz1");
    payload.timeout_secs = Some(1);
    h.state.queue.submit(key.clone(), payload, Priority::Normal).await.unwrap();
    let record = h.run_next().await;

    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(count(&record.logs, "Rolling back..."), 1);
    assert_eq!(count(&record.logs, "Removed working directory"), 1);
    assert!(!h.state.layout.app_dir(&key).exists().await);
}

#[tokio::test]
async fn test_mid_run_subscriber_sees_every_line_once() {
    let h = Harness::new().await;
    let key = key("biz1");
    let gate = h.runner.gate("npm run build");

    h.state.queue.submit(key.clone(), payload("biz1"), Priority::Normal).await.unwrap();
    let job = h.state.queue.try_next_job().await.unwrap();
    let executor = h.state.executor.clone();
    let run = tokio::spawn(async move { executor.execute(job).await });

    let runner = h.runner.clone();
    wait_for(|| runner.was_called("npm run build")).await;

    let mut subscription = h.state.queue.subscribe(&key);
    gate.notify_one();

    let mut lines = Vec::new();
    let mut markers = Vec::new();
    while let Some(event) = subscription.next().await {
        match event {
            LogEvent::Line(line) => {
                assert!(markers.is_empty(), "line after terminal marker");
                lines.push(line);
            }
            LogEvent::Finished(status) => markers.push(status),
        }
    }

    let record = run.await.unwrap();
    assert_eq!(markers, vec![DeploymentStatus::Success]);
    assert_eq!(lines, record.logs);
}

#[tokio::test]
async fn test_progress_is_reported_while_running() {
    let h = Harness::new().await;
    let key = key("biz1");
    let gate = h.runner.gate("npm install");

    h.state.queue.submit(key.clone(), payload("biz1"), Priority::Normal).await.unwrap();
    let job = h.state.queue.try_next_job().await.unwrap();
    let executor = h.state.executor.clone();
    let run = tokio::spawn(async move { executor.execute(job).await });

    let runner = h.runner.clone();
    wait_for(|| runner.was_called("npm install")).await;

    let status = h.state.queue.status(&key).await.unwrap();
    assert_eq!(status.state, JobState::Active);
    assert_eq!(status.progress, 50);
    assert!(status.started_at.is_some());

    gate.notify_one();
    let record = run.await.unwrap();
    h.state.queue.complete(&key, record).await;
    assert_eq!(h.state.queue.status(&key).await.unwrap().progress, 100);
}

#[tokio::test]
async fn test_readmission_after_failure_starts_fresh_run() {
    let h = Harness::new().await;
    let key = key("biz1");
    h.runner.fail_on("npm run build");

    h.state.queue.submit(key.clone(), payload("biz1"), Priority::Normal).await.unwrap();
    let failed = h.run_next().await;
    assert_eq!(failed.status, DeploymentStatus::Failed);

    let admission = h.state.queue.submit(key.clone(), payload("biz1"), Priority::Normal).await.unwrap();
    let Admission::Queued(job) = admission else {
        panic!("expected a fresh job");
    };
    assert_eq!(job.state, JobState::Waiting);

    let record = h.state.store.read(&key).await.unwrap().unwrap();
    assert_eq!(record.status, DeploymentStatus::InProgress);
    assert!(record.logs.is_empty());
    assert_eq!(record.port, failed.port);
    assert_eq!(h.state.queue.logs(&key).await.unwrap(), Some(Vec::new()));
}

#[tokio::test]
async fn test_workers_drain_the_queue() {
    let h = Harness::new().await;
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let worker = tokio::spawn(tenant_deployer::workers::deployer::run(
        0,
        h.state.queue.clone(),
        h.state.executor.clone(),
        Box::pin(async move {
            let _ = rx.await;
        }),
    ));

    for tenant in ["a", "b"] {
        h.state.queue.submit(key(tenant), payload(tenant), Priority::Normal).await.unwrap();
    }

    let queue = Arc::clone(&h.state.queue);
    for tenant in ["a", "b"] {
        let mut done = false;
        for _ in 0..500 {
            if let Some(job) = queue.status(&key(tenant)).await {
                if job.state == JobState::Completed {
                    done = true;
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(done, "job for {} did not complete", tenant);
    }

    tx.send(()).unwrap();
    worker.await.unwrap();
}
