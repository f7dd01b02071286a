//! Job queue and admission control
//!
//! Admission is idempotent per deployment key: a key that is already
//! deployed, or whose run is still fresh in the status store, is answered
//! from the store without scheduling anything. A key has at most one job
//! waiting or active at any time.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::deploy::pipeline::StepTracker;
use crate::deploy::ports::PortAllocator;
use crate::errors::DeployerError;
use crate::jobs::fsm::{JobEvent, JobFsm};
use crate::models::deployment::{
    DeploymentKey, DeploymentPayload, DeploymentRecord, DeploymentStatus, DeploymentTarget,
};
use crate::models::job::{JobRecord, JobState, Priority};
use crate::storage::status::StatusStore;
use crate::stream::broadcaster::{LogBroadcaster, Subscription};

/// Outcome of a submission
#[derive(Debug, Clone)]
pub enum Admission {
    /// A new job was created
    Queued(JobRecord),

    /// A recent run for the key is still in progress
    InProgress(DeploymentRecord),

    /// The key is already deployed
    AlreadyDeployed(DeploymentRecord),
}

/// Job handed to a worker
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub key: DeploymentKey,
    pub payload: DeploymentPayload,
    pub port: u16,

    /// The `in_progress` record written at admission
    pub record: DeploymentRecord,
    pub tracker: StepTracker,
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// `in_progress` records older than this no longer short-circuit
    pub stale_after: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug)]
struct JobEntry {
    fsm: JobFsm,
    priority: Priority,
    payload: DeploymentPayload,
    port: u16,
    record: DeploymentRecord,
    tracker: StepTracker,
    result: Option<DeploymentRecord>,
    submitted_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl JobEntry {
    fn snapshot(&self, key: &DeploymentKey) -> JobRecord {
        let state = self.fsm.state();
        JobRecord {
            id: key.clone(),
            state,
            priority: self.priority,
            progress: match state {
                JobState::Completed => 100,
                _ => self.tracker.progress(),
            },
            result: self.result.clone(),
            failure_reason: self.fsm.failure_reason().map(str::to_string),
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Entry of the ready heap: higher weight first, then lower sequence
#[derive(Debug, PartialEq, Eq)]
struct Ready {
    weight: u32,
    seq: u64,
    key: DeploymentKey,
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.weight
            .cmp(&other.weight)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<DeploymentKey, JobEntry>,
    ready: BinaryHeap<Ready>,
    next_seq: u64,
}

/// Deployment job queue
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    store: Arc<StatusStore>,
    logs: Arc<LogBroadcaster>,
    ports: Arc<PortAllocator>,
    options: QueueOptions,
}

impl JobQueue {
    pub fn new(
        store: Arc<StatusStore>,
        logs: Arc<LogBroadcaster>,
        ports: Arc<PortAllocator>,
        options: QueueOptions,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            store,
            logs,
            ports,
            options,
        }
    }

    /// Admit a deployment for `key`.
    ///
    /// Malformed and unsupported submissions are rejected before anything is
    /// read or written. When a job is queued, its `in_progress` record is
    /// already durable by the time this returns.
    pub async fn submit(
        &self,
        key: DeploymentKey,
        payload: DeploymentPayload,
        priority: Priority,
    ) -> Result<Admission, DeployerError> {
        payload.validate(&key)?;
        if let DeploymentTarget::Remote { .. } = payload.target {
            return Err(DeployerError::Unsupported("remote deployment is not supported".to_string()));
        }

        let mut state = self.state.lock().await;
        let now = Utc::now();

        let previous = match self.store.read(&key).await {
            Ok(previous) => previous,
            Err(DeployerError::JsonError(e)) => {
                warn!("[{}] Ignoring unreadable status record: {}", key, e);
                None
            }
            Err(e) => return Err(e),
        };
        if let Some(record) = &previous {
            match record.status {
                DeploymentStatus::Success => {
                    debug!("[{}] Already deployed, nothing to do", key);
                    return Ok(Admission::AlreadyDeployed(record.clone()));
                }
                DeploymentStatus::InProgress if !self.is_stale(record, now) => {
                    debug!("[{}] Deployment already in progress", key);
                    return Ok(Admission::InProgress(record.clone()));
                }
                _ => {}
            }
        }

        if let Some(entry) = state.jobs.get(&key) {
            if entry.fsm.state().is_pending() {
                return Err(DeployerError::AlreadyActive(key.to_string()));
            }
        }

        if let Some(owner) = self.domain_owner(&key, &payload.tenant.domain).await? {
            return Err(DeployerError::DomainConflict {
                domain: payload.tenant.domain.clone(),
                owner,
            });
        }

        let port = self.ports.resolve(&key, previous.as_ref())?;
        let record = DeploymentRecord::started(&key, &payload.tenant.domain, port, now);
        self.store.write(&key, &record).await?;
        self.logs.begin(&key);

        let seq = state.next_seq;
        state.next_seq += 1;
        let entry = JobEntry {
            fsm: JobFsm::new(),
            priority,
            payload,
            port,
            record,
            tracker: StepTracker::new(),
            result: None,
            submitted_at: now,
            started_at: None,
            finished_at: None,
        };
        let job = entry.snapshot(&key);
        state.jobs.insert(key.clone(), entry);
        state.ready.push(Ready {
            weight: priority.weight(),
            seq,
            key: key.clone(),
        });
        drop(state);

        info!("[{}] Queued deployment on port {} with {:?} priority", key, port, priority);
        self.notify.notify_one();
        Ok(Admission::Queued(job))
    }

    /// Current job state for `key`
    pub async fn status(&self, key: &DeploymentKey) -> Option<JobRecord> {
        let state = self.state.lock().await;
        state.jobs.get(key).map(|entry| entry.snapshot(key))
    }

    /// Lines of the current or last run: the live buffer if present,
    /// otherwise the persisted record
    pub async fn logs(&self, key: &DeploymentKey) -> Result<Option<Vec<String>>, DeployerError> {
        if let Some(lines) = self.logs.history(key) {
            return Ok(Some(lines));
        }
        Ok(self.store.read(key).await?.map(|record| record.logs))
    }

    /// Persisted record for `key`
    pub async fn record(&self, key: &DeploymentKey) -> Result<Option<DeploymentRecord>, DeployerError> {
        self.store.read(key).await
    }

    /// Live log subscription for `key`
    pub fn subscribe(&self, key: &DeploymentKey) -> Subscription {
        self.logs.subscribe(key)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.logs.unsubscribe(subscription)
    }

    pub async fn cancel(&self, key: &DeploymentKey) -> Result<(), DeployerError> {
        Err(DeployerError::NotImplemented(format!("cancelling deployment {}", key)))
    }

    /// Wait for the next ready job and mark it active
    pub async fn next_job(&self) -> ActiveJob {
        loop {
            if let Some(job) = self.try_next_job().await {
                return job;
            }
            self.notify.notified().await;
        }
    }

    /// Take the next ready job without waiting
    pub async fn try_next_job(&self) -> Option<ActiveJob> {
        let mut state = self.state.lock().await;
        while let Some(ready) = state.ready.pop() {
            let Some(entry) = state.jobs.get_mut(&ready.key) else {
                continue;
            };
            if let Err(e) = entry.fsm.process(JobEvent::Start) {
                warn!("[{}] Skipping queued job: {}", ready.key, e);
                continue;
            }
            entry.started_at = Some(Utc::now());
            let job = ActiveJob {
                key: ready.key.clone(),
                payload: entry.payload.clone(),
                port: entry.port,
                record: entry.record.clone(),
                tracker: entry.tracker.clone(),
            };
            let more = !state.ready.is_empty();
            drop(state);
            if more {
                // pass the wakeup on so idle workers drain the rest
                self.notify.notify_one();
            }
            return Some(job);
        }
        None
    }

    /// Record the terminal outcome of an active job
    pub async fn complete(&self, key: &DeploymentKey, record: DeploymentRecord) {
        let mut state = self.state.lock().await;
        let Some(entry) = state.jobs.get_mut(key) else {
            warn!("[{}] Completed a job that is not tracked", key);
            return;
        };

        let event = match record.status {
            DeploymentStatus::Success => JobEvent::Complete,
            _ => JobEvent::Fail(record.error.clone().unwrap_or_else(|| "deployment failed".to_string())),
        };
        if let Err(e) = entry.fsm.process(event) {
            warn!("[{}] {}", key, e);
        }
        entry.finished_at = Some(Utc::now());
        entry.result = Some(record);
    }

    /// Another key whose deployment holds `domain`. Failed runs have had
    /// their proxy config rolled back and hold nothing.
    async fn domain_owner(&self, key: &DeploymentKey, domain: &str) -> Result<Option<String>, DeployerError> {
        let owner = self.store.list().await?.into_iter().find(|record| {
            record.domain.as_deref() == Some(domain)
                && record.status != DeploymentStatus::Failed
                && (record.template_id != key.template_id() || record.tenant_id != key.tenant_id())
        });
        Ok(owner.map(|record| format!("{}/{}", record.template_id, record.tenant_id)))
    }

    fn is_stale(&self, record: &DeploymentRecord, now: DateTime<Utc>) -> bool {
        match record.age(now).to_std() {
            Ok(age) => age >= self.options.stale_after,
            // updated in the future: treat as fresh
            Err(_) => false,
        }
    }
}
