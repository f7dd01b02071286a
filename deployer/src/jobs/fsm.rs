//! Finite State Machine for queued jobs

use crate::models::job::JobState;

/// Job event
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A worker picked the job up
    Start,

    /// Pipeline reached `success`
    Complete,

    /// Pipeline reached `failed`
    Fail(String),
}

/// Job FSM
#[derive(Debug, Clone)]
pub struct JobFsm {
    state: JobState,
    failure_reason: Option<String>,
}

impl JobFsm {
    /// Create a new FSM in waiting state
    pub fn new() -> Self {
        Self {
            state: JobState::Waiting,
            failure_reason: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Get failure reason if any
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: JobEvent) -> Result<(), String> {
        let new_state = match (&self.state, &event) {
            (JobState::Waiting, JobEvent::Start) => JobState::Active,
            (JobState::Active, JobEvent::Complete) => JobState::Completed,
            (JobState::Active, JobEvent::Fail(reason)) => {
                self.failure_reason = Some(reason.clone());
                JobState::Failed
            }

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }
}

impl Default for JobFsm {
    fn default() -> Self {
        Self::new()
    }
}
