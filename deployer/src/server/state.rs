//! Server state

use std::sync::Arc;

use crate::jobs::queue::JobQueue;

/// Server state shared across handlers
pub struct ServerState {
    pub queue: Arc<JobQueue>,
}

impl ServerState {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self { queue }
    }
}
