//! Deployment job queue

pub mod fsm;
pub mod queue;
