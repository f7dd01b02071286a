//! Deployment module

pub mod command;
pub mod executor;
pub mod pipeline;
pub mod ports;
pub mod proxy;
pub mod rollback;
pub mod supervisor;
