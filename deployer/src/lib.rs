//! Tenant Deployer Library
//!
//! Deployment job engine: provisions one supervised web application per
//! (template, tenant) pair behind an nginx reverse proxy.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod jobs;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod stream;
pub mod utils;
pub mod workers;
