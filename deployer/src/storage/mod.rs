//! Persistent state

pub mod layout;
pub mod settings;
pub mod status;
