//! Live deployment log streaming

pub mod broadcaster;
pub mod sink;
