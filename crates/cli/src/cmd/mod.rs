//! CLI command implementations

pub mod cleanup;
pub mod config;
pub mod delete;
pub mod list;
pub mod run;
pub mod snapshot;
pub mod status;
