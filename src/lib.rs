pub mod commands;
pub mod config;
pub mod error;
pub mod git;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod output;
pub mod parse;
pub mod provider;
pub mod store;
pub mod task_id;
pub mod transform;
pub mod validate;
