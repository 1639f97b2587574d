//! relog node: HTTP API, node configuration, master/secondary CLI

pub mod api;
pub mod cli;
pub mod config;

pub use config::NodeConfig;
