pub mod agent;
pub mod api;
pub mod broker;
pub mod config;
pub mod deployment;
pub mod error;
pub mod model;
pub mod multiregion;
pub mod plan;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod state;
pub mod status;
