//! # Forest Agent
//!
//! The HTTP side of the admin agent: an axum router serving the admin UI,
//! session authentication, the client of the remote authorization service
//! and the services that cache what it answers.
//!
//! Hosts embed the agent by building an [`api::AppState`] and merging
//! [`api::build_router`] into their own router. The `forest-agent` binary
//! does the same from command line settings.

pub mod api;
pub mod cli;
pub mod client;
pub mod config;

// Re-export forest_core for convenience
pub use forest_core;

pub use api::{AppState, build_router};
pub use client::{ClientError, ForestClient};
pub use config::AgentConfig;
