//! Node supervisor daemon for a fleet of stream-processing engine nodes.
//!
//! The agent registers with a coordinator, serves its command stream,
//! supervises the local engine processes (crash detection and rate-limited
//! auto-restart) and reports their lifecycle events.

pub mod agent;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod metrics;
pub mod process;

#[cfg(test)]
mod testkit;

pub use agent::{Agent, AgentParts};
pub use config::AgentConfig;
