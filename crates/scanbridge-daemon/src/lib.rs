//! Scanbridge daemon
//!
//! HTTP endpoint in front of the simulated scanner, plus the configuration
//! shared with the one-shot scan client.

pub mod api;
pub mod config;
pub mod server;
pub mod state;
