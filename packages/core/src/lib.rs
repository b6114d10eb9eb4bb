//! Percentile gas price estimation for EVM chains.
//!
//! The [`gasprice`] module holds the core (head tracking, per-block fee
//! sampling, percentile aggregation). [`services`] provides chain-data
//! providers, [`handler`] the HTTP surface and [`config`] the CLI.

pub mod config;
pub mod error;
pub mod gasprice;
pub mod handler;
pub mod services;
