//! Shared library surface for the `infologger-server` and `infologgerd`
//! binaries: config loading, CLI flags, shutdown signal handling, the
//! collector daemon, the dispatch hub, and the three consumers.

pub mod cli;
pub mod collector;
pub mod config;
pub mod consumers;
pub mod hub;
pub mod signal;
