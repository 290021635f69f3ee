//! # rowvault
//!
//! Server and CLI around `rowvault-core`. The library target exposes the
//! router and configuration so integration tests can drive them directly.

pub mod api;
pub mod cli;
pub mod config;
