//! Tooling & Integration Layer
//!
//! Command-line entry points for running and inspecting a replica.

pub mod cli;

pub use cli::{Cli, CliContext, Commands};
