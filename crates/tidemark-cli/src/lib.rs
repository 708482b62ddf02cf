//! Tidemark CLI - validate, plan and apply migrations against a local store.

pub mod commands;
pub mod config;
pub mod error;

pub use commands::run;
pub use config::{Args, Command};
pub use error::CliError;
