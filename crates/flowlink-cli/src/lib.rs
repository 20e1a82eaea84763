//! flowlink CLI library
//!
//! An echo server and client over TCP links, used to exercise the channel,
//! heartbeat and recovery strategies outside of tests.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands};
pub use commands::{CommandDispatcher, Text};
pub use config::{AppConfig, Strategies};
pub use error::{CliError, Result};
