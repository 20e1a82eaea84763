//! Command-line interface definitions and parsing

use std::net::SocketAddr;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path (TOML)
    #[arg(short, long)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Accept connections and echo every text event back
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:7400")]
        bind: SocketAddr,
    },
    /// Connect, send text events and wait for their echoes
    Connect {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:7400")]
        addr: SocketAddr,
        /// Number of events to send
        #[arg(short = 'n', long, default_value_t = 10)]
        count: u32,
        /// Message body
        #[arg(short, long, default_value = "hello")]
        message: String,
    },
    /// Print the effective configuration as TOML
    Config,
}
