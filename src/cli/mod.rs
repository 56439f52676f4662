use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Remote job execution fabric: endpoint agent and mediating server.
#[derive(Parser)]
#[command(name = "opsfabric", version, about)]
pub struct Cli {
    /// Path to the config file (defaults to ~/.opsfabric/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the endpoint agent on this host.
    Agent,
    /// Run the mediating server.
    Server {
        /// Listen host, overriding the config file.
        #[arg(long)]
        host: Option<String>,
        /// Listen port, overriding the config file.
        #[arg(long)]
        port: Option<u16>,
    },
}
