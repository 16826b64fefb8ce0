//! CLI command definitions and dispatch.
//!
//! Each subcommand is implemented in its own submodule:
//! - `serve`: run the streaming server until Ctrl-C
//! - `catalog`: offline catalog queries and maintenance
//! - `setup`: configuration file bootstrap

mod catalog;
mod serve;
mod setup;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::runtime::{Builder, Runtime};

use crate::config::{self, Config};

pub use catalog::{cmd_reindex, cmd_search, cmd_top};
pub use serve::cmd_serve;
pub use setup::cmd_init_config;

/// songstream CLI
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (default: the OS config directory)
    #[arg(short, long, global = true, env = "SONGSTREAM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory holding the catalog, credentials and songs
    #[arg(long, global = true, env = "SONGSTREAM_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the streaming server (default)
    Serve {
        /// Interface to bind
        #[arg(long, env = "SONGSTREAM_HOST")]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long, env = "SONGSTREAM_PORT")]
        port: Option<u16>,
    },
    /// Print the most played songs
    Top {
        /// How many songs to list
        #[arg(allow_negative_numbers = true)]
        count: i64,
    },
    /// Search the catalog by keywords
    Search {
        /// Keywords matched against titles and artists
        #[arg(required = true)]
        keywords: Vec<String>,
    },
    /// Rebuild the search index and rewrite all catalog stores
    Reindex,
    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Run the command given on the command line; `serve` when none is.
pub fn run_command(cli: &Cli) -> anyhow::Result<()> {
    let mut config = load_config(cli);

    match &cli.command {
        None => cmd_serve(&runtime()?, &config),
        Some(Commands::Serve { host, port }) => {
            if let Some(host) = host {
                config.server.host = host.clone();
            }
            if let Some(port) = port {
                config.server.port = *port;
            }
            cmd_serve(&runtime()?, &config)
        }
        Some(Commands::Top { count }) => cmd_top(&config, *count),
        Some(Commands::Search { keywords }) => cmd_search(&config, keywords),
        Some(Commands::Reindex) => cmd_reindex(&config),
        Some(Commands::InitConfig { force }) => cmd_init_config(cli.config.as_deref(), *force),
    }
}

// ============================================================================
// Shared helper functions
// ============================================================================

/// Configuration from file, with command-line overrides applied.
pub(crate) fn load_config(cli: &Cli) -> Config {
    let mut config = config::load(cli.config.as_deref());
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    config
}

/// The reactor is single-threaded; so is its runtime.
fn runtime() -> std::io::Result<Runtime> {
    Builder::new_current_thread().enable_all().build()
}
