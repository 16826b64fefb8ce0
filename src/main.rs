//! songstream - a session-oriented music streaming server.
//!
//! Clients connect over TCP, log in with line-based text commands, query and
//! curate the song catalog, and receive songs as a framed binary audio stream
//! on the same connection. The catalog can also be queried and reindexed
//! offline through CLI subcommands.

pub mod accounts;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod report;
pub mod server;
pub mod session;
pub mod stream;
#[cfg(test)]
pub mod test_utils;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_TARGETS: [&str; 8] = [
    "server", "dispatch", "session", "stream", "catalog", "accounts", "config", "incident",
];

fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    // Initialize logging
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(log_filter(env.as_deref())?)
        .init();

    cli::run_command(&args)
}

/// `RUST_LOG` directives when given, otherwise info for every component target.
fn log_filter(env: Option<&str>) -> anyhow::Result<EnvFilter> {
    if let Some(directives) = env.filter(|d| !d.trim().is_empty()) {
        return Ok(EnvFilter::try_new(directives)?);
    }
    let mut filter = EnvFilter::new("songstream=info");
    for target in LOG_TARGETS {
        filter = filter.add_directive(format!("{target}=info").parse()?);
    }
    Ok(filter)
}
