//! The `serve` command.

use anyhow::Context;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::info;

use crate::accounts::AccountStore;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::dispatch::ServerState;
use crate::report::TracingReporter;
use crate::server::Server;

/// Serve clients until Ctrl-C, then commit and exit.
pub fn cmd_serve(rt: &Runtime, config: &Config) -> anyhow::Result<()> {
    rt.block_on(async {
        let catalog = Catalog::open(&config.storage).context("Failed to load catalog")?;
        let accounts = AccountStore::open(
            &config.storage.credentials_path(),
            &config.accounts.email_pattern,
        )
        .context("Failed to load accounts")?;

        let server = Server::bind(
            config,
            ServerState::new(catalog, accounts),
            Arc::new(TracingReporter),
        )
        .await?;
        println!("Listening on {}", server.local_addr()?);

        let shutdown = server.shutdown_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(target: "server", "Interrupt received");
                shutdown.shutdown();
            }
        });

        let state = server.run().await?;
        info!(
            target: "server",
            songs = state.catalog.song_count(),
            playlists = state.catalog.playlist_count(),
            accounts = state.accounts.len(),
            "Server stopped"
        );
        Ok(())
    })
}
