//! Offline catalog commands.

use anyhow::Context;

use crate::catalog::Catalog;
use crate::config::Config;

/// Print the `count` most played songs.
pub fn cmd_top(config: &Config, count: i64) -> anyhow::Result<()> {
    let catalog = open(config)?;
    println!("{}", catalog.top(count));
    Ok(())
}

/// Print the songs matching `keywords`, best match first.
pub fn cmd_search(config: &Config, keywords: &[String]) -> anyhow::Result<()> {
    let catalog = open(config)?;
    println!("{}", catalog.search(keywords));
    Ok(())
}

/// Rebuild the index and rewrite every catalog store.
pub fn cmd_reindex(config: &Config) -> anyhow::Result<()> {
    let mut catalog = open(config)?;
    catalog.mark_dirty();
    catalog.commit().context("Failed to write catalog")?;
    println!(
        "Reindexed {} songs: {} tokens, {} playlists",
        catalog.song_count(),
        catalog.index().len(),
        catalog.playlist_count()
    );
    Ok(())
}

fn open(config: &Config) -> anyhow::Result<Catalog> {
    Catalog::open(&config.storage).with_context(|| {
        format!(
            "Failed to load catalog from {}",
            config.storage.data_dir.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_config;

    #[test]
    fn test_reindex_writes_all_stores() {
        let dir = tempfile::tempdir().unwrap();
        let config = temp_config(dir.path());
        assert!(!config.storage.index_path().exists());

        cmd_reindex(&config).unwrap();

        assert!(config.storage.index_path().exists());
        assert!(config.storage.playlists_path().exists());
        let reopened = Catalog::open(&config.storage).unwrap();
        assert!(!reopened.is_dirty());
        assert_eq!(reopened.song_count(), 5);
    }

    #[test]
    fn test_queries_on_missing_data_dir_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = dir.path().join("nothing-here");

        cmd_top(&config, 3).unwrap();
        cmd_search(&config, &["smooth".to_string()]).unwrap();
    }
}
