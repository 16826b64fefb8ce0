//! JSON persistence for the catalog.
//!
//! Three independent stores, each rewritten in full on commit:
//! - songs: title → songs sharing that title
//! - playlists: account email → playlist name → playlist
//! - index: token → song identities

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::index::Index;
use crate::config::StorageConfig;
use crate::error::{Error, Result, ResultExt};
use crate::model::{Playlist, Song};

pub type SongTable = BTreeMap<String, Vec<Song>>;
pub type PlaylistTable = BTreeMap<String, BTreeMap<String, Playlist>>;

/// Locations of the three catalog stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogFiles {
    pub songs: PathBuf,
    pub playlists: PathBuf,
    pub index: PathBuf,
}

impl CatalogFiles {
    pub fn from_config(storage: &StorageConfig) -> Self {
        Self {
            songs: storage.songs_path(),
            playlists: storage.playlists_path(),
            index: storage.index_path(),
        }
    }

    pub fn load_songs(&self) -> Result<SongTable> {
        read_json(&self.songs)
    }

    pub fn load_playlists(&self) -> Result<PlaylistTable> {
        read_json(&self.playlists)
    }

    pub fn load_index(&self) -> Result<Index> {
        read_json(&self.index)
    }

    pub fn save(&self, songs: &SongTable, playlists: &PlaylistTable, index: &Index) -> Result<()> {
        write_json(&self.songs, songs)?;
        write_json(&self.playlists, playlists)?;
        write_json(&self.index, index)?;
        Ok(())
    }
}

/// Read a JSON store. A missing file is an empty store; unparsable content
/// is a [`Error::Storage`].
fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        tracing::info!(target: "catalog", path = %path.display(), "Store missing, starting empty");
        return Ok(T::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(format!("reading {}", path.display()))?;
    if contents.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&contents).map_err(|e| Error::storage(path, e.to_string()))
}

/// Write pretty JSON atomically (temp file, then rename).
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(format!("creating {}", dir.display()))?;
    }
    let contents = serde_json::to_string_pretty(value)?;
    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, contents)
        .with_context(format!("writing {}", temp_path.display()))?;
    std::fs::rename(&temp_path, path).with_context(format!("replacing {}", path.display()))?;
    tracing::debug!(target: "catalog", path = %path.display(), "Store written");
    Ok(())
}
