//! In-memory catalog of songs, playlists and the keyword index.
//!
//! The catalog is owned by the reactor and mutated only from there. Stream
//! tasks never touch it; they get a resolved file path up front.
//!
//! # Persistence
//!
//! Mutations set a dirty flag. [`Catalog::commit`] rebuilds the index from the
//! song set and rewrites all three stores, or does nothing when clean.

pub mod index;
pub mod store;

use std::path::{Path, PathBuf};

use crate::config::StorageConfig;
use crate::error::Result;
use crate::model::{Playlist, Song, SongKey};

pub use index::{Index, Stopwords, tokenize};
pub use store::{CatalogFiles, PlaylistTable, SongTable};

/// Reply when a search matches nothing.
pub const NO_RESULTS: &str = "We couldn't find any songs based on your query";

/// Reply when `top` is asked for zero or fewer songs.
pub const INVALID_COUNT: &str = "Cannot find a negative number of top songs";

/// Expected catalog failures. These are user-facing and never incidents.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error(
        "Playlist with this name already exists. Please choose another name or add songs to the already existing playlist"
    )]
    PlaylistExists,

    #[error(
        "No playlist with this name was found. Please choose another playlist or create it before adding a song to it"
    )]
    PlaylistNotFound,

    #[error("The song {0} was not found")]
    SongNotFound(String),

    #[error("Song {0} already exists in this playlist")]
    SongAlreadyInPlaylist(String),

    #[error("Song {0} was not found")]
    UnknownSong(String),

    #[error("We know about the requested song, but it doesn't exist in our database. It cannot be played.")]
    SourceMissing,
}

/// Songs, playlists and their index.
#[derive(Debug)]
pub struct Catalog {
    songs: SongTable,
    playlists: PlaylistTable,
    index: Index,
    stopwords: Stopwords,
    songs_dir: PathBuf,
    files: Option<CatalogFiles>,
    dirty: bool,
}

impl Catalog {
    /// In-memory catalog with no backing files; `commit` only rebuilds the index.
    pub fn new(
        songs: impl IntoIterator<Item = Song>,
        stopwords: Stopwords,
        songs_dir: impl Into<PathBuf>,
    ) -> Self {
        let mut table = SongTable::new();
        for song in songs {
            insert_song(&mut table, song);
        }
        let index = Index::build(table.values().flatten().map(|s| &s.key), &stopwords);
        Self {
            songs: table,
            playlists: PlaylistTable::new(),
            index,
            stopwords,
            songs_dir: songs_dir.into(),
            files: None,
            dirty: false,
        }
    }

    /// Load the catalog described by `storage`.
    ///
    /// Missing stores start empty. A stored index that disagrees with the
    /// songs is logged and replaced on the next commit.
    pub fn open(storage: &StorageConfig) -> Result<Self> {
        let files = CatalogFiles::from_config(storage);
        let stopwords = Stopwords::load(&storage.stopwords_path())?;
        let songs = files.load_songs()?;
        let playlists = files.load_playlists()?;
        let stored_index = files.load_index()?;

        let index = Index::build(songs.values().flatten().map(|s| &s.key), &stopwords);
        let dirty = stored_index != index;
        if dirty {
            tracing::warn!(
                target: "catalog",
                stored = stored_index.len(),
                rebuilt = index.len(),
                "Stored index is out of date, it will be rewritten"
            );
        }

        let catalog = Self {
            songs,
            playlists,
            index,
            stopwords,
            songs_dir: storage.songs_dir_path(),
            files: Some(files),
            dirty,
        };
        tracing::info!(
            target: "catalog",
            songs = catalog.song_count(),
            playlists = catalog.playlist_count(),
            tokens = catalog.index.len(),
            "Catalog loaded"
        );
        Ok(catalog)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// First stored song with `title`.
    pub fn song(&self, title: &str) -> Option<&Song> {
        self.songs.get(title).and_then(|songs| songs.first())
    }

    fn song_by_key(&self, key: &SongKey) -> Option<&Song> {
        self.songs
            .get(&key.title)
            .and_then(|songs| songs.iter().find(|s| &s.key == key))
    }

    pub fn songs(&self) -> impl Iterator<Item = &Song> {
        self.songs.values().flatten()
    }

    pub fn song_count(&self) -> usize {
        self.songs.values().map(Vec::len).sum()
    }

    pub fn playlist_count(&self) -> usize {
        self.playlists.values().map(|p| p.len()).sum()
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Songs matching `keywords`, best matches first.
    pub fn search_songs(&self, keywords: &[String]) -> Vec<&Song> {
        self.index
            .rank(keywords, &self.stopwords)
            .into_iter()
            .filter_map(|(key, _)| self.song_by_key(&key))
            .collect()
    }

    /// Rendered search results, one song per line.
    pub fn search(&self, keywords: &[String]) -> String {
        let found = self.search_songs(keywords);
        if found.is_empty() {
            return NO_RESULTS.to_string();
        }
        render_songs(found)
    }

    /// The `n` most played songs, most played first.
    pub fn top_songs(&self, n: usize) -> Vec<&Song> {
        let mut all: Vec<&Song> = self.songs().collect();
        all.sort_by(|a, b| b.plays.cmp(&a.plays));
        all.truncate(n);
        all
    }

    /// Rendered top list; `n <= 0` yields [`INVALID_COUNT`].
    pub fn top(&self, n: i64) -> String {
        if n <= 0 {
            return INVALID_COUNT.to_string();
        }
        let n = usize::try_from(n).unwrap_or(usize::MAX);
        render_songs(self.top_songs(n))
    }

    /// The caller's playlist named `name`, or failing that any account's.
    pub fn get_playlist(&self, email: &str, name: &str) -> Result<&Playlist, CatalogError> {
        if let Some(own) = self.playlists.get(email).and_then(|p| p.get(name)) {
            return Ok(own);
        }
        self.playlists
            .values()
            .find_map(|owned| owned.get(name))
            .ok_or(CatalogError::PlaylistNotFound)
    }

    /// Resolve `title` to a song whose audio file exists.
    pub fn playable(&self, title: &str) -> Result<(SongKey, PathBuf), CatalogError> {
        let song = self
            .song(title)
            .ok_or_else(|| CatalogError::UnknownSong(title.to_string()))?;
        let path = song.key.source_path(&self.songs_dir);
        if !path.is_file() {
            return Err(CatalogError::SourceMissing);
        }
        Ok((song.key.clone(), path))
    }

    pub fn songs_dir(&self) -> &Path {
        &self.songs_dir
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    pub fn create_playlist(&mut self, email: &str, name: &str) -> Result<(), CatalogError> {
        let owned = self.playlists.entry(email.to_string()).or_default();
        if owned.contains_key(name) {
            return Err(CatalogError::PlaylistExists);
        }
        owned.insert(name.to_string(), Playlist::new(name));
        self.dirty = true;
        tracing::debug!(target: "catalog", user = %email, playlist = %name, "Playlist created");
        Ok(())
    }

    pub fn add_song_to_playlist(
        &mut self,
        email: &str,
        playlist: &str,
        title: &str,
    ) -> Result<(), CatalogError> {
        if !self
            .playlists
            .get(email)
            .is_some_and(|owned| owned.contains_key(playlist))
        {
            return Err(CatalogError::PlaylistNotFound);
        }
        let key = self
            .song(title)
            .map(|s| s.key.clone())
            .ok_or_else(|| CatalogError::SongNotFound(title.to_string()))?;

        let target = self
            .playlists
            .get_mut(email)
            .and_then(|owned| owned.get_mut(playlist))
            .ok_or(CatalogError::PlaylistNotFound)?;
        if !target.add(key) {
            return Err(CatalogError::SongAlreadyInPlaylist(title.to_string()));
        }
        self.dirty = true;
        Ok(())
    }

    /// Count one play of `key`. Returns `false` for an unknown song.
    pub fn record_play(&mut self, key: &SongKey) -> bool {
        let Some(song) = self
            .songs
            .get_mut(&key.title)
            .and_then(|songs| songs.iter_mut().find(|s| &s.key == key))
        else {
            return false;
        };
        song.record_play();
        self.dirty = true;
        true
    }

    /// Force the next commit to rebuild and rewrite everything.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Rebuild the index and write all stores if anything changed.
    ///
    /// Returns whether a write happened.
    pub fn commit(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        self.index = Index::build(self.songs().map(|s| &s.key), &self.stopwords);
        if let Some(files) = &self.files {
            files.save(&self.songs, &self.playlists, &self.index)?;
            tracing::info!(target: "catalog", songs = self.song_count(), "Catalog committed");
        }
        self.dirty = false;
        Ok(true)
    }
}

fn insert_song(table: &mut SongTable, song: Song) {
    let bucket = table.entry(song.key.title.clone()).or_default();
    if !bucket.iter().any(|s| s.key == song.key) {
        bucket.push(song);
    }
}

fn render_songs<'a>(songs: impl IntoIterator<Item = &'a Song>) -> String {
    songs
        .into_iter()
        .map(Song::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}
