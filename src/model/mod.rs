//! Core data models for the catalog.
//!
//! Defines the primary entities: [`Song`] and [`Playlist`], plus the
//! [`SongKey`] identity used wherever a song is referenced rather than owned
//! (playlists, the keyword index).
//!
//! # Identity
//!
//! Two songs are the same song when title, artist and duration match.
//! The play counter is not part of the identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Immutable identity of a song.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SongKey {
    pub title: String,
    pub artist: String,
    /// Duration in seconds
    pub duration: u32,
}

impl SongKey {
    pub fn new(title: impl Into<String>, artist: impl Into<String>, duration: u32) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            duration,
        }
    }

    /// Location of the song's audio inside `songs_dir`.
    pub fn source_path(&self, songs_dir: &Path) -> PathBuf {
        songs_dir.join(format!(
            "{} - {} - {}.wav",
            self.artist, self.title, self.duration
        ))
    }
}

impl fmt::Display for SongKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.artist, self.title)
    }
}

/// A song in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Song {
    #[serde(flatten)]
    pub key: SongKey,
    /// Completed `play` invocations; only ever increases
    #[serde(default)]
    pub plays: u64,
}

impl Song {
    pub fn new(title: impl Into<String>, artist: impl Into<String>, duration: u32) -> Self {
        Self {
            key: SongKey::new(title, artist, duration),
            plays: 0,
        }
    }

    /// Builder-style play count, mostly for fixtures.
    pub fn with_plays(mut self, plays: u64) -> Self {
        self.plays = plays;
        self
    }

    pub fn record_play(&mut self) {
        self.plays += 1;
    }
}

impl fmt::Display for Song {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.key.fmt(f)
    }
}

/// A named, insertion-ordered collection of distinct songs owned by one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    pub name: String,
    songs: Vec<SongKey>,
}

impl Playlist {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            songs: Vec::new(),
        }
    }

    pub fn contains(&self, song: &SongKey) -> bool {
        self.songs.contains(song)
    }

    /// Append `song`; returns `false` (and leaves the playlist untouched)
    /// when it is already present.
    pub fn add(&mut self, song: SongKey) -> bool {
        if self.contains(&song) {
            return false;
        }
        self.songs.push(song);
        true
    }

    pub fn len(&self) -> usize {
        self.songs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.songs.is_empty()
    }

    /// Name line followed by numbered entries.
    pub fn render(&self) -> String {
        let mut lines = vec![self.name.clone()];
        lines.extend(
            self.songs
                .iter()
                .enumerate()
                .map(|(i, song)| format!("{}. {}", i + 1, song)),
        );
        lines.join("\n")
    }
}
