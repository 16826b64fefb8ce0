//! Keyword inverted index and stopword handling.
//!
//! The index maps every lowercase, non-stopword token appearing in a song's
//! title or artist to the songs containing it. It is always derived from the
//! song set; nothing patches it incrementally.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use crate::error::{Result, ResultExt};
use crate::model::SongKey;

/// Words ignored by both indexing and searching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stopwords(HashSet<String>);

impl Stopwords {
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            words
                .into_iter()
                .map(|w| w.as_ref().trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect(),
        )
    }

    /// Load one word per line. A missing file yields an empty set.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(target: "catalog", path = %path.display(), "No stopwords file");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(format!("reading stopwords from {}", path.display()))?;
        Ok(Self::from_words(contents.lines()))
    }

    pub fn contains(&self, word: &str) -> bool {
        self.0.contains(word)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Split `text` into lowercase tokens, dropping stopwords.
pub fn tokenize<'a>(text: &'a str, stopwords: &'a Stopwords) -> impl Iterator<Item = String> + 'a {
    text.split_whitespace()
        .map(str::to_lowercase)
        .filter(move |token| !stopwords.contains(token))
}

/// Token → songs whose title or artist contain it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Index {
    entries: BTreeMap<String, Vec<SongKey>>,
}

impl Index {
    /// Build the index from scratch.
    pub fn build<'a, I>(songs: I, stopwords: &Stopwords) -> Self
    where
        I: IntoIterator<Item = &'a SongKey>,
    {
        let mut entries: BTreeMap<String, Vec<SongKey>> = BTreeMap::new();
        for song in songs {
            let tokens: HashSet<String> = tokenize(&song.title, stopwords)
                .chain(tokenize(&song.artist, stopwords))
                .collect();
            for token in tokens {
                let bucket = entries.entry(token).or_default();
                if !bucket.contains(song) {
                    bucket.push(song.clone());
                }
            }
        }
        Self { entries }
    }

    pub fn lookup(&self, token: &str) -> &[SongKey] {
        self.entries.get(token).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Songs matching any of `keywords`, with how many distinct keywords each
    /// matched, most matches first.
    ///
    /// Keywords are lowercased, split on whitespace, stripped of stopwords and
    /// deduplicated. Equal counts keep the order in which songs were first hit.
    pub fn rank(&self, keywords: &[String], stopwords: &Stopwords) -> Vec<(SongKey, usize)> {
        let mut seen = HashSet::new();
        let mut ranked: Vec<(SongKey, usize)> = Vec::new();
        let mut position: HashMap<&SongKey, usize> = HashMap::new();

        for token in keywords.iter().flat_map(|k| tokenize(k, stopwords)) {
            if !seen.insert(token.clone()) {
                continue;
            }
            for song in self.lookup(&token) {
                match position.get(song) {
                    Some(&at) => ranked[at].1 += 1,
                    None => {
                        position.insert(song, ranked.len());
                        ranked.push((song.clone(), 1));
                    }
                }
            }
        }

        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
