//! Test utilities and fixtures for songstream tests.
//!
//! Provides a small known catalog, a WAV writer for streaming tests, a
//! reporter that remembers incidents, and a server running on a temporary
//! data directory.
//!
//! # Example
//!
//! ```ignore
//! use crate::test_utils::TempServer;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let server = TempServer::start().await;
//!     // connect to server.addr ...
//!     let state = server.stop().await;
//! }
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use crate::accounts::AccountStore;
use crate::catalog::{Catalog, SongTable, Stopwords};
use crate::config::{Config, StorageConfig};
use crate::dispatch::ServerState;
use crate::error::{Error, Result};
use crate::model::{Song, SongKey};
use crate::report::ErrorReporter;
use crate::server::{Server, ShutdownHandle};
use crate::stream::Framing;

/// Stopwords used by every fixture catalog.
pub const FIXTURE_STOPWORDS: [&str; 4] = ["the", "my", "a", "da"];

/// Five songs with distinct play counts, most played first.
pub fn fixture_songs() -> Vec<Song> {
    vec![
        Song::new("Smooth", "Santana", 143).with_plays(4),
        Song::new("Into The Night", "Santana", 140).with_plays(3),
        Song::new("Unchain My Heart", "Joe Cocker", 205).with_plays(2),
        Song::new("Morirò da Re", "Måneskin", 111).with_plays(1),
        Song::new("Losing My Religion", "R.E.M.", 210).with_plays(0),
    ]
}

/// In-memory catalog over [`fixture_songs`], reading audio from `songs_dir`.
pub fn fixture_catalog(songs_dir: &Path) -> Catalog {
    Catalog::new(
        fixture_songs(),
        Stopwords::from_words(FIXTURE_STOPWORDS),
        songs_dir,
    )
}

/// Write a 44.1 kHz, 16-bit, stereo PCM WAV file holding `data`.
pub fn write_wav(path: &Path, data: &[u8]) {
    const SAMPLE_RATE: u32 = 44_100;
    const CHANNELS: u16 = 2;
    const BITS: u16 = 16;
    let block_align = CHANNELS * BITS / 8;
    let byte_rate = SAMPLE_RATE * u32::from(block_align);

    let mut wav = Vec::with_capacity(44 + data.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data.len() as u32).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&CHANNELS.to_le_bytes());
    wav.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&BITS.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&(data.len() as u32).to_le_bytes());
    wav.extend_from_slice(data);

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).expect("Failed to create songs directory");
    }
    std::fs::write(path, wav).expect("Failed to write WAV file");
}

/// Reporter that keeps `(identity, message)` pairs for assertions.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    incidents: Mutex<Vec<(String, String)>>,
}

impl RecordingReporter {
    pub fn incidents(&self) -> Vec<(String, String)> {
        self.incidents.lock().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, identity: &str, error: &Error) {
        self.incidents
            .lock()
            .push((identity.to_string(), error.to_string()));
    }
}

/// Lay out a data directory under `root` holding the fixture songs and
/// stopwords, with fast streaming settings.
pub fn temp_config(root: &Path) -> Config {
    let storage = StorageConfig::rooted(root);

    let mut table = SongTable::new();
    for song in fixture_songs() {
        table.entry(song.key.title.clone()).or_default().push(song);
    }
    let songs_path = storage.songs_path();
    std::fs::create_dir_all(songs_path.parent().expect("songs file has a parent"))
        .expect("Failed to create media directory");
    std::fs::write(
        &songs_path,
        serde_json::to_string_pretty(&table).expect("Failed to serialize songs"),
    )
    .expect("Failed to write songs store");
    std::fs::write(storage.stopwords_path(), FIXTURE_STOPWORDS.join("\n"))
        .expect("Failed to write stopwords");

    let mut config = Config::default();
    config.storage = storage;
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.server.max_line_length = 256;
    config.streaming.chunk_size = 64;
    config.streaming.pacing_ms = 5;
    config.streaming.write_timeout_ms = 2_000;
    config.streaming.framing = Framing::LengthPrefixed;
    config
}

/// A server running in the background on an ephemeral port.
pub struct TempServer {
    pub addr: SocketAddr,
    pub config: Config,
    pub reporter: Arc<RecordingReporter>,
    pub shutdown: ShutdownHandle,
    task: JoinHandle<Result<ServerState>>,
    dir: TempDir,
}

impl TempServer {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp directory");
        let config = temp_config(dir.path());

        let catalog = Catalog::open(&config.storage).expect("Failed to open fixture catalog");
        let accounts = AccountStore::open(
            &config.storage.credentials_path(),
            &config.accounts.email_pattern,
        )
        .expect("Failed to open credentials");
        let reporter = Arc::new(RecordingReporter::default());

        let server = Server::bind(&config, ServerState::new(catalog, accounts), reporter.clone())
            .await
            .expect("Failed to bind test server");
        let addr = server.local_addr().expect("Listener has no address");
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(server.run());

        Self {
            addr,
            config,
            reporter,
            shutdown,
            task,
            dir,
        }
    }

    /// Where the audio file for the given song is expected.
    pub fn song_path(&self, title: &str, artist: &str, duration: u32) -> PathBuf {
        SongKey::new(title, artist, duration).source_path(&self.config.storage.songs_dir_path())
    }

    /// Shut down and return the final state.
    pub async fn stop(self) -> ServerState {
        self.stop_keeping_data().await.0
    }

    /// Shut down, keeping the data directory alive for inspection.
    pub async fn stop_keeping_data(self) -> (ServerState, TempDir) {
        self.shutdown.shutdown();
        let state = self
            .task
            .await
            .expect("Server task panicked")
            .expect("Server failed");
        (state, self.dir)
    }
}
