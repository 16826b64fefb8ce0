//! Command dispatcher.
//!
//! Turns one protocol line into an [`Outcome`]: the reply to send and what
//! the reactor must do with the connection afterwards. All catalog, account
//! and session mutation happens here, on the reactor task.
//!
//! Failures come in two kinds. Expected ones (bad arity, unknown song, not
//! logged in...) become an `Error! <reason>` reply. Unexpected ones become a
//! generic reply and are handed to the [`ErrorReporter`].

pub mod command;

use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::accounts::{AccountError, AccountStore};
use crate::catalog::{Catalog, CatalogError};
use crate::error::Error;
use crate::report::{ErrorReporter, UNKNOWN_IDENTITY};
use crate::session::{ConnId, SessionError, SessionRegistry};
use crate::stream::{AudioSource, BoxedWriter, StreamEngine, StreamRequest};

pub use command::Command;

/// Prefix of every failure reply.
pub const ERROR_PREFIX: &str = "Error!";

const NOT_LOGGED_IN: &str = "Please log in to perform this action";
const TOO_MANY_STREAMS: &str = "The server is streaming too many songs right now. Please try again later";

/// Why a command produced an error reply.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Invalid number of parameters for the command")]
    Arity,

    #[error("Unknown command")]
    Unknown,

    #[error("{0}")]
    InvalidArgument(String),

    /// An expected, user-facing failure
    #[error("{0}")]
    Domain(String),

    /// Anything else; reported, and answered without detail
    #[error("A failure happened for unknown reasons")]
    Unexpected(#[source] Error),
}

impl CommandError {
    /// The reply line for this error.
    pub fn response(&self) -> String {
        format!("{ERROR_PREFIX} {self}")
    }
}

impl From<Error> for CommandError {
    fn from(e: Error) -> Self {
        CommandError::Unexpected(e)
    }
}

impl From<CatalogError> for CommandError {
    fn from(e: CatalogError) -> Self {
        CommandError::Domain(e.to_string())
    }
}

impl From<SessionError> for CommandError {
    fn from(e: SessionError) -> Self {
        CommandError::Domain(e.to_string())
    }
}

impl From<AccountError> for CommandError {
    fn from(e: AccountError) -> Self {
        match e {
            AccountError::Storage(inner) => CommandError::Unexpected(inner),
            other => CommandError::Domain(other.to_string()),
        }
    }
}

/// Text going back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Line(String),
    /// Produced but not sent; the stream's own stop frame answers instead
    Suppressed(String),
}

impl Reply {
    pub fn text(&self) -> &str {
        match self {
            Reply::Line(text) | Reply::Suppressed(text) => text,
        }
    }
}

/// What the reactor does once the reply is out.
pub enum After {
    Continue,
    Close,
    /// Give the connection's writer to a freshly started stream
    HandOver(oneshot::Sender<BoxedWriter>),
}

impl fmt::Debug for After {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            After::Continue => "Continue",
            After::Close => "Close",
            After::HandOver(_) => "HandOver",
        })
    }
}

/// Result of dispatching one line.
#[derive(Debug)]
pub struct Outcome {
    pub reply: Reply,
    /// Writer returned by a stream that just ended
    pub reclaimed: Option<Reclaimed>,
    pub after: After,
}

/// A writer coming back from a joined stream.
pub struct Reclaimed(pub Option<BoxedWriter>);

impl fmt::Debug for Reclaimed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reclaimed(writer: {})", self.0.is_some())
    }
}

impl Outcome {
    fn line(text: impl Into<String>) -> Self {
        Self {
            reply: Reply::Line(text.into()),
            reclaimed: None,
            after: After::Continue,
        }
    }
}

/// State owned by the reactor and mutated by commands.
#[derive(Debug)]
pub struct ServerState {
    pub catalog: Catalog,
    pub accounts: AccountStore,
    pub sessions: SessionRegistry,
}

impl ServerState {
    pub fn new(catalog: Catalog, accounts: AccountStore) -> Self {
        Self {
            catalog,
            accounts,
            sessions: SessionRegistry::new(),
        }
    }

    fn identity(&self, conn: ConnId) -> String {
        self.sessions
            .username_of(conn)
            .unwrap_or(UNKNOWN_IDENTITY)
            .to_string()
    }
}

/// Executes commands against [`ServerState`].
pub struct Dispatcher {
    engine: StreamEngine,
    reporter: Arc<dyn ErrorReporter>,
}

impl Dispatcher {
    pub fn new(engine: StreamEngine, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self { engine, reporter }
    }

    pub fn engine(&self) -> &StreamEngine {
        &self.engine
    }

    pub fn reporter(&self) -> &Arc<dyn ErrorReporter> {
        &self.reporter
    }

    /// Handle one command line from `conn`.
    pub async fn dispatch(&self, state: &mut ServerState, conn: ConnId, line: &str) -> Outcome {
        let identity = state.identity(conn);
        let result = match Command::parse(line) {
            Ok(command) => {
                debug!(target: "dispatch", conn = %conn, command = command.name(), "Dispatching");
                self.execute(state, conn, command).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(outcome) => outcome,
            Err(CommandError::Unexpected(e)) => {
                self.reporter.report(&identity, &e);
                Outcome::line(CommandError::Unexpected(e).response())
            }
            Err(e) => {
                debug!(target: "dispatch", conn = %conn, reason = %e, "Command rejected");
                Outcome::line(e.response())
            }
        }
    }

    async fn execute(
        &self,
        state: &mut ServerState,
        conn: ConnId,
        command: Command,
    ) -> Result<Outcome, CommandError> {
        match command {
            Command::Register { email, password } => {
                state.accounts.register(&email, &password)?;
                Ok(Outcome::line(format!("User {email} registered")))
            }
            Command::Login { email, password } => {
                state.accounts.authenticate(&email, &password)?;
                state.sessions.login(conn, &email)?;
                info!(target: "dispatch", conn = %conn, user = %email, "User logged in");
                Ok(Outcome::line("User successfully logged in"))
            }
            Command::Disconnect => Ok(self.disconnect(state, conn).await),
            Command::Search { keywords } => Ok(Outcome::line(state.catalog.search(&keywords))),
            Command::Top { count } => Ok(Outcome::line(state.catalog.top(count))),
            Command::CreatePlaylist { name } => {
                let user = require_login(state, conn)?;
                state.catalog.create_playlist(&user, &name)?;
                Ok(Outcome::line("Playlist created successfully"))
            }
            Command::AddSongTo { playlist, song } => {
                let user = require_login(state, conn)?;
                state.catalog.add_song_to_playlist(&user, &playlist, &song)?;
                Ok(Outcome::line("Song successfully added to playlist"))
            }
            Command::ShowPlaylist { name } => {
                let user = require_login(state, conn)?;
                let playlist = state.catalog.get_playlist(&user, &name)?;
                Ok(Outcome::line(playlist.render()))
            }
            Command::Play { song } => {
                let user = require_login(state, conn)?;
                self.play(state, conn, user, song).await
            }
            Command::Stop => {
                require_login(state, conn)?;
                let handle = state.sessions.detach_stream(conn)?;
                let exit = handle.stop().await;
                debug!(target: "dispatch", conn = %conn, state = ?exit.state, "Stream stopped");
                Ok(Outcome {
                    reply: Reply::Suppressed("No longer playing music".to_string()),
                    reclaimed: Some(Reclaimed(exit.writer)),
                    after: After::Continue,
                })
            }
        }
    }

    /// Start streaming `title` to `conn`.
    ///
    /// Everything that can fail is checked before the stream is registered,
    /// so a failed `play` leaves no stream and no play count behind.
    async fn play(
        &self,
        state: &mut ServerState,
        conn: ConnId,
        user: String,
        title: String,
    ) -> Result<Outcome, CommandError> {
        let (song, path) = state.catalog.playable(&title)?;
        if state.sessions.is_streaming(conn) {
            return Err(SessionError::AlreadyStreaming.into());
        }
        let permit = self
            .engine
            .try_reserve()
            .ok_or_else(|| CommandError::Domain(TOO_MANY_STREAMS.to_string()))?;

        let source = tokio::task::spawn_blocking(move || AudioSource::open(&path))
            .await
            .map_err(|e| Error::audio(format!("source open task failed: {e}")))??;

        let (handle, writer_tx) = self.engine.start(StreamRequest {
            conn,
            song: song.clone(),
            identity: user,
            source,
            permit,
        });
        if let Err((err, handle)) = state.sessions.attach_stream(conn, handle) {
            drop(writer_tx);
            handle.join().await;
            return Err(err.into());
        }
        state.catalog.record_play(&song);

        Ok(Outcome {
            reply: Reply::Line(format!("Now playing {title}")),
            reclaimed: None,
            after: After::HandOver(writer_tx),
        })
    }

    /// Log out, stop any stream, persist, and close.
    async fn disconnect(&self, state: &mut ServerState, conn: ConnId) -> Outcome {
        let identity = state.identity(conn);
        let _ = state.sessions.logout(conn);

        let reclaimed = match state.sessions.detach_stream(conn) {
            Ok(handle) => Some(Reclaimed(handle.stop().await.writer)),
            Err(_) => None,
        };
        if let Err(e) = state.catalog.commit() {
            self.reporter.report(&identity, &e);
        }

        Outcome {
            reply: Reply::Line("Disconnected".to_string()),
            reclaimed,
            after: After::Close,
        }
    }
}

fn require_login(state: &ServerState, conn: ConnId) -> Result<String, CommandError> {
    state
        .sessions
        .username_of(conn)
        .map(str::to_string)
        .ok_or_else(|| CommandError::Domain(NOT_LOGGED_IN.to_string()))
}
