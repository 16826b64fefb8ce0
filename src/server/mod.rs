//! Connection reactor.
//!
//! A single task owns the listener, every connection's write half, and the
//! [`ServerState`]. It waits on four sources at once:
//!
//! - the shutdown signal
//! - new connections
//! - command lines (and closures) from connection readers
//! - streams that finished on their own
//!
//! Every command runs to completion before the next event is looked at, so
//! catalog and session state need no locking.

mod connection;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatch::{After, Dispatcher, Reclaimed, Reply, ServerState};
use crate::error::{Result, ResultExt};
use crate::report::{ErrorReporter, UNKNOWN_IDENTITY};
use crate::session::ConnId;
use crate::stream::{StreamEngine, StreamFinished};

pub use connection::{Connection, Inbound};

/// Command lines buffered between readers and the reactor.
const INBOUND_BUFFER: usize = 256;

/// Stops a running [`Server`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    /// Make the reactor stop streams, commit the catalog and return.
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }
}

/// A bound, not yet running server.
pub struct Server {
    listener: TcpListener,
    dispatcher: Dispatcher,
    state: ServerState,
    finished: mpsc::UnboundedReceiver<StreamFinished>,
    shutdown: ShutdownHandle,
    max_line_length: usize,
    write_timeout: Duration,
}

impl Server {
    /// Bind the listener described by `config`.
    pub async fn bind(
        config: &Config,
        state: ServerState,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self> {
        let address = config.server.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(format!("binding {address}"))?;

        let (engine, finished) = StreamEngine::new(
            config.streaming.clone(),
            config.server.max_concurrent_streams,
            Arc::clone(&reporter),
        );
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            listener,
            dispatcher: Dispatcher::new(engine, reporter),
            state,
            finished,
            shutdown: ShutdownHandle(Arc::new(shutdown_tx)),
            max_line_length: config.server.max_line_length,
            write_timeout: config.streaming.write_timeout(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Serve until shut down. Returns the final state after the catalog has
    /// been committed and the listener closed.
    pub async fn run(self) -> Result<ServerState> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let mut reactor = Reactor {
            dispatcher: self.dispatcher,
            state: self.state,
            connections: HashMap::new(),
            inbound_tx,
            next_conn: 1,
            max_line_length: self.max_line_length,
            write_timeout: self.write_timeout,
        };
        let mut shutdown = self.shutdown.0.subscribe();
        let mut inbound_rx = inbound_rx;
        let mut finished = self.finished;
        let listener = self.listener;

        info!(target: "server", addr = ?listener.local_addr().ok(), "Listening");

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => Event::Shutdown,
                accepted = listener.accept() => Event::Accepted(accepted),
                Some(inbound) = inbound_rx.recv() => Event::Inbound(inbound),
                Some(done) = finished.recv() => Event::Finished(done),
            };

            match event {
                Event::Shutdown => break,
                Event::Accepted(Ok((socket, peer))) => reactor.accept(socket, peer),
                Event::Accepted(Err(e)) => {
                    warn!(target: "server", error = %e, "Accept failed");
                }
                Event::Inbound(Inbound::Line(conn, line)) => reactor.handle_line(conn, &line).await,
                Event::Inbound(Inbound::Closed(conn)) => reactor.close(conn).await,
                Event::Finished(done) => reactor.reclaim(done).await,
            }
        }

        info!(target: "server", "Shutting down");
        drop(listener);
        reactor.shutdown().await;
        Ok(reactor.state)
    }
}

enum Event {
    Shutdown,
    Accepted(std::io::Result<(tokio::net::TcpStream, SocketAddr)>),
    Inbound(Inbound),
    Finished(StreamFinished),
}

struct Reactor {
    dispatcher: Dispatcher,
    state: ServerState,
    connections: HashMap<ConnId, Connection>,
    inbound_tx: mpsc::Sender<Inbound>,
    next_conn: u64,
    max_line_length: usize,
    write_timeout: Duration,
}

impl Reactor {
    fn accept(&mut self, socket: tokio::net::TcpStream, peer: SocketAddr) {
        let conn = ConnId(self.next_conn);
        self.next_conn += 1;

        self.state.sessions.bind(conn);
        let connection = Connection::spawn(
            conn,
            socket,
            peer,
            self.max_line_length,
            self.write_timeout,
            self.inbound_tx.clone(),
        );
        self.connections.insert(conn, connection);
        info!(target: "server", conn = %conn, peer = %peer, "Client connected");
    }

    async fn handle_line(&mut self, conn: ConnId, line: &str) {
        if !self.connections.contains_key(&conn) {
            return;
        }
        let outcome = self.dispatcher.dispatch(&mut self.state, conn, line).await;
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };

        let mut healthy = true;
        if let Some(Reclaimed(Some(writer))) = outcome.reclaimed {
            healthy &= connection.restore_writer(writer).await.is_ok();
        }

        match &outcome.reply {
            Reply::Line(text) => healthy &= connection.send_line(text).await.is_ok(),
            Reply::Suppressed(text) => {
                debug!(target: "server", conn = %conn, reply = %text, "Reply suppressed");
            }
        }

        match outcome.after {
            After::Continue => {}
            After::Close => healthy = false,
            After::HandOver(tx) => match connection.take_writer() {
                Some(writer) => {
                    if let Err(writer) = tx.send(writer) {
                        healthy &= connection.restore_writer(writer).await.is_ok();
                    }
                }
                None => drop(tx),
            },
        }

        let orphaned = !connection.has_writer() && !self.state.sessions.is_streaming(conn);
        if !healthy || orphaned {
            self.close(conn).await;
        }
    }

    /// A stream ended by itself: take its writer back.
    async fn reclaim(&mut self, done: StreamFinished) {
        let Some(handle) = self.state.sessions.detach_stream_if(done.conn, done.stream) else {
            return;
        };
        let exit = handle.join().await;
        debug!(target: "server", conn = %done.conn, stream = %done.stream, state = ?exit.state, "Writer returned");

        let Some(connection) = self.connections.get_mut(&done.conn) else {
            return;
        };
        let restored = match exit.writer {
            Some(writer) => connection.restore_writer(writer).await.is_ok(),
            None => false,
        };
        if !restored {
            self.close(done.conn).await;
        }
    }

    /// Tear down `conn`: stop its stream, drop its session, persist.
    async fn close(&mut self, conn: ConnId) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };
        let identity = self
            .state
            .sessions
            .username_of(conn)
            .unwrap_or(UNKNOWN_IDENTITY)
            .to_string();

        if let Some(handle) = self.state.sessions.remove(conn) {
            handle.stop().await;
        }
        let peer = connection.peer();
        connection.close().await;

        if let Err(e) = self.state.catalog.commit() {
            self.dispatcher.reporter().report(&identity, &e);
        }
        info!(target: "server", conn = %conn, peer = %peer, "Client disconnected");
    }

    async fn shutdown(&mut self) {
        for (conn, handle) in self.state.sessions.drain_streams() {
            let exit = handle.stop().await;
            debug!(target: "server", conn = %conn, state = ?exit.state, "Stream stopped for shutdown");
        }
        for (conn, connection) in self.connections.drain() {
            self.state.sessions.remove(conn);
            connection.close().await;
        }
        if let Err(e) = self.state.catalog.commit() {
            self.dispatcher.reporter().report(UNKNOWN_IDENTITY, &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Frame, FrameDecoder};
    use crate::test_utils::{TempServer, write_wav};
    use bytes::BytesMut;
    use futures::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
    use tokio::net::TcpStream;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    const TIMEOUT: Duration = Duration::from_secs(5);
    const HEADER: &str = "PCM_SIGNED\n44100.0\n16\n2\n4\n44100.0\nfalse\n";

    /// Reads the two kinds of server output off one buffer: reply lines
    /// (and the audio header) or length-prefixed frames.
    struct ClientCodec {
        frames_mode: bool,
        lines: LinesCodec,
        frames: FrameDecoder,
    }

    enum Received {
        Line(String),
        Frame(Frame),
    }

    impl Decoder for ClientCodec {
        type Item = Received;
        type Error = LinesCodecError;

        fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Received>, LinesCodecError> {
            if self.frames_mode {
                Ok(self.frames.decode(src)?.map(Received::Frame))
            } else {
                Ok(self.lines.decode(src)?.map(Received::Line))
            }
        }

        fn decode_eof(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Received>, LinesCodecError> {
            if self.frames_mode {
                Ok(self.frames.decode_eof(src)?.map(Received::Frame))
            } else {
                Ok(self.lines.decode_eof(src)?.map(Received::Line))
            }
        }
    }

    struct Client {
        reader: FramedRead<OwnedReadHalf, ClientCodec>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let (read, writer) = TcpStream::connect(addr).await.unwrap().into_split();
            let codec = ClientCodec {
                frames_mode: false,
                lines: LinesCodec::new(),
                frames: FrameDecoder::default(),
            };
            Self {
                reader: FramedRead::new(read, codec),
                writer,
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\n").as_bytes())
                .await
                .unwrap();
        }

        async fn next(&mut self, frames_mode: bool) -> Received {
            self.reader.decoder_mut().frames_mode = frames_mode;
            tokio::time::timeout(TIMEOUT, self.reader.next())
                .await
                .unwrap()
                .expect("connection closed")
                .unwrap()
        }

        async fn line(&mut self) -> String {
            match self.next(false).await {
                Received::Line(line) => line,
                Received::Frame(frame) => panic!("expected a line, got {frame:?}"),
            }
        }

        async fn ask(&mut self, line: &str) -> String {
            self.send(line).await;
            self.line().await
        }

        /// The seven-line audio header, reassembled.
        async fn header(&mut self) -> String {
            let mut header = String::new();
            for _ in 0..7 {
                header.push_str(&self.line().await);
                header.push('\n');
            }
            header
        }

        async fn frame(&mut self) -> Frame {
            match self.next(true).await {
                Received::Frame(frame) => frame,
                Received::Line(line) => panic!("expected a frame, got {line:?}"),
            }
        }

        /// Skip audio frames up to the terminal one.
        async fn until_terminal(&mut self) -> (Frame, usize) {
            let mut audio = 0;
            loop {
                match self.frame().await {
                    Frame::Audio(bytes) => audio += bytes.len(),
                    terminal => return (terminal, audio),
                }
            }
        }

        /// True once the server has closed the connection.
        async fn eof(&mut self) -> bool {
            let mut rest = Vec::new();
            tokio::time::timeout(TIMEOUT, self.reader.get_mut().read_to_end(&mut rest))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false)
        }

        async fn login(&mut self, email: &str) {
            assert_eq!(
                self.ask(&format!("register {email} pw")).await,
                format!("User {email} registered")
            );
            assert_eq!(
                self.ask(&format!("login {email} pw")).await,
                "User successfully logged in"
            );
        }
    }

    #[tokio::test]
    async fn test_queries_and_login_gate() {
        let server = TempServer::start().await;
        let mut client = Client::connect(server.addr).await;

        assert_eq!(client.ask("top 1").await, "Santana - Smooth");
        assert_eq!(
            client.ask("search joe cocker").await,
            "Joe Cocker - Unchain My Heart"
        );
        assert_eq!(
            client.ask("create-playlist X").await,
            "Error! Please log in to perform this action"
        );
        assert_eq!(client.ask("boogie").await, "Error! Unknown command");
        assert_eq!(
            client.ask("add-song-to X").await,
            "Error! Invalid number of parameters for the command"
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn test_multi_line_replies() {
        let server = TempServer::start().await;
        let mut client = Client::connect(server.addr).await;

        client.send("top 2").await;
        assert_eq!(client.line().await, "Santana - Smooth");
        assert_eq!(client.line().await, "Santana - Into The Night");

        client.login("ana@example.com").await;
        client.ask("create-playlist mix").await;
        client.ask("add-song-to mix Smooth").await;
        client.ask("add-song-to mix Into_The_Night").await;
        client.send("show-playlist mix").await;
        assert_eq!(client.line().await, "mix");
        assert_eq!(client.line().await, "1. Santana - Smooth");
        assert_eq!(client.line().await, "2. Santana - Into The Night");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_play_to_completion_then_keep_talking() {
        let server = TempServer::start().await;
        write_wav(&server.song_path("Smooth", "Santana", 143), &[9u8; 1000]);
        let mut client = Client::connect(server.addr).await;
        client.login("ana@example.com").await;

        assert_eq!(client.ask("play Smooth").await, "Now playing Smooth");
        assert_eq!(client.header().await, HEADER);
        let (terminal, audio) = client.until_terminal().await;
        assert_eq!(terminal, Frame::Completed);
        assert_eq!(audio, 1000);

        // The writer is back with the reactor
        assert_eq!(client.ask("top 1").await, "Santana - Smooth");

        let state = server.stop().await;
        assert_eq!(state.catalog.song("Smooth").unwrap().plays, 5);
    }

    #[tokio::test]
    async fn test_stop_ends_with_stop_frame_and_flushes_backlog() {
        let server = TempServer::start().await;
        write_wav(
            &server.song_path("Unchain My Heart", "Joe Cocker", 205),
            &[1u8; 64 * 400],
        );
        let mut client = Client::connect(server.addr).await;
        client.login("ana@example.com").await;

        assert_eq!(
            client.ask("play Unchain_My_Heart").await,
            "Now playing Unchain My Heart"
        );
        assert_eq!(client.header().await, HEADER);
        assert!(matches!(client.frame().await, Frame::Audio(_)));

        // Answered only once the stream gives the connection back
        client.send("top 1").await;
        client.send("stop").await;

        let (terminal, _) = client.until_terminal().await;
        assert_eq!(terminal, Frame::Stopped);
        assert_eq!(client.line().await, "Santana - Smooth");

        // Nothing is playing any more
        assert_eq!(
            client.ask("stop").await,
            "Error! There is currently no song playing. Nothing to stop"
        );

        let state = server.stop().await;
        assert_eq!(state.catalog.song("Unchain My Heart").unwrap().plays, 3);
    }

    #[tokio::test]
    async fn test_play_missing_song_registers_nothing() {
        let server = TempServer::start().await;
        let mut client = Client::connect(server.addr).await;
        client.login("ana@example.com").await;

        assert_eq!(
            client.ask("play MissingSong").await,
            "Error! Song MissingSong was not found"
        );
        assert_eq!(client.ask("top 1").await, "Santana - Smooth");

        let reporter = server.reporter.clone();
        let state = server.stop().await;
        let plays: Vec<u64> = state.catalog.songs().map(|s| s.plays).collect();
        assert_eq!(plays.iter().sum::<u64>(), 4 + 3 + 2 + 1);
        assert!(reporter.incidents().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_replies_then_closes() {
        let server = TempServer::start().await;
        let mut client = Client::connect(server.addr).await;
        client.login("ana@example.com").await;

        assert_eq!(client.ask("disconnect").await, "Disconnected");
        assert!(client.eof().await);

        // Same account from a new connection
        let mut again = Client::connect(server.addr).await;
        assert_eq!(
            again.ask("login ana@example.com pw").await,
            "User successfully logged in"
        );
        server.stop().await;
    }

    #[tokio::test]
    async fn test_dropped_connection_frees_login_and_stream() {
        let server = TempServer::start().await;
        write_wav(&server.song_path("Smooth", "Santana", 143), &[0u8; 64 * 400]);

        let mut first = Client::connect(server.addr).await;
        first.login("ana@example.com").await;
        assert_eq!(first.ask("play Smooth").await, "Now playing Smooth");
        drop(first);

        let mut second = Client::connect(server.addr).await;
        let mut answer = second.ask("login ana@example.com pw").await;
        for _ in 0..50 {
            if answer == "User successfully logged in" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            answer = second.ask("login ana@example.com pw").await;
        }
        assert_eq!(answer, "User successfully logged in");

        let state = server.stop().await;
        assert_eq!(state.sessions.len(), 0);
    }

    #[tokio::test]
    async fn test_overlong_line_closes_connection() {
        let server = TempServer::start().await;
        let mut client = Client::connect(server.addr).await;
        client.send(&"x".repeat(4096)).await;
        assert!(client.eof().await);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_commits_catalog() {
        let server = TempServer::start().await;
        write_wav(&server.song_path("Smooth", "Santana", 143), &[0u8; 64 * 400]);
        let mut client = Client::connect(server.addr).await;
        client.login("ana@example.com").await;
        client.ask("create-playlist keepers").await;
        assert_eq!(client.ask("play Smooth").await, "Now playing Smooth");

        let storage = server.config.storage.clone();
        let (_, _dir) = server.stop_keeping_data().await;

        let reloaded = crate::catalog::Catalog::open(&storage).unwrap();
        assert_eq!(reloaded.song("Smooth").unwrap().plays, 5);
        assert!(reloaded.get_playlist("ana@example.com", "keepers").is_ok());
        assert!(client.eof().await);
    }

    #[tokio::test]
    async fn test_shutdown_handle_is_shared() {
        let server = TempServer::start().await;
        assert!(!server.shutdown.is_shutdown());
        let other = server.shutdown.clone();
        other.shutdown();
        assert!(server.shutdown.is_shutdown());
        server.stop().await;
    }
}
