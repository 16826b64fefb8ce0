//! One client connection as seen by the reactor.
//!
//! The read half lives in a small task that turns bytes into command lines
//! and forwards them to the reactor. The write half is held here, except
//! while a stream owns it; replies produced in the meantime wait in a
//! backlog and go out, in order, once the writer comes back.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::session::ConnId;
use crate::stream::BoxedWriter;

/// Events from connection readers to the reactor.
#[derive(Debug)]
pub enum Inbound {
    Line(ConnId, String),
    /// End of input, a read error, or a line the codec refused
    Closed(ConnId),
}

pub struct Connection {
    id: ConnId,
    peer: SocketAddr,
    writer: Option<BoxedWriter>,
    backlog: VecDeque<String>,
    write_timeout: Duration,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Split `socket` and start its line reader.
    pub fn spawn(
        id: ConnId,
        socket: TcpStream,
        peer: SocketAddr,
        max_line_length: usize,
        write_timeout: Duration,
        inbound: mpsc::Sender<Inbound>,
    ) -> Self {
        let (read_half, write_half) = socket.into_split();
        let reader = tokio::spawn(read_lines(id, read_half, max_line_length, inbound));
        Self {
            id,
            peer,
            writer: Some(Box::new(write_half)),
            backlog: VecDeque::new(),
            write_timeout,
            reader,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn has_writer(&self) -> bool {
        self.writer.is_some()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Send one reply line, or queue it while a stream owns the writer.
    pub async fn send_line(&mut self, text: &str) -> io::Result<()> {
        self.backlog.push_back(format!("{text}\n"));
        self.flush_backlog().await
    }

    /// Give the writer away. Subsequent replies are queued.
    pub fn take_writer(&mut self) -> Option<BoxedWriter> {
        self.writer.take()
    }

    /// Take the writer back and send everything queued meanwhile.
    pub async fn restore_writer(&mut self, writer: BoxedWriter) -> io::Result<()> {
        self.writer = Some(writer);
        self.flush_backlog().await
    }

    async fn flush_backlog(&mut self) -> io::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            debug!(target: "server", conn = %self.id, queued = self.backlog.len(), "Writer busy, reply queued");
            return Ok(());
        };
        while let Some(line) = self.backlog.pop_front() {
            write_bounded(writer, line.as_bytes(), self.write_timeout).await?;
        }
        Ok(())
    }

    /// Stop reading and shut the write side down.
    pub async fn close(mut self) {
        self.reader.abort();
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
    }
}

async fn write_bounded(writer: &mut BoxedWriter, bytes: &[u8], timeout: Duration) -> io::Result<()> {
    tokio::time::timeout(timeout, async {
        writer.write_all(bytes).await?;
        writer.flush().await
    })
    .await
    .unwrap_or_else(|_| {
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "client stopped reading",
        ))
    })
}

async fn read_lines(
    id: ConnId,
    read_half: OwnedReadHalf,
    max_line_length: usize,
    inbound: mpsc::Sender<Inbound>,
) {
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(max_line_length));

    while let Some(next) = lines.next().await {
        match next {
            Ok(line) => {
                if inbound.send(Inbound::Line(id, line)).await.is_err() {
                    return;
                }
            }
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(target: "server", conn = %id, max_line_length, "Command line too long, closing");
                break;
            }
            Err(LinesCodecError::Io(e)) => {
                debug!(target: "server", conn = %id, error = %e, "Read failed");
                break;
            }
        }
    }
    let _ = inbound.send(Inbound::Closed(id)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn pair() -> (Connection, TcpStream, mpsc::Receiver<Inbound>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (socket, peer) = listener.accept().await.unwrap();
        let (tx, rx) = mpsc::channel(8);
        let connection = Connection::spawn(ConnId(9), socket, peer, 16, Duration::from_secs(2), tx);
        (connection, client, rx)
    }

    #[tokio::test]
    async fn test_lines_are_forwarded_then_closed() {
        let (_connection, mut client, mut rx) = pair().await;
        client.write_all(b"top 1\r\nsearch x\n").await.unwrap();
        client.shutdown().await.unwrap();

        assert!(matches!(rx.recv().await, Some(Inbound::Line(ConnId(9), l)) if l == "top 1"));
        assert!(matches!(rx.recv().await, Some(Inbound::Line(_, l)) if l == "search x"));
        assert!(matches!(rx.recv().await, Some(Inbound::Closed(ConnId(9)))));
    }

    #[tokio::test]
    async fn test_overlong_line_closes() {
        let (_connection, mut client, mut rx) = pair().await;
        client.write_all(&[b'a'; 64]).await.unwrap();
        client.write_all(b"\n").await.unwrap();

        assert!(matches!(rx.recv().await, Some(Inbound::Closed(_))));
    }

    #[tokio::test]
    async fn test_replies_queue_while_writer_is_away() {
        let (mut connection, mut client, _rx) = pair().await;
        let writer = connection.take_writer().unwrap();

        connection.send_line("first").await.unwrap();
        connection.send_line("second").await.unwrap();
        assert_eq!(connection.backlog_len(), 2);

        connection.restore_writer(writer).await.unwrap();
        assert_eq!(connection.backlog_len(), 0);
        connection.send_line("third").await.unwrap();
        connection.close().await;

        let mut received = String::new();
        client.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "first\nsecond\nthird\n");
    }
}
