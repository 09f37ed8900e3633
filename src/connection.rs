//! Per-connection echo handler.
//!
//! A connection starts OPEN. Each cycle reads up to one chunk, logs it and
//! writes the same bytes back. End of stream or any I/O error moves it to
//! CLOSED, after which the stream is shut down and dropped. Nothing is
//! reported to the accept loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Bytes read per read/echo cycle.
pub const CHUNK_SIZE: usize = 1024;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    /// Terminal.
    Closed,
}

/// Totals for a finished connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionSummary {
    /// Non-empty reads performed, including one whose echo failed.
    pub reads: u64,
    /// Bytes echoed back to the peer.
    pub bytes: u64,
}

/// A single accepted client connection.
///
/// Owns its stream exclusively for its whole lifetime.
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    state: ConnState,
    summary: ConnectionSummary,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Open,
            summary: ConnectionSummary::default(),
        }
    }

    /// Echo until the peer closes or an I/O error occurs.
    pub async fn run(mut self) -> ConnectionSummary {
        info!("Connection opened from {}", self.peer);

        let mut chunk = [0u8; CHUNK_SIZE];
        while self.state == ConnState::Open {
            self.state = self.echo_chunk(&mut chunk).await;
        }

        // Best effort: the peer may already be gone.
        let _ = self.stream.shutdown().await;

        info!(
            "Connection from {} closed after {} bytes in {} reads",
            self.peer, self.summary.bytes, self.summary.reads
        );
        self.summary
    }

    /// One read/echo cycle. Returns the state to move to.
    async fn echo_chunk(&mut self, chunk: &mut [u8]) -> ConnState {
        let n = match self.stream.read(chunk).await {
            Ok(0) => {
                debug!("Peer {} closed the connection", self.peer);
                return ConnState::Closed;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("Read from {} failed: {}", self.peer, e);
                return ConnState::Closed;
            }
        };

        self.summary.reads += 1;
        let data = &chunk[..n];
        info!("Received message ({} bytes): \"{}\"", n, data.escape_ascii());

        if let Err(e) = self.stream.write_all(data).await {
            debug!("Write to {} failed: {}", self.peer, e);
            return ConnState::Closed;
        }

        self.summary.bytes += n as u64;
        ConnState::Open
    }
}

/// Count of connection handlers currently alive.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    live: Arc<AtomicUsize>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new handler. The count drops when the guard does.
    pub fn track(&self) -> LiveConnection {
        self.live.fetch_add(1, Ordering::AcqRel);
        LiveConnection {
            live: Arc::clone(&self.live),
        }
    }

    /// Number of handlers currently alive.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

/// Held by a handler task for as long as it runs.
#[derive(Debug)]
pub struct LiveConnection {
    live: Arc<AtomicUsize>,
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tokio_test::io::Builder;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_echo_single_message() {
        let stream = Builder::new().read(b"hello").write(b"hello").build();

        let summary = Connection::new(stream, peer()).run().await;
        assert_eq!(summary, ConnectionSummary { reads: 1, bytes: 5 });
    }

    #[tokio::test]
    async fn test_echo_is_sequential() {
        let stream = Builder::new()
            .read(b"first")
            .write(b"first")
            .read(b"second")
            .write(b"second")
            .build();

        let summary = Connection::new(stream, peer()).run().await;
        assert_eq!(summary.reads, 2);
        assert_eq!(summary.bytes, 11);
    }

    #[tokio::test]
    async fn test_large_payload_is_chunked() {
        let payload: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let stream = Builder::new()
            .read(&payload)
            .write(&payload[..1024])
            .write(&payload[1024..2048])
            .write(&payload[2048..])
            .build();

        let summary = Connection::new(stream, peer()).run().await;
        assert_eq!(summary.reads, 3);
        assert_eq!(summary.bytes, 2500);
    }

    #[tokio::test]
    async fn test_binary_bytes_echo_unmodified() {
        let payload = [0u8, 0xff, b'\r', b'\n', 0x7f, b'"'];
        let stream = Builder::new().read(&payload).write(&payload).build();

        let summary = Connection::new(stream, peer()).run().await;
        assert_eq!(summary.bytes, payload.len() as u64);
    }

    #[tokio::test]
    async fn test_immediate_close() {
        let stream = Builder::new().build();

        let summary = Connection::new(stream, peer()).run().await;
        assert_eq!(summary, ConnectionSummary::default());
    }

    #[tokio::test]
    async fn test_read_error_closes() {
        let stream = Builder::new()
            .read(b"ok")
            .write(b"ok")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let summary = Connection::new(stream, peer()).run().await;
        assert_eq!(summary, ConnectionSummary { reads: 1, bytes: 2 });
    }

    #[tokio::test]
    async fn test_write_error_closes() {
        let stream = Builder::new()
            .read(b"lost")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"))
            .build();

        let summary = Connection::new(stream, peer()).run().await;
        assert_eq!(summary, ConnectionSummary { reads: 1, bytes: 0 });
    }

    #[test]
    fn test_tracker_counts_guards() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.live(), 0);

        let a = tracker.track();
        let b = tracker.clone().track();
        assert_eq!(tracker.live(), 2);

        drop(a);
        assert_eq!(tracker.live(), 1);
        drop(b);
        assert_eq!(tracker.live(), 0);
    }
}
