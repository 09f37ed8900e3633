//! TCP accept loop.
//!
//! Binds the listening socket, then hands every accepted connection to its
//! own task and goes straight back to accepting. The loop never returns
//! under normal operation.

use crate::config::{Config, StoragePaths};
use crate::connection::{Connection, ConnectionTracker};
use std::convert::Infallible;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Pending connections the kernel queues before `accept`.
const LISTEN_BACKLOG: i32 = 5;

/// Pause after the process runs out of descriptors or memory.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server instance
pub struct Server {
    listener: TcpListener,
    #[allow(dead_code)] // reserved for a storage backend
    storage: StoragePaths,
    connections: ConnectionTracker,
}

impl Server {
    /// Open the listening socket described by `config`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let addr = SocketAddr::new(config.host, config.port);
        let listener = create_listener(addr)?;
        let listener = TcpListener::from_std(listener).map_err(ServerError::Socket)?;
        let port = listener.local_addr().map_err(ServerError::Socket)?.port();

        debug!(
            "Reserved paths: database {}, files {}",
            config.storage.database.display(),
            config.storage.files.display()
        );
        info!("Listening on port {}", port);

        Ok(Server {
            listener,
            storage: config.storage.clone(),
            connections: ConnectionTracker::new(),
        })
    }

    /// Port the listener is bound to.
    #[cfg(test)]
    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    /// Live connection tracker, for tests.
    #[cfg(test)]
    pub fn connections(&self) -> ConnectionTracker {
        self.connections.clone()
    }

    /// Accept connections until a non-recoverable accept error occurs.
    pub async fn run_forever(self) -> Result<Infallible, ServerError> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let live = self.connections.track();

                    tokio::spawn(async move {
                        Connection::new(stream, peer).run().await;
                        drop(live);
                    });
                }
                Err(e) => match AcceptFailure::classify(&e) {
                    AcceptFailure::Transient => {
                        warn!("Failed to accept connection: {}", e);
                    }
                    AcceptFailure::Exhausted => {
                        warn!(
                            "Failed to accept connection: {}, retrying in {}ms",
                            e,
                            ACCEPT_BACKOFF.as_millis()
                        );
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                    AcceptFailure::Fatal => return Err(ServerError::Accept(e)),
                },
            }
        }
    }
}

/// How the accept loop reacts to an `accept` error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// The pending connection went away; the listener is fine.
    Transient,
    /// Out of descriptors or memory; may clear once connections close.
    Exhausted,
    Fatal,
}

impl AcceptFailure {
    fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut => return AcceptFailure::Transient,
            _ => {}
        }

        match err.raw_os_error() {
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => {
                AcceptFailure::Exhausted
            }
            // Network or protocol errors already pending on the new socket,
            // and a firewall refusing one connection.
            Some(
                libc::EPROTO
                | libc::ENOPROTOOPT
                | libc::ENETDOWN
                | libc::ENETUNREACH
                | libc::EHOSTDOWN
                | libc::EHOSTUNREACH
                | libc::EOPNOTSUPP
                | libc::EPERM,
            ) => AcceptFailure::Transient,
            #[cfg(target_os = "linux")]
            Some(libc::ENONET) => AcceptFailure::Transient,
            _ => AcceptFailure::Fatal,
        }
    }
}

/// Create a non-blocking listening socket with the server's backlog.
fn create_listener(addr: SocketAddr) -> Result<std::net::TcpListener, ServerError> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(ServerError::Socket)?;

    socket
        .bind(&addr.into())
        .map_err(|e| ServerError::Bind(addr, e))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| ServerError::Listen(addr, e))?;
    socket.set_nonblocking(true).map_err(ServerError::Socket)?;

    Ok(socket.into())
}

/// Socket setup and accept errors. All of them are fatal.
#[derive(Debug)]
pub enum ServerError {
    Socket(io::Error),
    Bind(SocketAddr, io::Error),
    Listen(SocketAddr, io::Error),
    Accept(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Socket(e) => write!(f, "Could not open socket: {}", e),
            ServerError::Bind(addr, e) if e.kind() == io::ErrorKind::AddrInUse => write!(
                f,
                "Could not bind to port {}. Is it already in use? ({})",
                addr.port(),
                e
            ),
            ServerError::Bind(addr, e) => {
                write!(f, "Could not bind to {}: {}", addr, e)
            }
            ServerError::Listen(addr, e) => {
                write!(f, "Could not listen on {}: {}", addr, e)
            }
            ServerError::Accept(e) => write!(f, "Could not accept connections: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Socket(e)
            | ServerError::Bind(_, e)
            | ServerError::Listen(_, e)
            | ServerError::Accept(e) => Some(e),
        }
    }
}
