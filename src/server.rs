//! TCP acceptor for lookup sessions.
//!
//! Binds the listening socket, accepts connections and hands each one to
//! the worker pool, which runs a session on it until the session closes.

use crate::config::Config;
use crate::pool::WorkerPool;
use crate::registry::Lookup;
use crate::session::{self, SessionConfig};
use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn, Instrument};

/// Listen backlog passed to the kernel
const LISTEN_BACKLOG: i32 = 1024;

/// Pause after a transient accept error (e.g. EMFILE) before retrying
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Server errors
#[derive(Debug)]
pub enum ServerError {
    /// The listen address could not be resolved
    Address(String, io::Error),
    /// The listening socket could not be created or bound
    Bind(String, io::Error),
    /// The listener failed and cannot accept further connections
    Listener(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Address(addr, e) => write!(f, "Invalid listen address '{addr}': {e}"),
            ServerError::Bind(addr, e) => write!(f, "Failed to bind '{addr}': {e}"),
            ServerError::Listener(e) => write!(f, "Listener failed: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

/// Server instance
pub struct Server {
    config: Config,
    registry: Arc<dyn Lookup>,
    pool: WorkerPool,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config, registry: Arc<dyn Lookup>) -> Self {
        let pool = WorkerPool::new(config.pool_size);

        Server {
            config,
            registry,
            pool,
        }
    }

    /// Bind the configured listen address.
    ///
    /// The host may be a name or an IP literal; each resolved address is
    /// tried in turn until one binds.
    pub fn bind(&self) -> Result<TcpListener, ServerError> {
        let listen = self.config.listen_addr();
        let addrs: Vec<SocketAddr> = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| ServerError::Address(listen.clone(), e))?
            .collect();

        let mut last_error = io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "host resolved to no addresses",
        );
        for addr in addrs {
            match create_listener(addr) {
                Ok(listener) => {
                    info!(address = %addr, "Server listening");
                    return Ok(listener);
                }
                Err(e) => {
                    debug!(address = %addr, error = %e, "Bind attempt failed");
                    last_error = e;
                }
            }
        }

        Err(ServerError::Bind(listen, last_error))
    }

    /// Bind, then accept connections until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves or the
    /// listener fails, then shut the worker pool down.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        tokio::pin!(shutdown);

        let session_config = SessionConfig {
            read_timeout: self.config.read_timeout,
        };

        let result = loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => match recover_from_accept_error(e).await {
                        Ok(()) => continue,
                        Err(e) => break Err(e),
                    },
                },
            };

            info!(peer = %peer, "Client connected");

            let registry = Arc::clone(&self.registry);
            let task = async move {
                match session::handle_connection(stream, registry.as_ref(), session_config).await {
                    Ok(outcome) => debug!(?outcome, "Session finished, releasing worker"),
                    Err(e) => warn!(error = %e, "Session failed, releasing worker"),
                }
            }
            .instrument(tracing::info_span!("session", peer = %peer));

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(peer = %peer, "Shutdown requested while waiting for a worker, dropping connection");
                    break Ok(());
                }
                submitted = self.pool.submit(task) => {
                    if let Err(e) = submitted {
                        error!(error = %e, "Failed to submit session");
                        break Ok(());
                    }
                }
            }
        };

        drop(listener);
        let remaining = self.pool.shutdown(self.config.shutdown_grace).await;
        info!(remaining, "Server stopped");

        result
    }
}

/// Log a failed `accept`. Transient errors back off before the loop retries;
/// errors meaning the listener is unusable are returned.
async fn recover_from_accept_error(e: io::Error) -> Result<(), ServerError> {
    if is_fatal_accept_error(&e) {
        error!(error = %e, "Listener failed");
        return Err(ServerError::Listener(e));
    }

    error!(error = %e, "Failed to accept connection");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
    Ok(())
}

/// Errors that mean the listening socket itself is unusable.
fn is_fatal_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected
    )
}

/// Create a non-blocking listener with SO_REUSEADDR set.
fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}
