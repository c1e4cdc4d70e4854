use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsAcceptor;
use tracing::{info, trace, warn};

use crate::cache::AssetCache;
use crate::config::ServerConfig;
use crate::error::{BindError, QueueError, StartupError};
use crate::pool::{task_queue, TaskQueue, WorkerPool};
use crate::registry::{Connection, ConnectionRegistry};
use crate::tls;
use crate::{
    MAX_ALIVE_CONN, MAX_QUEUE_CONN, REACTOR_TIMEOUT_MS, TASK_QUEUE_SIZE, THREAD_COUNT, TLS_TIMEOUT,
};

/// The server object: listener, TLS acceptor, asset cache, and connection
/// registry, constructed once at startup and owned by the reactor.
pub struct Server {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    cache: Arc<AssetCache>,
    registry: Arc<ConnectionRegistry>,
    local_addr: SocketAddr,
}

impl Server {
    /// Build the cache, load TLS material, and bind the listener. Any
    /// failure is startup-fatal. Must be called within a tokio runtime.
    pub fn bind(config: &ServerConfig) -> Result<Self, StartupError> {
        let cache = AssetCache::build(&config.asset_root)?;
        info!(entries = cache.len(), root = %config.asset_root.display(), "asset cache ready");

        let acceptor = tls::load_acceptor(&config.cert, &config.key)?;

        let listener = bind_listener(config.socket_addr())?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| BindError::Configure(source))?;
        let listener = TcpListener::from_std(listener)
            .map_err(|source| BindError::Configure(source))?;
        info!(addr = %local_addr, "listening");

        Ok(Self {
            listener,
            acceptor,
            cache: Arc::new(cache),
            registry: Arc::new(ConnectionRegistry::new()),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The reactor loop. Accepts and handshakes new connections, arms
    /// connections for readability, and dispatches readable ones to the
    /// worker pool. Exits when `shutdown` flips; workers are then joined and
    /// every remaining connection is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let (parked_tx, mut parked_rx) = mpsc::channel::<Connection>(MAX_ALIVE_CONN);
        let (queue, receiver) = task_queue::<Connection>(TASK_QUEUE_SIZE);
        let pool = WorkerPool::spawn(
            THREAD_COUNT,
            Arc::new(receiver),
            Arc::clone(&self.cache),
            parked_tx,
        );

        // Connections armed for readability; each resolves back to its
        // connection when the socket reports readable (or hung up).
        let mut ready: JoinSet<(Connection, io::Result<()>)> = JoinSet::new();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    self.accept_one(accepted, &mut ready).await;
                }
                Some(conn) = parked_rx.recv() => {
                    ready.spawn(wait_readable(conn));
                }
                Some(joined) = ready.join_next() => {
                    match joined {
                        Ok((conn, Ok(()))) => self.dispatch(conn, &queue),
                        Ok((conn, Err(err))) => {
                            trace!(fd = conn.fd(), %err, "hangup while armed");
                            conn.close().await;
                        }
                        Err(err) => warn!(%err, "readiness task failed"),
                    }
                }
                _ = sleep(Duration::from_millis(REACTOR_TIMEOUT_MS)) => {
                    trace!(live = self.registry.live(), "reactor idle");
                }
            }
        }

        info!("reactor stopped, shutting down");
        ready.shutdown().await;
        pool.stop().await;
    }

    /// Accept sub-protocol: handshake within `TLS_TIMEOUT`, claim a registry
    /// slot, then arm for readability. Every failure here is per-connection.
    async fn accept_one(
        &self,
        accepted: io::Result<(TcpStream, SocketAddr)>,
        ready: &mut JoinSet<(Connection, io::Result<()>)>,
    ) {
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "accept failed");
                return;
            }
        };
        let _ = stream.set_nodelay(true);

        let tls_stream = match timeout(TLS_TIMEOUT, self.acceptor.accept(stream)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                warn!(%peer, %err, "TLS handshake failed");
                return;
            }
            Err(_) => {
                warn!(%peer, "TLS handshake timed out");
                return;
            }
        };

        match Connection::register(tls_stream, Arc::clone(&self.registry)) {
            Ok(conn) => {
                trace!(fd = conn.fd(), %peer, "connection accepted");
                ready.spawn(wait_readable(conn));
            }
            Err(err) => warn!(%peer, %err, "registry rejected connection"),
        }
    }

    /// Hand a readable connection to the worker pool. A full queue is
    /// treated as a hangup: the connection is dropped on the spot.
    fn dispatch(&self, conn: Connection, queue: &TaskQueue<Connection>) {
        match queue.try_enqueue(conn) {
            Ok(()) => {}
            Err((conn, QueueError::Full)) => {
                warn!(fd = conn.fd(), "task queue full, closing connection");
                drop(conn);
            }
            Err((conn, QueueError::Closed)) => {
                trace!(fd = conn.fd(), "task queue stopped, closing connection");
                drop(conn);
            }
        }
    }
}

async fn wait_readable(conn: Connection) -> (Connection, io::Result<()>) {
    let result = conn.readable().await;
    (conn, result)
}

/// Create the listening socket: non-blocking, address-reuse, dual-stack for
/// IPv6 binds, backlog `MAX_QUEUE_CONN`.
fn bind_listener(addr: SocketAddr) -> Result<std::net::TcpListener, BindError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(BindError::Socket)?;
    socket.set_reuse_address(true).map_err(BindError::Configure)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false).map_err(BindError::Configure)?;
    }
    socket.set_nonblocking(true).map_err(BindError::Configure)?;
    socket
        .bind(&addr.into())
        .map_err(|source| BindError::Bind { addr, source })?;
    socket
        .listen(MAX_QUEUE_CONN)
        .map_err(|source| BindError::Listen { addr, source })?;
    Ok(socket.into())
}
