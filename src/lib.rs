use std::time::Duration;

pub mod cache;
pub mod config;
pub mod error;
pub mod handler;
pub mod mime;
pub mod pool;
pub mod registry;
pub mod server;
pub mod sys;
pub mod tls;

pub use cache::{AssetCache, AssetEntry, Body};
pub use config::ServerConfig;
pub use error::{BindError, CacheError, QueueError, RegistryError, StartupError, TlsError};
pub use registry::{Connection, ConnectionRegistry};
pub use server::Server;

/// Hard upper bound on file descriptors; also the Connection Registry size.
/// `sys::set_fd_limit` pins the process rlimit to this before any socket is
/// opened, so every fd the process receives is a valid registry index.
pub const MAX_FD: usize = 4096;

/// Kernel accept backlog on the listening socket.
pub const MAX_QUEUE_CONN: i32 = 64;

/// Capacity of the reactor's re-arm channel: connections parked for
/// keep-alive that have not yet been observed readable again.
pub const MAX_ALIVE_CONN: usize = 256;

/// Capacity of the bounded task queue between the reactor and the workers.
/// Enqueue rejects immediately when full; the connection is closed.
pub const TASK_QUEUE_SIZE: usize = 64;

/// Number of worker tasks draining the queue.
pub const THREAD_COUNT: usize = 16;

/// Per-connection receive buffer size; also the chunk size for fd-backed
/// asset bodies.
pub const BUFFER_SIZE: usize = 4096;

/// Idle tick of the reactor loop when no readiness arrives.
pub const REACTOR_TIMEOUT_MS: u64 = 1000;

/// Bound on the TLS handshake after accept.
pub const TLS_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on each read and write while a request is in flight.
pub const RTT_TIMEOUT: Duration = Duration::from_micros(500_000);

/// Port used when none is given on the command line.
pub const DEFAULT_PORT: u16 = 8080;
