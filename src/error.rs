use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use thiserror::Error;

/// Failures while binding the listening socket.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to create listening socket: {0}")]
    Socket(#[source] io::Error),
    #[error("failed to configure listening socket: {0}")]
    Configure(#[source] io::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Failures while building the asset cache at startup. All are fatal.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to read asset root {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no assets found at {0}")]
    Empty(PathBuf),
    #[error("required error page {0} is missing from the asset root")]
    MissingErrorPage(&'static str),
}

/// Failures while loading TLS material at startup. All are fatal.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("invalid certificate or key: {0}")]
    Material(#[from] rustls::Error),
}

/// Anything that can abort startup. The binary exits non-zero on these.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Bind(#[from] BindError),
}

/// Connection Registry admission failures. Per-connection, never fatal.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("file descriptor {0} is outside the registry range")]
    OutOfRange(RawFd),
    #[error("file descriptor {0} is already registered")]
    Occupied(RawFd),
}

/// Task queue admission failures.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task queue is full")]
    Full,
    #[error("task queue is stopped")]
    Closed,
}
