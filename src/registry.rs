use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tracing::trace;

use crate::error::RegistryError;
use crate::{BUFFER_SIZE, MAX_FD, RTT_TIMEOUT};

/// Occupancy table for live connections, indexed by the OS file descriptor.
///
/// The descriptor space is pinned below `MAX_FD` at startup, so the fd itself
/// is the slot index. The table does not own connections; a [`Connection`]
/// claims its slot on creation and releases it on drop, which makes the
/// one-owner-per-slot rule hold on every exit path.
pub struct ConnectionRegistry {
    slots: Box<[AtomicBool]>,
    live: AtomicUsize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_FD);
        slots.resize_with(MAX_FD, || AtomicBool::new(false));
        Self {
            slots: slots.into_boxed_slice(),
            live: AtomicUsize::new(0),
        }
    }

    /// Mark `fd` live. Fails if the descriptor is outside `[0, MAX_FD)` or
    /// the slot is already taken.
    pub fn claim(&self, fd: RawFd) -> Result<(), RegistryError> {
        let slot = self
            .slots
            .get(usize::try_from(fd).map_err(|_| RegistryError::OutOfRange(fd))?)
            .ok_or(RegistryError::OutOfRange(fd))?;
        if slot
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RegistryError::Occupied(fd));
        }
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Mark `fd` vacant again. Only the owning connection calls this.
    pub fn release(&self, fd: RawFd) {
        if let Ok(idx) = usize::try_from(fd) {
            if let Some(slot) = self.slots.get(idx) {
                if slot.swap(false, Ordering::AcqRel) {
                    self.live.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        usize::try_from(fd)
            .ok()
            .and_then(|idx| self.slots.get(idx))
            .map_or(false, |slot| slot.load(Ordering::Acquire))
    }

    /// Number of live connections.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One live client connection: the TLS stream, its receive buffer, and the
/// keep-alive flag derived from the most recent request.
///
/// Exactly one owner holds a `Connection` at any moment; it moves between the
/// reactor and a worker through the task queue and the re-arm channel.
pub struct Connection {
    pub(crate) stream: TlsStream<TcpStream>,
    pub(crate) buf: Vec<u8>,
    pub(crate) keep_alive: bool,
    fd: RawFd,
    registry: Arc<ConnectionRegistry>,
}

impl Connection {
    /// Claim a registry slot for the stream's descriptor and take ownership
    /// of the stream. The stream is dropped (socket closed) on failure.
    pub fn register(
        stream: TlsStream<TcpStream>,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self, RegistryError> {
        let fd = stream.get_ref().0.as_raw_fd();
        registry.claim(fd)?;
        Ok(Self {
            stream,
            buf: Vec::with_capacity(BUFFER_SIZE),
            keep_alive: false,
            fd,
            registry,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Wait until the underlying socket reports readable. Used by the
    /// reactor to re-arm a parked keep-alive connection.
    pub async fn readable(&self) -> io::Result<()> {
        self.stream.get_ref().0.readable().await
    }

    /// Graceful teardown: send the TLS close notify (bounded) and drop,
    /// which closes the socket and releases the registry slot.
    pub async fn close(mut self) {
        let _ = timeout(RTT_TIMEOUT, self.stream.shutdown()).await;
        trace!(fd = self.fd, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.registry.release(self.fd);
    }
}
