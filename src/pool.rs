use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::cache::AssetCache;
use crate::error::QueueError;
use crate::handler;
use crate::registry::Connection;

/// Create a bounded task queue. The sender half rejects immediately when the
/// queue is full; the receiver half is shared by all workers.
pub fn task_queue<T>(capacity: usize) -> (TaskQueue<T>, TaskReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (TaskQueue { tx }, TaskReceiver { rx: Mutex::new(rx) })
}

/// Producer side of the bounded task queue.
#[derive(Clone)]
pub struct TaskQueue<T> {
    tx: mpsc::Sender<T>,
}

impl<T> TaskQueue<T> {
    /// Enqueue without blocking. A full queue is an error surfaced to the
    /// producer, never a wait.
    pub fn try_enqueue(&self, task: T) -> Result<(), (T, QueueError)> {
        match self.tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) => Err((task, QueueError::Full)),
            Err(TrySendError::Closed(task)) => Err((task, QueueError::Closed)),
        }
    }
}

/// Consumer side, shared by the worker pool behind a lock.
pub struct TaskReceiver<T> {
    rx: Mutex<mpsc::Receiver<T>>,
}

impl<T> TaskReceiver<T> {
    /// Wait for the next task. Returns `None` once the queue is stopped and
    /// drained of producers.
    pub async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}

/// Fixed pool of worker tasks draining the connection queue.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawn `count` workers. Each loops: take a connection from the queue,
    /// run the request handler, and either drop the connection (close) or
    /// hand it back to the reactor through `parked` for keep-alive re-arm.
    pub fn spawn(
        count: usize,
        queue: Arc<TaskReceiver<Connection>>,
        cache: Arc<AssetCache>,
        parked: mpsc::Sender<Connection>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let workers = (0..count)
            .map(|id| {
                let queue = Arc::clone(&queue);
                let cache = Arc::clone(&cache);
                let parked = parked.clone();
                let mut stop = shutdown.subscribe();
                tokio::spawn(async move {
                    loop {
                        let conn = tokio::select! {
                            _ = stop.changed() => break,
                            conn = queue.recv() => match conn {
                                Some(conn) => conn,
                                None => break,
                            },
                        };

                        if let Some(conn) = handler::handle_request(conn, &cache).await {
                            // Keep-alive: the reactor must see the connection
                            // again before it can be dispatched a second time.
                            match parked.try_send(conn) {
                                Ok(()) => {}
                                Err(TrySendError::Full(conn)) => {
                                    warn!(fd = conn.fd(), "re-arm channel full, closing connection");
                                    conn.close().await;
                                }
                                Err(TrySendError::Closed(conn)) => {
                                    trace!(fd = conn.fd(), "reactor gone, closing connection");
                                    conn.close().await;
                                }
                            }
                        }
                    }
                    trace!(worker = id, "worker exiting");
                })
            })
            .collect();

        debug!(count, "worker pool started");
        Self { workers, shutdown }
    }

    /// Signal every worker to stop and join them. Workers finish the request
    /// they are on; queued connections are dropped unserved.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
        debug!("worker pool stopped");
    }
}
