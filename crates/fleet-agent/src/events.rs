//! Process-event delivery. Events queue in memory (bounded, oldest dropped
//! first) and a single flusher task drains them in FIFO order whenever the
//! link is connected and registered.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use fleet_process::ProcessEvent;
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{connection::ConnectionManager, error::RpcError};

struct ReporterInner {
    connection: ConnectionManager,
    queue: Mutex<VecDeque<ProcessEvent>>,
    capacity: usize,
    retry_delay: Duration,
    dropped: AtomicU64,
    wake: Notify,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct EventReporter {
    inner: Arc<ReporterInner>,
}

impl std::fmt::Debug for EventReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventReporter")
            .field("pending", &self.pending())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl EventReporter {
    pub fn new(connection: ConnectionManager, capacity: usize, retry_delay: Duration) -> Self {
        Self {
            inner: Arc::new(ReporterInner {
                connection,
                queue: Mutex::new(VecDeque::new()),
                capacity: capacity.max(1),
                retry_delay,
                dropped: AtomicU64::new(0),
                wake: Notify::new(),
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<ProcessEvent>> {
        self.inner.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pending(&self) -> usize {
        self.lock_queue().len()
    }

    /// Events evicted because the cache was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Queues `event` for delivery. Never blocks on the network.
    pub fn report(&self, event: ProcessEvent) {
        {
            let mut queue = self.lock_queue();
            if queue.len() >= self.inner.capacity {
                if let Some(old) = queue.pop_front() {
                    let total = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        event_id = %old.id,
                        event = old.event_type.as_str(),
                        dropped_total = total,
                        "event cache full; dropped oldest event"
                    );
                }
            }
            queue.push_back(event);
        }
        if !self.inner.connection.is_registered() {
            tracing::debug!(pending = self.pending(), "link not ready; event cached");
        }
        self.inner.wake.notify_one();
    }

    /// Sends queued events oldest first, stopping at the first failure so
    /// order is preserved. Only the flusher task calls this.
    async fn flush(&self) -> Result<usize, RpcError> {
        let mut sent = 0;
        loop {
            let Some(event) = self.lock_queue().front().cloned() else {
                return Ok(sent);
            };
            self.inner.connection.report_event(&event).await?;
            let mut queue = self.lock_queue();
            // The front may have been evicted while we were sending.
            if queue.front().is_some_and(|e| e.id == event.id) {
                queue.pop_front();
            }
            sent += 1;
        }
    }

    /// Starts the flusher task. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut slot = self.inner.task.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }
        let this = self.clone();
        *slot = Some(tokio::spawn(async move { this.run().await }));
    }

    async fn run(&self) {
        let mut link = self.inner.connection.subscribe();
        let cancel = self.inner.cancel.clone();
        let mut backoff = false;
        loop {
            let ready = link.borrow_and_update().is_ready();
            if ready && !backoff && self.pending() > 0 {
                match self.flush().await {
                    Ok(n) => {
                        if n > 0 {
                            tracing::info!(sent = n, "flushed cached events");
                        }
                    }
                    Err(e) if e.is_not_registered() => {
                        // The connection flagged itself unregistered; wait for
                        // re-registration to flip the link back to ready.
                        tracing::warn!(error = %e, pending = self.pending(), "event delivery needs re-registration");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, pending = self.pending(), "event delivery failed; will retry");
                        backoff = true;
                    }
                }
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.inner.wake.notified(), if !backoff => {}
                changed = link.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    backoff = false;
                }
                _ = tokio::time::sleep(self.inner.retry_delay), if backoff => {
                    backoff = false;
                }
            }
        }
    }

    /// Stops the flusher. Undelivered events are logged and dropped.
    pub async fn stop(&self, timeout: Duration) {
        self.inner.cancel.cancel();
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task
            && tokio::time::timeout(timeout, task).await.is_err()
        {
            tracing::warn!("event flusher did not stop in time");
        }
        let pending = self.pending();
        if pending > 0 {
            tracing::warn!(pending, "dropping undelivered events at shutdown");
        }
    }
}
