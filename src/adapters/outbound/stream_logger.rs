//! Stream Logger
//!
//! TelemetrySink that fans finished attempt records out to subscribers
//! through bounded channels. Publishing never blocks: a subscriber whose
//! buffer is full misses the record.

use crate::domain::ports::TelemetrySink;
use crate::domain::query_record::QueryAttemptRecord;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Default per-subscriber buffer size.
pub const DEFAULT_BUFFER: usize = 50;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Arc<QueryAttemptRecord>>,
    /// Set while the subscriber is missing records
    dropping: bool,
}

struct Inner {
    name: String,
    buffer: usize,
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
}

/// Fan-out logger of query attempt records.
#[derive(Clone)]
pub struct StreamLogger {
    inner: Arc<Inner>,
}

impl StreamLogger {
    pub fn new(name: impl Into<String>, buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                buffer: buffer.max(1),
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register a subscriber. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::Receiver<Arc<QueryAttemptRecord>> {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push(Subscriber {
            id,
            tx,
            dropping: false,
        });
        tracing::debug!("{}: subscriber {} attached", self.inner.name, id);
        rx
    }

    /// Deliver `record` to every live subscriber.
    pub fn publish(&self, record: Arc<QueryAttemptRecord>) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain_mut(|sub| match sub.tx.try_send(record.clone()) {
            Ok(()) => {
                sub.dropping = false;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                if !sub.dropping {
                    sub.dropping = true;
                    tracing::warn!("{}: subscriber {} is full, dropping records", self.inner.name, sub.id);
                }
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("{}: subscriber {} detached", self.inner.name, sub.id);
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Records lost to full subscriber buffers, summed over subscribers.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl TelemetrySink for StreamLogger {
    fn send(&self, record: QueryAttemptRecord) {
        self.publish(Arc::new(record));
    }
}
