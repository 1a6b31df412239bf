//! Buffered rendezvous queue with predicate-filtered waiting.
//!
//! Two collections: pending items and pending consumers. A pushed item is
//! handed to the first registered consumer whose predicate accepts it,
//! otherwise buffered. A waiting consumer first scans the buffer front to
//! back. Predicate matching lets several logical streams (e.g. replies
//! correlated by request ID) share one queue without head-of-line blocking.

use asimov_contract::ProtocolError;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// How long a consumer is willing to wait for a matching item.
#[derive(Debug, Clone, Copy)]
pub enum Wait {
    /// Return immediately with `None` when nothing buffered matches.
    Immediate,
    /// Wait until a matching item arrives or the queue is flushed.
    Forever,
    /// Wait up to the given duration, then return `None`.
    For(Duration),
}

type WaitResult<T> = Result<Option<T>, ProtocolError>;

struct Consumer<T> {
    id: u64,
    predicate: Box<dyn Fn(&T) -> bool + Send>,
    tx: oneshot::Sender<WaitResult<T>>,
}

struct Inner<T> {
    items: VecDeque<T>,
    consumers: VecDeque<Consumer<T>>,
    next_consumer_id: u64,
}

/// Single-producer/single-consumer rendezvous with buffering.
///
/// The queue is reusable: after a flush it behaves as a fresh empty queue.
pub struct AsyncQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AsyncQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                consumers: VecDeque::new(),
                next_consumer_id: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offer an item: hand it to the first accepting consumer, or buffer it.
    pub fn push(&self, item: T) {
        let mut inner = self.lock();
        let mut item = item;
        let mut idx = 0;
        while idx < inner.consumers.len() {
            if (inner.consumers[idx].predicate)(&item) {
                let Some(consumer) = inner.consumers.remove(idx) else {
                    break;
                };
                match consumer.tx.send(Ok(Some(item))) {
                    Ok(()) => return,
                    // Receiver gave up (timed out) between matching and
                    // delivery: reclaim the item and keep scanning.
                    Err(unsent) => match unsent {
                        Ok(Some(reclaimed)) => {
                            item = reclaimed;
                            continue;
                        }
                        _ => return,
                    },
                }
            }
            idx += 1;
        }
        inner.items.push_back(item);
    }

    /// Wait for the first item matching `predicate`.
    ///
    /// Buffered items are scanned front to back before a consumer is
    /// registered; consumers are served in registration order. Returns
    /// `Ok(None)` on timeout, immediate miss, or queue close; the error a
    /// flush supplied otherwise.
    pub async fn wait_for<F>(&self, predicate: F, wait: Wait) -> WaitResult<T>
    where
        F: Fn(&T) -> bool + Send + 'static,
    {
        let (id, rx) = {
            let mut inner = self.lock();
            if let Some(pos) = inner.items.iter().position(&predicate) {
                return Ok(inner.items.remove(pos));
            }
            if matches!(wait, Wait::Immediate) {
                return Ok(None);
            }
            let (tx, rx) = oneshot::channel();
            let id = inner.next_consumer_id;
            inner.next_consumer_id += 1;
            inner.consumers.push_back(Consumer {
                id,
                predicate: Box::new(predicate),
                tx,
            });
            (id, rx)
        };

        match wait {
            Wait::Immediate => Ok(None),
            Wait::Forever => rx.await.unwrap_or(Ok(None)),
            Wait::For(duration) => {
                let mut rx = rx;
                match tokio::time::timeout(duration, &mut rx).await {
                    Ok(delivered) => delivered.unwrap_or(Ok(None)),
                    Err(_elapsed) => {
                        self.deregister(id);
                        // An item may have been handed over in the race window
                        // between the timer firing and deregistration.
                        rx.try_recv().unwrap_or(Ok(None))
                    }
                }
            }
        }
    }

    fn deregister(&self, id: u64) {
        self.lock().consumers.retain(|c| c.id != id);
    }

    /// Drop all items and consumers.
    ///
    /// With an error, every pending consumer completes with that error;
    /// without, pending consumers complete empty.
    pub fn flush(&self, error: Option<ProtocolError>) {
        let (items, consumers) = {
            let mut inner = self.lock();
            (
                std::mem::take(&mut inner.items),
                std::mem::take(&mut inner.consumers),
            )
        };
        drop(items);
        for consumer in consumers {
            let outcome = match &error {
                Some(e) => Err(e.clone()),
                None => Ok(None),
            };
            let _ = consumer.tx.send(outcome);
        }
    }

    /// Complete every pending consumer empty while leaving buffered items
    /// in place for later immediate drains.
    pub fn close(&self) {
        let consumers = std::mem::take(&mut self.lock().consumers);
        for consumer in consumers {
            let _ = consumer.tx.send(Ok(None));
        }
    }
}

impl<T: Clone> AsyncQueue<T> {
    /// Clone the buffered items, front to back.
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().items.iter().cloned().collect()
    }
}

impl<T> AsyncQueue<T> {
    /// Seed the buffer, preserving order. Used when restoring a snapshot.
    pub fn seed(&self, items: impl IntoIterator<Item = T>) {
        let mut inner = self.lock();
        inner.items.extend(items);
    }
}
