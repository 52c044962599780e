use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, select};

/// Timing policy of a per-connection media queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub capacity: usize,
    /// How long a producer waits for room before dropping the item.
    pub push_timeout: Duration,
    /// How long a consumer waits for an item before reporting "empty".
    pub pop_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            push_timeout: Duration::from_millis(1),
            pop_timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of [`BoundedQueue::pop_or_cancel`].
#[derive(Debug)]
pub enum Popped<T> {
    Item(T),
    /// Nothing arrived within the pop timeout.
    Empty,
    /// The cancel channel fired or was disconnected.
    Cancelled,
}

/// Bounded FIFO between the fan-out push path and one consumer thread.
///
/// A full queue refuses the newest item rather than evicting the oldest.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    config: QueueConfig,
}

impl<T> BoundedQueue<T> {
    pub fn new(config: QueueConfig) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(config.capacity.max(1));
        Self { tx, rx, config }
    }

    /// Enqueue, waiting at most the push timeout. Returns `false` if the
    /// item was dropped.
    pub fn push(&self, item: T) -> bool {
        self.tx.send_timeout(item, self.config.push_timeout).is_ok()
    }

    /// Dequeue, waiting at most the pop timeout.
    pub fn pop(&self) -> Option<T> {
        match self.rx.recv_timeout(self.config.pop_timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Like [`pop`](Self::pop), but returns early when `cancel` becomes
    /// ready (a message or disconnection).
    pub fn pop_or_cancel(&self, cancel: &Receiver<()>) -> Popped<T> {
        select! {
            recv(cancel) -> _ => Popped::Cancelled,
            recv(self.rx) -> item => match item {
                Ok(item) => Popped::Item(item),
                Err(_) => Popped::Empty,
            },
            default(self.config.pop_timeout) => Popped::Empty,
        }
    }

    /// Discard everything queued.
    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
