//! Event queue
//!
//! Unbounded multi-producer multi-consumer FIFO built on a crossbeam channel.
//! Closing pushes a `None` sentinel behind everything already queued, so
//! consumers drain the remaining items before they observe end-of-stream. A
//! consumer that takes the sentinel puts it back, which lets every worker
//! sharing the queue wind down.

use core::time::Duration;
use std::sync::{PoisonError, RwLock};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::errors::QueueError;

/// Thread-safe unbounded FIFO with blocking and non-blocking dequeue
pub struct EventQueue<T> {
    sender: Sender<Option<T>>,
    receiver: Receiver<Option<T>>,
    closing: RwLock<bool>,
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            sender,
            receiver,
            closing: RwLock::new(false),
        }
    }

    /// Append `item`, failing once the queue is closed
    pub fn enqueue(&self, item: T) -> Result<(), QueueError> {
        let closing = self.closing.read().unwrap_or_else(PoisonError::into_inner);
        if *closing {
            return Err(QueueError::Closed);
        }
        // The queue owns a receiver, so the channel cannot be disconnected.
        self.sender
            .send(Some(item))
            .map_err(|_| QueueError::Closed)
    }

    /// Block until an item is available; `None` means end-of-stream
    pub fn dequeue(&self) -> Option<T> {
        match self.receiver.recv() {
            Ok(Some(item)) => Some(item),
            Ok(None) | Err(_) => self.pass_sentinel(),
        }
    }

    /// Take an item if one is ready, never blocking
    pub fn try_dequeue(&self) -> Option<T> {
        match self.receiver.try_recv() {
            Ok(Some(item)) => Some(item),
            Ok(None) => self.pass_sentinel(),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Block for at most `timeout`.
    ///
    /// Returns `Ok(Some(item))` for an item, `Ok(None)` at end-of-stream and
    /// `Err(QueueError::Timeout)` if nothing arrived in time.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Result<Option<T>, QueueError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(Some(item)) => Ok(Some(item)),
            Ok(None) | Err(RecvTimeoutError::Disconnected) => Ok(self.pass_sentinel()),
            Err(RecvTimeoutError::Timeout) => Err(QueueError::Timeout {
                duration_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Enter the terminal closed state. Idempotent.
    pub fn close(&self) {
        let mut closing = self.closing.write().unwrap_or_else(PoisonError::into_inner);
        if *closing {
            return;
        }
        *closing = true;
        let _ = self.sender.send(None);
    }

    pub fn is_closed(&self) -> bool {
        *self.closing.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of queued items, excluding the close sentinel
    pub fn len(&self) -> usize {
        let queued = self.receiver.len();
        if self.is_closed() {
            queued.saturating_sub(1)
        } else {
            queued
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pass_sentinel(&self) -> Option<T> {
        let _ = self.sender.send(None);
        None
    }
}

impl<T> core::fmt::Debug for EventQueue<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventQueue")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
