//! Threadless flow: the owning thread pumps the queue.
//!
//! Useful for tests and for embedding in an existing loop. The `wait` helpers
//! dispatch everything that arrives until an event equivalent to the expected
//! one shows up or the timeout elapses.

use std::sync::Arc;
use std::time::{Duration, Instant};

use flowlink_core::{Event, FlowConfig, Result};

use super::{Flow, FlowCore};

/// Flow without a background thread
pub struct ThreadlessFlow {
    core: FlowCore,
}

impl ThreadlessFlow {
    pub fn new<T: Into<String>>(name: T, config: FlowConfig) -> Arc<Self> {
        Arc::new(Self {
            core: FlowCore::new(name, config),
        })
    }

    /// Block for the next event and dispatch it. `false` at end-of-stream.
    pub fn dispatch(&self) -> bool {
        let Some(queue) = self.core.queue() else {
            return false;
        };
        match queue.dequeue() {
            Some(event) => {
                self.core.dispatch(event);
                true
            }
            None => false,
        }
    }

    /// Dispatch one event if one is queued
    pub fn try_dispatch(&self) -> bool {
        let Some(queue) = self.core.queue() else {
            return false;
        };
        match queue.try_dequeue() {
            Some(event) => {
                self.core.dispatch(event);
                true
            }
            None => false,
        }
    }

    /// Dispatch everything queued right now; returns the count
    pub fn try_dispatch_all(&self) -> usize {
        let mut dispatched = 0;
        while self.try_dispatch() {
            dispatched += 1;
        }
        dispatched
    }

    /// Dispatch arriving events until one equivalent to `expected` has been
    /// dispatched. Returns a copy of the matching event.
    pub fn wait(&self, expected: &dyn Event, timeout: Duration) -> Option<Box<dyn Event>> {
        let queue = self.core.queue()?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match queue.dequeue_timeout(remaining) {
                Ok(Some(event)) => {
                    let matched = expected.equivalent(event.as_ref()).then(|| event.clone());
                    self.core.dispatch(event);
                    if matched.is_some() {
                        return matched;
                    }
                }
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// Typed [`wait`](Self::wait)
    pub fn wait_for<E: Event>(&self, expected: &E, timeout: Duration) -> Option<E> {
        self.wait(expected, timeout)?.downcast::<E>().ok().map(|event| *event)
    }
}

impl Flow for ThreadlessFlow {
    fn core(&self) -> &FlowCore {
        &self.core
    }

    fn start(&self) -> Result<()> {
        self.core.start_with(|_| Ok(()))
    }

    fn stop(&self) {
        self.core.stop_with(|| {});
    }
}
