//! Multi-thread flow: N workers share one queue.
//!
//! Dequeue is the only serialization point, so two workers may run
//! consecutive events out of order.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::error;

use flowlink_core::{FlowConfig, FlowError, Result};

use super::{drain, Flow, FlowCore};

/// Flow with a fixed pool of dispatch threads
pub struct MultiThreadFlow {
    core: Arc<FlowCore>,
    workers: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MultiThreadFlow {
    /// Create a flow with `config.multi_thread_workers` workers
    pub fn new<T: Into<String>>(name: T, config: FlowConfig) -> Arc<Self> {
        let workers = config.multi_thread_workers.max(1);
        Self::with_workers(name, config, workers)
    }

    pub fn with_workers<T: Into<String>>(name: T, config: FlowConfig, workers: usize) -> Arc<Self> {
        Arc::new(Self {
            core: Arc::new(FlowCore::new(name, config)),
            workers: workers.max(1),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    fn join_all(&self) {
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("Flow {} worker panicked", self.core.name());
            }
        }
    }
}

impl Flow for MultiThreadFlow {
    fn core(&self) -> &FlowCore {
        &self.core
    }

    fn start(&self) -> Result<()> {
        self.core.start_with(|queue| {
            let queue = queue.ok_or_else(|| FlowError::NoQueue {
                name: self.core.name().to_string(),
            })?;
            for index in 0..self.workers {
                let core = Arc::clone(&self.core);
                let worker_queue = Arc::clone(&queue);
                let spawned = thread::Builder::new()
                    .name(format!("flow-{}-{}", self.core.name(), index))
                    .spawn(move || drain(&core, &worker_queue));
                match spawned {
                    Ok(handle) => self
                        .handles
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(handle),
                    Err(e) => {
                        queue.close();
                        self.join_all();
                        return Err(e.into());
                    }
                }
            }
            Ok(())
        })
    }

    fn stop(&self) {
        self.core.stop_with(|| self.join_all());
    }
}

impl Drop for MultiThreadFlow {
    fn drop(&mut self) {
        self.stop();
    }
}
