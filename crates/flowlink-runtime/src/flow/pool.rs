//! Thread-pool flow (legacy).
//!
//! One thread drains the queue and hands every event to a blocking task on a
//! private tokio runtime. There is no ordering between consecutive events and
//! no back-pressure: a burst of slow handlers grows the blocking pool up to its
//! limit and then queues tasks without bound. Prefer [`MultiThreadFlow`] for
//! new code.
//!
//! [`MultiThreadFlow`]: super::MultiThreadFlow

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tracing::{error, warn};

use flowlink_core::{FlowConfig, FlowError, Result};

use super::{Flow, FlowCore};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Flow that dispatches each event as an independent blocking task
pub struct ThreadPoolFlow {
    core: Arc<FlowCore>,
    max_tasks: usize,
    runtime: Mutex<Option<Runtime>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadPoolFlow {
    pub fn new<T: Into<String>>(name: T, config: FlowConfig) -> Arc<Self> {
        let max_tasks = config.multi_thread_workers.max(1);
        Arc::new(Self {
            core: Arc::new(FlowCore::new(name, config)),
            max_tasks,
            runtime: Mutex::new(None),
            dispatcher: Mutex::new(None),
        })
    }
}

impl Flow for ThreadPoolFlow {
    fn core(&self) -> &FlowCore {
        &self.core
    }

    fn start(&self) -> Result<()> {
        self.core.start_with(|queue| {
            let queue = queue.ok_or_else(|| FlowError::NoQueue {
                name: self.core.name().to_string(),
            })?;
            let runtime = Builder::new_multi_thread()
                .worker_threads(1)
                .max_blocking_threads(self.max_tasks)
                .thread_name(format!("flow-{}-pool", self.core.name()))
                .build()?;
            let handle = runtime.handle().clone();

            let core = Arc::clone(&self.core);
            let dispatcher = thread::Builder::new()
                .name(format!("flow-{}", self.core.name()))
                .spawn(move || {
                    while let Some(event) = queue.dequeue() {
                        let core = Arc::clone(&core);
                        drop(handle.spawn_blocking(move || core.dispatch(event)));
                    }
                })?;

            *self.runtime.lock().unwrap_or_else(PoisonError::into_inner) = Some(runtime);
            *self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(dispatcher);
            Ok(())
        })
    }

    fn stop(&self) {
        self.core.stop_with(|| {
            let dispatcher = self
                .dispatcher
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(dispatcher) = dispatcher {
                if dispatcher.join().is_err() {
                    error!("Flow {} dispatcher panicked", self.core.name());
                }
            }
            let runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(runtime) = runtime {
                runtime.shutdown_timeout(SHUTDOWN_GRACE);
            }
        });
    }
}

impl Drop for ThreadPoolFlow {
    fn drop(&mut self) {
        if self.core.state() == super::FlowState::Running {
            warn!("Flow {} dropped while running", self.core.name());
        }
        self.stop();
    }
}
