//! Single-thread flow: one dedicated thread dispatches strictly in order.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::error;

use flowlink_core::{FlowConfig, FlowError, Result};

use super::{drain, Flow, FlowCore};

/// Flow with one dispatch thread; handlers never run concurrently
pub struct SingleThreadFlow {
    core: Arc<FlowCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SingleThreadFlow {
    pub fn new<T: Into<String>>(name: T, config: FlowConfig) -> Arc<Self> {
        Arc::new(Self {
            core: Arc::new(FlowCore::new(name, config)),
            worker: Mutex::new(None),
        })
    }
}

impl Flow for SingleThreadFlow {
    fn core(&self) -> &FlowCore {
        &self.core
    }

    fn start(&self) -> Result<()> {
        self.core.start_with(|queue| {
            let queue = queue.ok_or_else(|| FlowError::NoQueue {
                name: self.core.name().to_string(),
            })?;
            let core = Arc::clone(&self.core);
            let handle = thread::Builder::new()
                .name(format!("flow-{}", self.core.name()))
                .spawn(move || drain(&core, &queue))?;
            *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            Ok(())
        })
    }

    fn stop(&self) {
        self.core.stop_with(|| {
            let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    error!("Flow {} dispatch thread panicked", self.core.name());
                }
            }
        });
    }
}

impl Drop for SingleThreadFlow {
    fn drop(&mut self) {
        self.stop();
    }
}
