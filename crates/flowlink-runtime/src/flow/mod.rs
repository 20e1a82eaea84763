//! Flows
//!
//! A flow is an execution context that owns a handler-binding stack and a
//! dispatch loop. All variants share [`FlowCore`], which holds the queue, the
//! binder, the attached cases and the lifecycle state machine:
//!
//! `Stopped -> Starting -> Running -> Stopping -> Stopped`
//!
//! `start` and `stop` are idempotent and serialized by a lifecycle lock. On
//! start the cases install their bindings before the first dequeue; on stop the
//! queue is closed to unblock the loop, the loop threads are joined and the
//! bindings are torn down.

mod frame;
mod multi;
mod pool;
mod single;
mod threadless;

pub use frame::{FrameClock, FrameFlow, Update};
pub use multi::MultiThreadFlow;
pub use pool::ThreadPoolFlow;
pub use single::SingleThreadFlow;
pub use threadless::ThreadlessFlow;

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, error, info, trace, warn};

use flowlink_core::{Event, EventQueue, FlowConfig, FlowError, Result};

use crate::case::{Binder, Case};

/// Queue type shared by every flow
pub type FlowQueue = EventQueue<Box<dyn Event>>;

// ----------------------------------------------------------------------------
// Flow State
// ----------------------------------------------------------------------------

/// Lifecycle state of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

// ----------------------------------------------------------------------------
// Current Flow
// ----------------------------------------------------------------------------

thread_local! {
    static CURRENT_FLOW: RefCell<Option<Arc<str>>> = const { RefCell::new(None) };
}

/// Name of the flow whose handler is running on this thread, if any
pub fn current_flow() -> Option<Arc<str>> {
    CURRENT_FLOW.with(|current| current.borrow().clone())
}

struct CurrentFlowGuard {
    previous: Option<Arc<str>>,
}

impl CurrentFlowGuard {
    fn enter(name: &Arc<str>) -> Self {
        let previous = CURRENT_FLOW.with(|current| current.replace(Some(Arc::clone(name))));
        Self { previous }
    }
}

impl Drop for CurrentFlowGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_FLOW.with(|current| *current.borrow_mut() = previous);
    }
}

// ----------------------------------------------------------------------------
// Flow Trait
// ----------------------------------------------------------------------------

/// An execution context attached to the hub
pub trait Flow: Send + Sync {
    fn core(&self) -> &FlowCore;

    /// Start the flow. No-op unless stopped.
    fn start(&self) -> Result<()>;

    /// Stop the flow and wait for its threads. No-op unless running.
    fn stop(&self);

    fn name(&self) -> &str {
        self.core().name()
    }

    fn state(&self) -> FlowState {
        self.core().state()
    }

    /// Enqueue `event` for dispatch
    fn feed(&self, event: Box<dyn Event>) -> bool {
        self.core().feed(event)
    }

    /// Whether a binding of this flow matches `event`
    fn matches(&self, event: &dyn Event) -> bool {
        self.core().matches(event)
    }

    /// Add a case; it takes effect on the next start
    fn add_case(&self, case: Arc<dyn Case>) {
        self.core().add_case(case)
    }
}

// ----------------------------------------------------------------------------
// Flow Core
// ----------------------------------------------------------------------------

/// State shared by every flow variant
pub struct FlowCore {
    name: Arc<str>,
    config: FlowConfig,
    queue: Option<RwLock<Arc<FlowQueue>>>,
    binder: RwLock<Binder>,
    cases: Mutex<Vec<Arc<dyn Case>>>,
    state: Mutex<FlowState>,
    lifecycle: Mutex<()>,
    depth_warned: AtomicBool,
}

impl FlowCore {
    /// Create a core that owns an event queue
    pub fn new<T: Into<String>>(name: T, config: FlowConfig) -> Self {
        Self::build(name.into(), config, true)
    }

    /// Create a core without a queue, for update-only frame flows
    pub fn without_queue<T: Into<String>>(name: T, config: FlowConfig) -> Self {
        Self::build(name.into(), config, false)
    }

    fn build(name: String, config: FlowConfig, with_queue: bool) -> Self {
        Self {
            name: Arc::from(name),
            config,
            queue: with_queue.then(|| RwLock::new(Arc::new(FlowQueue::new()))),
            binder: RwLock::new(Binder::new()),
            cases: Mutex::new(Vec::new()),
            state: Mutex::new(FlowState::Stopped),
            lifecycle: Mutex::new(()),
            depth_warned: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn state(&self) -> FlowState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: FlowState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn has_queue(&self) -> bool {
        self.queue.is_some()
    }

    /// The queue of the current run
    pub fn queue(&self) -> Option<Arc<FlowQueue>> {
        self.queue.as_ref().map(|queue| {
            Arc::clone(&queue.read().unwrap_or_else(PoisonError::into_inner))
        })
    }

    /// Queued events not yet dispatched
    pub fn queue_len(&self) -> usize {
        self.queue().map(|queue| queue.len()).unwrap_or(0)
    }

    pub fn add_case(&self, case: Arc<dyn Case>) {
        self.cases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(case);
    }

    pub fn matches(&self, event: &dyn Event) -> bool {
        self.queue.is_some()
            && self
                .binder
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .matches(event)
    }

    /// Enqueue `event`. Fails if the flow has no queue or it was closed.
    pub fn feed(&self, event: Box<dyn Event>) -> bool {
        let Some(queue) = self.queue() else {
            debug!("Flow {} has no queue; dropping {}", self.name, event.type_name());
            return false;
        };
        if queue.enqueue(event).is_err() {
            debug!("Flow {} queue is closed", self.name);
            return false;
        }
        self.check_depth(queue.len());
        true
    }

    fn check_depth(&self, depth: usize) {
        let threshold = self.config.queue_warn_threshold;
        if threshold == 0 {
            return;
        }
        if depth >= threshold {
            if !self.depth_warned.swap(true, Ordering::Relaxed) {
                warn!(
                    "Flow {} queue depth {} reached threshold {}",
                    self.name, depth, threshold
                );
            }
        } else if depth < threshold / 2 {
            self.depth_warned.store(false, Ordering::Relaxed);
        }
    }

    /// Run every matching handler for `event` on the calling thread.
    ///
    /// A panicking handler is logged and does not stop the remaining handlers.
    pub fn dispatch(&self, event: Box<dyn Event>) {
        let handlers = self
            .binder
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers_for(event.as_ref());
        if handlers.is_empty() {
            trace!("Flow {}: no handler for {}", self.name, event.type_name());
            return;
        }

        let _current = CurrentFlowGuard::enter(&self.name);
        for handler in handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(event.as_ref())));
            if let Err(payload) = outcome {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    "Handler for {} panicked in flow {}: {}",
                    event.type_name(),
                    self.name,
                    reason
                );
            }
        }
    }

    /// Drive the `Stopped -> Running` transition.
    ///
    /// `spawn` starts the variant's loop; it receives the queue of this run.
    pub fn start_with<F>(&self, spawn: F) -> Result<()>
    where
        F: FnOnce(Option<Arc<FlowQueue>>) -> Result<()>,
    {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state() != FlowState::Stopped {
            return Ok(());
        }
        self.set_state(FlowState::Starting);
        debug!("Starting flow {}", self.name);

        let queue = self.renew_queue();
        if let Err(e) = self.setup_cases() {
            self.teardown_cases();
            self.set_state(FlowState::Stopped);
            return Err(e);
        }
        if let Err(e) = spawn(queue) {
            self.close_queue();
            self.teardown_cases();
            self.set_state(FlowState::Stopped);
            return Err(FlowError::StartFailed {
                name: self.name.to_string(),
                reason: e.to_string(),
            }
            .into());
        }

        self.set_state(FlowState::Running);
        info!("Flow {} started", self.name);
        Ok(())
    }

    /// Drive the `Running -> Stopped` transition.
    ///
    /// The queue is closed before `join` runs, so blocked loops wake up.
    pub fn stop_with<F: FnOnce()>(&self, join: F) {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state() != FlowState::Running {
            return;
        }
        self.set_state(FlowState::Stopping);
        debug!("Stopping flow {}", self.name);

        self.close_queue();
        join();
        let discarded = self.queue_len();
        if discarded > 0 {
            debug!("Flow {} discarded {} undispatched events", self.name, discarded);
        }
        self.teardown_cases();

        self.set_state(FlowState::Stopped);
        info!("Flow {} stopped", self.name);
    }

    /// A closed queue is never reopened; a restart gets a fresh one
    fn renew_queue(&self) -> Option<Arc<FlowQueue>> {
        let slot = self.queue.as_ref()?;
        let mut queue = slot.write().unwrap_or_else(PoisonError::into_inner);
        if queue.is_closed() {
            *queue = Arc::new(FlowQueue::new());
        }
        Some(Arc::clone(&queue))
    }

    fn close_queue(&self) {
        if let Some(queue) = self.queue() {
            queue.close();
        }
    }

    fn setup_cases(&self) -> Result<()> {
        let cases = self
            .cases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut binder = self.binder.write().unwrap_or_else(PoisonError::into_inner);
        for case in cases {
            case.setup(&mut binder).map_err(|e| FlowError::CaseSetup {
                name: self.name.to_string(),
                reason: format!("{}: {}", case.name(), e),
            })?;
        }
        Ok(())
    }

    fn teardown_cases(&self) {
        let cases = self
            .cases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut binder = self.binder.write().unwrap_or_else(PoisonError::into_inner);
        for case in cases.iter().rev() {
            case.teardown(&mut binder);
        }
        binder.clear();
    }
}

impl core::fmt::Debug for FlowCore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FlowCore")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("queue_len", &self.queue_len())
            .finish()
    }
}

/// Blocking drain loop used by the threaded variants
pub(crate) fn drain(core: &FlowCore, queue: &FlowQueue) {
    while let Some(event) = queue.dequeue() {
        core.dispatch(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::FnCase;
    use flowlink_core::define_event;
    use std::sync::atomic::AtomicUsize;

    define_event! {
        pub struct Probe = 11 {}
    }

    #[test]
    fn test_dispatch_survives_panicking_handler() {
        let core = FlowCore::new("current-flow", FlowConfig::testing());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        core.add_case(Arc::new(FnCase::new("current-flow", move |binder: &mut Binder| {
            binder.bind_type(|_: &Probe| panic!("boom"));
            let counter = Arc::clone(&counter);
            binder.bind_type(move |_: &Probe| {
                assert_eq!(current_flow().as_deref(), Some("current-flow"));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        })));

        core.start_with(|_| Ok(())).unwrap();
        core.dispatch(Box::new(Probe::new()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(current_flow().is_none());
    }

    #[test]
    fn test_lifecycle_is_idempotent() {
        let core = FlowCore::new("idle", FlowConfig::testing());
        let starts = AtomicUsize::new(0);

        core.start_with(|_| {
            starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        core.start_with(|_| {
            starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(core.state(), FlowState::Running);

        core.stop_with(|| {});
        core.stop_with(|| {});
        assert_eq!(core.state(), FlowState::Stopped);
        assert!(!core.feed(Box::new(Probe::new())));

        core.start_with(|_| Ok(())).unwrap();
        assert!(core.feed(Box::new(Probe::new())));
    }

    #[test]
    fn test_failed_spawn_rolls_back() {
        let core = FlowCore::new("broken", FlowConfig::testing());
        let result = core.start_with(|_| Err(flowlink_core::FlowlinkError::config_error("no")));
        assert!(result.is_err());
        assert_eq!(core.state(), FlowState::Stopped);
    }
}
