//! Frame-based flow
//!
//! A loop thread calls [`Update::update`] once per fixed resolution tick. When
//! the flow owns a queue, queued events are dispatched within whatever is left
//! of the tick; an empty queue costs a short sleep. Without a queue the thread
//! sleeps out the remainder of the tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{error, trace};

use flowlink_core::{FlowConfig, FlowlinkError, Result};

use super::{Flow, FlowCore, FlowQueue};

/// Sleep taken when the queue is empty and the tick still has budget
const IDLE_SLEEP: Duration = Duration::from_millis(1);

// ----------------------------------------------------------------------------
// Frame Clock
// ----------------------------------------------------------------------------

/// Timing information handed to each update
#[derive(Debug, Clone, Copy)]
pub struct FrameClock {
    started: Instant,
    previous: Instant,
    now: Instant,
    frame: u64,
}

impl FrameClock {
    fn new(now: Instant) -> Self {
        Self {
            started: now,
            previous: now,
            now,
            frame: 0,
        }
    }

    fn advance(&mut self, now: Instant) {
        self.previous = self.now;
        self.now = now;
        self.frame += 1;
    }

    /// Time since the loop started
    pub fn elapsed(&self) -> Duration {
        self.now.duration_since(self.started)
    }

    /// Time since the previous update
    pub fn delta(&self) -> Duration {
        self.now.duration_since(self.previous)
    }

    /// Start of the current tick
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Index of the current tick, starting at 1
    pub fn frame(&self) -> u64 {
        self.frame
    }
}

// ----------------------------------------------------------------------------
// Update
// ----------------------------------------------------------------------------

/// Per-tick work of a frame flow
pub trait Update: Send + 'static {
    fn update(&mut self, clock: &FrameClock);
}

impl<F> Update for F
where
    F: FnMut(&FrameClock) + Send + 'static,
{
    fn update(&mut self, clock: &FrameClock) {
        self(clock)
    }
}

// ----------------------------------------------------------------------------
// Frame Flow
// ----------------------------------------------------------------------------

/// Flow driven by a fixed-resolution tick
pub struct FrameFlow {
    core: Arc<FlowCore>,
    resolution: Duration,
    updater: Mutex<Option<Box<dyn Update>>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<Box<dyn Update>>>>,
}

impl FrameFlow {
    /// Frame flow that also dispatches queued events
    pub fn new<T, U>(name: T, config: FlowConfig, updater: U) -> Arc<Self>
    where
        T: Into<String>,
        U: Update,
    {
        Arc::new(Self::build(FlowCore::new(name, config), Box::new(updater)))
    }

    /// Frame flow that only runs updates
    pub fn update_only<T, U>(name: T, config: FlowConfig, updater: U) -> Arc<Self>
    where
        T: Into<String>,
        U: Update,
    {
        Arc::new(Self::build(
            FlowCore::without_queue(name, config),
            Box::new(updater),
        ))
    }

    pub(crate) fn build(core: FlowCore, updater: Box<dyn Update>) -> Self {
        let resolution = core.config().frame_resolution.max(Duration::from_micros(100));
        Self {
            core: Arc::new(core),
            resolution,
            updater: Mutex::new(Some(updater)),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn resolution(&self) -> Duration {
        self.resolution
    }
}

fn run_frames(
    core: &FlowCore,
    queue: Option<Arc<FlowQueue>>,
    resolution: Duration,
    running: &AtomicBool,
    mut updater: Box<dyn Update>,
) -> Box<dyn Update> {
    let mut clock = FrameClock::new(Instant::now());
    while running.load(Ordering::Acquire) {
        let tick_start = Instant::now();
        clock.advance(tick_start);
        updater.update(&clock);

        let deadline = tick_start + resolution;
        match &queue {
            Some(queue) => loop {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                match queue.try_dequeue() {
                    Some(event) => core.dispatch(event),
                    None if queue.is_closed() => break,
                    None => thread::sleep(IDLE_SLEEP.min(deadline - now)),
                }
            },
            None => thread::sleep(deadline.saturating_duration_since(Instant::now())),
        }

        let overrun = Instant::now().saturating_duration_since(deadline);
        if overrun > resolution {
            trace!("Flow {} tick overran by {:?}", core.name(), overrun);
        }
    }
    updater
}

impl Flow for FrameFlow {
    fn core(&self) -> &FlowCore {
        &self.core
    }

    fn start(&self) -> Result<()> {
        self.core.start_with(|queue| {
            let updater = self
                .updater
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .ok_or_else(|| FlowlinkError::config_error("frame updater is missing"))?;

            self.running.store(true, Ordering::Release);
            let core = Arc::clone(&self.core);
            let running = Arc::clone(&self.running);
            let resolution = self.resolution;
            let spawned = thread::Builder::new()
                .name(format!("flow-{}", self.core.name()))
                .spawn(move || run_frames(&core, queue, resolution, &running, updater));
            match spawned {
                Ok(handle) => {
                    *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                    Ok(())
                }
                Err(e) => {
                    // The updater moved into the failed closure and is gone.
                    self.running.store(false, Ordering::Release);
                    Err(e.into())
                }
            }
        })
    }

    fn stop(&self) {
        self.core.stop_with(|| {
            self.running.store(false, Ordering::Release);
            let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(handle) = handle {
                match handle.join() {
                    Ok(updater) => {
                        *self.updater.lock().unwrap_or_else(PoisonError::into_inner) =
                            Some(updater);
                    }
                    Err(_) => error!("Flow {} frame thread panicked", self.core.name()),
                }
            }
        });
    }
}

impl Drop for FrameFlow {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_update_runs_every_tick() {
        let frames = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&frames);
        let flow = FrameFlow::update_only(
            "frames",
            FlowConfig::testing(),
            move |clock: &FrameClock| {
                seen.store(clock.frame(), Ordering::SeqCst);
            },
        );

        flow.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while frames.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        flow.stop();

        assert!(frames.load(Ordering::SeqCst) >= 3);
        assert!(!flow.core().has_queue());
    }

    #[test]
    fn test_restart_reuses_updater() {
        let flow = FrameFlow::update_only("restart", FlowConfig::testing(), |_: &FrameClock| {});
        flow.start().unwrap();
        flow.stop();
        flow.start().unwrap();
        flow.stop();
    }
}
