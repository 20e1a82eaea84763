//! Timer service
//!
//! [`Timer`] keeps one-shot reservations in a due-time ordered heap and
//! repeating reservations in a separate map. Each `tick` fires everything that
//! is due. A repetition advances by exactly one interval per firing, so a tick
//! that arrives late fires once for every interval that elapsed instead of
//! drifting.
//!
//! [`TimeFlow`] is a frame flow whose update ticks a timer and re-posts every
//! fired event through the hub. Attach it to the hub before the flows that use
//! it: it then starts first and stops last.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tracing::{trace, warn};

use flowlink_core::{Event, FlowConfig, Result};

use crate::flow::{Flow, FlowCore, FrameClock, FrameFlow, Update};
use crate::hub::Hub;

/// Shortest accepted repetition interval
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Handle of a one-shot reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReservationId(u64);

/// Handle of a repeating reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepetitionId(u64);

// ----------------------------------------------------------------------------
// Timeout Scheduler
// ----------------------------------------------------------------------------

/// Scheduling seam used by components that need delayed events
pub trait TimeoutScheduler: Send + Sync {
    /// Post `event` through the hub once `delay` has elapsed
    fn schedule(&self, event: Box<dyn Event>, delay: Duration) -> ReservationId;

    /// Cancel a pending reservation; `false` if it already fired
    fn cancel(&self, id: ReservationId) -> bool;
}

// ----------------------------------------------------------------------------
// Timer
// ----------------------------------------------------------------------------

struct Repetition {
    next: Instant,
    interval: Duration,
    event: Box<dyn Event>,
}

#[derive(Default)]
struct TimerState {
    due: BinaryHeap<Reverse<(Instant, u64)>>,
    one_shots: HashMap<u64, Box<dyn Event>>,
    repetitions: HashMap<u64, Repetition>,
}

impl TimerState {
    fn has_due(&self, now: Instant) -> bool {
        let one_shot_due = self
            .due
            .peek()
            .map(|Reverse((due, _))| *due <= now)
            .unwrap_or(false);
        one_shot_due || self.repetitions.values().any(|r| r.next <= now)
    }
}

/// One-shot and repeating event reservations
#[derive(Default)]
pub struct Timer {
    state: RwLock<TimerState>,
    next_id: AtomicU64,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Fire `event` once `delay` from now
    pub fn reserve(&self, event: Box<dyn Event>, delay: Duration) -> ReservationId {
        self.reserve_at(event, Instant::now() + delay)
    }

    /// Fire `event` once at `due`
    pub fn reserve_at(&self, event: Box<dyn Event>, due: Instant) -> ReservationId {
        let id = self.allocate();
        trace!("Reserved {} as #{}", event.type_name(), id);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.due.push(Reverse((due, id)));
        state.one_shots.insert(id, event);
        ReservationId(id)
    }

    pub fn cancel(&self, id: ReservationId) -> bool {
        // The heap entry stays behind and is skipped when it comes due.
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .one_shots
            .remove(&id.0)
            .is_some()
    }

    /// Fire a copy of `event` every `interval`, starting one interval from now
    pub fn reserve_repetition(&self, event: Box<dyn Event>, interval: Duration) -> RepetitionId {
        self.reserve_repetition_from(event, interval, Instant::now())
    }

    /// Like [`reserve_repetition`](Self::reserve_repetition) with an explicit
    /// start time
    pub fn reserve_repetition_from(
        &self,
        event: Box<dyn Event>,
        interval: Duration,
        start: Instant,
    ) -> RepetitionId {
        let interval = if interval < MIN_INTERVAL {
            warn!(
                "Repetition interval {:?} for {} raised to {:?}",
                interval,
                event.type_name(),
                MIN_INTERVAL
            );
            MIN_INTERVAL
        } else {
            interval
        };
        let id = self.allocate();
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .repetitions
            .insert(
                id,
                Repetition {
                    next: start + interval,
                    interval,
                    event,
                },
            );
        RepetitionId(id)
    }

    pub fn cancel_repetition(&self, id: RepetitionId) -> bool {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .repetitions
            .remove(&id.0)
            .is_some()
    }

    /// Pending one-shots plus active repetitions
    pub fn pending(&self) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.one_shots.len() + state.repetitions.len()
    }

    /// Fire everything due now
    pub fn tick(&self, fire: &mut dyn FnMut(Box<dyn Event>)) -> usize {
        self.tick_at(Instant::now(), fire)
    }

    /// Fire everything due at `now`. Callbacks run without the timer lock held,
    /// so they may reserve again.
    pub fn tick_at(&self, now: Instant, fire: &mut dyn FnMut(Box<dyn Event>)) -> usize {
        if !self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .has_due(now)
        {
            return 0;
        }

        let mut fired = Vec::new();
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            while let Some(Reverse((due, id))) = state.due.peek().copied() {
                if due > now {
                    break;
                }
                state.due.pop();
                if let Some(event) = state.one_shots.remove(&id) {
                    fired.push(event);
                }
            }
            for repetition in state.repetitions.values_mut() {
                while repetition.next <= now {
                    fired.push(repetition.event.clone());
                    repetition.next += repetition.interval;
                }
            }
        }

        let count = fired.len();
        for event in fired {
            fire(event);
        }
        count
    }
}

impl core::fmt::Debug for Timer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Timer")
            .field("pending", &self.pending())
            .finish()
    }
}

impl TimeoutScheduler for Timer {
    fn schedule(&self, event: Box<dyn Event>, delay: Duration) -> ReservationId {
        self.reserve(event, delay)
    }

    fn cancel(&self, id: ReservationId) -> bool {
        Timer::cancel(self, id)
    }
}

// ----------------------------------------------------------------------------
// Time Flow
// ----------------------------------------------------------------------------

struct TimerUpdate {
    timer: Arc<Timer>,
    hub: Weak<Hub>,
}

impl Update for TimerUpdate {
    fn update(&mut self, clock: &FrameClock) {
        let hub = &self.hub;
        self.timer.tick_at(clock.now(), &mut |event| match hub.upgrade() {
            Some(hub) => {
                hub.post(event);
            }
            None => trace!("Hub is gone; dropping timed {}", event.type_name()),
        });
    }
}

/// Frame flow that runs the timer service
pub struct TimeFlow {
    frame: FrameFlow,
    timer: Arc<Timer>,
}

impl TimeFlow {
    /// Create a time flow posting to `hub`. The caller attaches it.
    pub fn new<T: Into<String>>(name: T, hub: &Arc<Hub>, config: FlowConfig) -> Arc<Self> {
        let timer = Arc::new(Timer::new());
        let updater = TimerUpdate {
            timer: Arc::clone(&timer),
            hub: Arc::downgrade(hub),
        };
        let frame = FrameFlow::build(FlowCore::without_queue(name, config), Box::new(updater));
        Arc::new(Self { frame, timer })
    }

    pub fn timer(&self) -> &Arc<Timer> {
        &self.timer
    }

    pub fn reserve(&self, event: Box<dyn Event>, delay: Duration) -> ReservationId {
        self.timer.reserve(event, delay)
    }

    pub fn cancel(&self, id: ReservationId) -> bool {
        self.timer.cancel(id)
    }

    pub fn reserve_repetition(&self, event: Box<dyn Event>, interval: Duration) -> RepetitionId {
        self.timer.reserve_repetition(event, interval)
    }

    pub fn cancel_repetition(&self, id: RepetitionId) -> bool {
        self.timer.cancel_repetition(id)
    }

    /// Post the hub heartbeat every `interval`
    pub fn start_heartbeat(&self, interval: Duration) -> RepetitionId {
        self.reserve_repetition(Hub::heartbeat_event(), interval)
    }
}

impl Flow for TimeFlow {
    fn core(&self) -> &FlowCore {
        self.frame.core()
    }

    fn start(&self) -> Result<()> {
        self.frame.start()
    }

    fn stop(&self) {
        self.frame.stop()
    }
}

impl TimeoutScheduler for TimeFlow {
    fn schedule(&self, event: Box<dyn Event>, delay: Duration) -> ReservationId {
        self.reserve(event, delay)
    }

    fn cancel(&self, id: ReservationId) -> bool {
        TimeFlow::cancel(self, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowlink_core::HeartbeatEvent;
    use proptest::prelude::*;

    fn heartbeat() -> Box<dyn Event> {
        Box::new(HeartbeatEvent::new())
    }

    #[test]
    fn test_one_shot_fires_once_when_due() {
        let timer = Timer::new();
        let start = Instant::now();
        timer.reserve_at(heartbeat(), start + Duration::from_millis(10));

        let mut fired = 0;
        assert_eq!(timer.tick_at(start, &mut |_| fired += 1), 0);
        assert_eq!(timer.tick_at(start + Duration::from_millis(10), &mut |_| fired += 1), 1);
        assert_eq!(timer.tick_at(start + Duration::from_secs(1), &mut |_| fired += 1), 0);
        assert_eq!(fired, 1);
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn test_cancelled_one_shot_never_fires() {
        let timer = Timer::new();
        let start = Instant::now();
        let id = timer.reserve_at(heartbeat(), start + Duration::from_millis(5));
        assert!(timer.cancel(id));
        assert!(!timer.cancel(id));
        assert_eq!(timer.tick_at(start + Duration::from_secs(1), &mut |_| {}), 0);
    }

    #[test]
    fn test_one_shots_fire_in_due_order() {
        let timer = Timer::new();
        let start = Instant::now();
        let late = HeartbeatEvent::new().with_handle(2);
        let early = HeartbeatEvent::new().with_handle(1);
        timer.reserve_at(Box::new(late), start + Duration::from_millis(20));
        timer.reserve_at(Box::new(early), start + Duration::from_millis(10));

        let mut order = Vec::new();
        timer.tick_at(start + Duration::from_millis(30), &mut |e| order.push(e.handle()));
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn test_repetition_catches_up_missed_intervals() {
        let timer = Timer::new();
        let start = Instant::now();
        let interval = Duration::from_millis(10);
        let id = timer.reserve_repetition_from(heartbeat(), interval, start);

        assert_eq!(timer.tick_at(start + Duration::from_millis(5), &mut |_| {}), 0);
        assert_eq!(timer.tick_at(start + Duration::from_millis(10), &mut |_| {}), 1);
        // Three intervals elapsed while the caller was stalled.
        assert_eq!(timer.tick_at(start + Duration::from_millis(45), &mut |_| {}), 3);
        assert_eq!(timer.tick_at(start + Duration::from_millis(49), &mut |_| {}), 0);
        assert_eq!(timer.tick_at(start + Duration::from_millis(50), &mut |_| {}), 1);

        assert!(timer.cancel_repetition(id));
        assert_eq!(timer.tick_at(start + Duration::from_secs(1), &mut |_| {}), 0);
    }

    proptest! {
        #[test]
        fn prop_one_shots_fire_once_in_due_order(delays in proptest::collection::vec(0u64..500, 0..64)) {
            let timer = Timer::new();
            let start = Instant::now();
            for delay in &delays {
                let event = HeartbeatEvent::new().with_handle(*delay);
                timer.reserve_at(Box::new(event), start + Duration::from_millis(*delay));
            }

            let mut fired = Vec::new();
            timer.tick_at(start + Duration::from_millis(250), &mut |e| fired.push(e.handle()));
            timer.tick_at(start + Duration::from_secs(1), &mut |e| fired.push(e.handle()));

            let mut expected = delays.clone();
            expected.sort_unstable();
            prop_assert_eq!(fired, expected);
            prop_assert_eq!(timer.pending(), 0);
        }
    }
}
