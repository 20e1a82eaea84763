//! Heartbeat strategy
//!
//! Driven by the hub heartbeat tick. Outgoing mode sends a `HeartbeatEvent`
//! whenever nothing else went out since the previous tick; incoming mode counts
//! consecutive silent ticks and closes the session once the count reaches the
//! threshold. Any received frame counts as traffic.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{trace, warn};

use flowlink_core::{Event, HeartbeatConfig, HeartbeatEvent};

use super::{Action, Actions, Claim, SessionStrategy, SessionView, StrategyKind};
use crate::session::Stage;

/// Link-level heartbeat configuration
#[derive(Debug, Clone)]
pub struct HeartbeatTemplate {
    config: HeartbeatConfig,
}

impl HeartbeatTemplate {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    pub fn instantiate(&self) -> Arc<Mutex<HeartbeatStrategy>> {
        Arc::new(Mutex::new(HeartbeatStrategy::new(self.config.clone())))
    }
}

/// Per-session keepalive state
#[derive(Debug)]
pub struct HeartbeatStrategy {
    config: HeartbeatConfig,
    rx: bool,
    tx: bool,
    failures: u32,
}

impl HeartbeatStrategy {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            rx: false,
            tx: false,
            failures: 0,
        }
    }

    /// Consecutive ticks without inbound traffic
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl SessionStrategy for HeartbeatStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Heartbeat
    }

    fn try_claim(&mut self, _view: &SessionView, event: &dyn Event) -> Claim {
        if event.event_type() == HeartbeatEvent::TYPE_ID {
            Claim::claimed([])
        } else {
            Claim::pass()
        }
    }

    fn note_received(&mut self) {
        self.rx = true;
    }

    fn note_sent(&mut self, event_type: i32) {
        if event_type != HeartbeatEvent::TYPE_ID {
            self.tx = true;
        }
    }

    fn on_tick(&mut self, view: &SessionView, _now: Instant) -> Actions {
        let mut actions = Actions::new();
        if view.stage != Stage::Established {
            return actions;
        }

        if self.config.outgoing && !self.tx {
            trace!("Idle tick, sending heartbeat");
            let mut beat = HeartbeatEvent::new();
            beat.set_transform_eligible(false);
            actions.push(Action::Send(Box::new(beat)));
        }

        if self.config.incoming {
            if self.rx {
                self.failures = 0;
            } else {
                self.failures += 1;
                if self.failures >= self.config.threshold_failure_count {
                    warn!(
                        "No traffic for {} heartbeat ticks, closing session",
                        self.failures
                    );
                    // Abrupt close: a link with recovery reconnects and resumes
                    actions.push(Action::Close);
                }
            }
        }

        self.rx = false;
        self.tx = false;
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Counters, Role};

    fn established() -> SessionView {
        SessionView {
            role: Role::Client,
            stage: Stage::Established,
            counters: Counters::default(),
        }
    }

    fn config(threshold: u32) -> HeartbeatConfig {
        HeartbeatConfig {
            threshold_failure_count: threshold,
            ..HeartbeatConfig::default()
        }
    }

    #[test]
    fn test_idle_tick_sends_heartbeat() {
        let mut heartbeat = HeartbeatStrategy::new(config(3));
        let actions = heartbeat.on_tick(&established(), Instant::now());
        assert!(matches!(actions[0], Action::Send(_)));

        heartbeat.note_sent(7);
        heartbeat.note_received();
        let actions = heartbeat.on_tick(&established(), Instant::now());
        assert!(actions.is_empty());
    }

    #[test]
    fn test_own_heartbeats_do_not_count_as_traffic() {
        let mut heartbeat = HeartbeatStrategy::new(config(3));
        heartbeat.note_sent(HeartbeatEvent::TYPE_ID);
        let actions = heartbeat.on_tick(&established(), Instant::now());
        assert!(actions.iter().any(|a| matches!(a, Action::Send(_))));
    }

    #[test]
    fn test_silence_reaches_threshold_then_traffic_resets() {
        let mut heartbeat = HeartbeatStrategy::new(config(3));
        let now = Instant::now();

        heartbeat.on_tick(&established(), now);
        heartbeat.on_tick(&established(), now);
        assert_eq!(heartbeat.failures(), 2);

        heartbeat.note_received();
        heartbeat.on_tick(&established(), now);
        assert_eq!(heartbeat.failures(), 0);

        for _ in 0..2 {
            let actions = heartbeat.on_tick(&established(), now);
            assert!(!actions.iter().any(|a| matches!(a, Action::Close)));
        }
        let actions = heartbeat.on_tick(&established(), now);
        assert!(actions.iter().any(|a| matches!(a, Action::Close)));
    }

    #[test]
    fn test_ticks_before_establishment_are_ignored() {
        let mut heartbeat = HeartbeatStrategy::new(config(1));
        let view = SessionView {
            stage: Stage::Channel,
            ..established()
        };
        assert!(heartbeat.on_tick(&view, Instant::now()).is_empty());
        assert_eq!(heartbeat.failures(), 0);
    }

    #[test]
    fn test_claims_only_heartbeats() {
        let mut heartbeat = HeartbeatStrategy::new(config(3));
        assert!(heartbeat.try_claim(&established(), &HeartbeatEvent::new()).claimed);
        assert!(
            !heartbeat
                .try_claim(&established(), &flowlink_core::SessionEnd::new())
                .claimed
        );
    }
}
