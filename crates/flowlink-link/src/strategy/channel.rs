//! Channel strategy: three-leg transform handshake.
//!
//! 1. Initiator sends `HandshakeReq{data}` from `initialize_handshake`.
//! 2. Responder answers `HandshakeResp{data}` from `handshake`; it can decrypt
//!    from here on.
//! 3. Initiator checks the response with `finalize_handshake` and sends
//!    `HandshakeAck{result}`; on success it can encrypt and decrypt. The
//!    responder may encrypt only after a successful Ack.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use flowlink_core::{
    BufferTransform, ChannelConfig, Event, HandshakeAck, HandshakeReq, HandshakeResp,
};

use super::{Action, Actions, Claim, SessionStrategy, SessionView, StrategyKind};
use crate::session::Role;

// ----------------------------------------------------------------------------
// Template
// ----------------------------------------------------------------------------

/// Link-level channel configuration
pub struct ChannelTemplate {
    transform: Mutex<Box<dyn BufferTransform>>,
    config: ChannelConfig,
}

impl ChannelTemplate {
    pub fn new<T: BufferTransform + 'static>(transform: T, config: ChannelConfig) -> Self {
        Self::from_boxed(Box::new(transform), config)
    }

    pub fn from_boxed(transform: Box<dyn BufferTransform>, config: ChannelConfig) -> Self {
        Self {
            transform: Mutex::new(transform),
            config,
        }
    }

    /// Fresh per-session strategy with its own transform instance
    pub fn instantiate(&self, role: Role) -> Arc<Mutex<ChannelStrategy>> {
        let transform = self
            .transform
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .boxed_clone();
        Arc::new(Mutex::new(ChannelStrategy::new(
            role,
            transform,
            self.config.handshake_timeout,
        )))
    }
}

// ----------------------------------------------------------------------------
// Strategy
// ----------------------------------------------------------------------------

enum Phase {
    /// Not started; holds the transform to handshake with
    Idle(Box<dyn BufferTransform>),
    /// Initiator waiting for the response
    AwaitResponse {
        transform: Box<dyn BufferTransform>,
        since: Instant,
    },
    /// Responder waiting for the acknowledgement
    AwaitAck { since: Instant },
    Ready,
    Failed,
}

/// Per-session handshake state machine
pub struct ChannelStrategy {
    role: Role,
    phase: Phase,
    timeout: Duration,
    /// When the stage began; bounds the responder's wait for a request
    started: Option<Instant>,
}

impl ChannelStrategy {
    pub fn new(role: Role, transform: Box<dyn BufferTransform>, timeout: Duration) -> Self {
        Self {
            role,
            phase: Phase::Idle(transform),
            timeout,
            started: None,
        }
    }

    /// Whether the handshake completed on this side
    pub fn is_ready(&self) -> bool {
        matches!(self.phase, Phase::Ready)
    }

    fn fail(&mut self, reason: String) -> Actions {
        warn!("Channel handshake failed: {}", reason);
        self.phase = Phase::Failed;
        let mut actions = Actions::new();
        actions.push(Action::Fail(reason));
        actions
    }

    fn on_request(&mut self, req: &HandshakeReq) -> Claim {
        if self.role != Role::Server {
            return Claim::claimed(self.fail("unexpected handshake request".to_string()));
        }
        let transform = match std::mem::replace(&mut self.phase, Phase::Failed) {
            Phase::Idle(transform) => transform,
            other => {
                self.phase = other;
                return Claim::claimed(self.fail("duplicate handshake request".to_string()));
            }
        };
        let mut transform = transform;
        match transform.handshake(req.data()) {
            Ok(data) => {
                debug!("Channel handshake request accepted");
                self.phase = Phase::AwaitAck {
                    since: Instant::now(),
                };
                let mut resp = HandshakeResp::new();
                resp.set_data(data);
                resp.set_transform_eligible(false);
                Claim::claimed([
                    Action::InstallTransform {
                        transform,
                        rx_ready: true,
                        tx_ready: false,
                    },
                    Action::Send(Box::new(resp)),
                ])
            }
            Err(e) => Claim::claimed(self.fail(e.to_string())),
        }
    }

    fn on_response(&mut self, resp: &HandshakeResp) -> Claim {
        let mut transform = match std::mem::replace(&mut self.phase, Phase::Failed) {
            Phase::AwaitResponse { transform, .. } => transform,
            other => {
                self.phase = other;
                return Claim::claimed(self.fail("unexpected handshake response".to_string()));
            }
        };

        let result = transform.finalize_handshake(resp.data());
        let mut ack = HandshakeAck::new();
        ack.set_result(result);
        ack.set_transform_eligible(false);

        if result {
            debug!("Channel handshake finalized");
            self.phase = Phase::Ready;
            Claim::claimed([
                Action::Send(Box::new(ack)),
                Action::InstallTransform {
                    transform,
                    rx_ready: true,
                    tx_ready: true,
                },
                Action::StageComplete,
            ])
        } else {
            let mut claim = Claim::claimed([Action::Send(Box::new(ack))]);
            claim
                .actions
                .extend(self.fail("handshake response rejected".to_string()));
            claim
        }
    }

    fn on_ack(&mut self, ack: &HandshakeAck) -> Claim {
        if !matches!(self.phase, Phase::AwaitAck { .. }) {
            return Claim::claimed(self.fail("unexpected handshake acknowledgement".to_string()));
        }
        if *ack.result() {
            debug!("Channel handshake acknowledged");
            self.phase = Phase::Ready;
            Claim::claimed([Action::EnableTransmit, Action::StageComplete])
        } else {
            Claim::claimed(self.fail("peer rejected handshake".to_string()))
        }
    }
}

impl SessionStrategy for ChannelStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Channel
    }

    fn begin(&mut self, _view: &SessionView) -> Actions {
        self.started = Some(Instant::now());
        if self.role != Role::Client {
            return Actions::new();
        }
        let mut transform = match std::mem::replace(&mut self.phase, Phase::Failed) {
            Phase::Idle(transform) => transform,
            other => {
                self.phase = other;
                return Actions::new();
            }
        };
        match transform.initialize_handshake() {
            Ok(data) => {
                self.phase = Phase::AwaitResponse {
                    transform,
                    since: Instant::now(),
                };
                let mut req = HandshakeReq::new();
                req.set_data(data);
                req.set_transform_eligible(false);
                let mut actions = Actions::new();
                actions.push(Action::Send(Box::new(req)));
                actions
            }
            Err(e) => self.fail(e.to_string()),
        }
    }

    fn try_claim(&mut self, _view: &SessionView, event: &dyn Event) -> Claim {
        if let Some(req) = event.downcast_ref::<HandshakeReq>() {
            self.on_request(req)
        } else if let Some(resp) = event.downcast_ref::<HandshakeResp>() {
            self.on_response(resp)
        } else if let Some(ack) = event.downcast_ref::<HandshakeAck>() {
            self.on_ack(ack)
        } else {
            Claim::pass()
        }
    }

    fn on_tick(&mut self, _view: &SessionView, now: Instant) -> Actions {
        let since = match &self.phase {
            Phase::AwaitResponse { since, .. } | Phase::AwaitAck { since } => *since,
            Phase::Idle(_) => match self.started {
                Some(started) => started,
                None => return Actions::new(),
            },
            _ => return Actions::new(),
        };
        if now.saturating_duration_since(since) >= self.timeout {
            self.fail(format!("handshake timed out after {:?}", self.timeout))
        } else {
            Actions::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Counters, Stage};
    use flowlink_core::CipherTransform;

    fn view(role: Role) -> SessionView {
        SessionView {
            role,
            stage: Stage::Channel,
            counters: Counters::default(),
        }
    }

    fn sent<T: Event>(actions: &Actions) -> &T {
        actions
            .iter()
            .find_map(|action| match action {
                Action::Send(event) => event.downcast_ref::<T>(),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_handshake_flags_are_asymmetric() {
        let timeout = Duration::from_secs(1);
        let mut client = ChannelStrategy::new(Role::Client, Box::new(CipherTransform::new()), timeout);
        let mut server = ChannelStrategy::new(Role::Server, Box::new(CipherTransform::new()), timeout);

        let begun = client.begin(&view(Role::Client));
        let req = sent::<HandshakeReq>(&begun).clone();

        let claim = server.try_claim(&view(Role::Server), &req);
        assert!(claim.claimed);
        assert!(matches!(
            claim.actions[0],
            Action::InstallTransform {
                rx_ready: true,
                tx_ready: false,
                ..
            }
        ));
        let resp = sent::<HandshakeResp>(&claim.actions).clone();

        let claim = client.try_claim(&view(Role::Client), &resp);
        assert!(client.is_ready());
        assert!(claim
            .actions
            .iter()
            .any(|a| matches!(a, Action::StageComplete)));
        let ack = sent::<HandshakeAck>(&claim.actions).clone();
        assert!(*ack.result());

        assert!(!server.is_ready());
        let claim = server.try_claim(&view(Role::Server), &ack);
        assert!(matches!(claim.actions[0], Action::EnableTransmit));
        assert!(server.is_ready());
    }

    #[test]
    fn test_handshake_times_out() {
        let timeout = Duration::from_millis(10);
        let mut client = ChannelStrategy::new(Role::Client, Box::new(CipherTransform::new()), timeout);
        client.begin(&view(Role::Client));

        let now = Instant::now();
        assert!(client.on_tick(&view(Role::Client), now).is_empty());
        let actions = client.on_tick(&view(Role::Client), now + Duration::from_secs(1));
        assert!(matches!(actions[0], Action::Fail(_)));
    }

    #[test]
    fn test_responder_waiting_for_request_times_out() {
        let timeout = Duration::from_millis(10);
        let mut server = ChannelStrategy::new(Role::Server, Box::new(CipherTransform::new()), timeout);

        let now = Instant::now();
        assert!(server.on_tick(&view(Role::Server), now + Duration::from_secs(1)).is_empty());

        assert!(server.begin(&view(Role::Server)).is_empty());
        assert!(server.on_tick(&view(Role::Server), Instant::now()).is_empty());
        let actions = server.on_tick(&view(Role::Server), Instant::now() + Duration::from_secs(1));
        assert!(matches!(actions[0], Action::Fail(_)));
    }

    #[test]
    fn test_ignores_other_events() {
        let mut server = ChannelStrategy::new(
            Role::Server,
            Box::new(CipherTransform::new()),
            Duration::from_secs(1),
        );
        let claim = server.try_claim(&view(Role::Server), &flowlink_core::HeartbeatEvent::new());
        assert!(!claim.claimed);
    }
}
