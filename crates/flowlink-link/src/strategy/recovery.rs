//! Session recovery strategy
//!
//! One state machine for both roles. The client opens every connection with a
//! `SessionReq` carrying its prior token (empty for a new session) and the
//! counters of the session it wants back; the server validates the request
//! and answers `SessionResp`. What the session does with the answer (take over
//! an old session, resend retained frames, mint a token) is decided by the
//! link; this strategy only tracks the exchange.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use flowlink_core::{Event, RecoveryConfig, SessionAck, SessionEnd, SessionReq, SessionResp};

use super::{Action, Actions, Claim, SessionStrategy, SessionView, StrategyKind};
use crate::session::{Counters, Role, Stage};

/// Link-level recovery configuration
#[derive(Debug, Clone)]
pub struct RecoveryTemplate {
    config: RecoveryConfig,
    timeout: Duration,
}

impl RecoveryTemplate {
    /// `timeout` bounds the token exchange
    pub fn new(config: RecoveryConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Strategy for a session with no prior identity
    pub fn instantiate(&self, role: Role) -> Arc<Mutex<RecoveryStrategy>> {
        Arc::new(Mutex::new(RecoveryStrategy::new(role, None, self.timeout)))
    }

    /// Client strategy that asks to resume `token` with the old counters
    pub fn resuming(&self, token: String, counters: Counters) -> Arc<Mutex<RecoveryStrategy>> {
        Arc::new(Mutex::new(RecoveryStrategy::new(
            Role::Client,
            Some((token, counters)),
            self.timeout,
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Client: request sent
    AwaitResponse,
    /// Server: response sent or pending validation
    AwaitAck,
    Done,
}

/// Per-session recovery exchange
#[derive(Debug)]
pub struct RecoveryStrategy {
    role: Role,
    phase: Phase,
    prior: Option<(String, Counters)>,
    timeout: Duration,
    started: Option<Instant>,
}

impl RecoveryStrategy {
    pub fn new(role: Role, prior: Option<(String, Counters)>, timeout: Duration) -> Self {
        Self {
            role,
            phase: Phase::Idle,
            prior,
            timeout,
            started: None,
        }
    }

    /// Token this session asked to resume, if any
    pub fn prior_token(&self) -> Option<&str> {
        self.prior.as_ref().map(|(token, _)| token.as_str())
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    fn on_request(&mut self, req: &SessionReq) -> Claim {
        if self.role != Role::Server || self.phase != Phase::Idle {
            debug!("Ignoring unexpected session request");
            return Claim::claimed([]);
        }
        self.phase = Phase::AwaitAck;
        Claim::claimed([Action::Validate(req.clone())])
    }

    fn on_response(&mut self, resp: &SessionResp) -> Claim {
        if self.role != Role::Client || self.phase != Phase::AwaitResponse {
            debug!("Ignoring unexpected session response");
            return Claim::claimed([]);
        }
        self.phase = Phase::Done;
        let token = resp.token().clone();

        match &self.prior {
            None => Claim::claimed([
                Action::AssignToken(token),
                Action::Send(Box::new(ack(false))),
                Action::StageComplete,
            ]),
            Some((prior, _)) if *prior == token => {
                info!("Server accepted session token, resuming");
                Claim::claimed([Action::Resume {
                    retransmission: *resp.retransmission(),
                }])
            }
            Some(_) => {
                info!("Server refused session token, starting over");
                Claim::claimed([
                    Action::Abandon { token },
                    Action::Send(Box::new(ack(false))),
                    Action::StageComplete,
                ])
            }
        }
    }

    fn on_ack(&mut self, ack: &SessionAck) -> Claim {
        if self.role != Role::Server || self.phase != Phase::AwaitAck {
            return Claim::claimed([]);
        }
        self.phase = Phase::Done;
        if *ack.recovered() {
            // Takeover already established the session
            Claim::claimed([])
        } else {
            Claim::claimed([Action::StageComplete])
        }
    }
}

fn ack(recovered: bool) -> SessionAck {
    let mut ack = SessionAck::new();
    ack.set_recovered(recovered);
    ack.set_transform_eligible(false);
    ack
}

impl SessionStrategy for RecoveryStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Recovery
    }

    fn begin(&mut self, _view: &SessionView) -> Actions {
        let mut actions = Actions::new();
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
        if self.role != Role::Client || self.phase != Phase::Idle {
            return actions;
        }
        self.phase = Phase::AwaitResponse;

        let mut req = SessionReq::new();
        req.set_transform_eligible(false);
        if let Some((token, counters)) = &self.prior {
            req.set_token(token.clone())
                .set_rx_counter(counters.rx)
                .set_tx_counter(counters.tx)
                .set_tx_buffered(counters.buffered);
        } else {
            req.set_token(String::new());
        }
        actions.push(Action::Send(Box::new(req)));
        actions
    }

    fn try_claim(&mut self, _view: &SessionView, event: &dyn Event) -> Claim {
        if let Some(req) = event.downcast_ref::<SessionReq>() {
            self.on_request(req)
        } else if let Some(resp) = event.downcast_ref::<SessionResp>() {
            self.on_response(resp)
        } else if let Some(ack) = event.downcast_ref::<SessionAck>() {
            self.on_ack(ack)
        } else if event.is::<SessionEnd>() {
            self.phase = Phase::Done;
            Claim::claimed([Action::PeerEnded])
        } else {
            Claim::pass()
        }
    }

    fn on_tick(&mut self, view: &SessionView, now: Instant) -> Actions {
        let mut actions = Actions::new();
        if view.stage != Stage::Recovery || self.phase == Phase::Done {
            return actions;
        }
        let Some(started) = self.started else {
            return actions;
        };
        if now.saturating_duration_since(started) >= self.timeout {
            warn!("Session token exchange timed out after {:?}", self.timeout);
            self.phase = Phase::Done;
            actions.push(Action::Fail(format!(
                "session exchange timed out after {:?}",
                self.timeout
            )));
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn view(role: Role) -> SessionView {
        SessionView {
            role,
            stage: Stage::Recovery,
            counters: Counters::default(),
        }
    }

    fn response(token: &str, retransmission: u64) -> SessionResp {
        let mut resp = SessionResp::new();
        resp.set_token(token.to_string())
            .set_retransmission(retransmission);
        resp
    }

    fn request_of(actions: &Actions) -> SessionReq {
        match &actions[0] {
            Action::Send(event) => event.downcast_ref::<SessionReq>().unwrap().clone(),
            other => panic!("expected a request, got {:?}", other),
        }
    }

    #[test]
    fn test_new_session_requests_with_empty_token() {
        let mut client = RecoveryStrategy::new(Role::Client, None, TIMEOUT);
        let req = request_of(&client.begin(&view(Role::Client)));
        assert!(req.token().is_empty());
        assert!(!req.transform_eligible());

        let claim = client.try_claim(&view(Role::Client), &response("t-1", 0));
        assert!(matches!(&claim.actions[0], Action::AssignToken(t) if t == "t-1"));
        assert!(matches!(claim.actions[2], Action::StageComplete));
        assert!(client.is_done());
    }

    #[test]
    fn test_resume_request_carries_old_counters() {
        let counters = Counters {
            rx: 6,
            tx: 7,
            buffered: 7,
        };
        let mut client = RecoveryStrategy::new(Role::Client, Some(("t-1".to_string(), counters)), TIMEOUT);
        let req = request_of(&client.begin(&view(Role::Client)));
        assert_eq!(req.token(), "t-1");
        assert_eq!((*req.rx_counter(), *req.tx_counter(), *req.tx_buffered()), (6, 7, 7));

        let claim = client.try_claim(&view(Role::Client), &response("t-1", 2));
        assert!(matches!(
            claim.actions[0],
            Action::Resume { retransmission: 2 }
        ));
    }

    #[test]
    fn test_refused_token_abandons_old_session() {
        let mut client = RecoveryStrategy::new(
            Role::Client,
            Some(("old".to_string(), Counters::default())),
            TIMEOUT,
        );
        client.begin(&view(Role::Client));
        let claim = client.try_claim(&view(Role::Client), &response("new", 0));
        assert!(matches!(&claim.actions[0], Action::Abandon { token } if token == "new"));
    }

    #[test]
    fn test_server_validates_then_completes_on_ack() {
        let mut server = RecoveryStrategy::new(Role::Server, None, TIMEOUT);
        assert!(server.begin(&view(Role::Server)).is_empty());

        let claim = server.try_claim(&view(Role::Server), &SessionReq::new());
        assert!(matches!(claim.actions[0], Action::Validate(_)));

        let claim = server.try_claim(&view(Role::Server), &ack(false));
        assert!(matches!(claim.actions[0], Action::StageComplete));
        assert!(server.is_done());
    }

    #[test]
    fn test_session_end_is_claimed_by_either_role() {
        for role in [Role::Client, Role::Server] {
            let mut strategy = RecoveryStrategy::new(role, None, TIMEOUT);
            let claim = strategy.try_claim(&view(role), &SessionEnd::new());
            assert!(matches!(claim.actions[0], Action::PeerEnded));
        }
    }

    #[test]
    fn test_exchange_fails_once_the_deadline_passes() {
        for role in [Role::Client, Role::Server] {
            let mut strategy = RecoveryStrategy::new(role, None, TIMEOUT);
            strategy.begin(&view(role));

            let now = Instant::now();
            assert!(strategy.on_tick(&view(role), now).is_empty());
            let actions = strategy.on_tick(&view(role), now + TIMEOUT * 2);
            assert!(matches!(actions[0], Action::Fail(_)));
            assert!(strategy.on_tick(&view(role), now + TIMEOUT * 3).is_empty());
        }
    }

    #[test]
    fn test_finished_exchange_never_times_out() {
        let mut client = RecoveryStrategy::new(Role::Client, None, TIMEOUT);
        client.begin(&view(Role::Client));
        client.try_claim(&view(Role::Client), &response("t-1", 0));

        let later = Instant::now() + TIMEOUT * 2;
        assert!(client.on_tick(&view(Role::Client), later).is_empty());
        let established = SessionView {
            stage: Stage::Established,
            ..view(Role::Client)
        };
        assert!(client.on_tick(&established, later).is_empty());
    }
}
