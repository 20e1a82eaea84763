//! Server link
//!
//! One session per accepted transport. With recovery configured, a session
//! that drops without a clean end stays registered under its token until the
//! recovery timer fires; a client presenting that token with consistent
//! counters takes it over, otherwise the old session is torn down and the
//! client gets a fresh token.

use std::sync::{Arc, PoisonError};

use tracing::{debug, info, warn};

use flowlink_core::{Event, FlowlinkError, LinkError, Result, SessionReq, SessionResp};
use flowlink_runtime::Case;

use super::LinkCore;
use crate::case::LinkCase;
use crate::events;
use crate::session::{LinkSession, Role, SessionTransport};

/// Server end of a link
#[derive(Clone)]
pub struct ServerLink {
    core: Arc<LinkCore>,
}

impl ServerLink {
    pub(super) fn from_core(core: Arc<LinkCore>) -> Self {
        Self { core }
    }

    pub fn core(&self) -> &Arc<LinkCore> {
        &self.core
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Start a session over an accepted transport
    pub fn accept(&self, transport: Arc<dyn SessionTransport>) -> Result<Arc<LinkSession>> {
        if self.core.is_closed() {
            transport.close();
            return Err(LinkError::Closed {
                name: self.name().to_string(),
            }
            .into());
        }
        let session = self.core.open_session(transport, None);
        session.start();
        Ok(session)
    }

    /// Send to one session. A dropped session that may still recover holds
    /// the event for its successor.
    pub fn send(&self, handle: u64, event: Box<dyn Event>) -> Result<()> {
        self.core
            .session(handle)
            .ok_or_else(|| FlowlinkError::session_not_found(handle))?
            .send(event)
    }

    /// Send a copy of `event` to every established session
    pub fn broadcast(&self, event: &dyn Event) -> usize {
        let mut delivered = 0;
        for session in self.core.sessions() {
            if session.is_established() && session.send(event.boxed_clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn session(&self, handle: u64) -> Option<Arc<LinkSession>> {
        self.core.session(handle)
    }

    pub fn sessions(&self) -> Vec<Arc<LinkSession>> {
        self.core.sessions()
    }

    /// Close one session cleanly
    pub fn close_session(&self, handle: u64) -> Result<()> {
        self.core
            .session(handle)
            .ok_or_else(|| FlowlinkError::session_not_found(handle))?
            .close();
        Ok(())
    }

    pub fn on_heartbeat(&self) {
        self.core.on_heartbeat();
    }

    /// The recovery timer for `token` fired
    pub fn on_recovery_timeout(&self, token: &str) {
        self.core.on_recovery_timeout(token);
    }

    pub fn close(&self) {
        self.core.close();
    }

    /// Case driving heartbeats and recovery expiry from the hub
    pub fn case(&self) -> Arc<dyn Case> {
        Arc::new(LinkCase::new(&self.core))
    }
}

impl core::fmt::Debug for ServerLink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServerLink")
            .field("name", &self.name())
            .field("sessions", &self.core.sessions().len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Server Session Handling
// ----------------------------------------------------------------------------

impl LinkCore {
    /// Expire a recoverable session. Ignored on client links.
    pub fn on_recovery_timeout(&self, token: &str) {
        if self.role == Role::Client {
            return;
        }
        self.recovery_timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
        match self.registry.lookup(token) {
            Some(session) if session.is_closed() && session.is_resumable() => {
                info!(
                    "Link {} gave up waiting for session {}",
                    self.name(),
                    session.handle()
                );
                self.finalize_session(&session, "recovery timed out");
            }
            _ => debug!("Recovery timer for a session that is gone or resumed"),
        }
    }

    pub(super) fn server_closed(&self, session: &Arc<LinkSession>, clean: bool) {
        if !clean && self.has_recovery() && !self.is_closed() && session.is_resumable() {
            if let Some(scheduler) = &self.scheduler {
                let token = session.token();
                let timeout = self.config.recovery.recovery_timeout;
                let id = scheduler.schedule(
                    events::recovery_timeout(self.name(), &token),
                    timeout,
                );
                let previous = self
                    .recovery_timers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(token, id);
                if let Some(previous) = previous {
                    scheduler.cancel(previous);
                }
                info!(
                    "Link {} session {} dropped, recoverable for {:?}",
                    self.name(),
                    session.handle(),
                    timeout
                );
                return;
            }
            warn!(
                "Link {} has no scheduler, releasing dropped session {}",
                self.name(),
                session.handle()
            );
        }
        self.finalize_session(session, if clean { "closed" } else { "connection lost" });
    }

    pub(super) fn server_validate(self: &Arc<Self>, session: &Arc<LinkSession>, req: SessionReq) {
        let token = req.token();
        let previous = if token.is_empty() {
            None
        } else {
            self.registry
                .lookup(token)
                .filter(|old| !Arc::ptr_eq(old, session))
        };
        let Some(old) = previous.filter(|old| old.is_resumable()) else {
            if !token.is_empty() {
                info!("Link {} does not know the presented token", self.name());
            }
            self.issue_token(session);
            return;
        };

        let counters = old.counters();
        let outgoing = counters.tx.checked_sub(*req.rx_counter());
        let incoming = req.tx_counter().checked_sub(counters.rx);
        match (outgoing, incoming) {
            (Some(outgoing), Some(incoming))
                if outgoing <= counters.buffered && incoming <= *req.tx_buffered() =>
            {
                self.take_over(session, &old, outgoing, incoming);
            }
            _ => {
                warn!(
                    "Link {} refusing recovery of session {} (server rx={} tx={} buffered={}, client rx={} tx={} buffered={})",
                    self.name(),
                    old.handle(),
                    counters.rx,
                    counters.tx,
                    counters.buffered,
                    req.rx_counter(),
                    req.tx_counter(),
                    req.tx_buffered()
                );
                self.finalize_session(&old, "recovery refused");
                self.issue_token(session);
            }
        }
    }

    fn take_over(
        &self,
        session: &Arc<LinkSession>,
        old: &Arc<LinkSession>,
        outgoing: u64,
        incoming: u64,
    ) {
        let Some(inheritance) = old.surrender() else {
            self.issue_token(session);
            return;
        };
        let handle = inheritance.handle();
        let token = inheritance.token().to_string();
        self.cancel_recovery_timer(&token);

        let (provisional, frames) = session.adopt(inheritance, outgoing);
        self.retrack(provisional, handle, session);
        self.registry.release(provisional);
        self.registry.bind_token(&token, session);

        info!(
            "Link {} resumed session {}: resending {}, expecting {}",
            self.name(),
            handle,
            frames.len(),
            incoming
        );
        send_response(session, token, incoming);
        session.establish_recovered(frames);
    }

    fn issue_token(&self, session: &Arc<LinkSession>) {
        let token = self.registry.mint_token();
        session.assign_token(token.clone());
        send_response(session, token, 0);
    }
}

fn send_response(session: &Arc<LinkSession>, token: String, retransmission: u64) {
    let mut resp = SessionResp::new();
    resp.set_token(token).set_retransmission(retransmission);
    resp.set_transform_eligible(false);
    if let Err(e) = session.send(Box::new(resp)) {
        warn!("Could not answer session request: {}", e);
    }
}
