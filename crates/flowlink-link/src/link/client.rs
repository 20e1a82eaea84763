//! Client link
//!
//! Holds at most one live session. When that session drops without a clean
//! end and recovery is configured, the link keeps it as `recovering`, asks its
//! [`Connector`] for exactly one new transport and lets the next session try
//! to resume it. A failure while recovering is final.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use flowlink_core::{Event, FlowlinkError, LinkError, Result, SessionAck};
use flowlink_runtime::Case;

use super::LinkCore;
use crate::case::LinkCase;
use crate::events;
use crate::session::{LinkSession, SessionTransport};

/// Opens transports for a client link.
///
/// An implementation connects without blocking the caller and then either
/// hands the transport to [`ClientLink::attach`] or reports
/// [`ClientLink::connect_failed`].
pub trait Connector: Send + Sync {
    fn connect(&self, link: ClientLink);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Idle,
    Connecting,
    Connected(u64),
    Failed(String),
}

struct ClientStatus {
    session: Option<Arc<LinkSession>>,
    recovering: Option<Arc<LinkSession>>,
    outcome: Outcome,
}

pub(super) struct ClientState {
    connector: Option<Arc<dyn Connector>>,
    status: Mutex<ClientStatus>,
    changed: Condvar,
}

impl ClientState {
    pub(super) fn new(connector: Option<Arc<dyn Connector>>) -> Self {
        Self {
            connector,
            status: Mutex::new(ClientStatus {
                session: None,
                recovering: None,
                outcome: Outcome::Idle,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClientStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn take_recovering(&self) -> Option<Arc<LinkSession>> {
        self.lock().recovering.take()
    }

    fn set_outcome(&self, outcome: Outcome) {
        self.lock().outcome = outcome;
        self.changed.notify_all();
    }
}

// ----------------------------------------------------------------------------
// Client Link
// ----------------------------------------------------------------------------

/// Client end of a link
#[derive(Clone)]
pub struct ClientLink {
    core: Arc<LinkCore>,
}

impl ClientLink {
    pub(super) fn from_core(core: Arc<LinkCore>) -> Self {
        Self { core }
    }

    pub fn core(&self) -> &Arc<LinkCore> {
        &self.core
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Ask the connector for a transport. Returns immediately.
    pub fn connect(&self) -> Result<()> {
        if self.core.is_closed() {
            return Err(LinkError::Closed {
                name: self.name().to_string(),
            }
            .into());
        }
        let connector = self.core.client.connector.clone().ok_or_else(|| {
            FlowlinkError::config_error(format!("link {} has no connector", self.name()))
        })?;
        self.core.client.set_outcome(Outcome::Connecting);
        info!("Link {} connecting", self.name());
        connector.connect(self.clone());
        Ok(())
    }

    /// Connect and block the calling thread until the session is established
    /// or fails. Returns the session handle.
    pub fn connect_and_wait(&self, timeout: Duration) -> Result<u64> {
        self.connect()?;
        self.wait_connected(timeout)
    }

    /// Block until the pending connect resolves. On timeout a session still
    /// in setup is failed.
    pub fn wait_connected(&self, timeout: Duration) -> Result<u64> {
        let deadline = Instant::now() + timeout;
        let mut status = self.core.client.lock();
        loop {
            match &status.outcome {
                Outcome::Connected(handle) => return Ok(*handle),
                Outcome::Failed(reason) => {
                    return Err(FlowlinkError::connection_failed(self.name(), reason.clone()))
                }
                Outcome::Idle | Outcome::Connecting => {}
            }
            let now = Instant::now();
            if now >= deadline {
                let pending = status.session.clone();
                drop(status);
                if let Some(session) = pending.filter(|s| !s.is_established()) {
                    session.fail(format!("connect timed out after {:?}", timeout));
                }
                return Err(FlowlinkError::timeout("connect", timeout));
            }
            status = self
                .core
                .client
                .changed
                .wait_timeout(status, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Start a session over a freshly connected transport
    pub fn attach(&self, transport: Arc<dyn SessionTransport>) -> Result<Arc<LinkSession>> {
        if self.core.is_closed() {
            transport.close();
            return Err(LinkError::Closed {
                name: self.name().to_string(),
            }
            .into());
        }
        let prior = self
            .core
            .client
            .lock()
            .recovering
            .as_ref()
            .map(|old| (old.token(), old.counters()));

        let session = self.core.open_session(transport, prior);
        self.core.client.lock().session = Some(session.clone());
        session.start();
        Ok(session)
    }

    /// The connector could not open a transport
    pub fn connect_failed(&self, reason: &str) {
        self.core.client_connect_failed(reason);
    }

    /// Send to the server. While recovering, events are held for the resumed
    /// session.
    pub fn send(&self, event: Box<dyn Event>) -> Result<()> {
        let target = {
            let status = self.core.client.lock();
            status.session.clone().or_else(|| status.recovering.clone())
        };
        match target {
            Some(session) => session.send(event),
            None => Err(LinkError::NotConnected { handle: 0 }.into()),
        }
    }

    pub fn session(&self) -> Option<Arc<LinkSession>> {
        self.core.client.lock().session.clone()
    }

    /// Handle of the current session, 0 if none
    pub fn handle(&self) -> u64 {
        self.session().map(|s| s.handle()).unwrap_or(0)
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_some_and(|s| s.is_established())
    }

    pub fn is_recovering(&self) -> bool {
        self.core.client.lock().recovering.is_some()
    }

    pub fn on_heartbeat(&self) {
        self.core.on_heartbeat();
    }

    pub fn close(&self) {
        self.core.close();
    }

    /// Case driving this link's heartbeat from the hub
    pub fn case(&self) -> Arc<dyn Case> {
        Arc::new(LinkCase::new(&self.core))
    }
}

impl core::fmt::Debug for ClientLink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClientLink")
            .field("name", &self.name())
            .field("handle", &self.handle())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Client Session Handling
// ----------------------------------------------------------------------------

impl LinkCore {
    pub(super) fn client_established(&self, handle: u64) {
        self.client.set_outcome(Outcome::Connected(handle));
    }

    pub(super) fn client_failed(&self, reason: &str) {
        let live = self
            .client
            .lock()
            .session
            .as_ref()
            .is_some_and(|s| s.is_established());
        if !live {
            self.client.set_outcome(Outcome::Failed(reason.to_string()));
        }
    }

    pub(super) fn client_closed(self: &Arc<Self>, session: &Arc<LinkSession>, clean: bool) {
        let recoverable =
            !clean && self.has_recovery() && !self.is_closed() && session.is_resumable();

        let (reconnect, orphan) = {
            let mut status = self.client.lock();
            if status
                .session
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                status.session = None;
            }
            if recoverable && status.recovering.is_none() {
                status.recovering = Some(session.clone());
                status.outcome = Outcome::Connecting;
                (true, None)
            } else {
                let orphan = status
                    .recovering
                    .take()
                    .filter(|old| !Arc::ptr_eq(old, session));
                (false, orphan)
            }
        };

        if reconnect {
            warn!(
                "Link {} lost session {}, reconnecting to recover it",
                self.name(),
                session.handle()
            );
            match &self.client.connector {
                Some(connector) => connector.connect(ClientLink::from_core(self.clone())),
                None => self.client_connect_failed("no connector"),
            }
            return;
        }

        self.finalize_session(session, if clean { "closed" } else { "connection lost" });
        if let Some(old) = orphan {
            self.finalize_session(&old, "recovery failed");
        }
    }

    pub(super) fn client_resume(self: &Arc<Self>, session: &Arc<LinkSession>, retransmission: u64) {
        let inheritance = self
            .client
            .take_recovering()
            .and_then(|old| old.surrender());
        let Some(inheritance) = inheritance else {
            session.fail("server resumed a session this link no longer holds".to_string());
            return;
        };

        let handle = inheritance.handle();
        let token = inheritance.token().to_string();
        let (provisional, frames) = session.adopt(inheritance, retransmission);
        self.retrack(provisional, handle, session);
        self.registry.release(provisional);
        self.registry.bind_token(&token, session);

        info!(
            "Link {} resumed session {}: resending {} frames",
            self.name(),
            handle,
            frames.len()
        );
        let mut ack = SessionAck::new();
        ack.set_recovered(true);
        ack.set_transform_eligible(false);
        if let Err(e) = session.send(Box::new(ack)) {
            warn!("Could not confirm recovery: {}", e);
        }
        session.establish_recovered(frames);
    }

    pub(super) fn client_abandon(self: &Arc<Self>, _session: &Arc<LinkSession>) {
        if let Some(old) = self.client.take_recovering() {
            self.finalize_session(&old, "recovery refused");
        }
    }

    pub(super) fn client_connect_failed(self: &Arc<Self>, reason: &str) {
        warn!("Link {} could not connect: {}", self.name(), reason);
        let orphan = {
            let mut status = self.client.lock();
            status.outcome = Outcome::Failed(reason.to_string());
            status.recovering.take()
        };
        self.client.changed.notify_all();
        self.hub
            .post(events::connected(self.name(), 0, false, reason));
        if let Some(old) = orphan {
            self.finalize_session(&old, "reconnect failed");
        }
    }
}
