//! Session-based links
//!
//! A link owns the sessions of one endpoint: a [`ClientLink`] holds a single
//! session (plus the dropped one it is trying to recover), a [`ServerLink`]
//! holds one per accepted connection. Both are thin handles over a shared
//! [`LinkCore`], which sessions reference weakly.
//!
//! Links are assembled with a [`LinkBuilder`] that decides which strategies
//! every session gets.

mod client;
mod server;

pub use client::{ClientLink, Connector};
pub use server::ServerLink;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use hashbrown::HashMap;
use tracing::{debug, info, warn};

use flowlink_core::{BufferTransform, EventFactory, FlowlinkError, LinkConfig, Result, SessionReq};
use flowlink_runtime::{Hub, ReservationId, TimeoutScheduler};

use crate::events;
use crate::registry::SessionRegistry;
use crate::session::{Counters, LinkSession, Role, SessionTransport, StrategySlots};
use crate::strategy::{ChannelTemplate, HeartbeatTemplate, RecoveryTemplate};

// ----------------------------------------------------------------------------
// Link Builder
// ----------------------------------------------------------------------------

/// Assembles a client or server link
pub struct LinkBuilder {
    config: LinkConfig,
    hub: Arc<Hub>,
    factory: EventFactory,
    registry: Option<Arc<SessionRegistry>>,
    scheduler: Option<Arc<dyn TimeoutScheduler>>,
    channel: Option<Box<dyn BufferTransform>>,
    heartbeat: bool,
    recovery: bool,
}

impl LinkBuilder {
    pub fn new(config: LinkConfig, hub: &Arc<Hub>) -> Self {
        Self {
            config,
            hub: Arc::clone(hub),
            factory: EventFactory::with_builtins(),
            registry: None,
            scheduler: None,
            channel: None,
            heartbeat: false,
            recovery: false,
        }
    }

    /// Application event types this link can decode. Builtins are added.
    pub fn factory(mut self, mut factory: EventFactory) -> Self {
        flowlink_core::builtin::register_builtins(&mut factory);
        self.factory = factory;
        self
    }

    /// Share handle space and tokens with other links
    pub fn registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Timer service for setup deadlines and server-side recovery expiry
    pub fn scheduler(mut self, scheduler: Arc<dyn TimeoutScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Run the channel handshake with a clone of `transform` on every session
    pub fn with_channel<T: BufferTransform + 'static>(mut self, transform: T) -> Self {
        self.channel = Some(Box::new(transform));
        self
    }

    pub fn with_heartbeat(mut self) -> Self {
        self.heartbeat = true;
        self
    }

    pub fn with_recovery(mut self) -> Self {
        self.recovery = true;
        self
    }

    fn build(self, role: Role, connector: Option<Arc<dyn Connector>>) -> Result<Arc<LinkCore>> {
        self.config
            .validate()
            .map_err(FlowlinkError::config_error)?;

        let LinkBuilder {
            config,
            hub,
            factory,
            registry,
            scheduler,
            channel,
            heartbeat,
            recovery,
        } = self;

        if recovery && role == Role::Server && scheduler.is_none() {
            warn!(
                "Link {} has recovery but no scheduler; dropped sessions will not be kept",
                config.name
            );
        }

        let templates = Templates {
            channel: channel.map(|t| ChannelTemplate::from_boxed(t, config.channel.clone())),
            heartbeat: heartbeat.then(|| HeartbeatTemplate::new(config.heartbeat.clone())),
            recovery: recovery.then(|| RecoveryTemplate::new(config.recovery.clone(), config.channel.handshake_timeout)),
        };

        info!(
            "Built {:?} link {} (channel: {}, heartbeat: {}, recovery: {})",
            role,
            config.name,
            templates.channel.is_some(),
            heartbeat,
            recovery
        );

        Ok(Arc::new(LinkCore {
            role,
            config,
            hub,
            factory: Arc::new(factory),
            registry: registry.unwrap_or_default(),
            scheduler,
            templates,
            sessions: RwLock::new(HashMap::new()),
            recovery_timers: Mutex::new(HashMap::new()),
            setup_epochs: AtomicU64::new(0),
            client: client::ClientState::new(connector),
            closed: Mutex::new(false),
        }))
    }

    pub fn build_server(self) -> Result<ServerLink> {
        Ok(ServerLink::from_core(self.build(Role::Server, None)?))
    }

    /// `connector` opens transports for [`ClientLink::connect`] and for
    /// reconnects while recovering
    pub fn build_client(self, connector: Arc<dyn Connector>) -> Result<ClientLink> {
        Ok(ClientLink::from_core(self.build(Role::Client, Some(connector))?))
    }
}

struct Templates {
    channel: Option<ChannelTemplate>,
    heartbeat: Option<HeartbeatTemplate>,
    recovery: Option<RecoveryTemplate>,
}

// ----------------------------------------------------------------------------
// Link Core
// ----------------------------------------------------------------------------

/// State shared by a link handle and its sessions
pub struct LinkCore {
    role: Role,
    config: LinkConfig,
    hub: Arc<Hub>,
    factory: Arc<EventFactory>,
    registry: Arc<SessionRegistry>,
    scheduler: Option<Arc<dyn TimeoutScheduler>>,
    templates: Templates,
    sessions: RwLock<HashMap<u64, Arc<LinkSession>>>,
    recovery_timers: Mutex<HashMap<String, ReservationId>>,
    setup_epochs: AtomicU64,
    client: client::ClientState,
    closed: Mutex<bool>,
}

impl LinkCore {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn factory(&self) -> &EventFactory {
        &self.factory
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn has_recovery(&self) -> bool {
        self.templates.recovery.is_some()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sessions currently tracked, including dropped ones awaiting recovery
    pub fn sessions(&self) -> Vec<Arc<LinkSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn session(&self, handle: u64) -> Option<Arc<LinkSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .cloned()
    }

    /// Create and register a session over `transport`; the caller starts it
    pub(crate) fn open_session(
        self: &Arc<Self>,
        transport: Arc<dyn SessionTransport>,
        prior: Option<(String, Counters)>,
    ) -> Arc<LinkSession> {
        let handle = self.registry.acquire();
        let strategies = StrategySlots {
            channel: self
                .templates
                .channel
                .as_ref()
                .map(|template| template.instantiate(self.role)),
            heartbeat: self
                .templates
                .heartbeat
                .as_ref()
                .map(HeartbeatTemplate::instantiate),
            recovery: self.templates.recovery.as_ref().map(|template| match prior {
                Some((token, counters)) => template.resuming(token, counters),
                None => template.instantiate(self.role),
            }),
        };
        let retention = self
            .templates
            .recovery
            .as_ref()
            .map(|template| template.config().retransmission_window)
            .unwrap_or(0);

        let session = LinkSession::new(
            self.role,
            handle,
            Arc::downgrade(self),
            transport,
            self.config.max_frame_len,
            retention,
            strategies,
        );
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, session.clone());
        debug!(
            "Link {} opened session {} with {}",
            self.name(),
            handle,
            session.remote()
        );
        session
    }

    /// Heartbeat tick for every session
    pub fn on_heartbeat(&self) {
        for session in self.sessions() {
            session.on_heartbeat();
        }
    }

    /// Arm the deadline of a setup stage. `None` without a scheduler.
    pub(crate) fn schedule_setup_timeout(&self, handle: u64) -> Option<(u64, ReservationId)> {
        let scheduler = self.scheduler.as_ref()?;
        let epoch = self.setup_epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let id = scheduler.schedule(
            events::setup_timeout(self.name(), handle, epoch),
            self.config.channel.handshake_timeout,
        );
        Some((epoch, id))
    }

    pub(crate) fn cancel_timer(&self, id: ReservationId) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.cancel(id);
        }
    }

    /// A setup deadline fired; fails the session if it is still in that stage
    pub fn on_setup_timeout(&self, handle: u64, epoch: u64) {
        match self.session(handle) {
            Some(session) => session.on_setup_timeout(epoch),
            None => debug!("Setup timer for session {} that is gone", handle),
        }
    }

    // ------------------------------------------------------------------------
    // Session Callbacks
    // ------------------------------------------------------------------------

    pub(crate) fn on_session_established(&self, session: &Arc<LinkSession>, recovered: bool) {
        let handle = session.handle();
        if recovered {
            self.hub
                .post(events::recovered(self.name(), handle, &session.token()));
        } else {
            self.hub
                .post(events::connected(self.name(), handle, true, ""));
        }
        if self.role == Role::Client {
            self.client_established(handle);
        }
    }

    pub(crate) fn on_session_closed(self: &Arc<Self>, session: &Arc<LinkSession>, clean: bool) {
        match self.role {
            Role::Client => self.client_closed(session, clean),
            Role::Server => self.server_closed(session, clean),
        }
    }

    pub(crate) fn validate(self: &Arc<Self>, session: &Arc<LinkSession>, req: SessionReq) {
        self.server_validate(session, req);
    }

    pub(crate) fn resume(self: &Arc<Self>, session: &Arc<LinkSession>, retransmission: u64) {
        self.client_resume(session, retransmission);
    }

    pub(crate) fn abandon(self: &Arc<Self>, session: &Arc<LinkSession>) {
        self.client_abandon(session);
    }

    /// Release a session for good and tell the hub
    pub(crate) fn finalize_session(&self, session: &Arc<LinkSession>, context: &str) {
        let Some(finalized) = session.finalize() else {
            return;
        };

        {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            if sessions
                .get(&finalized.handle)
                .is_some_and(|tracked| Arc::ptr_eq(tracked, session))
            {
                sessions.remove(&finalized.handle);
            }
        }
        self.cancel_recovery_timer(&finalized.token);
        self.registry.unbind_token(&finalized.token);
        self.registry.release(finalized.handle);

        if finalized.established {
            info!(
                "Link {} session {} disconnected: {}",
                self.name(),
                finalized.handle,
                context
            );
            self.hub
                .post(events::disconnected(self.name(), finalized.handle, context));
        } else {
            let reason = finalized.failure.unwrap_or_else(|| context.to_string());
            info!(
                "Link {} session {} failed to connect: {}",
                self.name(),
                finalized.handle,
                reason
            );
            self.hub
                .post(events::connected(self.name(), finalized.handle, false, &reason));
            if self.role == Role::Client {
                self.client_failed(&reason);
            }
        }
    }

    /// Swap `session` into the slot of the session it replaced
    pub(crate) fn retrack(&self, provisional: u64, handle: u64, session: &Arc<LinkSession>) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(&provisional);
        sessions.insert(handle, session.clone());
    }

    pub(crate) fn cancel_recovery_timer(&self, token: &str) {
        if token.is_empty() {
            return;
        }
        let reservation = self
            .recovery_timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
        if let (Some(id), Some(scheduler)) = (reservation, &self.scheduler) {
            scheduler.cancel(id);
        }
    }

    /// Close every session cleanly and stop accepting work
    pub fn close(self: &Arc<Self>) {
        {
            let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
            if *closed {
                return;
            }
            *closed = true;
        }
        info!("Closing link {}", self.name());
        for session in self.sessions() {
            if session.is_closed() {
                self.finalize_session(&session, "link closed");
            } else {
                session.close();
            }
        }
        if let Some(orphan) = self.client.take_recovering() {
            self.finalize_session(&orphan, "link closed");
        }
    }
}

impl core::fmt::Debug for LinkCore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LinkCore")
            .field("name", &self.config.name)
            .field("role", &self.role)
            .field("sessions", &self.sessions().len())
            .finish()
    }
}
