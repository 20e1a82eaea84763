//! Link sessions
//!
//! A [`LinkSession`] is the per-connection state machine sitting on top of a
//! [`SessionTransport`]. It cuts inbound bytes into frames, decodes them and
//! offers each event to its strategies before posting it to the hub, and it
//! runs the outbound pipeline: events are staged in a [`SendExchange`],
//! serialized outside the lock, optionally transformed, framed and handed to
//! the transport as one segment. Application frames handed to the transport are
//! retained (up to the retransmission window) so a recovered session can
//! resend what the peer never saw.
//!
//! Locking: `state`, `cipher`, `strategies` and `pool` are independent. The
//! session never holds two of them at once except `state` followed by `pool`,
//! and never calls into the link or the transport while holding any of them.

use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Instant;

use smallvec::SmallVec;
use tracing::{debug, info, trace, warn};

use flowlink_core::builtin::is_builtin;
use flowlink_runtime::ReservationId;
use flowlink_core::{
    BufferTransform, Event, Frame, FrameCodec, LinkError, ReassemblyBuffer, Result,
    SendExchange, SessionEnd, WireBuffer,
};

use crate::link::LinkCore;
use crate::strategy::{
    Action, Actions, ChannelStrategy, HeartbeatStrategy, RecoveryStrategy, SessionStrategy,
    SessionView,
};

/// Spare frame bodies kept per session
pub const POOL_CAPACITY: usize = 64;

// ----------------------------------------------------------------------------
// Session Types
// ----------------------------------------------------------------------------

/// Which end of the connection a session is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Initiates the channel and recovery handshakes
    Client,
    /// Responds to them
    Server,
}

/// Setup stage of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Token exchange
    Recovery,
    /// Transform handshake
    Channel,
    /// Carrying application events
    Established,
    /// Transport gone
    Closed,
}

/// Application frame counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Frames decoded
    pub rx: u64,
    /// Frames handed to the transport
    pub tx: u64,
    /// Sent frames still retained for retransmission
    pub buffered: u64,
}

/// Byte transport under a session.
///
/// `send` must not call back into the session synchronously; the transport
/// reports each send exactly once through [`LinkSession::on_send_completed`],
/// delivers inbound bytes through [`LinkSession::on_received`] and reports loss
/// of the connection through [`LinkSession::on_transport_closed`].
pub trait SessionTransport: Send + Sync {
    /// Queue one segment of framed bytes
    fn send(&self, segment: Vec<u8>) -> Result<()>;

    /// Close the connection. Idempotent.
    fn close(&self);

    /// Peer address, for logging
    fn remote(&self) -> String;
}

/// Item staged for the send pipeline
pub enum Outgoing {
    /// Event to serialize
    Event(Box<dyn Event>),
    /// Previously sent frame being retransmitted as-is
    Raw(WireBuffer),
}

impl core::fmt::Debug for Outgoing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Outgoing::Event(event) => write!(f, "Event({})", event.type_name()),
            Outgoing::Raw(buffer) => write!(f, "Raw({} bytes)", buffer.len()),
        }
    }
}

/// Installed channel transform and its direction flags
#[derive(Default)]
pub(crate) struct CipherSlot {
    transform: Option<Box<dyn BufferTransform>>,
    rx_ready: bool,
    tx_ready: bool,
}

/// Per-session strategy instances, one per category
#[derive(Default)]
pub(crate) struct StrategySlots {
    pub channel: Option<Arc<Mutex<ChannelStrategy>>>,
    pub heartbeat: Option<Arc<Mutex<HeartbeatStrategy>>>,
    pub recovery: Option<Arc<Mutex<RecoveryStrategy>>>,
}

type StrategyRef = Arc<Mutex<dyn SessionStrategy>>;

impl StrategySlots {
    /// Strategies in claim order
    fn chain(&self) -> SmallVec<[StrategyRef; 3]> {
        let mut chain: SmallVec<[StrategyRef; 3]> = SmallVec::new();
        if let Some(channel) = &self.channel {
            chain.push(channel.clone());
        }
        if let Some(heartbeat) = &self.heartbeat {
            chain.push(heartbeat.clone());
        }
        if let Some(recovery) = &self.recovery {
            chain.push(recovery.clone());
        }
        chain
    }
}

/// Identity and buffers moved from a dropped session to its successor
pub(crate) struct Inheritance {
    handle: u64,
    token: String,
    counters: Counters,
    sent: VecDeque<WireBuffer>,
    pending: Vec<Outgoing>,
    cipher: CipherSlot,
    channel: Option<Arc<Mutex<ChannelStrategy>>>,
}

impl Inheritance {
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// What the link needs to release when a session is finalized
#[derive(Debug)]
pub(crate) struct Finalized {
    pub handle: u64,
    pub token: String,
    pub established: bool,
    pub failure: Option<String>,
}

enum FrameKind {
    Control(i32),
    Application(i32),
    Resend,
}

struct Encoded {
    buffer: WireBuffer,
    kind: FrameKind,
}

struct InFlight {
    buffer: WireBuffer,
    retain: bool,
}

struct SessionState {
    handle: u64,
    token: String,
    stage: Stage,
    counters: Counters,
    rx_buffer: ReassemblyBuffer,
    exchange: SendExchange<Outgoing>,
    batch: Option<Vec<Outgoing>>,
    sending: Vec<InFlight>,
    sent: VecDeque<WireBuffer>,
    /// Application events sent before establishment
    pending: Vec<Outgoing>,
    closing: bool,
    close_after_flush: bool,
    clean: bool,
    established_once: bool,
    recovered: bool,
    adopted: bool,
    finalized: bool,
    failure: Option<String>,
    /// Epoch and reservation of the armed setup deadline
    setup_timer: Option<(u64, ReservationId)>,
}

impl SessionState {
    fn is_resumable(&self) -> bool {
        !self.clean
            && !self.finalized
            && !self.adopted
            && self.established_once
            && !self.token.is_empty()
    }

    /// Move everything handed to the pipeline but not confirmed into the
    /// retained list, and staged events back to pending
    fn stash_in_flight(&mut self, retention: usize, spare: &mut Vec<Vec<u8>>) {
        for frame in mem::take(&mut self.sending) {
            if frame.retain {
                self.sent.push_back(frame.buffer);
            } else {
                spare.push(frame.buffer.into_body());
            }
        }
        let staged = self.exchange.reset();
        let mut events = Vec::new();
        for item in staged {
            match item {
                Outgoing::Raw(buffer) => self.sent.push_back(buffer),
                Outgoing::Event(event) if !is_builtin(event.event_type()) => {
                    events.push(Outgoing::Event(event))
                }
                Outgoing::Event(_) => {}
            }
        }
        events.append(&mut self.pending);
        self.pending = events;
        self.batch = None;
        trim(&mut self.sent, retention, spare);
    }
}

fn trim(sent: &mut VecDeque<WireBuffer>, retention: usize, spare: &mut Vec<Vec<u8>>) {
    while sent.len() > retention {
        if let Some(oldest) = sent.pop_front() {
            spare.push(oldest.into_body());
        }
    }
}

// ----------------------------------------------------------------------------
// Link Session
// ----------------------------------------------------------------------------

/// One connection of a link
pub struct LinkSession {
    role: Role,
    link: Weak<LinkCore>,
    transport: Arc<dyn SessionTransport>,
    max_frame_len: usize,
    /// Retransmission window; zero when recovery is not configured
    retention: usize,
    state: Mutex<SessionState>,
    cipher: Mutex<CipherSlot>,
    strategies: RwLock<StrategySlots>,
    pool: Mutex<Vec<Vec<u8>>>,
}

impl LinkSession {
    pub(crate) fn new(
        role: Role,
        handle: u64,
        link: Weak<LinkCore>,
        transport: Arc<dyn SessionTransport>,
        max_frame_len: usize,
        retention: usize,
        strategies: StrategySlots,
    ) -> Arc<Self> {
        let stage = if strategies.recovery.is_some() {
            Stage::Recovery
        } else if strategies.channel.is_some() {
            Stage::Channel
        } else {
            Stage::Established
        };

        Arc::new(Self {
            role,
            link,
            transport,
            max_frame_len,
            retention,
            state: Mutex::new(SessionState {
                handle,
                token: String::new(),
                stage,
                counters: Counters::default(),
                rx_buffer: ReassemblyBuffer::new(),
                exchange: SendExchange::new(),
                batch: None,
                sending: Vec::new(),
                sent: VecDeque::new(),
                pending: Vec::new(),
                closing: false,
                close_after_flush: false,
                clean: false,
                established_once: false,
                recovered: false,
                adopted: false,
                finalized: false,
                failure: None,
                setup_timer: None,
            }),
            cipher: Mutex::new(CipherSlot::default()),
            strategies: RwLock::new(strategies),
            pool: Mutex::new(Vec::new()),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cipher(&self) -> MutexGuard<'_, CipherSlot> {
        self.cipher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn chain(&self) -> SmallVec<[StrategyRef; 3]> {
        self.strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .chain()
    }

    fn link(&self) -> Option<Arc<LinkCore>> {
        self.link.upgrade()
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn role(&self) -> Role {
        self.role
    }

    /// Routing handle; 0 once the session was finalized or taken over
    pub fn handle(&self) -> u64 {
        self.lock_state().handle
    }

    /// Recovery token, empty if none was issued
    pub fn token(&self) -> String {
        self.lock_state().token.clone()
    }

    pub fn stage(&self) -> Stage {
        self.lock_state().stage
    }

    pub fn is_established(&self) -> bool {
        self.stage() == Stage::Established
    }

    pub fn is_closed(&self) -> bool {
        self.stage() == Stage::Closed
    }

    /// Whether this session resumed a dropped one
    pub fn is_recovered(&self) -> bool {
        self.lock_state().recovered
    }

    pub fn counters(&self) -> Counters {
        let state = self.lock_state();
        self.counters_of(&state)
    }

    fn counters_of(&self, state: &SessionState) -> Counters {
        let in_flight = state.sending.iter().filter(|f| f.retain).count();
        Counters {
            buffered: (state.sent.len() + in_flight) as u64,
            ..state.counters
        }
    }

    /// Channel transform readiness as `(rx_ready, tx_ready)`
    pub fn channel_ready(&self) -> (bool, bool) {
        let cipher = self.lock_cipher();
        (cipher.rx_ready, cipher.tx_ready)
    }

    /// Consecutive silent heartbeat ticks, if a heartbeat strategy is attached
    pub fn heartbeat_failures(&self) -> Option<u32> {
        let strategies = self.strategies.read().unwrap_or_else(PoisonError::into_inner);
        strategies.heartbeat.as_ref().map(|heartbeat| {
            heartbeat
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .failures()
        })
    }

    pub fn remote(&self) -> String {
        self.transport.remote()
    }

    fn view(&self) -> SessionView {
        let state = self.lock_state();
        SessionView {
            role: self.role,
            stage: state.stage,
            counters: self.counters_of(&state),
        }
    }

    // ------------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------------

    /// Begin the first setup stage
    pub(crate) fn start(self: &Arc<Self>) {
        let stage = self.stage();
        debug!("Session {} starting in {:?} stage", self.handle(), stage);
        match stage {
            Stage::Recovery | Stage::Channel => self.begin_stage(stage),
            Stage::Established => self.on_established(),
            Stage::Closed => {}
        }
    }

    fn begin_stage(self: &Arc<Self>, stage: Stage) {
        let strategy: Option<StrategyRef> = {
            let strategies = self.strategies.read().unwrap_or_else(PoisonError::into_inner);
            match stage {
                Stage::Recovery => strategies.recovery.clone().map(|s| s as StrategyRef),
                Stage::Channel => strategies.channel.clone().map(|s| s as StrategyRef),
                _ => None,
            }
        };
        if let Some(strategy) = strategy {
            self.arm_setup_timer();
            let view = self.view();
            let actions = strategy
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .begin(&view);
            self.apply(actions);
        }
    }

    fn arm_setup_timer(&self) {
        let Some(link) = self.link() else {
            return;
        };
        let handle = self.handle();
        let Some(timer) = link.schedule_setup_timeout(handle) else {
            return;
        };
        let previous = self.lock_state().setup_timer.replace(timer);
        if let Some((_, id)) = previous {
            link.cancel_timer(id);
        }
    }

    fn disarm_setup_timer(&self) {
        let timer = self.lock_state().setup_timer.take();
        if let (Some((_, id)), Some(link)) = (timer, self.link()) {
            link.cancel_timer(id);
        }
    }

    /// The setup deadline armed under `epoch` passed
    pub(crate) fn on_setup_timeout(self: &Arc<Self>, epoch: u64) {
        let stage = {
            let mut state = self.lock_state();
            match (state.stage, state.setup_timer) {
                (Stage::Recovery | Stage::Channel, Some((armed, _))) if armed == epoch => {
                    state.setup_timer = None;
                    state.stage
                }
                _ => return,
            }
        };
        self.fail(format!("{:?} stage timed out", stage));
    }

    /// The strategy of the current stage finished its handshake
    fn complete_stage(self: &Arc<Self>) {
        let has_channel = self
            .strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .channel
            .is_some();

        let next = {
            let mut state = self.lock_state();
            let next = match state.stage {
                Stage::Recovery if has_channel => Stage::Channel,
                Stage::Recovery | Stage::Channel => Stage::Established,
                _ => return,
            };
            if next == Stage::Channel {
                state.stage = Stage::Channel;
            }
            next
        };

        match next {
            Stage::Channel => self.begin_stage(Stage::Channel),
            _ => self.on_established(),
        }
    }

    fn on_established(self: &Arc<Self>) {
        self.disarm_setup_timer();
        let (handle, start) = {
            let mut state = self.lock_state();
            if state.stage == Stage::Closed {
                return;
            }
            state.stage = Stage::Established;
            state.established_once = true;
            let mut start = false;
            for item in mem::take(&mut state.pending) {
                start |= state.exchange.push(item);
            }
            (state.handle, start)
        };
        info!("Session {} established with {}", handle, self.remote());
        if start {
            self.run_pipeline();
        }
        if let Some(link) = self.link() {
            link.on_session_established(self, false);
        }
    }

    /// Set the issued token and register it for recovery
    pub(crate) fn assign_token(self: &Arc<Self>, token: String) {
        self.lock_state().token = token.clone();
        if let Some(link) = self.link() {
            link.registry().bind_token(&token, self);
        }
    }

    // ------------------------------------------------------------------------
    // Send Path
    // ------------------------------------------------------------------------

    /// Queue `event` for the peer.
    ///
    /// Application events sent before the session is established are held
    /// and flushed, in order, once setup completes.
    pub fn send(self: &Arc<Self>, event: Box<dyn Event>) -> Result<()> {
        let control = is_builtin(event.event_type());
        let start = {
            let mut state = self.lock_state();
            match state.stage {
                Stage::Closed if !control && self.retention > 0 && state.is_resumable() => {
                    trace!("Holding {} for the recovered session", event.type_name());
                    state.pending.push(Outgoing::Event(event));
                    false
                }
                Stage::Closed => {
                    return Err(LinkError::NotConnected {
                        handle: state.handle,
                    }
                    .into())
                }
                _ if state.closing && !control => {
                    return Err(LinkError::NotConnected {
                        handle: state.handle,
                    }
                    .into())
                }
                Stage::Established => state.exchange.push(Outgoing::Event(event)),
                _ if control => state.exchange.push(Outgoing::Event(event)),
                _ => {
                    trace!("Holding {} until established", event.type_name());
                    state.pending.push(Outgoing::Event(event));
                    false
                }
            }
        };
        if start {
            self.run_pipeline();
        }
        Ok(())
    }

    fn take_body(&self) -> Vec<u8> {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default()
    }

    fn recycle(&self, bodies: Vec<Vec<u8>>) {
        if bodies.is_empty() {
            return;
        }
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        for mut body in bodies {
            if pool.len() >= POOL_CAPACITY {
                break;
            }
            body.clear();
            pool.push(body);
        }
    }

    fn encode(&self, event: &dyn Event, mut body: Vec<u8>) -> Result<WireBuffer> {
        body.clear();
        FrameCodec::encode_payload(event, &mut body)?;

        let mut transformed = false;
        if event.transform_eligible() && !is_builtin(event.event_type()) {
            let mut cipher = self.lock_cipher();
            if cipher.tx_ready {
                if let Some(transform) = cipher.transform.as_mut() {
                    transform.transform(&mut body)?;
                    transformed = true;
                }
            }
        }
        Ok(WireBuffer::new(body, transformed))
    }

    /// Drain the exchange until it goes idle or the transport takes a segment
    fn run_pipeline(self: &Arc<Self>) {
        loop {
            let mut batch = self.lock_state().exchange.begin();

            let mut frames = Vec::with_capacity(batch.len());
            for item in batch.drain(..) {
                match item {
                    Outgoing::Event(event) => {
                        let type_id = event.event_type();
                        match self.encode(event.as_ref(), self.take_body()) {
                            Ok(buffer) => frames.push(Encoded {
                                buffer,
                                kind: if is_builtin(type_id) {
                                    FrameKind::Control(type_id)
                                } else {
                                    FrameKind::Application(type_id)
                                },
                            }),
                            Err(e) => warn!("Dropping {}: {}", event.type_name(), e),
                        }
                    }
                    Outgoing::Raw(buffer) => frames.push(Encoded {
                        buffer,
                        kind: FrameKind::Resend,
                    }),
                }
            }

            let mut segment = Vec::new();
            for frame in &frames {
                frame.buffer.write_to(&mut segment);
            }

            let mut sent_types: SmallVec<[i32; 8]> = SmallVec::new();
            let open = {
                let mut state = self.lock_state();
                for frame in frames {
                    let retain = match frame.kind {
                        FrameKind::Control(type_id) => {
                            sent_types.push(type_id);
                            false
                        }
                        FrameKind::Application(type_id) => {
                            state.counters.tx += 1;
                            sent_types.push(type_id);
                            self.retention > 0
                        }
                        FrameKind::Resend => self.retention > 0,
                    };
                    state.sending.push(InFlight {
                        buffer: frame.buffer,
                        retain,
                    });
                }
                if state.stage == Stage::Closed {
                    // Lost with the transport; keep them for the next recovery
                    let mut spare = Vec::new();
                    state.stash_in_flight(self.retention, &mut spare);
                    drop(state);
                    self.recycle(spare);
                    return;
                }
                state.batch = Some(batch);
                !segment.is_empty()
            };

            for strategy in self.chain() {
                let mut strategy = strategy.lock().unwrap_or_else(PoisonError::into_inner);
                for type_id in &sent_types {
                    strategy.note_sent(*type_id);
                }
            }

            if !open {
                if self.complete_batch() {
                    continue;
                }
                return;
            }

            if let Err(e) = self.transport.send(segment) {
                warn!("Send to {} failed: {}", self.remote(), e);
                self.abort();
            }
            return;
        }
    }

    /// Transport finished the segment handed to it
    pub fn on_send_completed(self: &Arc<Self>, result: Result<()>) {
        if let Err(e) = result {
            warn!("Send to {} failed: {}", self.remote(), e);
            self.abort();
            return;
        }
        if self.complete_batch() {
            self.run_pipeline();
        }
    }

    /// Retire the in-flight frames; returns whether the pipeline must run again
    fn complete_batch(self: &Arc<Self>) -> bool {
        let mut spare = Vec::new();
        let (again, close_now) = {
            let mut state = self.lock_state();
            if state.stage == Stage::Closed {
                return false;
            }
            for frame in mem::take(&mut state.sending) {
                if frame.retain {
                    state.sent.push_back(frame.buffer);
                } else {
                    spare.push(frame.buffer.into_body());
                }
            }
            trim(&mut state.sent, self.retention, &mut spare);
            let batch = state.batch.take().unwrap_or_default();
            let again = state.exchange.finish(batch);
            (again, !again && state.close_after_flush)
        };
        self.recycle(spare);
        if close_now {
            self.close_transport();
            return false;
        }
        again
    }

    // ------------------------------------------------------------------------
    // Receive Path
    // ------------------------------------------------------------------------

    /// Bytes arrived from the transport
    pub fn on_received(self: &Arc<Self>, data: &[u8]) {
        let mut frames: SmallVec<[Frame; 4]> = SmallVec::new();
        let mut failure = None;
        {
            let mut state = self.lock_state();
            if state.stage == Stage::Closed {
                return;
            }
            state.rx_buffer.extend(data);
            loop {
                match state.rx_buffer.next_frame(self.max_frame_len) {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        for frame in frames {
            if self.is_closed() {
                return;
            }
            self.dispatch_frame(frame);
        }

        if let Some(e) = failure {
            warn!("Unreadable stream from {}: {}", self.remote(), e);
            self.abort();
        }
    }

    fn dispatch_frame(self: &Arc<Self>, frame: Frame) {
        let Some(link) = self.link() else {
            return;
        };

        let chain = self.chain();
        for strategy in &chain {
            strategy
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .note_received();
        }

        let mut payload = frame.payload;
        if frame.transformed {
            let mut cipher = self.lock_cipher();
            let rx_ready = cipher.rx_ready;
            let result = match cipher.transform.as_mut() {
                Some(transform) if rx_ready => transform.inverse_transform(&mut payload),
                _ => {
                    warn!("Transformed frame before the channel is ready, skipping");
                    return;
                }
            };
            if let Err(e) = result {
                warn!("Skipping frame that failed to inverse-transform: {}", e);
                return;
            }
        }

        let mut event = match FrameCodec::decode_payload(&payload, link.factory()) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping undecodable frame: {}", e);
                return;
            }
        };

        let type_id = event.event_type();
        let handle = {
            let mut state = self.lock_state();
            if !is_builtin(type_id) {
                state.counters.rx += 1;
            }
            state.handle
        };
        trace!("Session {} received {}", handle, event.type_name());

        let view = self.view();
        for strategy in &chain {
            let claim = strategy
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .try_claim(&view, event.as_ref());
            if claim.claimed {
                self.apply(claim.actions);
                return;
            }
        }

        if is_builtin(type_id) {
            debug!("Unclaimed protocol event {}", event.type_name());
            return;
        }
        event.set_handle(handle);
        link.hub().post(event);
    }

    // ------------------------------------------------------------------------
    // Strategy Actions
    // ------------------------------------------------------------------------

    fn apply(self: &Arc<Self>, actions: Actions) {
        for action in actions {
            trace!("Session applying {:?}", action);
            match action {
                Action::Send(event) => {
                    if let Err(e) = self.send(event) {
                        debug!("Protocol send skipped: {}", e);
                    }
                }
                Action::InstallTransform {
                    transform,
                    rx_ready,
                    tx_ready,
                } => {
                    let mut cipher = self.lock_cipher();
                    cipher.transform = Some(transform);
                    cipher.rx_ready = rx_ready;
                    cipher.tx_ready = tx_ready;
                }
                Action::EnableTransmit => self.lock_cipher().tx_ready = true,
                Action::StageComplete => self.complete_stage(),
                Action::Fail(reason) => self.fail(reason),
                Action::Close => self.abort(),
                Action::Validate(req) => {
                    if let Some(link) = self.link() {
                        link.validate(self, req);
                    }
                }
                Action::AssignToken(token) => self.assign_token(token),
                Action::Resume { retransmission } => {
                    if let Some(link) = self.link() {
                        link.resume(self, retransmission);
                    }
                }
                Action::Abandon { token } => {
                    if let Some(link) = self.link() {
                        link.abandon(self);
                    }
                    self.assign_token(token);
                }
                Action::PeerEnded => {
                    info!("Peer ended session {}", self.handle());
                    self.lock_state().clean = true;
                    self.close_transport();
                }
            }
        }
    }

    /// Heartbeat tick; drives keepalives and the deadlines of every setup
    /// stage
    pub fn on_heartbeat(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let now = Instant::now();
        for strategy in self.chain() {
            let view = self.view();
            let actions = strategy
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .on_tick(&view, now);
            self.apply(actions);
        }
    }

    // ------------------------------------------------------------------------
    // Recovery Takeover
    // ------------------------------------------------------------------------

    /// Hand over identity and buffers to a successor session.
    ///
    /// Returns `None` if the session was already finalized or taken over.
    pub(crate) fn surrender(&self) -> Option<Inheritance> {
        let mut spare = Vec::new();
        let (mut inheritance, was_open) = {
            let mut state = self.lock_state();
            if state.finalized || state.adopted {
                return None;
            }
            state.adopted = true;
            state.finalized = true;
            let was_open = state.stage != Stage::Closed;
            state.stage = Stage::Closed;
            state.stash_in_flight(self.retention, &mut spare);
            let counters = self.counters_of(&state);
            (
                Inheritance {
                    handle: mem::take(&mut state.handle),
                    token: mem::take(&mut state.token),
                    counters,
                    sent: mem::take(&mut state.sent),
                    pending: mem::take(&mut state.pending),
                    cipher: CipherSlot::default(),
                    channel: None,
                },
                was_open,
            )
        };
        self.recycle(spare);
        self.disarm_setup_timer();
        if was_open {
            self.transport.close();
        }
        inheritance.cipher = mem::take(&mut *self.lock_cipher());
        inheritance.channel = self
            .strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .channel
            .take();
        Some(inheritance)
    }

    /// Take over a dropped session's identity.
    ///
    /// Keeps the newest `resend` retained frames for retransmission and
    /// returns them with the handle this session held until now.
    pub(crate) fn adopt(&self, inheritance: Inheritance, resend: u64) -> (u64, Vec<WireBuffer>) {
        let Inheritance {
            handle,
            token,
            counters,
            mut sent,
            mut pending,
            cipher,
            channel,
        } = inheritance;

        *self.lock_cipher() = cipher;
        if channel.is_some() {
            self.strategies
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .channel = channel;
        }

        let mut spare = Vec::new();
        let keep = (resend as usize).min(sent.len());
        trim(&mut sent, keep, &mut spare);
        let frames: Vec<WireBuffer> = sent.into_iter().collect();

        let provisional = {
            let mut state = self.lock_state();
            let provisional = mem::replace(&mut state.handle, handle);
            state.token = token;
            state.counters = Counters {
                rx: counters.rx,
                tx: counters.tx,
                buffered: 0,
            };
            pending.append(&mut state.pending);
            state.pending = pending;
            provisional
        };
        self.recycle(spare);
        (provisional, frames)
    }

    /// Finish a takeover: retransmit, flush pending and go live
    pub(crate) fn establish_recovered(self: &Arc<Self>, resend: Vec<WireBuffer>) {
        self.disarm_setup_timer();
        let (handle, start) = {
            let mut state = self.lock_state();
            if state.stage == Stage::Closed {
                return;
            }
            let mut start = false;
            for buffer in resend {
                start |= state.exchange.push(Outgoing::Raw(buffer));
            }
            for item in mem::take(&mut state.pending) {
                start |= state.exchange.push(item);
            }
            state.stage = Stage::Established;
            state.established_once = true;
            state.recovered = true;
            (state.handle, start)
        };
        info!("Session {} recovered with {}", handle, self.remote());
        if start {
            self.run_pipeline();
        }
        if let Some(link) = self.link() {
            link.on_session_established(self, true);
        }
    }

    // ------------------------------------------------------------------------
    // Close Paths
    // ------------------------------------------------------------------------

    /// Close cleanly: tell the peer not to recover, flush, then close
    pub fn close(self: &Arc<Self>) {
        let send_end = {
            let mut state = self.lock_state();
            if state.stage == Stage::Closed || state.closing {
                return;
            }
            state.closing = true;
            state.clean = true;
            state.stage == Stage::Established && self.retention > 0
        };
        if send_end {
            let mut end = SessionEnd::new();
            end.set_transform_eligible(false);
            let _ = self.send(Box::new(end));
        }
        let close_now = {
            let mut state = self.lock_state();
            if state.exchange.is_sending() {
                state.close_after_flush = true;
                false
            } else {
                true
            }
        };
        if close_now {
            self.close_transport();
        }
    }

    /// Drop the connection without telling the peer; recoverable
    pub fn abort(self: &Arc<Self>) {
        self.close_transport();
    }

    /// Setup failed; close without recovery
    pub(crate) fn fail(self: &Arc<Self>, reason: String) {
        warn!("Session {} setup failed: {}", self.handle(), reason);
        {
            let mut state = self.lock_state();
            state.failure = Some(reason);
            state.clean = true;
        }
        self.close_transport();
    }

    fn close_transport(self: &Arc<Self>) {
        self.transport.close();
        self.on_transport_closed();
    }

    /// The transport lost or closed the connection. Idempotent.
    pub fn on_transport_closed(self: &Arc<Self>) {
        let mut spare = Vec::new();
        let clean = {
            let mut state = self.lock_state();
            if state.stage == Stage::Closed {
                return;
            }
            state.stage = Stage::Closed;
            state.rx_buffer.clear();
            state.stash_in_flight(self.retention, &mut spare);
            debug!(
                "Session {} closed ({})",
                state.handle,
                if state.clean { "clean" } else { "abrupt" }
            );
            state.clean
        };
        self.recycle(spare);
        self.disarm_setup_timer();
        if let Some(link) = self.link() {
            link.on_session_closed(self, clean);
        }
    }

    /// Whether a successor may still take this session over under its token
    pub(crate) fn is_resumable(&self) -> bool {
        self.lock_state().is_resumable()
    }

    /// Release everything. Returns what the link must unregister, or `None`
    /// if the session was already finalized or taken over.
    pub(crate) fn finalize(&self) -> Option<Finalized> {
        let finalized = {
            let mut state = self.lock_state();
            if state.finalized {
                return None;
            }
            state.finalized = true;
            state.stage = Stage::Closed;
            state.sent.clear();
            state.sending.clear();
            state.pending.clear();
            state.batch = None;
            let _ = state.exchange.reset();
            Finalized {
                handle: mem::take(&mut state.handle),
                token: mem::take(&mut state.token),
                established: state.established_once,
                failure: state.failure.take(),
            }
        };
        self.transport.close();
        *self.lock_cipher() = CipherSlot::default();
        Some(finalized)
    }
}

impl core::fmt::Debug for LinkSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("LinkSession")
            .field("role", &self.role)
            .field("handle", &state.handle)
            .field("stage", &state.stage)
            .field("counters", &state.counters)
            .finish()
    }
}
