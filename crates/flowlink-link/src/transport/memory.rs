//! In-process transport
//!
//! A [`MemoryPipe`] connects a client and a server session without sockets.
//! Nothing moves until the pipe is pumped: `send` only queues the segment,
//! and [`MemoryPipe::pump`] delivers queued segments to the peer and then
//! reports the send completed to the sender. This keeps the transport
//! asynchronous from the session's point of view and lets tests lose bytes
//! or cut the connection at exact points.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, trace};

use flowlink_core::{LinkError, Result};

use crate::link::{ClientLink, Connector, ServerLink};
use crate::session::{LinkSession, SessionTransport};

/// One end of a memory pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Client => 0,
            Side::Server => 1,
        }
    }

    fn peer(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

#[derive(Default)]
struct EndState {
    session: Weak<LinkSession>,
    outbox: VecDeque<Vec<u8>>,
    closing: bool,
}

struct PipeState {
    ends: [EndState; 2],
    closed: bool,
}

struct PipeShared {
    id: u64,
    state: Mutex<PipeState>,
}

impl PipeShared {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Step {
    Deliver {
        segment: Vec<u8>,
        from: Weak<LinkSession>,
        to: Weak<LinkSession>,
    },
    Close([Weak<LinkSession>; 2]),
}

static NEXT_PIPE: AtomicU64 = AtomicU64::new(1);

// ----------------------------------------------------------------------------
// Memory Pipe
// ----------------------------------------------------------------------------

/// Bidirectional in-memory connection
#[derive(Clone)]
pub struct MemoryPipe {
    shared: Arc<PipeShared>,
}

impl MemoryPipe {
    /// A pipe and its client and server transports
    pub fn open() -> (Self, Arc<MemoryTransport>, Arc<MemoryTransport>) {
        let shared = Arc::new(PipeShared {
            id: NEXT_PIPE.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(PipeState {
                ends: [EndState::default(), EndState::default()],
                closed: false,
            }),
        });
        let client = Arc::new(MemoryTransport {
            shared: shared.clone(),
            side: Side::Client,
        });
        let server = Arc::new(MemoryTransport {
            shared: shared.clone(),
            side: Side::Server,
        });
        (Self { shared }, client, server)
    }

    /// Route deliveries for `side` to `session`
    pub fn bind(&self, side: Side, session: &Arc<LinkSession>) {
        self.shared.lock().ends[side.index()].session = Arc::downgrade(session);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Segments queued by `side` and not yet delivered
    pub fn in_flight(&self, side: Side) -> usize {
        self.shared.lock().ends[side.index()].outbox.len()
    }

    /// Deliver until neither side has anything queued. Returns the number of
    /// segments delivered.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        while let Some(step) = self.next_step(None) {
            if matches!(step, Step::Deliver { .. }) {
                delivered += 1;
            }
            run(step);
        }
        delivered
    }

    /// Deliver at most one segment queued by `side`
    pub fn pump_once(&self, side: Side) -> bool {
        match self.next_step(Some(side)) {
            Some(step) => {
                run(step);
                true
            }
            None => false,
        }
    }

    /// Report every segment queued by `side` as sent without delivering it:
    /// the bytes left the sender and never reached the peer
    pub fn drop_in_flight(&self, side: Side) -> usize {
        let (lost, from) = {
            let mut state = self.shared.lock();
            let end = &mut state.ends[side.index()];
            (end.outbox.drain(..).count(), end.session.clone())
        };
        debug!("Pipe {} lost {} segments from {:?}", self.shared.id, lost, side);
        if let Some(session) = from.upgrade() {
            for _ in 0..lost {
                session.on_send_completed(Ok(()));
            }
        }
        lost
    }

    /// Cut the connection: queued bytes are lost and both sessions see the
    /// transport close
    pub fn disconnect(&self) {
        let sessions = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            for end in state.ends.iter_mut() {
                end.outbox.clear();
            }
            [state.ends[0].session.clone(), state.ends[1].session.clone()]
        };
        debug!("Pipe {} disconnected", self.shared.id);
        run(Step::Close(sessions));
    }

    fn next_step(&self, only: Option<Side>) -> Option<Step> {
        let mut state = self.shared.lock();
        if state.closed {
            return None;
        }
        let sides = match only {
            Some(side) => [side, side],
            None => [Side::Client, Side::Server],
        };
        for side in sides {
            if let Some(segment) = state.ends[side.index()].outbox.pop_front() {
                return Some(Step::Deliver {
                    segment,
                    from: state.ends[side.index()].session.clone(),
                    to: state.ends[side.peer().index()].session.clone(),
                });
            }
        }
        if only.is_none() && state.ends.iter().any(|end| end.closing) {
            state.closed = true;
            return Some(Step::Close([
                state.ends[0].session.clone(),
                state.ends[1].session.clone(),
            ]));
        }
        None
    }
}

impl core::fmt::Debug for MemoryPipe {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryPipe")
            .field("id", &self.shared.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn run(step: Step) {
    match step {
        Step::Deliver { segment, from, to } => {
            trace!("Delivering {} bytes", segment.len());
            if let Some(receiver) = to.upgrade() {
                receiver.on_received(&segment);
            }
            if let Some(sender) = from.upgrade() {
                sender.on_send_completed(Ok(()));
            }
        }
        Step::Close(sessions) => {
            for session in sessions.iter().filter_map(Weak::upgrade) {
                session.on_transport_closed();
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Memory Transport
// ----------------------------------------------------------------------------

/// One end of a [`MemoryPipe`]
pub struct MemoryTransport {
    shared: Arc<PipeShared>,
    side: Side,
}

impl SessionTransport for MemoryTransport {
    fn send(&self, segment: Vec<u8>) -> Result<()> {
        let mut state = self.shared.lock();
        let end = &mut state.ends[self.side.index()];
        if end.closing {
            return Err(LinkError::NotConnected { handle: 0 }.into());
        }
        end.outbox.push_back(segment);
        Ok(())
    }

    /// Graceful: bytes already queued are still delivered before the peer
    /// sees the close
    fn close(&self) {
        self.shared.lock().ends[self.side.index()].closing = true;
    }

    fn remote(&self) -> String {
        format!("memory:{}/{:?}", self.shared.id, self.side.peer())
    }
}

// ----------------------------------------------------------------------------
// Memory Connector
// ----------------------------------------------------------------------------

/// Connects a client link to a server link in the same process
pub struct MemoryConnector {
    server: ServerLink,
    pipes: Mutex<Vec<MemoryPipe>>,
    refuse: AtomicBool,
}

impl MemoryConnector {
    pub fn new(server: ServerLink) -> Arc<Self> {
        Arc::new(Self {
            server,
            pipes: Mutex::new(Vec::new()),
            refuse: AtomicBool::new(false),
        })
    }

    /// Make further connects fail, as if the server were unreachable
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// The most recently opened pipe
    pub fn latest(&self) -> Option<MemoryPipe> {
        self.lock_pipes().last().cloned()
    }

    pub fn pipes(&self) -> Vec<MemoryPipe> {
        self.lock_pipes().clone()
    }

    /// Pump every pipe until all are quiescent
    pub fn pump(&self) -> usize {
        let mut total = 0;
        loop {
            let moved: usize = self.pipes().iter().map(MemoryPipe::pump).sum();
            if moved == 0 {
                return total;
            }
            total += moved;
        }
    }

    fn lock_pipes(&self) -> MutexGuard<'_, Vec<MemoryPipe>> {
        self.pipes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, link: ClientLink) {
        if self.refuse.load(Ordering::SeqCst) {
            link.connect_failed("connection refused");
            return;
        }
        let (pipe, client, server) = MemoryPipe::open();
        self.lock_pipes().push(pipe.clone());

        match self.server.accept(server) {
            Ok(session) => pipe.bind(Side::Server, &session),
            Err(e) => {
                link.connect_failed(&e.to_string());
                return;
            }
        }
        match link.attach(client) {
            Ok(session) => pipe.bind(Side::Client, &session),
            Err(e) => debug!("Client link refused the memory transport: {}", e),
        }
    }
}
