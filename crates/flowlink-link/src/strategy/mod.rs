//! Session strategies
//!
//! Strategies are protocol add-ons attached to a link as configuration and
//! instantiated once per session. Each session tries its strategies in a fixed
//! order (channel, heartbeat, recovery) on every decoded frame; the first one
//! that claims the frame ends the chain, and unclaimed frames go to the hub.
//!
//! Strategies never touch the session directly. They return [`Action`]s that
//! the session applies after releasing the strategy lock, so a strategy lock is
//! never held while the session sends.

mod channel;
mod heartbeat;
mod recovery;

pub use channel::{ChannelStrategy, ChannelTemplate};
pub use heartbeat::{HeartbeatStrategy, HeartbeatTemplate};
pub use recovery::{RecoveryStrategy, RecoveryTemplate};

use std::time::Instant;

use smallvec::SmallVec;

use flowlink_core::{BufferTransform, Event, SessionReq};

use crate::session::{Counters, Role, Stage};

// ----------------------------------------------------------------------------
// Actions
// ----------------------------------------------------------------------------

/// Side effect requested by a strategy
pub enum Action {
    /// Send a protocol event in the clear
    Send(Box<dyn Event>),
    /// Hand the handshaken transform to the session
    InstallTransform {
        transform: Box<dyn BufferTransform>,
        rx_ready: bool,
        tx_ready: bool,
    },
    /// The installed transform may now be used for outbound frames
    EnableTransmit,
    /// The current setup stage finished
    StageComplete,
    /// Setup failed; the session closes without recovery
    Fail(String),
    /// Close the transport abruptly; the session stays recoverable
    Close,
    /// Server: validate or mint the token of a session request
    Validate(SessionReq),
    /// Client: the server issued `token` for a session with no prior token
    AssignToken(String),
    /// Client: the server accepted our token and expects `retransmission` frames
    Resume { retransmission: u64 },
    /// Client: the server refused our prior token and issued a fresh one
    Abandon { token: String },
    /// The peer ended the session cleanly
    PeerEnded,
}

impl core::fmt::Debug for Action {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Action::Send(event) => write!(f, "Send({})", event.type_name()),
            Action::InstallTransform {
                rx_ready, tx_ready, ..
            } => write!(f, "InstallTransform(rx={}, tx={})", rx_ready, tx_ready),
            Action::EnableTransmit => write!(f, "EnableTransmit"),
            Action::StageComplete => write!(f, "StageComplete"),
            Action::Fail(reason) => write!(f, "Fail({})", reason),
            Action::Close => write!(f, "Close"),
            Action::Validate(req) => write!(f, "Validate({})", req.token()),
            Action::AssignToken(token) => write!(f, "AssignToken({})", token),
            Action::Resume { retransmission } => write!(f, "Resume({})", retransmission),
            Action::Abandon { token } => write!(f, "Abandon({})", token),
            Action::PeerEnded => write!(f, "PeerEnded"),
        }
    }
}

pub type Actions = SmallVec<[Action; 4]>;

/// Result of offering a frame to a strategy
#[derive(Debug, Default)]
pub struct Claim {
    pub claimed: bool,
    pub actions: Actions,
}

impl Claim {
    /// Not ours; try the next strategy
    pub fn pass() -> Self {
        Self::default()
    }

    /// Ours, with follow-up actions
    pub fn claimed<I: IntoIterator<Item = Action>>(actions: I) -> Self {
        Self {
            claimed: true,
            actions: actions.into_iter().collect(),
        }
    }
}

// ----------------------------------------------------------------------------
// Strategy Contract
// ----------------------------------------------------------------------------

/// Strategy category; also the claim order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StrategyKind {
    Channel,
    Heartbeat,
    Recovery,
}

/// What a strategy may know about its session
#[derive(Debug, Clone, Copy)]
pub struct SessionView {
    pub role: Role,
    pub stage: Stage,
    pub counters: Counters,
}

/// Per-session protocol state machine
pub trait SessionStrategy: Send {
    fn kind(&self) -> StrategyKind;

    /// Start this strategy's setup stage. Only the initiating side sends.
    fn begin(&mut self, _view: &SessionView) -> Actions {
        Actions::new()
    }

    /// Offer a decoded frame
    fn try_claim(&mut self, view: &SessionView, event: &dyn Event) -> Claim;

    /// A frame arrived on this session, whether or not it decodes
    fn note_received(&mut self) {}

    /// A frame was handed to the transport
    fn note_sent(&mut self, _event_type: i32) {}

    /// Periodic heartbeat tick
    fn on_tick(&mut self, _view: &SessionView, _now: Instant) -> Actions {
        Actions::new()
    }
}
