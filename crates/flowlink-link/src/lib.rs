//! flowlink Link
//!
//! Carries events between processes over byte transports:
//! - `session`: one connection's framing, send pipeline and setup stages
//! - `strategy`: the channel handshake, heartbeat and session recovery add-ons
//! - `link`: client and server links owning sessions and their lifecycle
//! - `registry`: handles and recovery tokens shared between links
//! - `transport`: in-memory and TCP transports
//!
//! A link reports session changes as events posted through the hub, and
//! receives its heartbeat and recovery timeouts the same way through the case
//! returned by `ClientLink::case` / `ServerLink::case`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod case;
pub mod events;
pub mod link;
pub mod registry;
pub mod session;
pub mod strategy;
pub mod transport;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use case::LinkCase;
pub use events::{
    register_link_events, LinkSessionConnected, LinkSessionDisconnected, LinkSessionRecovered,
    SessionRecoveryTimeout, SessionSetupTimeout,
};
pub use link::{ClientLink, Connector, LinkBuilder, LinkCore, ServerLink};
pub use registry::SessionRegistry;
pub use session::{Counters, LinkSession, Outgoing, Role, SessionTransport, Stage};
pub use strategy::{
    Action, Actions, ChannelStrategy, ChannelTemplate, Claim, HeartbeatStrategy,
    HeartbeatTemplate, RecoveryStrategy, RecoveryTemplate, SessionStrategy, SessionView,
    StrategyKind,
};
pub use transport::{MemoryConnector, MemoryPipe, MemoryTransport, Side};

// Re-export core types for convenience
pub use flowlink_core::{Event, FlowlinkError, LinkConfig, Result};
