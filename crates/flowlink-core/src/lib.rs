//! flowlink Core
//!
//! This crate provides the foundational pieces shared by the flowlink runtime and
//! link layer: the event contract and its fingerprinted field model, the event
//! queue, the wire framing used between processes, and the channel transform
//! contract used by the encryption handshake.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod builtin;
pub mod config;
pub mod errors;
pub mod event;
pub mod exchange;
pub mod factory;
pub mod queue;
pub mod transform;
pub mod wire;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use builtin::{
    HandshakeAck, HandshakeReq, HandshakeResp, HeartbeatEvent, SessionAck, SessionEnd,
    SessionReq, SessionResp,
};
pub use config::{
    ChannelConfig, FlowConfig, HeartbeatConfig, LinkConfig, RecoveryConfig, RuntimeConfig,
};
pub use errors::{
    FlowError, FlowlinkError, FlowlinkResult, LinkError, QueueError, Result, TransformError,
    WireError,
};
pub use event::{Event, EventHeader, Fingerprint};
pub use exchange::SendExchange;
pub use factory::EventFactory;
pub use queue::EventQueue;
pub use transform::{BufferTransform, CipherTransform};
pub use wire::{Frame, FrameCodec, FrameHeader, ReassemblyBuffer, WireBuffer};

#[doc(hidden)]
pub use bincode as __bincode;
