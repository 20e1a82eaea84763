//! flowlink Runtime
//!
//! This crate contains the process-local half of flowlink:
//! - `Case` / `Binder`: the handler-binding stack every flow carries
//! - `Flow` and its scheduling variants (single-thread, multi-thread,
//!   thread-pool, threadless, frame-based)
//! - `Hub`: registry of attached flows and the single entry point for posting
//! - `Timer` / `TimeFlow`: one-shot and repeating reservations that re-post
//!   events through the hub

pub mod case;
pub mod flow;
pub mod hub;
pub mod time;

pub use case::{Binder, Case, FnCase, Handler};
pub use flow::{
    current_flow, FrameClock, FrameFlow, Flow, FlowCore, FlowState, MultiThreadFlow,
    SingleThreadFlow, ThreadPoolFlow, ThreadlessFlow, Update,
};
pub use hub::{FlowsGuard, Hub};
pub use time::{RepetitionId, ReservationId, TimeFlow, TimeoutScheduler, Timer};

// Re-export core types for convenience
pub use flowlink_core::{Event, EventQueue, FlowConfig, FlowError, FlowlinkError, Result};
