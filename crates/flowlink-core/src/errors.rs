//! Error types for flowlink
//!
//! This module contains every error type used by the runtime and the link layer:
//! queue errors, wire framing errors, channel transform errors, flow lifecycle
//! errors, link/session errors, and the `FlowlinkError` type that unifies them.

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Event queue errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is closed")]
    Closed,
    #[error("Dequeue timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
}

/// Wire framing and event decoding errors
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Frame header is malformed: {reason}")]
    MalformedHeader { reason: String },
    #[error("Frame too large: {length} bytes (max: {max})")]
    FrameTooLarge { length: usize, max: usize },
    #[error("Frame payload too short: expected at least {expected}, got {actual}")]
    PayloadTooShort { expected: usize, actual: usize },
    #[error("Unknown event type id: {type_id}")]
    UnknownType { type_id: i32 },
    #[error("Event type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: i32, actual: i32 },
    #[error("Event field {field} could not be decoded: {reason}")]
    Field { field: &'static str, reason: String },
}

/// Channel transform errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformError {
    #[error("Transform is not ready for {direction}")]
    NotReady { direction: &'static str },
    #[error("Handshake data is invalid: {reason}")]
    InvalidHandshake { reason: String },
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
}

/// Flow lifecycle and binding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    #[error("Flow {name} is already attached")]
    AlreadyAttached { name: String },
    #[error("Flow {name} failed to start: {reason}")]
    StartFailed { name: String, reason: String },
    #[error("Flow {name} has no event queue")]
    NoQueue { name: String },
    #[error("Case setup failed in flow {name}: {reason}")]
    CaseSetup { name: String, reason: String },
}

/// Link and session errors
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Connection failed to {remote}: {reason}")]
    ConnectionFailed { remote: String, reason: String },
    #[error("Network I/O error: {0}")]
    NetworkIo(#[from] std::io::Error),
    #[error("Session {handle} not found")]
    SessionNotFound { handle: u64 },
    #[error("Session {handle} is not connected")]
    NotConnected { handle: u64 },
    #[error("Handshake failed on session {handle}: {reason}")]
    HandshakeFailed { handle: u64, reason: String },
    #[error("Timed out after {duration_ms}ms waiting for {what}")]
    Timeout { what: &'static str, duration_ms: u64 },
    #[error("Recovery refused for token {token}: {reason}")]
    RecoveryRefused { token: String, reason: String },
    #[error("Link {name} is closed")]
    Closed { name: String },
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Core error type for flowlink
#[derive(Debug, thiserror::Error)]
pub enum FlowlinkError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl FlowlinkError {
    /// Create a malformed frame error with a reason
    pub fn invalid_frame<T: Into<String>>(reason: T) -> Self {
        FlowlinkError::Wire(WireError::MalformedHeader {
            reason: reason.into(),
        })
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        FlowlinkError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed<P: Into<String>, R: Into<String>>(remote: P, reason: R) -> Self {
        FlowlinkError::Link(LinkError::ConnectionFailed {
            remote: remote.into(),
            reason: reason.into(),
        })
    }

    /// Create a handshake failed error
    pub fn handshake_failed<R: Into<String>>(handle: u64, reason: R) -> Self {
        FlowlinkError::Link(LinkError::HandshakeFailed {
            handle,
            reason: reason.into(),
        })
    }

    /// Create a session not found error
    pub fn session_not_found(handle: u64) -> Self {
        FlowlinkError::Link(LinkError::SessionNotFound { handle })
    }

    /// Create a timeout error
    pub fn timeout(what: &'static str, duration: core::time::Duration) -> Self {
        FlowlinkError::Link(LinkError::Timeout {
            what,
            duration_ms: duration.as_millis() as u64,
        })
    }

    /// Whether this error came from the transport rather than the protocol
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FlowlinkError::Link(LinkError::NetworkIo(_))
                | FlowlinkError::Link(LinkError::ConnectionFailed { .. })
        )
    }
}

impl From<std::io::Error> for FlowlinkError {
    fn from(err: std::io::Error) -> Self {
        FlowlinkError::Link(LinkError::NetworkIo(err))
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, FlowlinkError>;
pub type FlowlinkResult<T> = Result<T>;
