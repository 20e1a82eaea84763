//! Byte transports under link sessions
//!
//! - `memory`: in-process pipes, pumped explicitly, for tests and demos
//! - `tcp`: tokio sockets with a listener and a connector

pub mod memory;
pub mod tcp;

pub use memory::{MemoryConnector, MemoryPipe, MemoryTransport, Side};
pub use tcp::{TcpBinding, TcpConnector, TcpRuntime, TcpServerTransport, TcpTransport};
