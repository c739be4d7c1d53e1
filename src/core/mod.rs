//! Core functionality for the realtime router

pub mod connection;
pub mod frames;
pub mod router;
pub mod transport;

// Re-export main components for convenience
pub use connection::{CloseFrame, Connection, ConnectionSettings};
pub use frames::{ClientFrame, ServerFrame};
pub use router::{Router, RouterStats, SharedRouter};
pub use transport::{Frame, MemoryTransport, Transport, WsTransport};
