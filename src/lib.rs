//! Chatty Realtime - session and room fan-out router for a chat service
//!
//! This library keeps one live websocket session per user, tracks which
//! sessions joined which conversations, and delivers opaque payloads to rooms
//! and users with bounded, non-blocking backpressure.

pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod handlers;

// Re-export main components
pub use config::*;
pub use constants::*;
