//! Write side of a framed duplex stream
//!
//! A [`Transport`] is exclusively owned by one [`Connection`](crate::core::Connection)
//! and only ever driven by its delivery task. Write deadlines are applied by the
//! caller, so implementations may block for as long as the peer makes them.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::sink::SinkExt;
use futures_util::stream::SplitSink;
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

use crate::error::{ChattyError, Result};

#[async_trait]
pub trait Transport: Send + 'static {
    /// Write one data frame
    async fn write_text(&mut self, payload: Bytes) -> Result<()>;

    /// Write a keepalive ping control frame
    async fn write_ping(&mut self) -> Result<()>;

    /// Write a close control frame
    async fn write_close(&mut self, code: u16, reason: &str) -> Result<()>;

    /// Release the underlying stream
    async fn close(&mut self) -> Result<()>;
}

/// Transport over the sending half of a warp websocket
pub struct WsTransport {
    sink: SplitSink<WebSocket, Message>,
}

impl WsTransport {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn write_text(&mut self, payload: Bytes) -> Result<()> {
        let message = match std::str::from_utf8(&payload) {
            Ok(text) => Message::text(text),
            Err(_) => Message::binary(payload.to_vec()),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| ChattyError::Transport(e.to_string()))
    }

    async fn write_ping(&mut self) -> Result<()> {
        self.sink
            .send(Message::ping(Vec::new()))
            .await
            .map_err(|e| ChattyError::Transport(e.to_string()))
    }

    async fn write_close(&mut self, code: u16, reason: &str) -> Result<()> {
        self.sink
            .send(Message::close_with(code, reason.to_string()))
            .await
            .map_err(|e| ChattyError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.sink
            .close()
            .await
            .map_err(|e| ChattyError::Transport(e.to_string()))
    }
}

/// Frame observed on a [`MemoryTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(Bytes),
    Ping,
    Close { code: u16, reason: String },
    Released,
}

/// In-process transport reporting every write on a channel
///
/// A stalled transport never completes a write, which lets callers exercise
/// write deadlines and backpressure without a real peer.
pub struct MemoryTransport {
    frames: mpsc::UnboundedSender<Frame>,
    stalled: bool,
}

impl MemoryTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (frames, rx) = mpsc::unbounded_channel();
        (
            Self {
                frames,
                stalled: false,
            },
            rx,
        )
    }

    pub fn stalled() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (mut transport, rx) = Self::new();
        transport.stalled = true;
        (transport, rx)
    }

    async fn emit(&self, frame: Frame) -> Result<()> {
        if self.stalled {
            std::future::pending::<()>().await;
        }
        self.frames
            .send(frame)
            .map_err(|_| ChattyError::Transport("peer gone".to_string()))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn write_text(&mut self, payload: Bytes) -> Result<()> {
        self.emit(Frame::Text(payload)).await
    }

    async fn write_ping(&mut self) -> Result<()> {
        self.emit(Frame::Ping).await
    }

    async fn write_close(&mut self, code: u16, reason: &str) -> Result<()> {
        self.emit(Frame::Close {
            code,
            reason: reason.to_string(),
        })
        .await
    }

    async fn close(&mut self) -> Result<()> {
        // Releasing never stalls, even on a stalled peer
        self.frames
            .send(Frame::Released)
            .map_err(|_| ChattyError::Transport("peer gone".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_memory_transport_reports_frames_in_order() {
        let (mut transport, mut frames) = MemoryTransport::new();

        transport.write_text(Bytes::from_static(b"hello")).await.unwrap();
        transport.write_ping().await.unwrap();
        transport.write_close(1000, "bye").await.unwrap();
        transport.close().await.unwrap();

        assert_eq!(frames.recv().await, Some(Frame::Text(Bytes::from_static(b"hello"))));
        assert_eq!(frames.recv().await, Some(Frame::Ping));
        assert_eq!(
            frames.recv().await,
            Some(Frame::Close {
                code: 1000,
                reason: "bye".to_string()
            })
        );
        assert_eq!(frames.recv().await, Some(Frame::Released));
    }

    #[tokio::test]
    async fn test_stalled_transport_never_completes_writes() {
        let (mut transport, _frames) = MemoryTransport::stalled();
        let write = tokio::time::timeout(
            Duration::from_millis(20),
            transport.write_text(Bytes::from_static(b"x")),
        )
        .await;
        assert!(write.is_err());
    }

    #[tokio::test]
    async fn test_write_fails_once_peer_dropped() {
        let (mut transport, frames) = MemoryTransport::new();
        drop(frames);
        let err = transport.write_ping().await.unwrap_err();
        assert!(matches!(err, ChattyError::Transport(_)));
    }
}
