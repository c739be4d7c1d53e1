//! Client connection management
//! Handles the outbound side of a live session: a bounded queue, a delivery
//! task that owns the transport, keepalive pings and a one-shot close.

use bytes::Bytes;
use log::{debug, info, trace, warn};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::constants::{
    CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, DEFAULT_PING_PERIOD, DEFAULT_SEND_BUFFER,
    DEFAULT_WRITE_WAIT, REASON_SEND_BUFFER_FULL, REASON_WRITE_FAILED,
};
use crate::core::transport::Transport;
use crate::error::{ChattyError, Result};

/// Delivery parameters of a single connection
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Capacity of the outbound queue
    pub send_buffer: usize,
    /// Deadline applied to every transport write
    pub write_wait: Duration,
    /// Interval between keepalive pings
    pub ping_period: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            send_buffer: DEFAULT_SEND_BUFFER,
            write_wait: DEFAULT_WRITE_WAIT,
            ping_period: DEFAULT_PING_PERIOD,
        }
    }
}

/// Code and reason carried by a close control frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

/// State shared between a connection handle and its delivery task
struct Shared {
    closed: AtomicBool,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    signal: watch::Sender<Option<CloseFrame>>,
    released: watch::Sender<bool>,
}

impl Shared {
    /// Flip to closed. Only the first caller wins and gets `true`.
    fn begin_close(&self, code: u16, reason: &str) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.signal.send_replace(Some(CloseFrame {
            code,
            reason: reason.to_string(),
        }));
        // Dropping the sender closes the queue
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        true
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close_frame(&self) -> Option<CloseFrame> {
        self.signal.borrow().clone()
    }
}

/// Queue and transport parked until the delivery task is launched
struct Pending {
    queue: mpsc::Receiver<Bytes>,
    transport: Box<dyn Transport>,
}

/// Represents one live client session
pub struct Connection {
    id: String,
    user_id: String,
    settings: ConnectionSettings,
    shared: Arc<Shared>,
    pending: Mutex<Option<Pending>>,
}

impl Connection {
    /// Create a connection with default delivery settings
    pub fn new<T: Transport>(user_id: impl Into<String>, transport: T) -> Self {
        Self::with_settings(user_id, transport, ConnectionSettings::default())
    }

    /// Create a connection with explicit delivery settings. Delivery does not
    /// begin until [`Connection::start`] is called.
    pub fn with_settings<T: Transport>(
        user_id: impl Into<String>,
        transport: T,
        settings: ConnectionSettings,
    ) -> Self {
        let (sender, queue) = mpsc::channel(settings.send_buffer.max(1));
        let (signal, _) = watch::channel(None);
        let (released, _) = watch::channel(false);

        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            settings,
            shared: Arc::new(Shared {
                closed: AtomicBool::new(false),
                outbound: Mutex::new(Some(sender)),
                signal,
                released,
            }),
            pending: Mutex::new(Some(Pending {
                queue,
                transport: Box::new(transport),
            })),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Code and reason of the close that won, if the connection is closed
    pub fn close_frame(&self) -> Option<CloseFrame> {
        self.shared.close_frame()
    }

    /// Launch the delivery task on the current tokio runtime.
    ///
    /// Must be called once. Later calls are ignored.
    pub fn start(&self) {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(pending) = pending else {
            if self.shared.is_closed() {
                debug!("Connection {} was closed before its delivery loop started", self.id);
            } else {
                warn!("Delivery loop for connection {} already started", self.id);
            }
            return;
        };

        debug!("Starting delivery loop for connection {} (user {})", self.id, self.user_id);
        tokio::spawn(self.delivery_task(pending).run());
    }

    fn delivery_task(&self, pending: Pending) -> DeliveryTask {
        DeliveryTask {
            connection_id: self.id.clone(),
            shared: Arc::clone(&self.shared),
            queue: pending.queue,
            transport: pending.transport,
            settings: self.settings.clone(),
        }
    }

    /// Enqueue a payload for delivery without blocking.
    ///
    /// A full queue means the peer is not keeping up: the connection is closed
    /// and the payload is rejected with [`ChattyError::BackpressureExceeded`].
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        if self.shared.is_closed() {
            return Err(ChattyError::ConnectionClosed);
        }

        let outbound = self
            .shared
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = outbound.as_ref() else {
            return Err(ChattyError::ConnectionClosed);
        };

        match sender.try_send(payload.into()) {
            Ok(()) => {
                trace!("Queued payload for connection {}", self.id);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                drop(outbound);
                warn!(
                    "Send buffer full for connection {} (user {}), evicting slow client",
                    self.id, self.user_id
                );
                self.close(CLOSE_GOING_AWAY, REASON_SEND_BUFFER_FULL);
                Err(ChattyError::BackpressureExceeded)
            }
            Err(TrySendError::Closed(_)) => Err(ChattyError::ConnectionClosed),
        }
    }

    /// Close the connection. Idempotent: only the first call's code and reason
    /// are used. Never fails and never blocks; the close frame is written and
    /// the transport released in the background, by the delivery task if it
    /// is running.
    pub fn close(&self, code: u16, reason: &str) {
        if !self.shared.begin_close(code, reason) {
            return;
        }

        info!(
            "Closing connection {} for user {} ({}: {})",
            self.id, self.user_id, code, reason
        );

        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(pending) = pending else { return };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(self.delivery_task(pending).finish());
            }
            Err(_) => warn!(
                "No runtime to flush close of connection {}, dropping transport",
                self.id
            ),
        }
    }

    /// Wait until the delivery task has released the transport
    pub async fn closed(&self) {
        let mut released = self.shared.released.subscribe();
        let _ = released.wait_for(|done| *done).await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct DeliveryTask {
    connection_id: String,
    shared: Arc<Shared>,
    queue: mpsc::Receiver<Bytes>,
    transport: Box<dyn Transport>,
    settings: ConnectionSettings,
}

impl DeliveryTask {
    async fn run(mut self) {
        let mut signal = self.shared.signal.subscribe();
        let period = self.settings.ping_period;
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // A close that landed before launch is already marked seen by subscribe()
        while !self.shared.is_closed() {
            tokio::select! {
                biased;
                _ = signal.changed() => break,
                next = self.queue.recv() => {
                    let Some(payload) = next else { break };
                    let deadline = Instant::now() + self.settings.write_wait;
                    // A close cuts an in-flight write short
                    tokio::select! {
                        biased;
                        _ = signal.changed() => break,
                        result = with_deadline(deadline, self.transport.write_text(payload)) => {
                            if let Err(e) = result {
                                self.fail("payload", e);
                                break;
                            }
                        }
                    }
                }
                _ = keepalive.tick() => {
                    let deadline = Instant::now() + self.settings.write_wait;
                    let write = self.transport.write_ping();
                    if let Err(e) = with_deadline(deadline, write).await {
                        self.fail("ping", e);
                        break;
                    }
                }
            }
        }

        self.finish().await;
    }

    fn fail(&self, what: &str, err: ChattyError) {
        warn!(
            "Failed to write {} to connection {}: {}",
            what, self.connection_id, err
        );
        self.shared.begin_close(CLOSE_INTERNAL_ERROR, REASON_WRITE_FAILED);
    }

    /// Write the close frame and release the transport, both within one
    /// write deadline.
    async fn finish(mut self) {
        self.queue.close();
        let deadline = Instant::now() + self.settings.write_wait;

        if let Some(frame) = self.shared.close_frame() {
            let write = self.transport.write_close(frame.code, &frame.reason);
            if let Err(e) = with_deadline(deadline, write).await {
                debug!(
                    "Close frame not delivered to connection {}: {}",
                    self.connection_id, e
                );
            }
        }

        let release = self.transport.close();
        if let Err(e) = with_deadline(deadline, release).await {
            debug!("Error releasing connection {}: {}", self.connection_id, e);
        }

        debug!("Connection {} released", self.connection_id);
        self.shared.released.send_replace(true);
    }
}

async fn with_deadline<F>(deadline: Instant, write: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match timeout_at(deadline, write).await {
        Ok(result) => result,
        Err(_) => Err(ChattyError::WriteTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{CLOSE_NORMAL, CLOSE_SESSION_REPLACED};
    use crate::core::transport::{Frame, MemoryTransport};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    fn fast_settings() -> ConnectionSettings {
        ConnectionSettings {
            send_buffer: DEFAULT_SEND_BUFFER,
            write_wait: Duration::from_millis(50),
            ping_period: Duration::from_secs(60),
        }
    }

    async fn next_frame(frames: &mut UnboundedReceiver<Frame>) -> Frame {
        timeout(Duration::from_secs(2), frames.recv())
            .await
            .expect("frame in time")
            .expect("transport still reporting")
    }

    fn drain(frames: &mut UnboundedReceiver<Frame>) -> Vec<Frame> {
        let mut seen = Vec::new();
        while let Ok(frame) = frames.try_recv() {
            seen.push(frame);
        }
        seen
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (a, _fa) = MemoryTransport::new();
        let (b, _fb) = MemoryTransport::new();
        let first = Connection::new("user1", a);
        let second = Connection::new("user1", b);
        assert_ne!(first.id(), second.id());
        assert_eq!(first.user_id(), "user1");
    }

    #[tokio::test]
    async fn test_payloads_delivered_in_order() {
        let (transport, mut frames) = MemoryTransport::new();
        let conn = Connection::with_settings("user1", transport, fast_settings());

        conn.send("one").unwrap();
        conn.send("two").unwrap();
        conn.start();
        conn.send("three").unwrap();

        for expected in ["one", "two", "three"] {
            assert_eq!(next_frame(&mut frames).await, Frame::Text(Bytes::from(expected)));
        }
    }

    #[tokio::test]
    async fn test_full_queue_evicts_connection() {
        let (transport, mut frames) = MemoryTransport::new();
        let conn = Connection::with_settings("user1", transport, fast_settings());

        for i in 0..DEFAULT_SEND_BUFFER {
            assert!(conn.send(format!("payload {}", i)).is_ok());
        }
        let err = conn.send("overflow").unwrap_err();
        assert!(matches!(err, ChattyError::BackpressureExceeded));
        assert!(conn.is_closed());
        assert_eq!(
            conn.close_frame(),
            Some(CloseFrame {
                code: CLOSE_GOING_AWAY,
                reason: REASON_SEND_BUFFER_FULL.to_string()
            })
        );

        // Nothing queued is flushed once closed; only the close frame goes out
        conn.start();
        conn.closed().await;
        assert_eq!(
            drain(&mut frames),
            vec![
                Frame::Close {
                    code: CLOSE_GOING_AWAY,
                    reason: REASON_SEND_BUFFER_FULL.to_string()
                },
                Frame::Released
            ]
        );
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (transport, _frames) = MemoryTransport::new();
        let conn = Connection::with_settings("user1", transport, fast_settings());
        conn.close(CLOSE_NORMAL, "bye");
        assert!(matches!(conn.send("late"), Err(ChattyError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_first_close_wins() {
        let (transport, _frames) = MemoryTransport::new();
        let conn = Connection::with_settings("user1", transport, fast_settings());
        conn.close(CLOSE_SESSION_REPLACED, "session replaced");
        conn.close(CLOSE_NORMAL, "session closed");
        assert_eq!(conn.close_frame().unwrap().code, CLOSE_SESSION_REPLACED);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_close_writes_one_close_frame() {
        let (transport, mut frames) = MemoryTransport::new();
        let conn = Arc::new(Connection::with_settings("user1", transport, fast_settings()));
        conn.start();

        let mut handles = Vec::new();
        for i in 0..16u16 {
            let conn = Arc::clone(&conn);
            handles.push(tokio::spawn(async move {
                conn.close(4000 + i, "racing");
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        conn.closed().await;
        let closes = drain(&mut frames)
            .into_iter()
            .filter(|frame| matches!(frame, Frame::Close { .. }))
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_keepalive_pings() {
        let (transport, mut frames) = MemoryTransport::new();
        let settings = ConnectionSettings {
            ping_period: Duration::from_millis(30),
            ..fast_settings()
        };
        let conn = Connection::with_settings("user1", transport, settings);
        conn.start();

        assert_eq!(next_frame(&mut frames).await, Frame::Ping);
        conn.close(CLOSE_NORMAL, "done");
    }

    #[tokio::test]
    async fn test_write_deadline_terminates_delivery() {
        let (transport, mut frames) = MemoryTransport::stalled();
        let conn = Connection::with_settings("user1", transport, fast_settings());
        conn.send("stuck").unwrap();
        conn.start();

        timeout(Duration::from_secs(2), conn.closed()).await.unwrap();
        assert_eq!(conn.close_frame().unwrap().reason, REASON_WRITE_FAILED);
        assert!(matches!(conn.send("more"), Err(ChattyError::ConnectionClosed)));
        assert_eq!(drain(&mut frames), vec![Frame::Released]);
    }

    #[tokio::test]
    async fn test_close_before_start_flushes_and_releases() {
        let (transport, mut frames) = MemoryTransport::new();
        let conn = Connection::with_settings("user1", transport, fast_settings());
        conn.send("never delivered").unwrap();

        conn.close(CLOSE_NORMAL, "bye");
        timeout(Duration::from_secs(2), conn.closed()).await.unwrap();

        assert_eq!(
            drain(&mut frames),
            vec![
                Frame::Close {
                    code: CLOSE_NORMAL,
                    reason: "bye".to_string()
                },
                Frame::Released
            ]
        );

        // Nothing left to launch
        conn.start();
        assert!(frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_interrupts_stalled_write() {
        let (transport, mut frames) = MemoryTransport::stalled();
        let wait = Duration::from_millis(300);
        let conn = Connection::with_settings(
            "user1",
            transport,
            ConnectionSettings {
                write_wait: wait,
                ..fast_settings()
            },
        );
        conn.send("stuck").unwrap();
        conn.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        conn.close(CLOSE_NORMAL, "bye");
        timeout(Duration::from_secs(2), conn.closed()).await.unwrap();

        // One deadline covers the close frame and the release
        assert!(started.elapsed() < wait + Duration::from_millis(150));
        assert_eq!(conn.close_frame().unwrap().code, CLOSE_NORMAL);
        assert_eq!(drain(&mut frames), vec![Frame::Released]);
    }

    #[tokio::test]
    async fn test_second_start_is_ignored() {
        let (transport, _frames) = MemoryTransport::new();
        let conn = Connection::with_settings("user1", transport, fast_settings());
        conn.start();
        conn.start();
        conn.close(CLOSE_NORMAL, "done");
        timeout(Duration::from_secs(2), conn.closed()).await.unwrap();
    }
}
