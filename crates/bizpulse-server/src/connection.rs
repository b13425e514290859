//! Server-side state for one dashboard `WebSocket`.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bizpulse_core::{BusinessId, ConnectionId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a registered connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// An authenticated connection bound to exactly one business.
///
/// Outbound frames go through a bounded queue drained by the session's
/// writer task; [`send`](Self::send) never blocks.
pub struct ClientConnection {
    pub id: ConnectionId,
    business_id: BusinessId,
    tx: mpsc::Sender<Arc<str>>,
    state: AtomicU8,
    close_requested: CancellationToken,
    connected_at: Instant,
    is_alive: AtomicBool,
    last_seen: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// `close_requested` is cancelled to ask the session to close the socket;
    /// pass a child of the server shutdown token.
    pub fn new(
        business_id: BusinessId,
        tx: mpsc::Sender<Arc<str>>,
        close_requested: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            business_id,
            tx,
            state: AtomicU8::new(ReadyState::Connecting as u8),
            close_requested,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    pub fn business_id(&self) -> &BusinessId {
        &self.business_id
    }

    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// Connecting → Open. Returns `false` from any other state.
    pub fn mark_open(&self) -> bool {
        self.transition(ReadyState::Connecting, ReadyState::Open)
    }

    /// Ask the session to close the socket. Open → Closing; stops fan-out
    /// to this connection immediately.
    pub fn request_close(&self) {
        let _ = self.transition(ReadyState::Open, ReadyState::Closing);
        self.close_requested.cancel();
    }

    /// Token cancelled once a close has been requested.
    pub fn close_token(&self) -> CancellationToken {
        self.close_requested.clone()
    }

    /// Move to Closed. Returns `true` only for the call that performed the
    /// transition, so cleanup tied to it runs once.
    pub fn close(&self) -> bool {
        let previous = self.state.swap(ReadyState::Closed as u8, Ordering::AcqRel);
        ReadyState::from_u8(previous) != ReadyState::Closed
    }

    fn transition(&self, from: ReadyState, to: ReadyState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Enqueue a text frame.
    ///
    /// Returns `false` if the queue is full or closed, and increments the
    /// dropped message counter.
    pub fn send(&self, message: Arc<str>) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record inbound activity (any frame, including pong).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Check and reset the alive flag. `true` if the peer was heard from
    /// since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Time since the connection was accepted.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("business_id", &self.business_id)
            .field("state", &self.ready_state())
            .finish_non_exhaustive()
    }
}
