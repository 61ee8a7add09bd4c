//! Connection state and transfer statistics.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Connection state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Connection manager for tracking state and statistics.
///
/// State changes go through [`ConnectionManager::transition`] under a lock;
/// counters are atomics so the send path and the read loop can update them
/// concurrently.
pub struct ConnectionManager {
    state: Mutex<ConnectionState>,
    connected_at: Mutex<Option<Instant>>,
    last_connection_time: Mutex<Option<Duration>>,
    last_send: Mutex<Option<Instant>>,
    last_receive: Mutex<Option<Instant>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    payloads_received: AtomicU64,
    connect_attempts: AtomicU32,
}

impl ConnectionManager {
    /// Create a new connection manager
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            connected_at: Mutex::new(None),
            last_connection_time: Mutex::new(None),
            last_send: Mutex::new(None),
            last_receive: Mutex::new(None),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            payloads_received: AtomicU64::new(0),
            connect_attempts: AtomicU32::new(0),
        }
    }

    /// Transition to new state, returning the previous one
    pub fn transition(&self, new_state: ConnectionState) -> ConnectionState {
        let mut state = self.state.lock();
        let old_state = *state;

        match new_state {
            ConnectionState::Connected => {
                *self.connected_at.lock() = Some(Instant::now());
            }
            ConnectionState::Disconnected => {
                if let Some(started) = self.connected_at.lock().take() {
                    *self.last_connection_time.lock() = Some(started.elapsed());
                }
            }
            ConnectionState::Connecting => {}
        }

        *state = new_state;
        old_state
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Time connected so far, or the length of the last connection.
    pub fn duration(&self) -> Option<Duration> {
        match *self.connected_at.lock() {
            Some(started) => Some(started.elapsed()),
            None => *self.last_connection_time.lock(),
        }
    }

    /// Record bytes sent
    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        *self.last_send.lock() = Some(Instant::now());
    }

    /// Record bytes received from a single read
    pub fn record_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        *self.last_receive.lock() = Some(Instant::now());
    }

    /// Record a payload handed to the caller
    pub fn record_payload(&self) {
        self.payloads_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed connection attempt, returning the new total
    pub fn record_attempt(&self) -> u32 {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Failed attempts in the current connect cycle
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Start a new connect cycle with no failed attempts
    pub fn reset_attempts(&self) {
        self.connect_attempts.store(0, Ordering::SeqCst);
    }

    /// Get transfer statistics
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            state: self.state(),
            duration: self.duration(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            payloads_received: self.payloads_received.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts(),
            last_send: self.last_send.lock().map(|t| t.elapsed()),
            last_receive: self.last_receive.lock().map(|t| t.elapsed()),
        }
    }

    /// Reset statistics
    pub fn reset(&self) {
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.payloads_received.store(0, Ordering::Relaxed);
        self.connect_attempts.store(0, Ordering::SeqCst);
        *self.last_send.lock() = None;
        *self.last_receive.lock() = None;
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection statistics
#[derive(Clone, Debug)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub duration: Option<Duration>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub payloads_received: u64,
    pub connect_attempts: u32,
    /// Time since the last successful send
    pub last_send: Option<Duration>,
    /// Time since the last read returned data
    pub last_receive: Option<Duration>,
}
