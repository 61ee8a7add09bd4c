//! Testing utilities for sessions and transport implementations.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use crate::endpoint::Endpoint;
use crate::events::ClientEvent;
use crate::traits::{StreamEnd, Transport, TransportKind};

const PEER_BUFFER: usize = 64 * 1024;

/// In-memory transport for testing.
///
/// Each successful connect creates a `tokio::io::duplex` pair; the session
/// gets one end and the other is queued for the test via
/// [`MockTransport::accept`]. Clones share state, so a test can keep a
/// handle after moving the transport into a session.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
}

struct MockState {
    remaining_failures: AtomicU32,
    always_fail: AtomicBool,
    failure_rate: Mutex<f64>,
    latency: Mutex<Duration>,
    stream_end: Mutex<StreamEnd>,
    connects: AtomicU32,
    endpoints_seen: Mutex<Vec<Endpoint>>,
    peers_tx: mpsc::UnboundedSender<DuplexStream>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
}

impl MockTransport {
    /// Create a mock transport that always connects
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(MockState {
                remaining_failures: AtomicU32::new(0),
                always_fail: AtomicBool::new(false),
                failure_rate: Mutex::new(0.0),
                latency: Mutex::new(Duration::ZERO),
                stream_end: Mutex::new(StreamEnd::Closed),
                connects: AtomicU32::new(0),
                endpoints_seen: Mutex::new(Vec::new()),
                peers_tx,
                peers_rx: tokio::sync::Mutex::new(peers_rx),
            }),
        }
    }

    /// Refuse the next `count` connects
    pub fn failing_first(self, count: u32) -> Self {
        self.state.remaining_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Refuse every connect
    pub fn always_failing(self) -> Self {
        self.state.always_fail.store(true, Ordering::SeqCst);
        self
    }

    /// Configure random connect failures (0.0 - 1.0)
    pub fn with_failure_rate(self, rate: f64) -> Self {
        *self.state.failure_rate.lock() = rate.clamp(0.0, 1.0);
        self
    }

    /// Configure simulated connect latency
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.state.latency.lock() = latency;
        self
    }

    /// Policy reported when the session reads end of stream
    pub fn with_stream_end(self, end: StreamEnd) -> Self {
        *self.state.stream_end.lock() = end;
        self
    }

    /// Start or stop refusing connects
    pub fn set_always_failing(&self, fail: bool) {
        self.state.always_fail.store(fail, Ordering::SeqCst);
    }

    /// Number of connect calls so far
    pub fn connect_calls(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Endpoints passed to connect, in call order
    pub fn endpoints_seen(&self) -> Vec<Endpoint> {
        self.state.endpoints_seen.lock().clone()
    }

    /// Wait for the peer end of the next successful connect.
    pub async fn accept(&self) -> Option<DuplexStream> {
        self.state.peers_rx.lock().await.recv().await
    }

    fn should_fail(&self) -> bool {
        if self.state.always_fail.load(Ordering::SeqCst) {
            return true;
        }
        let consumed = self
            .state
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return true;
        }
        let rate = *self.state.failure_rate.lock();
        rate > 0.0 && rand::thread_rng().gen::<f64>() < rate
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Reader = ReadHalf<DuplexStream>;
    type Writer = WriteHalf<DuplexStream>;

    fn kind(&self) -> TransportKind {
        TransportKind::Mock
    }

    async fn connect(&self, endpoint: &Endpoint, _interface: Option<&str>) -> io::Result<(Self::Reader, Self::Writer)> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.state.endpoints_seen.lock().push(endpoint.clone());

        let latency = *self.state.latency.lock();
        if !latency.is_zero() {
            sleep(latency).await;
        }

        if self.should_fail() {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "mock connect refused"));
        }

        let (local, peer) = tokio::io::duplex(PEER_BUFFER);
        self.state
            .peers_tx
            .send(peer)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "mock peer queue closed"))?;
        Ok(tokio::io::split(local))
    }

    async fn end_of_stream(&self, _reader: &mut Self::Reader) -> io::Result<StreamEnd> {
        Ok(*self.state.stream_end.lock())
    }
}

/// Collects session notifications for deterministic assertions.
pub struct EventRecorder {
    rx: mpsc::UnboundedReceiver<ClientEvent>,
    events: Vec<ClientEvent>,
}

impl EventRecorder {
    pub fn new(rx: mpsc::UnboundedReceiver<ClientEvent>) -> Self {
        Self { rx, events: Vec::new() }
    }

    /// Next event, or `None` if nothing arrives within `wait`.
    pub async fn next(&mut self, wait: Duration) -> Option<ClientEvent> {
        let event = timeout(wait, self.rx.recv()).await.ok().flatten()?;
        self.events.push(event.clone());
        Some(event)
    }

    /// Record events until one satisfies `pred`, returning it.
    pub async fn wait_for<F>(&mut self, wait: Duration, pred: F) -> Option<ClientEvent>
    where
        F: Fn(&ClientEvent) -> bool,
    {
        loop {
            let event = self.next(wait).await?;
            if pred(&event) {
                return Some(event);
            }
        }
    }

    /// Move everything already queued into the record.
    pub fn drain(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.events.push(event);
        }
    }

    pub fn events(&self) -> &[ClientEvent] {
        &self.events
    }

    /// Number of recorded events matching `pred`.
    pub fn count<F>(&self, pred: F) -> usize
    where
        F: Fn(&ClientEvent) -> bool,
    {
        self.events.iter().filter(|e| pred(e)).count()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::AddressFamily;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_mock_transport() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let transport = MockTransport::new().failing_first(1);
            let endpoint = Endpoint::new("mock", 1, AddressFamily::IPv4);

            assert!(transport.connect(&endpoint, None).await.is_err());
            let (_reader, mut writer) = transport.connect(&endpoint, None).await.unwrap();
            assert_eq!(transport.connect_calls(), 2);

            writer.write_all(b"hello").await.unwrap();
            let mut peer = transport.accept().await.unwrap();
            let mut buf = [0u8; 5];
            peer.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
        });
    }

    #[test]
    fn test_event_recorder() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut recorder = EventRecorder::new(rx);
            tx.send(ClientEvent::ConnectionAttempt).unwrap();
            tx.send(ClientEvent::ConnectionEstablished).unwrap();

            let found = recorder
                .wait_for(Duration::from_secs(1), |e| matches!(e, ClientEvent::ConnectionEstablished))
                .await;
            assert!(found.is_some());
            assert_eq!(recorder.events().len(), 2);
            assert!(recorder.next(Duration::from_millis(10)).await.is_none());
        });
    }
}
