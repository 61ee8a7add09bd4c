//! Connection session: connect-with-retry, the read loop and the send path.
//!
//! One background task per connection attempt first retries the transport's
//! connect primitive and, once connected, turns into the read loop. Sends
//! run on the caller's task and are serialized by the writer lock, which is
//! the session's single send permit.
//!
//! Every attempt carries a generation number. Teardown for a generation
//! that is no longer current is a no-op, so a read loop that outlives a
//! `disconnect()` timeout cannot clobber a newer connection. A send in
//! flight watches its generation's cancel signal and gives the writer back
//! as soon as teardown starts.

use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::buffer::TransportBuffer;
use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionState, ConnectionStats};
use crate::endpoint::{self, Endpoint, EndpointList};
use crate::errors::{ConfigError, ErrorSource, LinkError, SharedError, SourcedError};
use crate::events::{ClientEvent, EventHub, ReceiveHandler};
use crate::framing::{FrameCodec, LengthProbe};
use crate::traits::{StreamEnd, Transport};

/// Tunables for a session, usually derived from [`ClientConfig`].
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// `None` passes bytes through without framing
    pub framing: Option<FrameCodec>,
    pub receive_buffer_size: usize,
    /// `None` retries forever
    pub max_connection_attempts: Option<u32>,
    pub retry_interval: Duration,
    pub disconnect_timeout: Duration,
}

impl SessionOptions {
    pub fn from_config(config: &ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            framing: if config.payload_aware { Some(config.codec()?) } else { None },
            receive_buffer_size: config.receive_buffer_size,
            max_connection_attempts: config.max_connection_attempts,
            retry_interval: config.retry_interval(),
            disconnect_timeout: config.disconnect_timeout(),
        })
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        let config = ClientConfig::default();
        Self {
            framing: None,
            receive_buffer_size: config.receive_buffer_size,
            max_connection_attempts: None,
            retry_interval: config.retry_interval(),
            disconnect_timeout: config.disconnect_timeout(),
        }
    }
}

/// Progress of one connection attempt.
#[derive(Clone, Debug)]
pub enum ConnectStatus {
    Pending,
    Established,
    /// Attempts exhausted; carries the last connect error
    Failed(SharedError),
    /// Cancelled by `disconnect()` or drop before connecting
    Aborted,
}

/// Completion signal for a `connect()` call.
///
/// Calls made while an attempt is in flight (or connected) get a handle for
/// the same attempt.
#[derive(Clone, Debug)]
pub struct ConnectHandle {
    attempt: u64,
    status: watch::Receiver<ConnectStatus>,
}

impl ConnectHandle {
    /// Identifies the connection attempt this handle tracks.
    pub fn attempt_id(&self) -> u64 {
        self.attempt
    }

    pub fn status(&self) -> ConnectStatus {
        self.status.borrow().clone()
    }

    /// Wait until the attempt connects, fails or is aborted.
    pub async fn wait(&mut self) -> Result<(), SharedError> {
        loop {
            match self.status.borrow_and_update().clone() {
                ConnectStatus::Pending => {}
                ConnectStatus::Established => return Ok(()),
                ConnectStatus::Failed(err) => return Err(err),
                ConnectStatus::Aborted => return Err(Arc::new(LinkError::Closed)),
            }
            if self.status.changed().await.is_err() {
                // Sender dropped while still pending: the attempt went away.
                return match self.status.borrow().clone() {
                    ConnectStatus::Established => Ok(()),
                    ConnectStatus::Failed(err) => Err(err),
                    _ => Err(Arc::new(LinkError::Closed)),
                };
            }
        }
    }
}

struct ActiveLink {
    generation: u64,
    cancel: watch::Sender<bool>,
    status: watch::Sender<ConnectStatus>,
    /// Set once teardown has released the transport
    stopped: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ActiveLink {
    fn handle(&self) -> ConnectHandle {
        ConnectHandle {
            attempt: self.generation,
            status: self.status.subscribe(),
        }
    }
}

/// Write half of the current connection.
struct LinkWriter<W> {
    generation: u64,
    writer: W,
    cancel: watch::Receiver<bool>,
}

#[derive(Default)]
struct Lifecycle {
    generation: u64,
    active: Option<ActiveLink>,
}

struct Shared<T: Transport> {
    transport: T,
    options: SessionOptions,
    interface: Option<String>,
    endpoints: Mutex<EndpointList>,
    manager: ConnectionManager,
    events: EventHub,
    lifecycle: Mutex<Lifecycle>,
    writer: tokio::sync::Mutex<Option<LinkWriter<T::Writer>>>,
}

/// The connection state machine for one client.
pub struct ConnectionSession<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> ConnectionSession<T> {
    pub fn new(transport: T, endpoints: EndpointList, interface: Option<String>, options: SessionOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                options,
                interface,
                endpoints: Mutex::new(endpoints),
                manager: ConnectionManager::new(),
                events: EventHub::new(),
                lifecycle: Mutex::new(Lifecycle::default()),
                writer: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.manager.state()
    }

    pub fn statistics(&self) -> ConnectionStats {
        self.shared.manager.stats()
    }

    /// Failed attempts in the current connect cycle.
    pub fn connection_attempts(&self) -> u32 {
        self.shared.manager.connect_attempts()
    }

    pub fn endpoints(&self) -> EndpointList {
        self.shared.endpoints.lock().clone()
    }

    /// Rotate to the next endpoint for the next `connect()`.
    pub fn request_next_endpoint(&self) -> bool {
        let mut endpoints = self.shared.endpoints.lock();
        let changed = endpoint::advance(&mut endpoints);
        if changed {
            debug!(endpoint = %endpoints.current(), "moved to next endpoint");
        }
        changed
    }

    /// Take the notification receiver. Returns `None` after the first call.
    pub fn events(&self) -> Option<tokio::sync::mpsc::UnboundedReceiver<ClientEvent>> {
        self.shared.events.subscribe()
    }

    pub fn set_receive_handler(&self, handler: Option<Arc<dyn ReceiveHandler>>) {
        self.shared.events.set_handler(handler);
    }

    /// Start connecting, or return the handle of the attempt already under way.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) -> ConnectHandle {
        let shared = &self.shared;
        let mut lifecycle = shared.lifecycle.lock();

        if let Some(active) = &lifecycle.active {
            return active.handle();
        }

        lifecycle.generation += 1;
        let generation = lifecycle.generation;
        let endpoint = shared.endpoints.lock().current().clone();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (status_tx, _) = watch::channel(ConnectStatus::Pending);
        let (stopped_tx, _) = watch::channel(false);

        shared.manager.reset_attempts();
        shared.manager.transition(ConnectionState::Connecting);
        info!(endpoint = %endpoint, attempt = generation, "connecting");

        let task = tokio::spawn(run(Arc::clone(shared), generation, endpoint, cancel_rx));
        let link = ActiveLink {
            generation,
            cancel: cancel_tx,
            status: status_tx,
            stopped: stopped_tx,
            task: Some(task),
        };
        let handle = link.handle();
        lifecycle.active = Some(link);
        handle
    }

    /// Stop the current attempt or connection and wait for the read loop.
    ///
    /// Waits at most the configured disconnect timeout; overrunning it is
    /// reported as a [`LinkError::CancellationTimeout`] receive error and
    /// the session is marked disconnected regardless. Concurrent callers
    /// all wait for the same teardown.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        let (generation, task, mut stopped) = {
            let mut lifecycle = shared.lifecycle.lock();
            let Some(active) = lifecycle.active.as_mut() else {
                return;
            };
            active.cancel.send_replace(true);
            (active.generation, active.task.take(), active.stopped.subscribe())
        };

        let timeout = shared.options.disconnect_timeout;
        let Some(task) = task else {
            // Another caller is joining the task and owns the timeout report.
            let finished = async { stopped.wait_for(|done| *done).await.map(|_| ()) };
            let _ = tokio::time::timeout(timeout, finished).await;
            return;
        };

        if tokio::time::timeout(timeout, task).await.is_err() {
            warn!(?timeout, "read loop did not stop in time");
            shared.events.emit(ClientEvent::ReceiveError(SourcedError::new(
                ErrorSource::ReadLoop,
                LinkError::CancellationTimeout(timeout),
            )));
            shared.teardown(generation, ConnectStatus::Aborted).await;
        }
    }

    /// Frame (if enabled) and write `payload`.
    ///
    /// Only one send is in flight per session; concurrent callers queue on
    /// the send permit. Failures are reported, never retried.
    pub async fn send(&self, payload: &[u8]) -> Result<usize, SharedError> {
        let shared = &self.shared;
        shared.events.emit(ClientEvent::SendStarted);

        match shared.write_frame(payload).await {
            Ok(bytes) => {
                shared.events.emit(ClientEvent::SendComplete { bytes });
                Ok(bytes)
            }
            Err(err) => {
                let err = SourcedError::new(ErrorSource::SendPath, err);
                debug!(error = %err.error, "send failed");
                shared.events.emit(ClientEvent::SendError(err.clone()));
                Err(err.error)
            }
        }
    }

    /// Send `length` bytes of `data` starting at `offset`.
    pub async fn send_slice(&self, data: &[u8], offset: usize, length: usize) -> Result<usize, SharedError> {
        match offset.checked_add(length) {
            Some(end) if end <= data.len() => self.send(&data[offset..end]).await,
            _ => {
                let err = SourcedError::new(
                    ErrorSource::SendPath,
                    LinkError::InvalidRange {
                        offset,
                        length,
                        available: data.len(),
                    },
                );
                self.shared.events.emit(ClientEvent::SendError(err.clone()));
                Err(err.error)
            }
        }
    }
}

impl<T: Transport> Drop for ConnectionSession<T> {
    fn drop(&mut self) {
        if let Some(active) = &self.shared.lifecycle.lock().active {
            let _ = active.cancel.send(true);
        }
    }
}

impl<T: Transport> Shared<T> {
    fn is_current(&self, generation: u64) -> bool {
        matches!(&self.lifecycle.lock().active, Some(active) if active.generation == generation)
    }

    fn emit_error(&self, source: ErrorSource, error: LinkError) -> SourcedError {
        let err = SourcedError::new(source, error);
        let event = match source {
            ErrorSource::ConnectLoop => ClientEvent::ConnectionError(err.clone()),
            ErrorSource::ReadLoop => ClientEvent::ReceiveError(err.clone()),
            ErrorSource::SendPath => ClientEvent::SendError(err.clone()),
        };
        self.events.emit(event);
        err
    }

    fn deliver(&self, payload: &[u8]) {
        self.manager.record_payload();
        self.events.deliver(payload);
    }

    /// Ask the task owning `generation` to stop.
    fn cancel(&self, generation: u64) {
        if let Some(active) = &self.lifecycle.lock().active {
            if active.generation == generation {
                let _ = active.cancel.send(true);
            }
        }
    }

    /// Install the writer and move to Connected, unless the attempt was
    /// superseded or cancelled meanwhile.
    async fn establish(&self, generation: u64, writer: T::Writer) -> bool {
        let mut slot = self.writer.lock().await;
        let lifecycle = self.lifecycle.lock();
        let active = match &lifecycle.active {
            Some(active) if active.generation == generation && !*active.cancel.borrow() => active,
            _ => return false,
        };

        self.manager.reset();
        self.manager.transition(ConnectionState::Connected);
        *slot = Some(LinkWriter {
            generation,
            writer,
            cancel: active.cancel.subscribe(),
        });
        self.events.emit(ClientEvent::ConnectionEstablished);
        active.status.send_replace(ConnectStatus::Established);
        true
    }

    /// Shut down and drop the writer held in `slot`.
    async fn release_writer(slot: &mut Option<LinkWriter<T::Writer>>) {
        if let Some(mut link) = slot.take() {
            let _ = link.writer.shutdown().await;
        }
    }

    /// Move to Disconnected if `generation` is still current.
    ///
    /// `outcome` resolves connect handles that are still pending.
    async fn teardown(&self, generation: u64, outcome: ConnectStatus) {
        let (link, previous) = {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.active.take() {
                Some(active) if active.generation == generation => {
                    if matches!(*active.status.borrow(), ConnectStatus::Pending) {
                        active.status.send_replace(outcome);
                    }
                    let previous = self.manager.transition(ConnectionState::Disconnected);
                    (active, previous)
                }
                other => {
                    lifecycle.active = other;
                    return;
                }
            }
        };

        // An in-flight send sees the cancel and hands the lock back.
        link.cancel.send_replace(true);
        {
            let mut slot = self.writer.lock().await;
            if matches!(slot.as_ref(), Some(current) if current.generation == generation) {
                Self::release_writer(&mut slot).await;
            }
        }

        if previous == ConnectionState::Connected {
            info!(attempt = generation, "connection terminated");
            self.events.emit(ClientEvent::ConnectionTerminated);
        }
        link.stopped.send_replace(true);
    }

    async fn write_frame(&self, payload: &[u8]) -> Result<usize, LinkError> {
        let framed;
        let bytes: &[u8] = match &self.options.framing {
            Some(codec) => {
                framed = codec.encode(payload)?;
                &framed
            }
            None => payload,
        };

        let mut slot = self.writer.lock().await;
        let Some(link) = slot.as_mut() else {
            return Err(LinkError::NotConnected);
        };
        let generation = link.generation;

        if !self.is_current(generation) || self.manager.state() != ConnectionState::Connected {
            Self::release_writer(&mut slot).await;
            return Err(LinkError::NotConnected);
        }

        let mut cancel = link.cancel.clone();
        let writer = &mut link.writer;
        let written: Option<io::Result<()>> = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => None,
            result = async {
                writer.write_all(bytes).await?;
                writer.flush().await
            } => Some(result),
        };

        match written {
            None => {
                debug!(attempt = generation, "send interrupted by disconnect");
                Self::release_writer(&mut slot).await;
                Err(LinkError::Closed)
            }
            Some(Ok(())) => {
                self.manager.record_sent(bytes.len() as u64);
                Ok(bytes.len())
            }
            Some(Err(err)) => {
                warn!(error = %err, "write failed, dropping connection");
                slot.take();
                drop(slot);
                self.cancel(generation);
                Err(LinkError::Transport(err))
            }
        }
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Body of the per-attempt task: connect with retry, then read.
async fn run<T: Transport>(
    shared: Arc<Shared<T>>,
    generation: u64,
    endpoint: Endpoint,
    mut cancel: watch::Receiver<bool>,
) {
    let reader = match connect_with_retry(&shared, generation, &endpoint, &mut cancel).await {
        Ok(reader) => reader,
        Err(outcome) => {
            shared.teardown(generation, outcome).await;
            return;
        }
    };

    read_loop(&shared, generation, reader, &mut cancel).await;
    shared.teardown(generation, ConnectStatus::Aborted).await;
}

async fn connect_with_retry<T: Transport>(
    shared: &Shared<T>,
    generation: u64,
    endpoint: &Endpoint,
    cancel: &mut watch::Receiver<bool>,
) -> Result<T::Reader, ConnectStatus> {
    loop {
        if *cancel.borrow() {
            return Err(ConnectStatus::Aborted);
        }
        shared.events.emit(ClientEvent::ConnectionAttempt);

        let result = tokio::select! {
            biased;
            _ = cancelled(cancel) => return Err(ConnectStatus::Aborted),
            result = shared.transport.connect(endpoint, shared.interface.as_deref()) => result,
        };

        match result {
            Ok((reader, writer)) => {
                if !shared.establish(generation, writer).await {
                    return Err(ConnectStatus::Aborted);
                }
                info!(endpoint = %endpoint, "connection established");
                return Ok(reader);
            }
            Err(source) => {
                let attempts = shared.manager.record_attempt();
                warn!(endpoint = %endpoint, attempt = attempts, error = %source, "connection attempt failed");
                let err = shared.emit_error(
                    ErrorSource::ConnectLoop,
                    LinkError::Connect {
                        endpoint: endpoint.to_string(),
                        source,
                    },
                );

                if let Some(max) = shared.options.max_connection_attempts {
                    if attempts >= max {
                        warn!(endpoint = %endpoint, attempts, "giving up");
                        return Err(ConnectStatus::Failed(err.error));
                    }
                }

                tokio::select! {
                    biased;
                    _ = cancelled(cancel) => return Err(ConnectStatus::Aborted),
                    _ = tokio::time::sleep(shared.options.retry_interval) => {}
                }
            }
        }
    }
}

async fn read_loop<T: Transport>(
    shared: &Shared<T>,
    generation: u64,
    mut reader: T::Reader,
    cancel: &mut watch::Receiver<bool>,
) {
    let codec = shared.options.framing.as_ref();
    let header_len = codec.map(FrameCodec::header_len);
    let mut buffer = TransportBuffer::new(shared.options.receive_buffer_size);
    let mut idle = false;

    loop {
        if *cancel.borrow() {
            return;
        }

        let read = {
            let window = buffer.read_window(header_len);
            tokio::select! {
                biased;
                _ = cancelled(cancel) => return,
                result = reader.read(window) => result,
            }
        };

        let n = match read {
            Ok(0) => {
                let end = shared.transport.end_of_stream(&mut reader).await;
                match end {
                    Ok(StreamEnd::Closed) => {
                        debug!(attempt = generation, "end of stream");
                        shared.events.emit(ClientEvent::EndOfStream);
                        return;
                    }
                    Ok(StreamEnd::Rewound) => {
                        shared.events.emit(ClientEvent::EndOfStream);
                        continue;
                    }
                    Ok(StreamEnd::Idle(wait)) => {
                        if !idle {
                            idle = true;
                            shared.events.emit(ClientEvent::EndOfStream);
                        }
                        tokio::select! {
                            biased;
                            _ = cancelled(cancel) => return,
                            _ = tokio::time::sleep(wait) => continue,
                        }
                    }
                    Err(err) => {
                        shared.emit_error(ErrorSource::ReadLoop, LinkError::Transport(err));
                        return;
                    }
                }
            }
            Ok(n) => n,
            Err(err) => {
                if !*cancel.borrow() {
                    warn!(error = %err, "read failed, dropping connection");
                    shared.emit_error(ErrorSource::ReadLoop, LinkError::Transport(err));
                }
                return;
            }
        };

        idle = false;
        shared.manager.record_received(n as u64);
        buffer.advance(n);

        let Some(codec) = codec else {
            shared.deliver(buffer.filled());
            buffer.reset();
            continue;
        };

        if buffer.payload_length().is_none() {
            match codec.probe(buffer.filled(), buffer.write_offset()) {
                LengthProbe::NeedMore => continue,
                LengthProbe::Desynchronized => {
                    // No scan for the next marker: the next header-sized
                    // window is read from wherever the stream is.
                    warn!(marker = ?codec.marker(), "frame header does not match marker");
                    shared.emit_error(
                        ErrorSource::ReadLoop,
                        LinkError::FramingDesync {
                            expected: codec.marker().to_vec(),
                        },
                    );
                    buffer.reset();
                    continue;
                }
                LengthProbe::Length(length) => {
                    let length = length as usize;
                    if length > codec.max_payload_size() {
                        warn!(length, max = codec.max_payload_size(), "frame length over limit");
                        shared.emit_error(
                            ErrorSource::ReadLoop,
                            LinkError::FrameTooLarge(length, codec.max_payload_size()),
                        );
                        buffer.reset();
                        continue;
                    }
                    buffer.begin_payload(length);
                }
            }
        }

        if let Some(payload) = buffer.payload() {
            shared.deliver(payload);
            buffer.reset();
        }
    }
}
