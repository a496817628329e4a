//! The realtime connection service.
//!
//! One [`RealtimeService`] is built at the application root. Its
//! [`connect`](RealtimeService::connect) is idempotent: the first call
//! spawns the connection task and every later call returns the same
//! [`ConnectionHandle`]. The task opens an event stream through a
//! [`Connector`], trying transports in order, reconnects with a fixed delay
//! after a drop, and dispatches decoded [`DomainEvent`]s to the handlers
//! registered on the handle.

use ship_core::{DomainEvent, EventDecodeError, EventKind};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ShipConfig;
use crate::socketio::{Connector, EventStream, SocketIoConnector, TransportError, TransportKind, WireEvent};

/// Error returned by an event handler.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct HandlerError {
    pub reason: String,
}

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<ship_cache::CacheError> for HandlerError {
    fn from(err: ship_cache::CacheError) -> Self {
        Self::new(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("connect() requires a running tokio runtime")]
    NoRuntime,
    #[error("Realtime service lock poisoned")]
    LockPoisoned,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

pub type EventHandler = Arc<dyn Fn(&DomainEvent) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected(TransportKind),
    Reconnecting { attempt: u32 },
    Disconnected,
    /// Reconnect attempts exhausted.
    Failed,
}

#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    pub transports: Vec<TransportKind>,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl RealtimeSettings {
    pub fn from_config(config: &ShipConfig) -> Self {
        Self {
            transports: config.transports.order.clone(),
            reconnect_attempts: config.reconnect.attempts,
            reconnect_delay: config.reconnect.delay(),
        }
    }
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            transports: vec![TransportKind::Websocket, TransportKind::Polling],
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    events_received: AtomicU64,
    decode_failures: AtomicU64,
    handler_failures: AtomicU64,
    connections_opened: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RealtimeStats {
    pub events_received: u64,
    pub decode_failures: u64,
    pub handler_failures: u64,
    pub connections_opened: u64,
}

struct HandleInner {
    url: String,
    handlers: RwLock<HashMap<EventKind, Vec<(HandlerId, EventHandler)>>>,
    next_handler: AtomicU64,
    domain_registered: AtomicBool,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

/// Shared handle to the single event-stream connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionHandle {
    fn new(url: &str) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(HandleInner {
                url: url.to_string(),
                handlers: RwLock::new(HashMap::new()),
                next_handler: AtomicU64::new(1),
                domain_registered: AtomicBool::new(false),
                state,
                shutdown,
                task: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    /// A handle with no connection task; events arrive only through
    /// [`dispatch`](Self::dispatch).
    pub fn detached(url: &str) -> Self {
        let handle = Self::new(url);
        handle.set_state(ConnectionState::Disconnected);
        handle
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// True if both values refer to the same connection.
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectionState::Connected(_))
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state.send_replace(state);
    }

    /// Register `handler` for events of `kind`. Handlers run in
    /// registration order.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Result<HandlerId, RealtimeError>
    where
        F: Fn(&DomainEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self
            .inner
            .handlers
            .write()
            .map_err(|_| RealtimeError::LockPoisoned)?;
        handlers.entry(kind).or_default().push((id, Arc::new(handler)));
        Ok(id)
    }

    /// Remove one handler. Returns false if it was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let Ok(mut handlers) = self.inner.handlers.write() else {
            return false;
        };
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(existing, _)| *existing != id);
            removed |= list.len() != before;
        }
        removed
    }

    pub fn clear_handlers(&self) {
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.clear();
        }
        self.inner.domain_registered.store(false, Ordering::SeqCst);
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.inner
            .handlers
            .read()
            .map(|h| h.get(&kind).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Claim the one-time domain handler registration.
    ///
    /// Returns true for the first caller only.
    pub(crate) fn claim_domain_registration(&self) -> bool {
        !self.inner.domain_registered.swap(true, Ordering::SeqCst)
    }

    /// Run every handler for `event`, isolating failures and panics.
    ///
    /// Returns the number of handlers that completed without error.
    pub fn dispatch(&self, event: &DomainEvent) -> usize {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = match self.inner.handlers.read() {
            Ok(map) => map
                .get(&kind)
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default(),
            Err(_) => {
                warn!(event = %kind, "Handler registry poisoned; dropping event");
                return 0;
            }
        };

        let mut succeeded = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(err)) => {
                    self.inner.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(event = %kind, error = %err, "Event handler failed");
                }
                Err(_) => {
                    self.inner.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(event = %kind, "Event handler panicked");
                }
            }
        }
        succeeded
    }

    /// Decode a wire event and dispatch it.
    pub fn dispatch_wire(&self, wire: &WireEvent) -> Result<usize, EventDecodeError> {
        self.inner.counters.events_received.fetch_add(1, Ordering::Relaxed);
        match DomainEvent::decode(&wire.name, &wire.payload) {
            Ok(event) => {
                debug!(event = %wire.name, "Dispatching domain event");
                Ok(self.dispatch(&event))
            }
            Err(err) => {
                self.inner.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                match &err {
                    EventDecodeError::UnknownEvent { name } => {
                        debug!(event = %name, "Ignoring unknown event")
                    }
                    EventDecodeError::MalformedPayload { .. } => {
                        warn!(event = %wire.name, error = %err, "Dropping malformed event")
                    }
                }
                Err(err)
            }
        }
    }

    pub fn stats(&self) -> RealtimeStats {
        let c = &self.inner.counters;
        RealtimeStats {
            events_received: c.events_received.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            connections_opened: c.connections_opened.load(Ordering::Relaxed),
        }
    }

    /// Signal the connection task to close and wait for it.
    async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let task = self.inner.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "Connection task ended abnormally");
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Owns the process's single event-stream connection.
pub struct RealtimeService {
    connector: Arc<dyn Connector>,
    settings: RealtimeSettings,
    handle: Mutex<Option<ConnectionHandle>>,
}

impl RealtimeService {
    pub fn new(connector: Arc<dyn Connector>, settings: RealtimeSettings) -> Self {
        Self {
            connector,
            settings,
            handle: Mutex::new(None),
        }
    }

    /// Service using the network Socket.IO connector.
    pub fn from_config(config: &ShipConfig) -> Result<Self, RealtimeError> {
        let connector = SocketIoConnector::new(config.request_timeout())?;
        Ok(Self::new(Arc::new(connector), RealtimeSettings::from_config(config)))
    }

    pub fn settings(&self) -> &RealtimeSettings {
        &self.settings
    }

    /// Return the connection handle, opening the connection on first use.
    pub fn connect(&self, base_url: &str) -> Result<ConnectionHandle, RealtimeError> {
        let mut slot = self.handle.lock().map_err(|_| RealtimeError::LockPoisoned)?;
        if let Some(existing) = slot.as_ref() {
            if existing.url() != base_url {
                warn!(
                    requested = base_url,
                    active = existing.url(),
                    "Already connected; reusing existing connection"
                );
            }
            return Ok(existing.clone());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| RealtimeError::NoRuntime)?;
        let handle = ConnectionHandle::new(base_url);
        let task = runtime.spawn(run_connection(
            handle.clone(),
            Arc::clone(&self.connector),
            self.settings.clone(),
        ));
        if let Ok(mut t) = handle.inner.task.lock() {
            *t = Some(task);
        }
        info!(url = base_url, "Realtime connection started");
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// The current handle, if connected.
    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.handle.lock().ok().and_then(|h| h.clone())
    }

    /// Remove all handlers, close the connection and forget the handle.
    pub async fn teardown(&self) {
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        let Some(handle) = handle else {
            return;
        };
        handle.clear_handlers();
        handle.shutdown().await;
        info!(url = handle.url(), "Realtime connection torn down");
    }
}

enum StreamEnd {
    Shutdown,
    Closed,
    Failed(TransportError),
}

async fn open_first(
    connector: &dyn Connector,
    url: &str,
    transports: &[TransportKind],
) -> Result<Box<dyn EventStream>, TransportError> {
    let mut last_error = TransportError::Protocol("no transports configured".to_string());
    for &transport in transports {
        match connector.open(url, transport).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!(transport = %transport, error = %err, "Transport unavailable; trying next");
                last_error = err;
            }
        }
    }
    Err(last_error)
}

async fn pump(
    handle: &ConnectionHandle,
    stream: &mut dyn EventStream,
    shutdown: &mut watch::Receiver<bool>,
) -> StreamEnd {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return StreamEnd::Shutdown;
                }
            }
            next = stream.next_event() => match next {
                Ok(Some(wire)) => {
                    let _ = handle.dispatch_wire(&wire);
                }
                Ok(None) => return StreamEnd::Closed,
                Err(err) => return StreamEnd::Failed(err),
            }
        }
    }
}

async fn run_connection(
    handle: ConnectionHandle,
    connector: Arc<dyn Connector>,
    settings: RealtimeSettings,
) {
    let mut shutdown = handle.inner.shutdown.subscribe();
    let mut failures: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        handle.set_state(if failures == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting { attempt: failures }
        });

        let opened = tokio::select! {
            _ = shutdown.changed() => break,
            opened = open_first(connector.as_ref(), handle.url(), &settings.transports) => opened,
        };

        match opened {
            Ok(mut stream) => {
                failures = 0;
                let transport = stream.transport();
                handle.inner.counters.connections_opened.fetch_add(1, Ordering::Relaxed);
                handle.set_state(ConnectionState::Connected(transport));
                info!(url = handle.url(), transport = %transport, "Event stream connected");

                match pump(&handle, stream.as_mut(), &mut shutdown).await {
                    StreamEnd::Shutdown => {
                        if let Err(err) = stream.close().await {
                            debug!(error = %err, "Error closing event stream");
                        }
                        break;
                    }
                    StreamEnd::Closed => info!(url = handle.url(), "Event stream closed by server"),
                    StreamEnd::Failed(err) => {
                        warn!(url = handle.url(), error = %err, "Event stream disconnected")
                    }
                }
                handle.set_state(ConnectionState::Disconnected);
            }
            Err(err) => {
                failures += 1;
                warn!(url = handle.url(), attempt = failures, error = %err, "Event stream connection failed");
                if failures >= settings.reconnect_attempts {
                    error!(
                        url = handle.url(),
                        attempts = failures,
                        "Giving up on event stream after repeated failures"
                    );
                    handle.set_state(ConnectionState::Failed);
                    return;
                }
            }
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(settings.reconnect_delay) => {}
        }
    }

    handle.set_state(ConnectionState::Disconnected);
}
