//! RPC connection to the engine
//!
//! `Connection` owns the transport, allocates request ids, keeps the table of
//! pending calls and runs the read loop that routes every inbound message to
//! either a pending callback or the client delegate.
//!
//! Id allocation, pending-table changes, state checks and transport writes
//! all happen under one mutex. Callbacks and delegate handlers always run
//! after that mutex is released, so a callback may issue new requests.

use super::delegate::{dispatch_notification, ClientDelegate};
use super::framer::LineFramer;
use super::message::{self, IncomingMessage};
use super::notification::EngineRequest;
use super::transport::{Transport, TransportReader};
use super::RequestId;
use crate::config::{ConnectionOptions, EngineConfig};
use crate::error::{
    CallError, CloseReason, Error, ProtocolError, RemoteError, Result, TransportError,
};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, trace, warn};

/// Bytes requested from the engine's stdout per read
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// What a request callback receives
pub type CallResult = std::result::Result<Value, CallError>;

/// Stored completion for an outstanding request
pub type RequestCallback = Box<dyn FnOnce(CallResult) + Send + 'static>;

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport is up, read loop not yet running. Sends are queued.
    Connecting,
    /// Read loop running
    Ready,
    Closed(CloseReason),
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed(_))
    }

    fn ensure_open(&self) -> Result<()> {
        match self {
            ConnectionState::Closed(_) => Err(Error::NotReady(self.to_string())),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Ready => f.write_str("ready"),
            ConnectionState::Closed(reason) => write!(f, "closed: {}", reason),
        }
    }
}

/// Counters describing what the read loop has seen so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub responses: u64,
    pub notifications: u64,
    pub engine_requests: u64,
    pub framing_errors: u64,
    pub protocol_errors: u64,
    pub pending_calls: usize,
}

#[derive(Default)]
struct Counters {
    responses: AtomicU64,
    notifications: AtomicU64,
    engine_requests: AtomicU64,
    framing_errors: AtomicU64,
    protocol_errors: AtomicU64,
}

/// Everything guarded by the dispatch lock
struct Dispatch {
    state: ConnectionState,
    next_id: RequestId,
    pending: HashMap<RequestId, RequestCallback>,
}

struct Inner {
    dispatch: Mutex<Dispatch>,
    state_tx: watch::Sender<ConnectionState>,
    transport: Transport,
    delegate: Arc<dyn ClientDelegate>,
    options: ConnectionOptions,
    counters: Counters,
}

/// A live JSON-RPC session with one engine process
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Spawn the engine described by `config` and start the read loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: &EngineConfig, delegate: Arc<dyn ClientDelegate>) -> Result<Self> {
        config.validate()?;
        let (transport, reader) = Transport::spawn(config)?;
        Ok(Self::with_transport(
            transport,
            reader,
            delegate,
            config.connection.clone(),
        ))
    }

    /// Start a connection over an already established transport.
    ///
    /// Returns in `Connecting`; the state moves to `Ready` once the read loop
    /// task starts.
    pub fn with_transport(
        transport: Transport,
        reader: TransportReader,
        delegate: Arc<dyn ClientDelegate>,
        options: ConnectionOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let inner = Arc::new(Inner {
            dispatch: Mutex::new(Dispatch {
                state: ConnectionState::Connecting,
                next_id: 0,
                pending: HashMap::new(),
            }),
            state_tx,
            transport,
            delegate,
            options,
            counters: Counters::default(),
        });

        tokio::spawn(Inner::read_loop(Arc::clone(&inner), reader));

        Self { inner }
    }

    /// Send a request; `callback` fires later, exactly once.
    ///
    /// Returns the id assigned to the request. When this returns an error the
    /// request was not sent and the callback is dropped without being called.
    pub fn send_request<F>(&self, method: &str, params: Value, callback: F) -> Result<RequestId>
    where
        F: FnOnce(CallResult) + Send + 'static,
    {
        let mut dispatch = self.inner.dispatch.lock();
        dispatch.state.ensure_open()?;

        let id = dispatch.next_id;
        let line = message::encode_request(id, method, &params)?;
        dispatch.next_id += 1;

        self.inner.transport.write(line)?;
        let previous = dispatch.pending.insert(id, Box::new(callback));
        debug_assert!(previous.is_none(), "request id {} reused", id);

        debug!("Sent request {} method={}", id, method);
        Ok(id)
    }

    /// Send a notification. No id, no reply.
    pub fn send_notification(&self, method: &str, params: Value) -> Result<()> {
        let line = message::encode_notification(method, &params)?;

        let dispatch = self.inner.dispatch.lock();
        dispatch.state.ensure_open()?;
        self.inner.transport.write(line)?;

        debug!("Sent notification method={}", method);
        Ok(())
    }

    /// Send a request and wait for its result
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let (_, rx) = self.start_call(method, params)?;
        finish_call(rx.await)
    }

    /// Like `call`, giving up after `timeout`.
    ///
    /// On timeout the pending entry is removed, so a late response is
    /// treated as an unknown id.
    pub async fn call_timeout(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let (id, rx) = self.start_call(method, params)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(received) => finish_call(received),
            Err(_) => {
                if self.inner.dispatch.lock().pending.remove(&id).is_some() {
                    debug!("Request {} timed out after {:?}", id, timeout);
                }
                Err(Error::Call(CallError::Timeout))
            }
        }
    }

    fn start_call(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(RequestId, oneshot::Receiver<CallResult>)> {
        let (tx, rx) = oneshot::channel();
        let id = self.send_request(method, params, move |result| {
            let _ = tx.send(result);
        })?;
        Ok((id, rx))
    }

    /// Send a request and decode its result into `T`
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(|e| Error::Call(CallError::Decode(e.to_string())))
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Watch lifecycle changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the connection is closed, for at most `timeout`
    pub async fn wait_closed(&self, timeout: Duration) -> Result<CloseReason> {
        let mut rx = self.subscribe_state();

        let closed = tokio::time::timeout(timeout, rx.wait_for(ConnectionState::is_closed)).await;
        // Bound to a local so the borrowed `Ref` is released before `rx`.
        let outcome = match closed {
            Ok(Ok(state)) => match &*state {
                ConnectionState::Closed(reason) => Ok(reason.clone()),
                other => Err(Error::NotReady(other.to_string())),
            },
            Ok(Err(_)) => Err(Error::NotReady("state channel dropped".to_string())),
            Err(_) => Err(Error::Call(CallError::Timeout)),
        };
        outcome
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let counters = &self.inner.counters;
        Diagnostics {
            responses: counters.responses.load(Ordering::Relaxed),
            notifications: counters.notifications.load(Ordering::Relaxed),
            engine_requests: counters.engine_requests.load(Ordering::Relaxed),
            framing_errors: counters.framing_errors.load(Ordering::Relaxed),
            protocol_errors: counters.protocol_errors.load(Ordering::Relaxed),
            pending_calls: self.inner.dispatch.lock().pending.len(),
        }
    }

    /// Close the connection: fail pending calls, then stop the engine.
    pub async fn close(&self) {
        if self.inner.transition_closed(CloseReason::Shutdown) {
            self.inner.delegate.connection_closed(CloseReason::Shutdown).await;
        }
        self.inner
            .transport
            .shutdown(self.inner.options.shutdown_grace)
            .await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // The read loop notices and exits, which releases the transport.
        self.inner.transition_closed(CloseReason::Shutdown);
    }
}

impl Inner {
    /// Publishes under the dispatch lock so `state()` never lags `send_request`.
    fn set_state(&self, state: ConnectionState) {
        let mut dispatch = self.dispatch.lock();
        if dispatch.state.is_closed() {
            return;
        }
        dispatch.state = state.clone();
        self.state_tx.send_replace(state.clone());
        drop(dispatch);

        info!("Connection state: {}", state);
    }

    fn is_closed(&self) -> bool {
        self.dispatch.lock().state.is_closed()
    }

    /// Move to `Closed(reason)` and fail every pending call.
    ///
    /// Returns false if the connection was already closed.
    fn transition_closed(&self, reason: CloseReason) -> bool {
        let pending = {
            let mut dispatch = self.dispatch.lock();
            if dispatch.state.is_closed() {
                return false;
            }
            dispatch.state = ConnectionState::Closed(reason.clone());
            self.state_tx
                .send_replace(ConnectionState::Closed(reason.clone()));
            std::mem::take(&mut dispatch.pending)
        };

        info!(
            "Connection closed ({}), failing {} pending call(s)",
            reason,
            pending.len()
        );

        for (id, callback) in pending {
            invoke_callback(id, callback, Err(CallError::ConnectionClosed(reason.clone())));
        }
        true
    }

    /// Read loop: pull bytes, frame them, dispatch in arrival order
    async fn read_loop(self: Arc<Self>, mut reader: TransportReader) {
        let _guard = CloseGuard(Arc::clone(&self));
        let mut state_rx = self.state_tx.subscribe();
        let mut framer = LineFramer::with_max_line_bytes(self.options.max_line_bytes);
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        self.set_state(ConnectionState::Ready);

        let reason = 'read: loop {
            if self.is_closed() {
                debug!("Read loop stopping, connection closed");
                return;
            }

            let read = tokio::select! {
                biased;
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
                read = reader.read(&mut chunk) => read,
            };

            match read {
                Ok(0) => {
                    if let Some(e) = framer.finish() {
                        self.record_framing_error(&e);
                    }
                    let code = self.transport.exit_code().await;
                    warn!("Engine stdout closed (exit code: {:?})", code);
                    break CloseReason::Transport(TransportError::UnexpectedExit { code });
                }
                Ok(n) => {
                    for frame in framer.push(&chunk[..n]) {
                        // A handler may have closed the connection mid-chunk.
                        if self.is_closed() {
                            debug!("Read loop stopping, connection closed");
                            return;
                        }
                        match frame {
                            Ok(value) => {
                                if let Some(reason) = self.handle_message(value).await {
                                    break 'read reason;
                                }
                            }
                            Err(e) => self.record_framing_error(&e),
                        }
                    }
                }
                Err(e) => {
                    error!("Transport failure: {}", e);
                    break CloseReason::Transport(e);
                }
            }
        };

        if self.transition_closed(reason.clone()) {
            self.delegate.connection_closed(reason).await;
        }
    }

    /// Route one decoded value. Returns a close reason only for fatal protocol errors.
    async fn handle_message(&self, value: Value) -> Option<CloseReason> {
        trace!("Received message: {}", value);

        match message::parse_message(value) {
            Ok(IncomingMessage::Response { id, outcome }) => {
                let callback = self.dispatch.lock().pending.remove(&id);
                match callback {
                    Some(callback) => {
                        self.counters.responses.fetch_add(1, Ordering::Relaxed);
                        debug!("Delivering response for request {}", id);
                        invoke_callback(id, callback, outcome.map_err(CallError::Application));
                        None
                    }
                    None => self.protocol_error(ProtocolError::UnknownRequestId(id)),
                }
            }
            Ok(IncomingMessage::Notification(notification)) => {
                self.counters.notifications.fetch_add(1, Ordering::Relaxed);
                let method = notification.method().to_string();
                debug!("Dispatching notification: {}", method);
                let dispatched = AssertUnwindSafe(dispatch_notification(
                    self.delegate.as_ref(),
                    notification,
                ))
                .catch_unwind()
                .await;
                if dispatched.is_err() {
                    error!("Delegate handler for {} panicked", method);
                }
                None
            }
            Ok(IncomingMessage::Request { id, request }) => {
                self.counters.engine_requests.fetch_add(1, Ordering::Relaxed);
                self.answer_engine_request(id, request).await;
                None
            }
            Err(e) => self.protocol_error(e),
        }
    }

    async fn answer_engine_request(&self, id: RequestId, request: EngineRequest) {
        debug!("Engine request {} method={}", id, request.method());

        let outcome = match request {
            EngineRequest::MeasureWidth(requests) => {
                match AssertUnwindSafe(self.delegate.measure_width(requests))
                    .catch_unwind()
                    .await
                {
                    Ok(widths) => widths.map(|widths| serde_json::json!(widths)),
                    Err(_) => {
                        error!("Delegate handler for measure_width panicked");
                        Err(RemoteError::new(-32603, "measure_width handler panicked"))
                    }
                }
            }
            EngineRequest::Unknown { method, .. } => {
                warn!("Unsupported engine request: {}", method);
                Err(RemoteError::new(
                    -32601,
                    format!("Unsupported method: {}", method),
                ))
            }
        };

        match message::encode_response(id, &outcome) {
            Ok(line) => {
                if let Err(e) = self.transport.write(line) {
                    error!("Failed to answer engine request {}: {}", id, e);
                }
            }
            Err(e) => error!("Failed to encode reply to engine request {}: {}", id, e),
        }
    }

    fn protocol_error(&self, e: ProtocolError) -> Option<CloseReason> {
        self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
        if self.options.strict_protocol {
            error!("Protocol error, closing connection: {}", e);
            Some(CloseReason::Protocol(e))
        } else {
            warn!("Dropping message: {}", e);
            None
        }
    }

    fn record_framing_error(&self, e: &crate::error::FramingError) {
        self.counters.framing_errors.fetch_add(1, Ordering::Relaxed);
        warn!("Dropping engine output: {}", e);
    }
}

/// Fails pending calls if the read loop ends without closing the connection
/// (panic in a handler, task cancelled at runtime shutdown).
struct CloseGuard(Arc<Inner>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.transition_closed(CloseReason::Transport(TransportError::Read(
            "read loop stopped".to_string(),
        )));
    }
}

fn finish_call(
    received: std::result::Result<CallResult, oneshot::error::RecvError>,
) -> Result<Value> {
    // The sender is consumed by the callback, which runs unless the entry
    // was removed by a timeout.
    let result = received.map_err(|_| CallError::ConnectionClosed(CloseReason::Shutdown))?;
    Ok(result?)
}

fn invoke_callback(id: RequestId, callback: RequestCallback, result: CallResult) {
    if std::panic::catch_unwind(AssertUnwindSafe(move || callback(result))).is_err() {
        error!("Callback for request {} panicked", id);
    }
}
