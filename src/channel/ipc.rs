//! Asynchronous channel between the bridge and the decision authority
//!
//! Requests are correlated by a [`CallId`] and travel over a tokio mpsc
//! channel. Calls that expect an answer carry a oneshot responder; the answer
//! is delivered to the caller's [`ResultCallback`] on the channel's runtime,
//! never on the thread that issued the call.

use std::cell::Cell;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Call ID counter for correlation
static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Error code reported when the authority side goes away mid-call.
pub const CHANNEL_CLOSED_CODE: &str = "channel_closed";

thread_local! {
    static ON_DELIVERY_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Key/value payload sent with every call.
pub type Payload = serde_json::Map<String, Value>;

/// Callback receiving the single terminal outcome of a call.
pub type ResultCallback = Box<dyn FnOnce(ChannelOutcome) + Send + 'static>;

/// Unique identifier of one request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(u64);

impl CallId {
    /// Allocates the next id. Ids are never reused within a process.
    pub fn next() -> Self {
        Self(NEXT_CALL_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Terminal outcome of a call, as reported by the authority.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelOutcome {
    /// The authority answered. The payload may be absent (`null`).
    Success(Option<Value>),

    /// The authority reported an application error.
    Error {
        code: String,
        message: String,
        details: Option<Value>,
    },

    /// The authority has no handler for this method.
    NotImplemented,
}

impl ChannelOutcome {
    /// Create a success outcome carrying a payload
    pub fn success(value: Value) -> Self {
        if value.is_null() {
            Self::Success(None)
        } else {
            Self::Success(Some(value))
        }
    }

    /// Create an error outcome without details
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// A call leaving the bridge.
pub struct OutgoingCall {
    pub id: CallId,
    pub method: String,
    pub payload: Payload,
    pub on_result: Option<ResultCallback>,
}

impl OutgoingCall {
    /// Fire-and-forget notification.
    pub fn notification(method: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: CallId::next(),
            method: method.into(),
            payload,
            on_result: None,
        }
    }

    /// Call whose outcome is delivered to `on_result`.
    pub fn with_result(
        id: CallId,
        method: impl Into<String>,
        payload: Payload,
        on_result: ResultCallback,
    ) -> Self {
        Self {
            id,
            method: method.into(),
            payload,
            on_result: Some(on_result),
        }
    }
}

impl std::fmt::Debug for OutgoingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingCall")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("payload", &self.payload)
            .field("expects_reply", &self.on_result.is_some())
            .finish()
    }
}

/// Transport to the decision authority.
///
/// Implementations must deliver exactly one [`ChannelOutcome`] to
/// `on_result` for every call that carries one, unless the authority simply
/// never answers. Transport failures are reported as
/// [`ChannelOutcome::Error`], never by dropping the callback.
pub trait MessageChannel: Send + Sync {
    /// Hands a call to the transport.
    fn send(&self, call: OutgoingCall);

    /// Fire-and-forget invocation.
    fn invoke(&self, method: &str, payload: Payload) -> CallId {
        let call = OutgoingCall::notification(method, payload);
        let id = call.id;
        self.send(call);
        id
    }

    /// Invocation whose outcome is passed to `on_result`.
    fn invoke_with_result(&self, method: &str, payload: Payload, on_result: ResultCallback) -> CallId {
        let id = CallId::next();
        self.send(OutgoingCall::with_result(id, method, payload, on_result));
        id
    }
}

/// IPC channel error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("IPC channel closed")]
    Closed,

    #[error("IPC channel buffer is full")]
    BufferFull,

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Wait was interrupted")]
    Interrupted,

    #[error("Blocking wait attempted on the channel delivery thread")]
    DeliveryThread,
}

/// Request as seen by the authority.
pub struct ChannelRequest {
    pub id: CallId,
    pub method: String,
    pub payload: Payload,
    responder: Option<oneshot::Sender<ChannelOutcome>>,
}

impl ChannelRequest {
    /// Whether the bridge is waiting for an answer.
    pub fn expects_reply(&self) -> bool {
        self.responder.is_some()
    }

    /// Answers the request. Notifications ignore the outcome.
    pub fn reply(self, outcome: ChannelOutcome) {
        match self.responder {
            Some(responder) => {
                if responder.send(outcome).is_err() {
                    warn!("Bridge stopped waiting for call {} ({})", self.id, self.method);
                }
            }
            None => debug!("Discarding reply to notification {} ({})", self.id, self.method),
        }
    }
}

impl std::fmt::Debug for ChannelRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRequest")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("payload", &self.payload)
            .field("expects_reply", &self.responder.is_some())
            .finish()
    }
}

/// Returns true while the current thread is running a result callback.
pub(crate) fn is_delivery_thread() -> bool {
    ON_DELIVERY_THREAD.with(Cell::get)
}

struct DeliveryGuard;

impl DeliveryGuard {
    fn enter() -> Self {
        ON_DELIVERY_THREAD.with(|flag| flag.set(true));
        Self
    }
}

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        ON_DELIVERY_THREAD.with(|flag| flag.set(false));
    }
}

fn deliver(on_result: ResultCallback, outcome: ChannelOutcome) {
    let _guard = DeliveryGuard::enter();
    on_result(outcome);
}

type RequestReceiver = mpsc::Receiver<ChannelRequest>;

/// Tokio-backed [`MessageChannel`].
///
/// Sending never blocks: engine callbacks run on plain threads, so requests
/// are queued with `try_send` and responses are awaited on `runtime`.
#[derive(Clone)]
pub struct IpcChannel {
    request_tx: mpsc::Sender<ChannelRequest>,
    request_rx: Arc<Mutex<Option<RequestReceiver>>>,
    runtime: Handle,
}

impl IpcChannel {
    /// Default number of requests that may be queued for the authority.
    pub const DEFAULT_BUFFER_SIZE: usize = 256;

    /// Create a new IPC channel delivering results on `runtime`
    pub fn new(runtime: Handle) -> Self {
        Self::with_buffer_size(runtime, Self::DEFAULT_BUFFER_SIZE)
    }

    /// Create a new IPC channel with custom buffer size
    pub fn with_buffer_size(runtime: Handle, buffer_size: usize) -> Self {
        let (request_tx, request_rx) = mpsc::channel(buffer_size.max(1));

        Self {
            request_tx,
            request_rx: Arc::new(Mutex::new(Some(request_rx))),
            runtime,
        }
    }

    /// Take the request receiver (for the authority side)
    pub fn take_receiver(&self) -> Option<RequestReceiver> {
        self.request_rx.lock().take()
    }

    /// Check if the channel is still open
    pub fn is_open(&self) -> bool {
        !self.request_tx.is_closed()
    }

    fn fail(&self, id: CallId, on_result: Option<ResultCallback>, error: ChannelError) {
        let Some(on_result) = on_result else {
            return;
        };
        let outcome = ChannelOutcome::error(CHANNEL_CLOSED_CODE, error.to_string());
        debug!("Reporting transport failure for call {}: {}", id, error);
        self.runtime.spawn(async move { deliver(on_result, outcome) });
    }
}

impl MessageChannel for IpcChannel {
    fn send(&self, call: OutgoingCall) {
        let OutgoingCall {
            id,
            method,
            payload,
            on_result,
        } = call;

        let (responder, response_rx) = if on_result.is_some() {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        debug!("Sending IPC call {} ({}): {:?}", id, method, payload);

        let request = ChannelRequest {
            id,
            method,
            payload,
            responder,
        };

        if let Err(err) = self.request_tx.try_send(request) {
            let (request, error) = match err {
                TrySendError::Full(request) => (request, ChannelError::BufferFull),
                TrySendError::Closed(request) => (request, ChannelError::Closed),
            };
            error!("Failed to send IPC call {} ({}): {}", id, request.method, error);
            self.fail(id, on_result, error);
            return;
        }

        if let (Some(on_result), Some(response_rx)) = (on_result, response_rx) {
            self.runtime.spawn(async move {
                let outcome = match response_rx.await {
                    Ok(outcome) => {
                        debug!("Received IPC outcome for call {}: {:?}", id, outcome);
                        outcome
                    }
                    Err(_) => {
                        error!("IPC response channel closed for call {}", id);
                        ChannelOutcome::error(
                            CHANNEL_CLOSED_CODE,
                            "decision authority dropped the call without replying",
                        )
                    }
                };
                deliver(on_result, outcome);
            });
        }
    }
}

/// Helper to process bridge calls on the authority side
pub struct AuthorityProcessor {
    receiver: RequestReceiver,
}

impl AuthorityProcessor {
    /// Create a new processor from a channel
    pub fn new(channel: &IpcChannel) -> Option<Self> {
        channel.take_receiver().map(|receiver| Self { receiver })
    }

    /// Receive the next request
    pub async fn recv(&mut self) -> Option<ChannelRequest> {
        self.receiver.recv().await
    }

    /// Process requests with a handler function until the bridge side closes.
    ///
    /// Notifications are passed to the handler too; their outcome is dropped.
    pub async fn process<F, Fut>(&mut self, mut handler: F)
    where
        F: FnMut(String, Payload) -> Fut,
        Fut: Future<Output = ChannelOutcome>,
    {
        while let Some(request) = self.receiver.recv().await {
            debug!("Processing IPC call {}: {}", request.id, request.method);

            let outcome = handler(request.method.clone(), request.payload.clone()).await;

            request.reply(outcome);
        }
    }
}
