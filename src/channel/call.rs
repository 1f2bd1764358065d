//! Correlated calls and the blocking wait adapter.
//!
//! Most decisions are asynchronous: the outcome of a [`CorrelatedCall`] is
//! handed to a closure on the channel's delivery thread. Subresource
//! interception is the exception. The engine wants its answer inline, so
//! [`invoke_and_wait`] parks the calling thread on a single-slot
//! [`CallSlot`] until the delivery thread fills it, the wait is interrupted
//! through an [`InterruptToken`], or an optional timeout elapses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use tracing::{debug, warn};

use super::ipc::{is_delivery_thread, CallId, ChannelError, ChannelOutcome, MessageChannel, OutgoingCall, Payload};

/// Lifecycle of a correlated call. Exactly one transition out of `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Pending,
    Resolved,
    Failed,
    Unimplemented,
}

impl CallState {
    fn for_outcome(outcome: &ChannelOutcome) -> Self {
        match outcome {
            ChannelOutcome::Success(_) => Self::Resolved,
            ChannelOutcome::Error { .. } => Self::Failed,
            ChannelOutcome::NotImplemented => Self::Unimplemented,
        }
    }
}

/// One request/response exchange with the decision authority.
#[derive(Debug)]
pub struct CorrelatedCall {
    id: CallId,
    method: String,
    state: Mutex<CallState>,
}

impl CorrelatedCall {
    fn new(method: &str) -> Self {
        Self {
            id: CallId::next(),
            method: method.to_string(),
            state: Mutex::new(CallState::Pending),
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn state(&self) -> CallState {
        *self.state.lock()
    }

    /// Moves the call out of `Pending`. Returns false if it already settled.
    fn settle(&self, outcome: &ChannelOutcome) -> bool {
        let mut state = self.state.lock();
        if *state != CallState::Pending {
            return false;
        }
        *state = CallState::for_outcome(outcome);
        true
    }

    /// Issues `method` and runs `on_settled` with its outcome on the
    /// channel's delivery thread.
    pub fn issue<F>(channel: &dyn MessageChannel, method: &str, payload: Payload, on_settled: F) -> Arc<Self>
    where
        F: FnOnce(ChannelOutcome) + Send + 'static,
    {
        let call = Arc::new(Self::new(method));
        let tracked = Arc::clone(&call);

        debug!("Issuing correlated call {} ({})", call.id, call.method);

        channel.send(OutgoingCall::with_result(
            call.id,
            method,
            payload,
            Box::new(move |outcome| {
                if !tracked.settle(&outcome) {
                    warn!("Ignoring second outcome for call {} ({})", tracked.id, tracked.method);
                    return;
                }
                on_settled(outcome);
            }),
        ));

        call
    }
}

#[derive(Debug)]
enum SlotState {
    Waiting,
    Filled(ChannelOutcome),
    Interrupted,
}

/// Single-slot cell bridging the delivery thread and a waiting thread.
#[derive(Debug)]
pub struct CallSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl Default for CallSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl CallSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Waiting),
            ready: Condvar::new(),
        }
    }

    /// Stores the outcome and wakes the waiter. Late outcomes are dropped.
    pub fn fill(&self, outcome: ChannelOutcome) {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Waiting) {
            *state = SlotState::Filled(outcome);
            self.ready.notify_all();
        } else {
            debug!("Dropping outcome for an abandoned wait");
        }
    }

    /// Wakes the waiter with [`ChannelError::Interrupted`].
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Waiting) {
            *state = SlotState::Interrupted;
            self.ready.notify_all();
        }
    }

    /// Blocks until the slot is filled, interrupted, or `timeout` elapses.
    /// `None` waits until one of the first two happens.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<ChannelOutcome, ChannelError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock();

        loop {
            match std::mem::replace(&mut *state, SlotState::Waiting) {
                SlotState::Filled(outcome) => {
                    // Consumed; later fills are abandoned outcomes.
                    *state = SlotState::Interrupted;
                    return Ok(outcome);
                }
                SlotState::Interrupted => {
                    *state = SlotState::Interrupted;
                    return Err(ChannelError::Interrupted);
                }
                SlotState::Waiting => {}
            }

            match (deadline, timeout) {
                (Some(deadline), Some(timeout)) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out()
                        && matches!(*state, SlotState::Waiting)
                    {
                        *state = SlotState::Interrupted;
                        return Err(ChannelError::Timeout(timeout));
                    }
                }
                _ => self.ready.wait(&mut state),
            }
        }
    }
}

#[derive(Debug, Default)]
struct InterruptInner {
    interrupted: AtomicBool,
    slots: Mutex<Vec<Arc<CallSlot>>>,
}

/// Lets the engine interrupt threads blocked in [`invoke_and_wait`].
///
/// Clones share one flag. Once interrupted, every wait guarded by this token
/// (current or future, on any thread) returns [`ChannelError::Interrupted`].
#[derive(Debug, Clone, Default)]
pub struct InterruptToken {
    inner: Arc<InterruptInner>,
}

impl InterruptToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        let slots = self.inner.slots.lock();
        self.inner.interrupted.store(true, Ordering::SeqCst);
        for slot in slots.iter() {
            slot.interrupt();
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Number of waits currently guarded by this token.
    pub fn waiter_count(&self) -> usize {
        self.inner.slots.lock().len()
    }

    fn attach(&self, slot: &Arc<CallSlot>) {
        let mut slots = self.inner.slots.lock();
        if self.is_interrupted() {
            slot.interrupt();
        }
        slots.push(Arc::clone(slot));
    }

    fn detach(&self, slot: &Arc<CallSlot>) {
        self.inner.slots.lock().retain(|attached| !Arc::ptr_eq(attached, slot));
    }
}

/// Result of a blocking call: either a payload or an error description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaitResult {
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl From<ChannelOutcome> for WaitResult {
    fn from(outcome: ChannelOutcome) -> Self {
        match outcome {
            ChannelOutcome::Success(result) => Self { result, error: None },
            ChannelOutcome::Error { code, message, .. } => Self {
                result: None,
                error: Some(format!("{}, {}", code, message)),
            },
            ChannelOutcome::NotImplemented => Self {
                result: None,
                error: Some("method not implemented by the decision authority".to_string()),
            },
        }
    }
}

/// Issues `method` and blocks the calling thread until it settles.
///
/// Fails with [`ChannelError::Interrupted`] when `interrupt` fires, with
/// [`ChannelError::Timeout`] when `timeout` elapses, and with
/// [`ChannelError::DeliveryThread`] when called from inside a result callback,
/// where waiting would stall the very thread that has to fill the slot.
pub fn invoke_and_wait(
    channel: &dyn MessageChannel,
    method: &str,
    payload: Payload,
    interrupt: &InterruptToken,
    timeout: Option<Duration>,
) -> Result<WaitResult, ChannelError> {
    if is_delivery_thread() {
        warn!("Refusing blocking call {} on the channel delivery thread", method);
        return Err(ChannelError::DeliveryThread);
    }
    if interrupt.is_interrupted() {
        return Err(ChannelError::Interrupted);
    }

    let slot = Arc::new(CallSlot::new());
    interrupt.attach(&slot);

    let filler = Arc::clone(&slot);
    let call = CorrelatedCall::issue(channel, method, payload, move |outcome| filler.fill(outcome));

    let outcome = slot.wait(timeout);
    interrupt.detach(&slot);

    match outcome {
        Ok(outcome) => Ok(outcome.into()),
        Err(err) => {
            warn!("Blocking call {} ({}) abandoned: {}", call.id(), method, err);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    /// Channel that answers every call from a background thread.
    struct ThreadedChannel {
        outcome: Option<ChannelOutcome>,
        delay: Duration,
    }

    impl MessageChannel for ThreadedChannel {
        fn send(&self, call: OutgoingCall) {
            let Some(on_result) = call.on_result else {
                return;
            };
            let Some(outcome) = self.outcome.clone() else {
                // Keep the callback alive forever: the authority never answers.
                std::mem::forget(on_result);
                return;
            };
            let delay = self.delay;
            thread::spawn(move || {
                thread::sleep(delay);
                on_result(outcome);
            });
        }
    }

    #[test]
    fn test_correlated_call_settles_once() {
        let call = CorrelatedCall::new("onSafeBrowsingHit");
        assert_eq!(call.state(), CallState::Pending);
        assert!(call.settle(&ChannelOutcome::NotImplemented));
        assert!(!call.settle(&ChannelOutcome::Success(None)));
        assert_eq!(call.state(), CallState::Unimplemented);
    }

    #[test]
    fn test_slot_fill_then_wait() {
        let slot = CallSlot::new();
        slot.fill(ChannelOutcome::Success(None));
        assert_eq!(slot.wait(None), Ok(ChannelOutcome::Success(None)));
    }

    #[test]
    fn test_slot_times_out() {
        let slot = CallSlot::new();
        let result = slot.wait(Some(Duration::from_millis(20)));
        assert_eq!(result, Err(ChannelError::Timeout(Duration::from_millis(20))));
    }

    #[test]
    fn test_invoke_and_wait_returns_payload() {
        let channel = ThreadedChannel {
            outcome: Some(ChannelOutcome::success(json!({"base64data": "aGk="}))),
            delay: Duration::from_millis(10),
        };
        let result = invoke_and_wait(
            &channel,
            "onLoadResourceCustomScheme",
            Payload::new(),
            &InterruptToken::new(),
            None,
        )
        .unwrap();
        assert_eq!(result.result, Some(json!({"base64data": "aGk="})));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_invoke_and_wait_maps_error() {
        let channel = ThreadedChannel {
            outcome: Some(ChannelOutcome::error("boom", "authority failed")),
            delay: Duration::ZERO,
        };
        let result = invoke_and_wait(&channel, "m", Payload::new(), &InterruptToken::new(), None).unwrap();
        assert!(result.result.is_none());
        assert_eq!(result.error.as_deref(), Some("boom, authority failed"));
    }

    #[test]
    fn test_interrupt_unblocks_waiter() {
        let channel = ThreadedChannel {
            outcome: None,
            delay: Duration::ZERO,
        };
        let token = InterruptToken::new();
        let remote = token.clone();

        let interrupter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            remote.interrupt();
        });

        let started = Instant::now();
        let result = invoke_and_wait(&channel, "m", Payload::new(), &token, None);
        interrupter.join().unwrap();

        assert_eq!(result, Err(ChannelError::Interrupted));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_already_interrupted_does_not_send() {
        let token = InterruptToken::new();
        token.interrupt();
        let channel = ThreadedChannel {
            outcome: Some(ChannelOutcome::Success(None)),
            delay: Duration::ZERO,
        };
        assert_eq!(
            invoke_and_wait(&channel, "m", Payload::new(), &token, None),
            Err(ChannelError::Interrupted)
        );
    }

    #[test]
    fn test_interrupt_unblocks_every_waiter_on_shared_token() {
        let channel = Arc::new(ThreadedChannel {
            outcome: None,
            delay: Duration::ZERO,
        });
        let token = InterruptToken::new();
        let (tx, rx) = std::sync::mpsc::channel();

        let waiters: Vec<_> = (0..2)
            .map(|index| {
                let channel = Arc::clone(&channel);
                let token = token.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    let result = invoke_and_wait(channel.as_ref(), "m", Payload::new(), &token, None);
                    tx.send((index, result)).unwrap();
                })
            })
            .collect();

        let deadline = Instant::now() + Duration::from_secs(5);
        while token.waiter_count() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(token.waiter_count(), 2);

        token.interrupt();

        let mut finished: Vec<_> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        finished.sort_by_key(|(index, _)| *index);
        for waiter in waiters {
            waiter.join().unwrap();
        }

        assert_eq!(
            finished,
            vec![(0, Err(ChannelError::Interrupted)), (1, Err(ChannelError::Interrupted))]
        );
        assert_eq!(token.waiter_count(), 0);
    }
}
