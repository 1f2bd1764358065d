//! Message channel to the decision authority.
//!
//! The authority lives on a different execution context and is only reachable
//! through an asynchronous request/response channel. This module provides:
//!
//! - [`ipc`] - the [`MessageChannel`] seam, the tokio-backed [`IpcChannel`]
//!   and the authority-side [`AuthorityProcessor`]
//! - [`call`] - [`CorrelatedCall`] outcome tracking and the blocking
//!   [`invoke_and_wait`] adapter used where the engine needs an inline result

pub mod call;
pub mod ipc;

pub use call::{invoke_and_wait, CallSlot, CallState, CorrelatedCall, InterruptToken, WaitResult};
pub use ipc::{
    AuthorityProcessor, CallId, ChannelError, ChannelOutcome, ChannelRequest, IpcChannel,
    MessageChannel, OutgoingCall, Payload, ResultCallback,
};
