//! Request/response correlation on top of the framed codec.
//!
//! - [`RpcCaller`]: sends `rpc:call` frames and matches incoming
//!   `rpc:return` frames to waiting callers by `rpcID`
//! - [`RpcProvider`]: dispatches incoming `rpc:call` frames to named
//!   handlers and sends the `rpc:return` back
//!
//! Any handler failure, including a panic inside the handler task, turns
//! into a `rpc:return` frame carrying an `error` label. Callers see it as
//! [`RpcError::Remote`].

pub mod caller;
pub mod provider;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;
use crate::domain::message::{channel, label, subject, STATUS_ERROR, STATUS_SUCCESS};
use crate::domain::{Labels, Message};

pub use caller::{CorrelationTable, RpcCaller};
pub use provider::{RpcHandler, RpcProvider};

/// Fixed wait for a single RPC reply
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Size of the cyclic correlation ID space (`0 .. MAX_ID-1`)
pub const MAX_ID: usize = 1024;

/// Boxed future returned by registered handlers
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Errors seen by the calling side of an RPC
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("call {feature}.{method} timed out after {timeout:?}")]
    Timeout {
        feature: String,
        method: String,
        timeout: Duration,
    },

    /// The remote handler failed; carries its `error` label
    #[error("remote error: {0}")]
    Remote(String),

    #[error("no free correlation id ({0} calls pending)")]
    Exhausted(usize),

    #[error("feature {0} is not available")]
    Unavailable(String),

    #[error("reply slot dropped before a reply arrived")]
    Dropped,

    #[error("send failed: {0}")]
    Send(#[from] CodecError),

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Failure reported by a handler
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self(format!("invalid payload: {}", err))
    }
}

impl From<RpcError> for HandlerError {
    fn from(err: RpcError) -> Self {
        Self(err.to_string())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self(format!("{:#}", err))
    }
}

/// Build the `rpc:return` frame answering a call.
///
/// `call` are the labels of the original call; routing labels are copied
/// so relays can match the return to its origin.
pub(crate) fn return_frame(
    rpc_id: &str,
    call: &Labels,
    result: Result<Vec<u8>, HandlerError>,
) -> Message {
    let mut reply = Message::new(channel::RPC, subject::RETURN).with_label(label::RPC_ID, rpc_id);

    for name in [label::FEATURE, label::METHOD, label::CALLER, label::SESSION_ID] {
        if let Some(value) = call.get(name) {
            reply.set_label(name, value.clone());
        }
    }

    match result {
        Ok(payload) => reply
            .with_label(label::STATUS, STATUS_SUCCESS)
            .with_raw(payload),
        Err(err) => reply
            .with_label(label::STATUS, STATUS_ERROR)
            .with_label(label::ERROR, err.0),
    }
}

/// Extract a readable message from a panicked task
pub(crate) fn panic_message(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "handler task cancelled".to_string();
    }

    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}
