//! Calling side of the RPC bus.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;

use super::{RpcError, DEFAULT_RPC_TIMEOUT, MAX_ID};
use crate::codec::FrameSink;
use crate::domain::message::{channel, label, subject, NO_REPLY_ID, ORIGIN_CALLER};
use crate::domain::Message;

type ReplySlot = oneshot::Sender<Result<Vec<u8>, String>>;

struct Pending {
    seq: u64,
    tx: ReplySlot,
}

/// Pending calls keyed by a cyclically reused numeric ID.
///
/// An ID is never handed out while a call holding it is still pending.
pub struct CorrelationTable {
    next: usize,
    max: usize,
    seq: u64,
    pending: HashMap<String, Pending>,
}

impl CorrelationTable {
    pub fn new(max: usize) -> Self {
        Self {
            next: 0,
            max: max.max(1),
            seq: 0,
            pending: HashMap::new(),
        }
    }

    /// Reserve the next free ID
    fn allocate(&mut self) -> Option<(String, u64, oneshot::Receiver<Result<Vec<u8>, String>>)> {
        for _ in 0..self.max {
            let id = self.next.to_string();
            self.next = (self.next + 1) % self.max;

            if self.pending.contains_key(&id) {
                continue;
            }

            self.seq += 1;
            let (tx, rx) = oneshot::channel();
            self.pending.insert(id.clone(), Pending { seq: self.seq, tx });
            return Some((id, self.seq, rx));
        }
        None
    }

    /// Deliver a result to the call waiting on `id`
    fn complete(&mut self, id: &str, result: Result<Vec<u8>, String>) -> bool {
        match self.pending.remove(id) {
            Some(pending) => pending.tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Drop the slot if it still belongs to the call that reserved it
    fn release(&mut self, id: &str, seq: u64) {
        if self.pending.get(id).map(|p| p.seq) == Some(seq) {
            self.pending.remove(id);
        }
    }

    /// Number of calls still waiting for a reply
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Releases a correlation slot however the call ends
struct SlotGuard<'a> {
    table: &'a Mutex<CorrelationTable>,
    id: String,
    seq: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.release(&self.id, self.seq);
    }
}

/// Issues calls and correlates their returns
pub struct RpcCaller {
    table: Mutex<CorrelationTable>,
    timeout: Duration,
}

impl Default for RpcCaller {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcCaller {
    /// Caller with the fixed 10 second timeout
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_RPC_TIMEOUT, MAX_ID)
    }

    /// Caller with a custom timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_limits(timeout, MAX_ID)
    }

    /// Caller with a custom timeout and ID space
    pub fn with_limits(timeout: Duration, max_id: usize) -> Self {
        Self {
            table: Mutex::new(CorrelationTable::new(max_id)),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn table(&self) -> MutexGuard<'_, CorrelationTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of calls waiting for a reply
    pub fn pending(&self) -> usize {
        self.table().len()
    }

    /// Call `feature.method` with a raw payload and wait for the reply
    pub async fn call_raw(
        &self,
        sink: &dyn FrameSink,
        feature: &str,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        self.call_raw_as(sink, ORIGIN_CALLER, feature, method, payload)
            .await
    }

    /// Like [`call_raw`](Self::call_raw) with an explicit `caller` label,
    /// used when relaying a call on behalf of another feature
    pub async fn call_raw_as(
        &self,
        sink: &dyn FrameSink,
        caller: &str,
        feature: &str,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        let message = call_frame(caller, feature, method).with_raw(payload);
        self.request(sink, message).await
    }

    /// Send any message under a fresh `rpcID` and wait for the matching
    /// `rpc:return`. Used for `rpc:call` as well as replying commands.
    pub async fn request(
        &self,
        sink: &dyn FrameSink,
        mut message: Message,
    ) -> Result<Vec<u8>, RpcError> {
        let (id, seq, rx) = {
            let mut table = self.table();
            let pending = table.len();
            table.allocate().ok_or(RpcError::Exhausted(pending))?
        };
        let _slot = SlotGuard {
            table: &self.table,
            id: id.clone(),
            seq,
        };

        message.set_label(label::RPC_ID, id.clone());
        sink.send_frame(&message).await?;
        debug!(rpc_id = %id, key = %message.key(), "request sent");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(message))) => Err(RpcError::Remote(message)),
            Ok(Err(_)) => Err(RpcError::Dropped),
            Err(_) => Err(RpcError::Timeout {
                feature: message.label(label::FEATURE).unwrap_or_default().to_string(),
                method: message
                    .label(label::METHOD)
                    .unwrap_or(&message.subject)
                    .to_string(),
                timeout: self.timeout,
            }),
        }
    }

    /// Call with typed parameters and result
    pub async fn call<P, R>(
        &self,
        sink: &dyn FrameSink,
        feature: &str,
        method: &str,
        params: &P,
    ) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_vec(params)?;
        let reply = self.call_raw(sink, feature, method, payload).await?;
        decode_reply(&reply)
    }

    /// Fire-and-forget call: no correlation slot, no reply
    pub async fn call_no_wait<P>(
        &self,
        sink: &dyn FrameSink,
        feature: &str,
        method: &str,
        params: &P,
    ) -> Result<(), RpcError>
    where
        P: Serialize + ?Sized,
    {
        let message = call_frame(ORIGIN_CALLER, feature, method)
            .with_label(label::RPC_ID, NO_REPLY_ID)
            .with_raw(serde_json::to_vec(params)?);
        sink.send_frame(&message).await?;
        Ok(())
    }

    /// Match an incoming `rpc:return` to its pending call.
    ///
    /// Returns false when no call is waiting on that ID (late or stray
    /// return).
    pub fn handle_return(&self, message: &Message) -> bool {
        let Some(id) = message.label(label::RPC_ID) else {
            return false;
        };

        let result = match message.label(label::ERROR) {
            Some(error) => Err(error.to_string()),
            None => Ok(message.payload_bytes().unwrap_or_default()),
        };

        let delivered = self.table().complete(id, result);
        if !delivered {
            debug!(rpc_id = %id, "rpc return without a pending call");
        }
        delivered
    }
}

fn call_frame(caller: &str, feature: &str, method: &str) -> Message {
    Message::new(channel::RPC, subject::CALL)
        .with_label(label::FEATURE, feature)
        .with_label(label::METHOD, method)
        .with_label(label::CALLER, caller)
}

/// Decode a reply payload; an empty payload decodes as `null`
pub fn decode_reply<R: DeserializeOwned>(reply: &[u8]) -> Result<R, RpcError> {
    if reply.is_empty() {
        return Ok(serde_json::from_value(serde_json::Value::Null)?);
    }
    Ok(serde_json::from_slice(reply)?)
}
