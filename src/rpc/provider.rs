//! Providing side of the RPC bus.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{panic_message, return_frame, BoxFuture, HandlerError, DEFAULT_RPC_TIMEOUT};
use crate::codec::FrameSink;
use crate::domain::message::{label, NO_REPLY_ID};
use crate::domain::Message;

/// A registered method: takes the call message, returns the reply payload
pub type RpcHandler =
    Arc<dyn Fn(Message) -> BoxFuture<Result<Vec<u8>, HandlerError>> + Send + Sync>;

/// Method table plus the routing that answers calls
pub struct RpcProvider {
    handlers: RwLock<HashMap<String, RpcHandler>>,
    timeout: Duration,
}

impl Default for RpcProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcProvider {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_RPC_TIMEOUT)
    }

    /// Provider whose handlers are abandoned after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Register a handler working on the raw call message
    pub fn register_raw<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send + 'static,
    {
        let handler: RpcHandler = Arc::new(move |message| Box::pin(handler(message)));
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(method.into(), handler);
    }

    /// Register a handler with typed JSON parameters and result
    pub fn register<P, R, F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register_raw(method, move |message: Message| {
            let handler = handler.clone();
            async move {
                let params: P = message.parse()?;
                let result = handler(params).await?;
                Ok(serde_json::to_vec(&result)?)
            }
        });
    }

    /// Registered method names, sorted
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        methods.sort();
        methods
    }

    fn handler(&self, method: &str) -> Option<RpcHandler> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(method)
            .cloned()
    }

    /// Answer one `rpc:call`.
    ///
    /// The handler runs in its own task; a panic or an overrun of the
    /// timeout becomes an error reply. Nothing is sent back when the call
    /// carries the `skip` ID.
    pub fn route(&self, message: Message, return_to: Arc<dyn FrameSink>) -> JoinHandle<()> {
        let method = message.label(label::METHOD).unwrap_or_default().to_string();
        let rpc_id = message
            .label(label::RPC_ID)
            .unwrap_or(NO_REPLY_ID)
            .to_string();
        let handler = self.handler(&method);
        let timeout = self.timeout;

        tokio::spawn(async move {
            let call_labels = message.labels.clone();
            let result = match handler {
                Some(handler) => invoke(handler, message, timeout).await,
                None => Err(HandlerError(format!("unknown method {:?}", method))),
            };

            if rpc_id == NO_REPLY_ID {
                if let Err(e) = result {
                    warn!(%method, error = %e, "fire-and-forget call failed");
                }
                return;
            }

            let reply = return_frame(&rpc_id, &call_labels, result);
            if let Err(e) = return_to.send_frame(&reply).await {
                warn!(%method, rpc_id = %rpc_id, error = %e, "failed to send rpc return");
            } else {
                debug!(%method, rpc_id = %rpc_id, "rpc return sent");
            }
        })
    }
}

/// Run a handler in its own task, racing it against the timeout
async fn invoke(
    handler: RpcHandler,
    message: Message,
    timeout: Duration,
) -> Result<Vec<u8>, HandlerError> {
    let task = tokio::spawn(handler(message));

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(HandlerError(panic_message(join_err))),
        Err(_) => Err(HandlerError(format!(
            "handler timed out after {:?}",
            timeout
        ))),
    }
}
