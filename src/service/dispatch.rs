//! Per-message dispatch pipeline.
//!
//! Every inbound message passes, in order:
//! 1. expect handlers keyed `channel:subject:driver` (one-shot, with a
//!    timeout that runs an `except` callback instead)
//! 2. responders keyed `channel:subject` (all run, each in its own task)
//! 3. transformers keyed `channel:subject` (may replace or drop the message)
//! 4. the router, whose output is sent to each destination's pipe

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::codec::FrameSink;
use crate::domain::Message;
use crate::rpc::BoxFuture;

/// Something messages come from and can be sent to
pub trait Endpoint: FrameSink + 'static {
    fn feature(&self) -> &str;
    fn driver(&self) -> &str;
}

/// Pluggable routing policy
#[async_trait]
pub trait Router<E: Endpoint>: Send + Sync {
    /// Destinations for a message that survived the transformers
    async fn route(&self, origin: &Arc<E>, message: Message) -> Vec<(Arc<E>, Message)>;
}

pub type Responder<E> = Arc<dyn Fn(Arc<E>, Message) -> BoxFuture<()> + Send + Sync>;
pub type Transformer<E> =
    Arc<dyn Fn(Arc<E>, Message) -> BoxFuture<Option<Message>> + Send + Sync>;

type Then<E> = Box<dyn FnOnce(Arc<E>, Message) -> BoxFuture<()> + Send>;
type Except = Box<dyn FnOnce() -> BoxFuture<()> + Send>;

struct Expect<E> {
    token: u64,
    then: Then<E>,
}

/// The four dispatch tables
pub struct Dispatcher<E: Endpoint> {
    expects: Arc<Mutex<HashMap<String, Expect<E>>>>,
    responders: RwLock<HashMap<String, Vec<Responder<E>>>>,
    transformers: RwLock<HashMap<String, Vec<Transformer<E>>>>,
    router: RwLock<Option<Arc<dyn Router<E>>>>,
    next_token: AtomicU64,
}

impl<E: Endpoint> Default for Dispatcher<E> {
    fn default() -> Self {
        Self::new()
    }
}

fn key(channel: &str, subject: &str) -> String {
    format!("{}:{}", channel, subject)
}

impl<E: Endpoint> Dispatcher<E> {
    pub fn new() -> Self {
        Self {
            expects: Arc::new(Mutex::new(HashMap::new())),
            responders: RwLock::new(HashMap::new()),
            transformers: RwLock::new(HashMap::new()),
            router: RwLock::new(None),
            next_token: AtomicU64::new(1),
        }
    }

    /// Wait once for `channel:subject` from `driver`.
    ///
    /// `then` runs if the message arrives within `timeout`, `except`
    /// otherwise. Registering the same key again replaces the earlier
    /// expect, whose callbacks are then dropped without running.
    pub fn add_expect<T, TFut, X, XFut>(
        &self,
        channel: &str,
        subject: &str,
        driver: &str,
        timeout: Duration,
        then: T,
        except: X,
    ) -> u64
    where
        T: FnOnce(Arc<E>, Message) -> TFut + Send + 'static,
        TFut: Future<Output = ()> + Send + 'static,
        X: FnOnce() -> XFut + Send + 'static,
        XFut: Future<Output = ()> + Send + 'static,
    {
        let key = format!("{}:{}", key(channel, subject), driver);
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let then: Then<E> = Box::new(move |origin, message| Box::pin(then(origin, message)));
        let except: Except = Box::new(move || Box::pin(except()));

        self.expects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), Expect { token, then });

        let expects = self.expects.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let expired = {
                let mut expects = expects.lock().unwrap_or_else(|e| e.into_inner());
                match expects.get(&key) {
                    Some(expect) if expect.token == token => expects.remove(&key).is_some(),
                    _ => false,
                }
            };
            if expired {
                debug!(%key, ?timeout, "expect timed out");
                except().await;
            }
        });

        token
    }

    /// Drop a pending expect without running either callback
    pub fn cancel_expect(&self, channel: &str, subject: &str, driver: &str, token: u64) -> bool {
        let key = format!("{}:{}", key(channel, subject), driver);
        let mut expects = self.expects.lock().unwrap_or_else(|e| e.into_inner());
        match expects.get(&key) {
            Some(expect) if expect.token == token => expects.remove(&key).is_some(),
            _ => false,
        }
    }

    /// Number of expects still waiting
    pub fn pending_expects(&self) -> usize {
        self.expects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Add a permanent callback for `channel:subject`
    pub fn add_responder<F, Fut>(&self, channel: &str, subject: &str, responder: F)
    where
        F: Fn(Arc<E>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let responder: Responder<E> =
            Arc::new(move |origin, message| Box::pin(responder(origin, message)));
        self.responders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key(channel, subject))
            .or_default()
            .push(responder);
    }

    /// Append a transformer for `channel:subject`. Returning `None` stops
    /// the message before the router.
    pub fn add_transformer<F, Fut>(&self, channel: &str, subject: &str, transformer: F)
    where
        F: Fn(Arc<E>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Message>> + Send + 'static,
    {
        let transformer: Transformer<E> =
            Arc::new(move |origin, message| Box::pin(transformer(origin, message)));
        self.transformers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key(channel, subject))
            .or_default()
            .push(transformer);
    }

    pub fn set_router(&self, router: Arc<dyn Router<E>>) {
        *self.router.write().unwrap_or_else(|e| e.into_inner()) = Some(router);
    }

    /// Run one message through the pipeline
    pub async fn dispatch(&self, origin: Arc<E>, message: Message) {
        let key = message.key();

        let expect = {
            let expect_key = format!("{}:{}", key, origin.driver());
            self.expects
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&expect_key)
        };
        if let Some(expect) = expect {
            tokio::spawn((expect.then)(origin.clone(), message.detached()));
        }

        let responders = self
            .responders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
            .unwrap_or_default();
        for responder in responders {
            let origin = origin.clone();
            let message = message.clone();
            let key = key.clone();
            let task = tokio::spawn(responder(origin, message));
            tokio::spawn(async move {
                if let Err(e) = task.await {
                    warn!(%key, error = %e, "responder failed");
                }
            });
        }

        let transformers = self
            .transformers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
            .unwrap_or_default();
        let mut message = message;
        for transformer in transformers {
            match transformer(origin.clone(), message).await {
                Some(next) => message = next,
                None => {
                    debug!(%key, feature = %origin.feature(), "message dropped by transformer");
                    return;
                }
            }
        }

        let router = self
            .router
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(router) = router else {
            return;
        };

        for (destination, routed) in router.route(&origin, message).await {
            if let Err(e) = destination.send_frame(&routed).await {
                warn!(
                    %key,
                    from = %origin.feature(),
                    to = %destination.feature(),
                    error = %e,
                    "failed to deliver routed message"
                );
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::codec::CodecError;

    /// In-memory endpoint recording what is sent to it
    pub struct TestEndpoint {
        pub feature: String,
        pub driver: String,
        pub received: Mutex<Vec<Message>>,
    }

    impl TestEndpoint {
        pub fn new(feature: &str, driver: &str) -> Arc<Self> {
            Arc::new(Self {
                feature: feature.to_string(),
                driver: driver.to_string(),
                received: Mutex::new(Vec::new()),
            })
        }

        pub fn received(&self) -> Vec<Message> {
            self.received.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FrameSink for TestEndpoint {
        async fn send_frame(&self, message: &Message) -> Result<(), CodecError> {
            self.received.lock().unwrap().push(message.detached());
            Ok(())
        }
    }

    impl Endpoint for TestEndpoint {
        fn feature(&self) -> &str {
            &self.feature
        }

        fn driver(&self) -> &str {
            &self.driver
        }
    }
}
