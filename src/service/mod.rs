//! The service runtime.
//!
//! A [`Service`] owns the set of running features, keeps each one in line
//! with its configuration (hot or cold reload), multiplexes every driver's
//! inbound stream into one dispatch pipeline, and restarts drivers that
//! crash.
//!
//! Inbound fan-in: each runtime's stream is drained by a forwarder task
//! into one shared inbox tagged with the originating runtime. The loop in
//! [`Service::run`] selects over that inbox, a poll ticker, the shutdown
//! token and a fatal-error channel.

pub mod dispatch;
pub mod reload;
pub mod runtime;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::codec::CodecError;
use crate::domain::message::{channel, label, subject, NO_REPLY_ID};
use crate::domain::{DriverMeta, FeatureConfig, FeatureSpec, FeatureState, Labels, Message};
use crate::driver::{acquire, DriverError, DriverHandle};
use crate::lifecycle::Lifecycle;
use crate::rpc::{return_frame, HandlerError, RpcCaller, RpcError, DEFAULT_RPC_TIMEOUT};

pub use dispatch::{Dispatcher, Endpoint, Router};
pub use reload::ReloadPlan;
pub use runtime::{FeatureStatus, Runtime};

/// Depth of the shared inbox all driver streams forward into
const INBOX_DEPTH: usize = 256;

/// Errors from the service runtime
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("feature {0} is not configured")]
    UnknownFeature(String),

    #[error("feature {feature} uses undefined driver {driver}")]
    UnknownDriver { feature: String, driver: String },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("feature {feature} did not signal alive within {timeout:?}")]
    NotReady { feature: String, timeout: Duration },

    #[error("handshake with feature {feature} failed: {source}")]
    Handshake {
        feature: String,
        #[source]
        source: CodecError,
    },

    #[error("required feature {feature} failed: {reason}")]
    RequiredFailed { feature: String, reason: String },

    #[error("feature {feature} could not be recovered after {attempts} attempts")]
    RecoveryExhausted { feature: String, attempts: u32 },

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("service loop is already running")]
    AlreadyRunning,

    #[error("service is shutting down")]
    ShuttingDown,
}

/// Timing knobs; defaults are the fixed protocol values
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Trusted directory for built-in drivers
    pub driver_dir: PathBuf,

    /// Wait for a single RPC reply
    pub rpc_timeout: Duration,

    /// Loop re-evaluation interval
    pub poll_interval: Duration,

    /// Wait for `state:alive` after options+start
    pub readiness_timeout: Duration,

    /// Delay before an old process is closed after a cold reload
    pub cold_grace: Duration,

    /// Reload attempts after a crash before giving up
    pub recovery_attempts: u32,

    /// First delay between recovery attempts, doubled after each failure
    pub recovery_backoff: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            driver_dir: PathBuf::from("drivers"),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            poll_interval: Duration::from_secs(1),
            readiness_timeout: Duration::from_secs(10),
            cold_grace: Duration::from_secs(2),
            recovery_attempts: 5,
            recovery_backoff: Duration::from_millis(500),
        }
    }
}

/// Desired state: driver catalog plus the features to run
#[derive(Debug, Clone, Default)]
pub struct ServicePlan {
    pub drivers: HashMap<String, DriverMeta>,
    pub features: Vec<FeatureSpec>,
}

/// Outcome of [`Service::apply`]
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub reloaded: Vec<(String, ReloadPlan)>,
    pub failed: Vec<(String, String)>,
    pub removed: Vec<String>,
}

/// Snapshot of the whole service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub service: String,
    pub instance: Uuid,
    pub recoveries: u64,
    pub features: Vec<FeatureStatus>,
}

enum Inbound {
    Message(Arc<Runtime>, Message),
    Closed(Arc<Runtime>),
}

/// A named set of features and the loop that serves them
pub struct Service {
    name: String,
    instance: Uuid,
    settings: ServiceSettings,
    lifecycle: Lifecycle,
    features: Mutex<HashMap<String, Arc<Runtime>>>,
    specs: Mutex<HashMap<String, FeatureSpec>>,
    drivers: RwLock<HashMap<String, DriverMeta>>,
    dynamic: Mutex<HashSet<String>>,
    dispatcher: Arc<Dispatcher<Runtime>>,
    caller: RpcCaller,
    inbox_tx: mpsc::Sender<Inbound>,
    inbox_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Inbound>>>,
    fatal_tx: mpsc::UnboundedSender<ServiceError>,
    fatal_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<ServiceError>>>,
    reload_lock: tokio::sync::Mutex<()>,
    pings: Mutex<HashMap<String, oneshot::Sender<()>>>,
    next_ping: AtomicU64,
    recoveries: AtomicU64,
    generation: AtomicU64,
}

impl Service {
    /// Create a service with the built-in responders installed
    pub fn new(name: &str, settings: ServiceSettings, lifecycle: Lifecycle) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_DEPTH);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        Arc::new_cyclic(|weak: &Weak<Service>| {
            let dispatcher = Arc::new(Dispatcher::new());
            install_responders(&dispatcher, weak.clone());

            Self {
                name: name.to_string(),
                instance: Uuid::new_v4(),
                caller: RpcCaller::with_timeout(settings.rpc_timeout),
                settings,
                lifecycle,
                features: Mutex::new(HashMap::new()),
                specs: Mutex::new(HashMap::new()),
                drivers: RwLock::new(HashMap::new()),
                dynamic: Mutex::new(HashSet::new()),
                dispatcher,
                inbox_tx,
                inbox_rx: tokio::sync::Mutex::new(Some(inbox_rx)),
                fatal_tx,
                fatal_rx: tokio::sync::Mutex::new(Some(fatal_rx)),
                reload_lock: tokio::sync::Mutex::new(()),
                pings: Mutex::new(HashMap::new()),
                next_ping: AtomicU64::new(0),
                recoveries: AtomicU64::new(0),
                generation: AtomicU64::new(0),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Expect handlers, responders, transformers and router
    pub fn dispatcher(&self) -> &Arc<Dispatcher<Runtime>> {
        &self.dispatcher
    }

    /// Crash recoveries started so far
    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Feature map
    // ========================================================================

    fn features(&self) -> MutexGuard<'_, HashMap<String, Arc<Runtime>>> {
        self.features.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current runtime of a feature
    pub fn get(&self, feature: &str) -> Option<Arc<Runtime>> {
        self.features().get(feature).cloned()
    }

    /// Register a runtime as current, returning the one it replaces
    fn set(&self, runtime: Arc<Runtime>) -> Option<Arc<Runtime>> {
        self.features()
            .insert(runtime.feature().to_string(), runtime)
    }

    /// Remove a feature only if `runtime` is still its current runtime
    fn check_delete(&self, feature: &str, runtime: &Arc<Runtime>) -> bool {
        let mut features = self.features();
        match features.get(feature) {
            Some(current) if Arc::ptr_eq(current, runtime) => features.remove(feature).is_some(),
            _ => false,
        }
    }

    fn is_current(&self, runtime: &Arc<Runtime>) -> bool {
        self.get(runtime.feature())
            .map(|current| Arc::ptr_eq(&current, runtime))
            .unwrap_or(false)
    }

    /// Names of features with a registered runtime, sorted
    pub fn feature_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.features().keys().cloned().collect();
        names.sort();
        names
    }

    fn spec(&self, feature: &str) -> Option<FeatureSpec> {
        self.specs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(feature)
            .cloned()
    }

    // ========================================================================
    // Boot and reconciliation
    // ========================================================================

    /// Start every feature of the plan. A required feature that fails is
    /// fatal; optional failures are logged.
    #[instrument(skip(self, plan), fields(service = %self.name))]
    pub async fn boot(&self, plan: ServicePlan) -> Result<(), ServiceError> {
        self.set_drivers(plan.drivers);
        info!(features = plan.features.len(), "booting service");

        for spec in plan.features {
            match self.reload_feature(spec.clone()).await {
                Ok(_) => {}
                Err(e) if spec.required => {
                    error!(feature = %spec.feature, error = %e, "required feature failed to start");
                    return Err(ServiceError::RequiredFailed {
                        feature: spec.feature,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(feature = %spec.feature, error = %e, "optional feature failed to start");
                }
            }
        }

        info!(alive = self.feature_names().len(), "service booted");
        Ok(())
    }

    /// Bring running features in line with a new plan: reload every
    /// planned feature, and stop features the plan no longer names.
    /// Dynamic features are left alone.
    #[instrument(skip(self, plan), fields(service = %self.name))]
    pub async fn apply(&self, plan: ServicePlan) -> ReconcileReport {
        let _guard = self.reload_lock.lock().await;
        self.set_drivers(plan.drivers);

        let mut report = ReconcileReport::default();
        let planned: HashSet<String> = plan.features.iter().map(|s| s.feature.clone()).collect();

        for spec in plan.features {
            let feature = spec.feature.clone();
            match self.reload_locked(spec).await {
                Ok(plan) => report.reloaded.push((feature, plan)),
                Err(e) => {
                    warn!(%feature, error = %e, "reload failed, previous configuration kept");
                    report.failed.push((feature, e.to_string()));
                }
            }
        }

        let stale: Vec<String> = {
            let dynamic = self.dynamic.lock().unwrap_or_else(|e| e.into_inner());
            self.feature_names()
                .into_iter()
                .filter(|name| !planned.contains(name) && !dynamic.contains(name))
                .collect()
        };
        for feature in stale {
            if self.remove_locked(&feature).await {
                report.removed.push(feature);
            }
        }

        info!(
            reloaded = report.reloaded.len(),
            failed = report.failed.len(),
            removed = report.removed.len(),
            "configuration applied"
        );
        report
    }

    /// Reload one feature through the decision table
    pub async fn reload_feature(&self, spec: FeatureSpec) -> Result<ReloadPlan, ServiceError> {
        let _guard = self.reload_lock.lock().await;
        self.reload_locked(spec).await
    }

    /// Register a feature whose driver the caller picks by name
    pub async fn add_dynamic_feature(
        &self,
        feature: &str,
        driver: &str,
        config: FeatureConfig,
        required: bool,
    ) -> Result<ReloadPlan, ServiceError> {
        let meta = self
            .drivers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(driver)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownDriver {
                feature: feature.to_string(),
                driver: driver.to_string(),
            })?;

        self.dynamic
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(feature.to_string());

        self.reload_feature(FeatureSpec {
            feature: feature.to_string(),
            driver: meta,
            config,
            required,
        })
        .await
    }

    /// Stop a feature and forget it
    pub async fn remove_feature(&self, feature: &str) -> bool {
        let _guard = self.reload_lock.lock().await;
        self.remove_locked(feature).await
    }

    /// Replace the feature's process even if nothing changed
    pub async fn restart_feature(&self, feature: &str) -> Result<(), ServiceError> {
        let _guard = self.reload_lock.lock().await;
        let spec = self
            .spec(feature)
            .ok_or_else(|| ServiceError::UnknownFeature(feature.to_string()))?;
        self.cold_reload(&spec).await
    }

    fn set_drivers(&self, drivers: HashMap<String, DriverMeta>) {
        *self.drivers.write().unwrap_or_else(|e| e.into_inner()) = drivers;
    }

    async fn reload_locked(&self, spec: FeatureSpec) -> Result<ReloadPlan, ServiceError> {
        if self.lifecycle.is_shutting_down() {
            return Err(ServiceError::ShuttingDown);
        }

        let known_good = self
            .specs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(spec.feature.clone(), spec.clone());

        let previous = self.get(&spec.feature);
        let plan = ReloadPlan::decide(previous.as_deref(), &spec);
        debug!(feature = %spec.feature, %plan, "reload decided");

        let result = match (plan, previous) {
            (ReloadPlan::Noop, _) => Ok(()),
            (ReloadPlan::Hot, Some(runtime)) => self.hot_reload(&runtime, &spec).await,
            _ => self.cold_reload(&spec).await,
        };

        if let Err(e) = result {
            // a surviving runtime still runs the last known-good spec
            if let Some(known_good) = known_good {
                if self.get(&spec.feature).is_some() {
                    debug!(feature = %spec.feature, "restoring last known-good configuration");
                    self.specs
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(spec.feature.clone(), known_good);
                }
            }
            return Err(e);
        }
        Ok(plan)
    }

    async fn remove_locked(&self, feature: &str) -> bool {
        self.specs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(feature);
        self.dynamic
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(feature);

        let Some(runtime) = self.get(feature) else {
            return false;
        };
        if !self.check_delete(feature, &runtime) {
            return false;
        }

        info!(%feature, driver = %runtime.meta().name, "removing feature");
        if let Err(e) = runtime.handle().shutdown(self.settings.cold_grace).await {
            warn!(%feature, error = %e, "driver did not exit cleanly");
        }
        true
    }

    /// Start a fresh process; it becomes current only once alive
    #[instrument(skip(self, spec), fields(feature = %spec.feature, driver = %spec.driver.name))]
    async fn cold_reload(&self, spec: &FeatureSpec) -> Result<(), ServiceError> {
        let executable = acquire(&spec.driver, &self.settings.driver_dir)?;
        let handle = DriverHandle::start(&spec.driver, &executable, &self.name, &self.lifecycle)?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let runtime = Arc::new(Runtime::new(spec, handle, generation));
        self.attach(&runtime);

        if let Err(e) = self.handshake(&runtime).await {
            runtime.set_state(FeatureState::Failed);
            if let Err(io) = runtime.handle().shutdown(self.settings.cold_grace).await {
                warn!(error = %io, "failed to stop unready driver");
            }
            return Err(e);
        }

        runtime.set_state(FeatureState::Alive);
        info!(pid = ?runtime.pid(), generation, "feature alive");

        if let Some(old) = self.set(runtime) {
            self.retire(old);
        }
        Ok(())
    }

    /// Resend options+start to the live process
    #[instrument(skip(self, runtime, spec), fields(feature = %spec.feature))]
    async fn hot_reload(&self, runtime: &Arc<Runtime>, spec: &FeatureSpec) -> Result<(), ServiceError> {
        let previous = runtime.set_config(spec.config.clone());
        runtime.set_state(FeatureState::Reloading);

        match self.handshake(runtime).await {
            Ok(()) => {
                runtime.set_state(FeatureState::Alive);
                info!(pid = ?runtime.pid(), "feature hot reloaded");
                Ok(())
            }
            Err(e) => {
                runtime.set_config(previous);
                runtime.set_state(FeatureState::Failed);
                Err(e)
            }
        }
    }

    /// Send options+start and wait for `state:alive` from the driver
    async fn handshake(&self, runtime: &Arc<Runtime>) -> Result<(), ServiceError> {
        let timeout = self.settings.readiness_timeout;
        let (tx, mut rx) = mpsc::channel::<bool>(1);
        let alive_tx = tx.clone();

        let token = self.dispatcher.add_expect(
            channel::STATE,
            subject::ALIVE,
            &runtime.meta().name,
            timeout,
            move |_origin, _message| async move {
                let _ = alive_tx.send(true).await;
            },
            move || async move {
                let _ = tx.send(false).await;
            },
        );

        if let Err(source) = runtime.send_handshake().await {
            self.dispatcher
                .cancel_expect(channel::STATE, subject::ALIVE, &runtime.meta().name, token);
            return Err(ServiceError::Handshake {
                feature: runtime.feature().to_string(),
                source,
            });
        }

        match rx.recv().await {
            Some(true) => Ok(()),
            _ => Err(ServiceError::NotReady {
                feature: runtime.feature().to_string(),
                timeout,
            }),
        }
    }

    /// Close a replaced runtime once the grace period has passed
    fn retire(&self, old: Arc<Runtime>) {
        let grace = self.settings.cold_grace;
        let lifecycle = self.lifecycle.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = lifecycle.cancelled() => {}
                _ = tokio::time::sleep(grace) => {}
            }
            debug!(feature = %old.feature(), pid = ?old.pid(), "closing replaced driver");
            if let Err(e) = old.handle().shutdown(grace).await {
                warn!(feature = %old.feature(), error = %e, "replaced driver did not exit cleanly");
            }
        });
    }

    /// Forward a runtime's stream into the shared inbox
    fn attach(&self, runtime: &Arc<Runtime>) {
        let Some(mut stream) = runtime.handle().take_stream() else {
            return;
        };
        let inbox = self.inbox_tx.clone();
        let lifecycle = self.lifecycle.clone();
        let runtime = runtime.clone();

        self.lifecycle.spawn(async move {
            while let Some(message) = stream.recv().await {
                let inbound = Inbound::Message(runtime.clone(), message);
                tokio::select! {
                    _ = lifecycle.cancelled() => return,
                    sent = inbox.send(inbound) => if sent.is_err() { return },
                }
            }
            tokio::select! {
                _ = lifecycle.cancelled() => {}
                _ = inbox.send(Inbound::Closed(runtime)) => {}
            }
        });
    }

    // ========================================================================
    // Multiplex loop and crash recovery
    // ========================================================================

    /// Serve until shutdown or a fatal error
    pub async fn run(self: &Arc<Self>) -> Result<(), ServiceError> {
        let mut inbox = self
            .inbox_rx
            .lock()
            .await
            .take()
            .ok_or(ServiceError::AlreadyRunning)?;
        let mut fatal = self
            .fatal_rx
            .lock()
            .await
            .take()
            .ok_or(ServiceError::AlreadyRunning)?;

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(service = %self.name, "service loop running");
        loop {
            tokio::select! {
                _ = self.lifecycle.cancelled() => {
                    info!(service = %self.name, "service loop stopping");
                    return Ok(());
                }
                Some(err) = fatal.recv() => {
                    error!(service = %self.name, error = %err, "fatal service error");
                    return Err(err);
                }
                Some(inbound) = inbox.recv() => self.handle_inbound(inbound),
                _ = ticker.tick() => {
                    debug!(features = self.features().len(), "poll");
                }
            }
        }
    }

    fn handle_inbound(self: &Arc<Self>, inbound: Inbound) {
        match inbound {
            Inbound::Message(origin, message) => {
                let dispatcher = self.dispatcher.clone();
                tokio::spawn(async move { dispatcher.dispatch(origin, message).await });
            }
            Inbound::Closed(runtime) => {
                if self.lifecycle.is_shutting_down() {
                    return;
                }
                if self.is_current(&runtime) && runtime.state() == FeatureState::Alive {
                    warn!(
                        feature = %runtime.feature(),
                        pid = ?runtime.pid(),
                        "driver exited while alive, recovering"
                    );
                    let service = self.clone();
                    tokio::spawn(async move { service.recover(runtime).await });
                } else {
                    debug!(feature = %runtime.feature(), pid = ?runtime.pid(), "driver stream closed");
                }
            }
        }
    }

    #[instrument(skip(self, crashed), fields(feature = %crashed.feature()))]
    async fn recover(&self, crashed: Arc<Runtime>) {
        crashed.set_state(FeatureState::Failed);
        self.recoveries.fetch_add(1, Ordering::SeqCst);

        let Some(spec) = self.spec(crashed.feature()) else {
            return;
        };
        let attempts = self.settings.recovery_attempts;
        let mut delay = self.settings.recovery_backoff;

        for attempt in 1..=attempts {
            if self.lifecycle.is_shutting_down() {
                return;
            }
            // a reconcile may have replaced the crashed runtime meanwhile
            if !self.is_current(&crashed) {
                debug!("crashed runtime already replaced");
                return;
            }

            match self.reload_feature(spec.clone()).await {
                Ok(_) => {
                    info!(attempt, "feature recovered");
                    return;
                }
                Err(e) if attempt < attempts => {
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "recovery attempt failed");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "last recovery attempt failed");
                }
            }
        }

        if spec.required {
            let _ = self.fatal_tx.send(ServiceError::RecoveryExhausted {
                feature: spec.feature,
                attempts,
            });
        } else {
            error!(attempts, "optional feature could not be recovered");
        }
    }

    // ========================================================================
    // Calls into features
    // ========================================================================

    fn live(&self, feature: &str) -> Result<Arc<Runtime>, RpcError> {
        match self.get(feature) {
            Some(runtime) if runtime.state() != FeatureState::Failed => Ok(runtime),
            _ => Err(RpcError::Unavailable(feature.to_string())),
        }
    }

    /// Call `feature.method` with a raw payload
    pub async fn call_raw(
        &self,
        feature: &str,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        let runtime = self.live(feature)?;
        self.caller
            .call_raw(runtime.as_ref(), feature, method, payload)
            .await
    }

    /// Call `feature.method` with typed parameters and result
    pub async fn call<P, R>(&self, feature: &str, method: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let runtime = self.live(feature)?;
        self.caller
            .call(runtime.as_ref(), feature, method, params)
            .await
    }

    /// Fire-and-forget call
    pub async fn call_no_wait<P>(&self, feature: &str, method: &str, params: &P) -> Result<(), RpcError>
    where
        P: Serialize + ?Sized,
    {
        let runtime = self.live(feature)?;
        self.caller
            .call_no_wait(runtime.as_ref(), feature, method, params)
            .await
    }

    /// Send `command:<name>` and wait for its result. `labels` carry the
    /// retry settings (`retry`, `timeout`, `backoff_ms`).
    pub async fn command(
        &self,
        feature: &str,
        name: &str,
        labels: Labels,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        let runtime = self.live(feature)?;
        let mut message = Message::new(channel::COMMAND, name).with_raw(payload);
        message.labels = labels;
        message.set_label(label::FEATURE, feature);
        self.caller.request(runtime.as_ref(), message).await
    }

    /// Push a message directly to one feature
    pub async fn send_message(&self, feature: &str, message: &Message) -> Result<(), ServiceError> {
        let runtime = self
            .get(feature)
            .ok_or_else(|| ServiceError::UnknownFeature(feature.to_string()))?;
        runtime
            .send_message(message)
            .await
            .map_err(|source| ServiceError::Handshake {
                feature: feature.to_string(),
                source,
            })
    }

    /// Round trip of `state:ping` / `state:pong`. Each ping carries its
    /// own nonce, so features sharing a driver never answer each other.
    pub async fn ping(&self, feature: &str) -> Result<Duration, ServiceError> {
        let runtime = self
            .get(feature)
            .ok_or_else(|| ServiceError::UnknownFeature(feature.to_string()))?;
        let timeout = self.settings.readiness_timeout;

        let nonce = self.next_ping.fetch_add(1, Ordering::SeqCst).to_string();
        let (tx, rx) = oneshot::channel();
        self.pings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(nonce.clone(), tx);

        let started = Instant::now();
        let ping =
            Message::new(channel::STATE, subject::PING).with_label(label::NONCE, nonce.as_str());
        if let Err(source) = runtime.send_message(&ping).await {
            self.forget_ping(&nonce);
            return Err(ServiceError::Handshake {
                feature: feature.to_string(),
                source,
            });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            _ => {
                self.forget_ping(&nonce);
                Err(ServiceError::NotReady {
                    feature: feature.to_string(),
                    timeout,
                })
            }
        }
    }

    fn forget_ping(&self, nonce: &str) {
        self.pings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(nonce);
    }

    fn answer_ping(&self, message: &Message) {
        let Some(nonce) = message.label(label::NONCE) else {
            debug!("pong without a nonce");
            return;
        };
        let waiter = self
            .pings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(nonce);
        match waiter {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => debug!(%nonce, "late pong"),
        }
    }

    /// Per-feature snapshot, including configured features that are down
    pub fn status(&self) -> ServiceStatus {
        let mut features: Vec<FeatureStatus> = {
            let running = self.features();
            let specs = self.specs.lock().unwrap_or_else(|e| e.into_inner());

            let mut names: HashSet<&String> = running.keys().collect();
            names.extend(specs.keys());

            names
                .into_iter()
                .map(|name| match running.get(name) {
                    Some(runtime) => runtime.status(),
                    None => {
                        let spec = &specs[name];
                        FeatureStatus {
                            feature: name.clone(),
                            driver: spec.driver.name.clone(),
                            state: FeatureState::Failed,
                            pid: None,
                            generation: 0,
                            started_at: None,
                            fingerprint: spec.config.fingerprint(),
                        }
                    }
                })
                .collect()
        };
        features.sort_by(|a, b| a.feature.cmp(&b.feature));

        ServiceStatus {
            service: self.name.clone(),
            instance: self.instance,
            recoveries: self.recoveries(),
            features,
        }
    }

    /// Stop the loop, close every driver, and wait for all fetch loops
    pub async fn shutdown(&self) {
        info!(service = %self.name, "shutting down");
        self.lifecycle.shutdown();

        let runtimes: Vec<Arc<Runtime>> = self.features().drain().map(|(_, rt)| rt).collect();
        let grace = self.settings.cold_grace;
        let mut stops = JoinSet::new();
        for runtime in runtimes {
            stops.spawn(async move {
                if let Err(e) = runtime.handle().shutdown(grace).await {
                    warn!(feature = %runtime.feature(), error = %e, "driver did not exit cleanly");
                }
            });
        }
        while stops.join_next().await.is_some() {}

        self.lifecycle.wait().await;
        info!(service = %self.name, "shutdown complete");
    }

    /// Relay a driver's own `rpc:call` to the target feature and send the
    /// result back to the origin
    async fn relay(&self, origin: Arc<Runtime>, message: Message) {
        let rpc_id = message
            .label(label::RPC_ID)
            .unwrap_or(NO_REPLY_ID)
            .to_string();
        let target = message.label(label::FEATURE).unwrap_or_default().to_string();
        let method = message.label(label::METHOD).unwrap_or_default().to_string();

        let runtime = match self.live(&target) {
            Ok(runtime) => runtime,
            Err(e) => {
                self.answer_relay(&origin, &rpc_id, &message.labels, Err(e.into()))
                    .await;
                return;
            }
        };

        if rpc_id == NO_REPLY_ID {
            let mut forwarded = message.detached();
            forwarded.set_label(label::CALLER, origin.feature());
            if let Err(e) = runtime.send_message(&forwarded).await {
                warn!(from = %origin.feature(), to = %target, error = %e, "failed to forward call");
            }
            return;
        }

        let payload = message.payload_bytes().unwrap_or_default();
        let result = self
            .caller
            .call_raw_as(runtime.as_ref(), origin.feature(), &target, &method, payload)
            .await
            .map_err(HandlerError::from);
        self.answer_relay(&origin, &rpc_id, &message.labels, result)
            .await;
    }

    async fn answer_relay(
        &self,
        origin: &Arc<Runtime>,
        rpc_id: &str,
        call: &Labels,
        result: Result<Vec<u8>, HandlerError>,
    ) {
        if rpc_id == NO_REPLY_ID {
            return;
        }
        let reply = return_frame(rpc_id, call, result);
        if let Err(e) = origin.send_message(&reply).await {
            warn!(feature = %origin.feature(), error = %e, "failed to return relayed call");
        }
    }
}

/// Responders every service carries: RPC returns, pongs, relayed calls
/// and voluntary restarts
fn install_responders(dispatcher: &Dispatcher<Runtime>, service: Weak<Service>) {
    let weak = service.clone();
    dispatcher.add_responder(channel::RPC, subject::RETURN, move |_origin, message| {
        let weak = weak.clone();
        async move {
            if let Some(service) = weak.upgrade() {
                service.caller.handle_return(&message);
            }
        }
    });

    let weak = service.clone();
    dispatcher.add_responder(channel::STATE, subject::PONG, move |_origin, message| {
        let weak = weak.clone();
        async move {
            if let Some(service) = weak.upgrade() {
                service.answer_ping(&message);
            }
        }
    });

    let weak = service.clone();
    dispatcher.add_responder(channel::RPC, subject::CALL, move |origin, message| {
        let weak = weak.clone();
        async move {
            if let Some(service) = weak.upgrade() {
                service.relay(origin, message).await;
            }
        }
    });

    dispatcher.add_responder(channel::STATE, subject::COLD, move |origin: Arc<Runtime>, _message| {
        let weak = service.clone();
        async move {
            let Some(service) = weak.upgrade() else {
                return;
            };
            if !service.is_current(&origin) {
                return;
            }
            info!(feature = %origin.feature(), "driver requested cold restart");
            if let Err(e) = service.restart_feature(origin.feature()).await {
                warn!(feature = %origin.feature(), error = %e, "cold restart failed");
            }
        }
    });
}
