//! The record of one running feature.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::dispatch::Endpoint;
use crate::codec::{CodecError, FrameSink};
use crate::domain::message::{channel, subject};
use crate::domain::{DriverMeta, FeatureConfig, FeatureSpec, FeatureState, Message};
use crate::driver::DriverHandle;

/// A feature bound to one driver process.
///
/// Configuration and state change in place on hot reload; a cold reload
/// replaces the whole record.
pub struct Runtime {
    feature: String,
    meta: DriverMeta,
    config: RwLock<FeatureConfig>,
    state: RwLock<FeatureState>,
    handle: DriverHandle,
    generation: u64,
    started_at: DateTime<Utc>,
}

/// Point-in-time view of a feature
#[derive(Debug, Clone, Serialize)]
pub struct FeatureStatus {
    pub feature: String,
    pub driver: String,
    pub state: FeatureState,
    pub pid: Option<u32>,
    pub generation: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub fingerprint: String,
}

impl Runtime {
    pub fn new(spec: &FeatureSpec, handle: DriverHandle, generation: u64) -> Self {
        Self {
            feature: spec.feature.clone(),
            meta: spec.driver.clone(),
            config: RwLock::new(spec.config.clone()),
            state: RwLock::new(FeatureState::Loading),
            handle,
            generation,
            started_at: Utc::now(),
        }
    }

    pub fn feature(&self) -> &str {
        &self.feature
    }

    pub fn meta(&self) -> &DriverMeta {
        &self.meta
    }

    pub fn config(&self) -> FeatureConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the stored configuration, returning the previous one
    pub fn set_config(&self, config: FeatureConfig) -> FeatureConfig {
        let mut guard = self.config.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, config)
    }

    pub fn state(&self) -> FeatureState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, state: FeatureState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    /// Spawn counter value this runtime was created with
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn handle(&self) -> &DriverHandle {
        &self.handle
    }

    /// Push one message straight to this feature's process
    pub async fn send_message(&self, message: &Message) -> Result<(), CodecError> {
        self.handle.send_message(message).await
    }

    /// Send `command:options` with the stored configuration, then
    /// `command:start`
    pub async fn send_handshake(&self) -> Result<(), CodecError> {
        let options = Message::new(channel::COMMAND, subject::OPTIONS).with_json(&self.config())?;
        self.send_message(&options).await?;
        self.send_message(&Message::new(channel::COMMAND, subject::START))
            .await
    }

    pub fn status(&self) -> FeatureStatus {
        FeatureStatus {
            feature: self.feature.clone(),
            driver: self.meta.name.clone(),
            state: self.state(),
            pid: self.pid(),
            generation: self.generation,
            started_at: Some(self.started_at),
            fingerprint: self.config().fingerprint(),
        }
    }
}

#[async_trait]
impl FrameSink for Runtime {
    async fn send_frame(&self, message: &Message) -> Result<(), CodecError> {
        self.send_message(message).await
    }
}

impl Endpoint for Runtime {
    fn feature(&self) -> &str {
        &self.feature
    }

    fn driver(&self) -> &str {
        &self.meta.name
    }
}
