//! Domain types for the conduit daemon.
//!
//! This module contains the core data structures:
//! - Message: the envelope exchanged with driver processes
//! - Feature: driver identity, feature configuration and lifecycle state

pub mod feature;
pub mod message;

// Re-export commonly used types
pub use feature::{DriverMeta, DriverSource, FeatureConfig, FeatureSpec, FeatureState};
pub use message::{Labels, Message, Payload, Reply};
