//! conduit - event-driven orchestration daemon
//!
//! A daemon supervises a set of *features*, each served by a *driver*
//! subprocess. Daemon and drivers exchange framed messages over the
//! driver's stdin/stdout; the driver logs to fd 3.
//!
//! # Architecture
//!
//! - Every exchange is a [`Message`] on a channel (`command`, `rpc`,
//!   `state`) with a subject, string labels and a payload
//! - Requests are correlated by an `rpcID` label; replies come back as
//!   `rpc:return` frames
//! - A feature is brought in line with its config by a hot reload (same
//!   process, new options) or a cold reload (new process)
//! - Drivers that exit unexpectedly are restarted with backoff
//!
//! # Modules
//!
//! - `codec`: framed pipe codec
//! - `rpc`: call/return correlation and method dispatch
//! - `driver`: subprocess handle, command retry, driver-side SDK
//! - `service`: feature runtimes, reload, multiplex loop, recovery
//! - `config`: YAML config and file watcher
//! - `cli`: command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Validate drivers without starting them
//! conduit check --config .conduit/config.yaml
//!
//! # Serve until interrupted, reloading on config edits
//! conduit run
//! ```

pub mod cli;
pub mod codec;
pub mod config;
pub mod domain;
pub mod driver;
pub mod lifecycle;
pub mod rpc;
pub mod service;

// Re-export main types at crate root for convenience
pub use codec::{CodecError, FrameReader, FrameSink, FrameWriter};
pub use domain::{DriverMeta, DriverSource, FeatureConfig, FeatureSpec, FeatureState, Message};
pub use driver::{Driver, DriverContext, DriverError, DriverHandle, RetryPolicy};
pub use lifecycle::Lifecycle;
pub use rpc::{HandlerError, RpcCaller, RpcError, RpcProvider};
pub use service::{ReloadPlan, Service, ServiceError, ServicePlan, ServiceSettings, ServiceStatus};
