//! Feature and driver identity types.
//!
//! A feature is a named slot that a service resolves to exactly one
//! driver process at a time. These types describe what should be running;
//! [`crate::service::Runtime`] describes what is running.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Where a driver executable comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverSource {
    /// Short symbolic name looked up in the trusted driver directory
    Builtin(String),

    /// Explicit path to an executable
    Path(PathBuf),
}

impl fmt::Display for DriverSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Builtin(name) => write!(f, "builtin:{}", name),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Driver metadata resolved from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverMeta {
    /// Driver name (key in the drivers table)
    pub name: String,

    /// Driver type, e.g. "cache" or "webhook"
    pub kind: String,

    /// Executable identity
    pub source: DriverSource,

    /// Extra process arguments, marshalled by `DriverHandle::prepare`
    #[serde(default)]
    pub args: Vec<Value>,
}

impl DriverMeta {
    /// Whether two metas describe the same process image and argv.
    ///
    /// A difference here always requires a cold reload.
    pub fn same_identity(&self, other: &DriverMeta) -> bool {
        self == other
    }
}

/// Configuration delivered to a driver through `command:options`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    #[serde(default)]
    pub data: Value,

    #[serde(default, rename = "dynamicData")]
    pub dynamic_data: Value,
}

impl FeatureConfig {
    pub fn new(data: Value, dynamic_data: Value) -> Self {
        Self { data, dynamic_data }
    }

    /// SHA256 over the canonical JSON form, hex encoded
    pub fn fingerprint(&self) -> String {
        // serde_json maps are ordered, so equal content gives equal bytes
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// Everything needed to bring one feature up
#[derive(Debug, Clone)]
pub struct FeatureSpec {
    pub feature: String,
    pub driver: DriverMeta,
    pub config: FeatureConfig,
    pub required: bool,
}

/// Lifecycle state of a feature's runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureState {
    /// Process spawned, waiting for the alive handshake
    Loading,

    /// Hot reload in progress on a live process
    Reloading,

    /// Handshake observed, serving traffic
    Alive,

    /// Handshake missed, process crashed, or reload rolled back
    Failed,
}

impl FeatureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Reloading => "reloading",
            Self::Alive => "alive",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for FeatureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(source: DriverSource) -> DriverMeta {
        DriverMeta {
            name: "cache".to_string(),
            kind: "cache".to_string(),
            source,
            args: vec![json!(64)],
        }
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = FeatureConfig::new(json!({"a": 1, "b": 2}), Value::Null);
        let b = FeatureConfig::new(json!({"b": 2, "a": 1}), Value::Null);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_fingerprint_sees_dynamic_data() {
        let a = FeatureConfig::new(json!({"a": 1}), json!({"token": "x"}));
        let b = FeatureConfig::new(json!({"a": 1}), json!({"token": "y"}));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_options_payload_shape() {
        let config = FeatureConfig::new(json!({"size": 3}), json!([1]));
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value, json!({"data": {"size": 3}, "dynamicData": [1]}));
    }

    #[test]
    fn test_identity() {
        let a = meta(DriverSource::Builtin("conduit-cache".to_string()));
        let mut b = a.clone();
        assert!(a.same_identity(&b));

        b.args.push(json!("lru"));
        assert!(!a.same_identity(&b));

        let c = meta(DriverSource::Path(PathBuf::from("/opt/cache")));
        assert!(!a.same_identity(&c));
    }
}
