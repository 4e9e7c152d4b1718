//! Reload decision for one feature.

use std::fmt;

use super::runtime::Runtime;
use crate::domain::{DriverMeta, FeatureConfig, FeatureSpec, FeatureState};

/// How to bring a feature in line with its configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadPlan {
    /// Identity and configuration unchanged
    Noop,

    /// Same process, new configuration
    Hot,

    /// New process
    Cold,
}

impl ReloadPlan {
    /// Decide against the feature's current runtime, if any
    pub fn decide(previous: Option<&Runtime>, spec: &FeatureSpec) -> Self {
        match previous {
            Some(runtime) => Self::decide_parts(
                Some((runtime.meta(), &runtime.config(), runtime.state())),
                &spec.driver,
                &spec.config,
            ),
            None => Self::Cold,
        }
    }

    /// Decision table:
    ///
    /// | previous | identity | content | plan |
    /// |---|---|---|---|
    /// | none | | | cold |
    /// | failed | | | cold |
    /// | present | changed | | cold |
    /// | present | same | changed | hot |
    /// | present | same | same | noop |
    pub fn decide_parts(
        previous: Option<(&DriverMeta, &FeatureConfig, FeatureState)>,
        meta: &DriverMeta,
        config: &FeatureConfig,
    ) -> Self {
        let Some((prev_meta, prev_config, prev_state)) = previous else {
            return Self::Cold;
        };

        if prev_state == FeatureState::Failed || !prev_meta.same_identity(meta) {
            Self::Cold
        } else if prev_config.fingerprint() != config.fingerprint() {
            Self::Hot
        } else {
            Self::Noop
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Hot => "hot",
            Self::Cold => "cold",
        }
    }
}

impl fmt::Display for ReloadPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
