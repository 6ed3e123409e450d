//! Per-step timeout/retry configuration and its hierarchical overrides.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::Duration;

/// Time budget for one leaf call
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Timeout {
    #[default]
    Unbounded,
    After(Duration),
}

impl Timeout {
    pub fn secs(secs: u64) -> Self {
        Timeout::After(Duration::from_secs(secs))
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            Timeout::Unbounded => None,
            Timeout::After(d) => Some(*d),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::After(d)
    }
}

impl Serialize for Timeout {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Timeout::Unbounded => serializer.serialize_str("none"),
            Timeout::After(d) => serializer.serialize_f64(d.as_secs_f64()),
        }
    }
}

impl<'de> Deserialize<'de> for Timeout {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(f64),
            Keyword(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) if secs.is_finite() && secs > 0.0 => Duration::try_from_secs_f64(secs)
                .map(Timeout::After)
                .map_err(|e| serde::de::Error::custom(format!("timeout of {} seconds: {}", secs, e))),
            Raw::Seconds(secs) => Err(serde::de::Error::custom(format!(
                "timeout must be a positive number of seconds, got {}",
                secs
            ))),
            Raw::Keyword(word) if word.eq_ignore_ascii_case("none") => Ok(Timeout::Unbounded),
            Raw::Keyword(word) => Err(serde::de::Error::custom(format!(
                "timeout must be a number of seconds or \"none\", got {:?}",
                word
            ))),
        }
    }
}

/// Resolved configuration of one step.
///
/// The `Default` is the engine default: no timeout, no retry, no breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    pub timeout: Timeout,
    pub retries: u32,
    pub breakpoint: bool,
}

impl StepConfig {
    /// Apply a caller override on top of this config, field by field
    pub fn with_override(&self, over: &StepOverride) -> StepConfig {
        StepConfig {
            timeout: over.timeout.unwrap_or(self.timeout),
            retries: over.retries.unwrap_or(self.retries),
            breakpoint: over.breakpoint.unwrap_or(self.breakpoint),
        }
    }

    pub fn validate(&self, step: &str) -> ConfigResult<()> {
        if let Timeout::After(d) = self.timeout {
            if d.is_zero() {
                return Err(ConfigError::InvalidTimeout {
                    step: step.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Caller-supplied override for one step name.
///
/// `config` holds the overrides for the steps nested under this one (the
/// microsteps of a macrostep).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StepOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Timeout>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakpoint: Option<bool>,
    #[serde(skip_serializing_if = "ConfigOverrides::is_empty")]
    pub config: ConfigOverrides,
}

impl StepOverride {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn breakpoint(mut self) -> Self {
        self.breakpoint = Some(true);
        self
    }

    /// Override for a step nested under this one
    pub fn child(mut self, name: impl Into<String>, over: StepOverride) -> Self {
        self.config.insert(name, over);
        self
    }
}

/// Overrides keyed by step name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigOverrides {
    steps: BTreeMap<String, StepOverride>,
}

impl ConfigOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, over: StepOverride) -> Self {
        self.insert(name, over);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, over: StepOverride) {
        self.steps.insert(name.into(), over);
    }

    pub fn get(&self, name: &str) -> Option<&StepOverride> {
        self.steps.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(|s| s.as_str())
    }

    /// Resolve the config of `name`: `declared` overridden by this map
    pub fn resolve(&self, name: &str, declared: &StepConfig) -> StepConfig {
        match self.get(name) {
            Some(over) => declared.with_override(over),
            None => *declared,
        }
    }

    /// Overrides for the steps nested under `name`
    pub fn nested(&self, name: &str) -> ConfigOverrides {
        self.get(name).map(|o| o.config.clone()).unwrap_or_default()
    }
}
