//! Build-time errors.
//!
//! Every error here is raised while a workflow is being assembled, before
//! any node is touched. Node failures during a run are never errors: they end
//! up in the `ko` set of the report.

/// Result type for workflow construction.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Invalid step specification, configuration or registry.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A leaf names a step the registry does not know.
    #[error("unknown {kind} `{name}` referenced in {scope}")]
    UnknownStep {
        kind: &'static str,
        name: String,
        scope: String,
    },

    /// A caller override is keyed by a name that no step in scope uses.
    #[error("override `{name}` in {scope} does not match any step")]
    UnknownOverride { name: String, scope: String },

    /// A fallback group without alternatives.
    #[error("fallback group in {scope} has no alternatives")]
    EmptyFallback { scope: String },

    /// A leaf with an empty name.
    #[error("leaf with an empty name in {scope}")]
    EmptyName { scope: String },

    /// Zero or otherwise unusable timeout.
    #[error("invalid timeout for `{step}`: {reason}")]
    InvalidTimeout { step: String, reason: String },

    /// A microstep rejected the arguments it was given.
    #[error("invalid arguments for `{step}`: {reason}")]
    InvalidArgs { step: String, reason: String },

    /// Two handlers registered under the same name.
    #[error("{kind} `{name}` is registered twice")]
    Duplicate { kind: &'static str, name: String },
}
