use super::macrostep::Macrostep;
use super::microstep::Microstep;
use crate::error::{ConfigError, ConfigResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Name-to-handler tables consulted when a workflow is built.
///
/// Leaves of a workflow resolve against the macrosteps, leaves of a
/// macrostep against the microsteps.
#[derive(Clone, Default)]
pub struct Registry {
    microsteps: HashMap<String, Arc<dyn Microstep>>,
    macrosteps: HashMap<String, Macrostep>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a microstep under its own name
    pub fn register_microstep<M>(&mut self, microstep: M) -> ConfigResult<()>
    where
        M: Microstep + 'static,
    {
        self.register_microstep_arc(Arc::new(microstep))
    }

    pub fn register_microstep_arc(&mut self, microstep: Arc<dyn Microstep>) -> ConfigResult<()> {
        let name = microstep.name().to_string();
        if self.microsteps.contains_key(&name) {
            return Err(ConfigError::Duplicate {
                kind: "microstep",
                name,
            });
        }
        tracing::debug!("Registered microstep {}", name);
        self.microsteps.insert(name, microstep);
        Ok(())
    }

    pub fn register_macrostep(&mut self, macrostep: Macrostep) -> ConfigResult<()> {
        if self.macrosteps.contains_key(&macrostep.name) {
            return Err(ConfigError::Duplicate {
                kind: "macrostep",
                name: macrostep.name,
            });
        }
        tracing::debug!("Registered macrostep {}", macrostep.name);
        self.macrosteps.insert(macrostep.name.clone(), macrostep);
        Ok(())
    }

    /// Builder-style registration, for tests and small programs
    pub fn with_microstep<M>(mut self, microstep: M) -> ConfigResult<Self>
    where
        M: Microstep + 'static,
    {
        self.register_microstep(microstep)?;
        Ok(self)
    }

    pub fn with_macrostep(mut self, macrostep: Macrostep) -> ConfigResult<Self> {
        self.register_macrostep(macrostep)?;
        Ok(self)
    }

    pub fn microstep(&self, name: &str) -> Option<Arc<dyn Microstep>> {
        self.microsteps.get(name).cloned()
    }

    pub fn macrostep(&self, name: &str) -> Option<&Macrostep> {
        self.macrosteps.get(name)
    }

    /// Sorted names of the registered microsteps
    pub fn microstep_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.microsteps.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Sorted names of the registered macrosteps
    pub fn macrostep_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.macrosteps.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}
