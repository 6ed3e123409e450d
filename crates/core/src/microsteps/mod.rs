// Built-in microsteps

pub mod command;

pub use command::CommandMicrostep;

use crate::automata::{Microstep, TaskContext};
use async_trait::async_trait;

/// Microstep that succeeds on every node without doing anything
pub struct NoopMicrostep {
    name: String,
}

impl NoopMicrostep {
    pub fn new() -> Self {
        Self::named("noop")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for NoopMicrostep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Microstep for NoopMicrostep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<bool> {
        tracing::debug!("{}: nothing to do for {}", ctx.step(), ctx.nodes());
        Ok(true)
    }
}
