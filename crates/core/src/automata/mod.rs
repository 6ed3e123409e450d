// Recursive Workflow -> Macrostep -> Microstep execution engine

mod context;
mod leaf;
pub mod macrostep;
mod manager;
pub mod microstep;
mod plan;
pub mod registry;
pub mod workflow;

#[cfg(test)]
mod tests;

pub use context::{Raiser, TaskContext};
pub use macrostep::Macrostep;
pub use microstep::Microstep;
pub use registry::Registry;
pub use workflow::{Workflow, WorkflowBuilder, WorkflowReport};
