// Core types and the automata engine for nodeflow cluster deployments

pub mod automata;
pub mod config;
pub mod error;
pub mod events;
pub mod microsteps;
pub mod node;
pub mod status;
pub mod step;
pub mod storage;
pub mod types;

pub use automata::{Macrostep, Microstep, Raiser, Registry, TaskContext, Workflow, WorkflowBuilder, WorkflowReport};
pub use config::{ConfigOverrides, StepConfig, StepOverride, Timeout};
pub use error::{ConfigError, ConfigResult};
pub use node::{Node, NodeSet};
pub use status::{FailureReason, NodeFailure, NodeState, StatusBoard};
pub use step::{LeafStep, Sequence, Step};
pub use types::*;
