//! Step specification grammar.
//!
//! A [`Sequence`] is run left to right, each step consuming the survivors of
//! the previous one (AND-composition). A [`Step::Fallback`] group tries its
//! alternatives in order, each over the nodes its predecessor failed
//! (OR-composition). Groups nest freely.

use crate::config::{StepConfig, Timeout};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ordered list of steps
pub type Sequence = Vec<Step>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// A single named step
    Leaf(LeafStep),
    /// Alternatives tried in order until the nodes are resolved
    Fallback { alternatives: Vec<Step> },
}

impl Step {
    /// Leaf with the engine default config
    pub fn leaf(name: impl Into<String>) -> Self {
        Step::Leaf(LeafStep::new(name))
    }

    pub fn fallback(alternatives: impl IntoIterator<Item = Step>) -> Self {
        Step::Fallback {
            alternatives: alternatives.into_iter().collect(),
        }
    }

    /// Names of every leaf under this step, in declaration order
    pub fn leaf_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Step::Leaf(leaf) => names.push(leaf.name.as_str()),
            Step::Fallback { alternatives } => {
                for alt in alternatives {
                    alt.collect_names(names);
                }
            }
        }
    }
}

impl From<LeafStep> for Step {
    fn from(leaf: LeafStep) -> Self {
        Step::Leaf(leaf)
    }
}

/// Named step with its arguments and declared config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafStep {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub config: StepConfig,
}

impl LeafStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            config: StepConfig::default(),
        }
    }

    pub fn arg(mut self, arg: impl Into<serde_json::Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Timeout::After(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    pub fn breakpoint(mut self) -> Self {
        self.config.breakpoint = true;
        self
    }
}

/// Names of every leaf in a sequence
pub fn sequence_leaf_names(sequence: &[Step]) -> Vec<&str> {
    sequence.iter().flat_map(|s| s.leaf_names()).collect()
}
