use crate::node::NodeSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Why a node ended up in the ko set of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The leaf call returned `false` for the nodes it did not resolve
    StepFailed,
    /// The leaf call returned an error
    Error { message: String },
    /// The leaf call did not finish in time
    TimedOut { after_secs: f64 },
    /// The leaf reported the node as failed while still running
    Raised {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// The run was cancelled before the node was resolved
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::StepFailed => write!(f, "step failed"),
            FailureReason::Error { message } => write!(f, "error: {}", message),
            FailureReason::TimedOut { after_secs } => write!(f, "timed out after {}s", after_secs),
            FailureReason::Raised { message: None } => write!(f, "reported failed"),
            FailureReason::Raised { message: Some(message) } => write!(f, "reported failed: {}", message),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Current state of one node within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Running { step: String },
    Ok { step: String },
    Failed { step: String, reason: FailureReason },
}

/// A failed node with the step that failed it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub step: String,
    pub reason: FailureReason,
}

/// Live per-node status of a run, shared between the engine and observers
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    states: Arc<Mutex<HashMap<String, NodeState>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register nodes as pending
    pub fn register(&self, nodes: &NodeSet) {
        let mut states = self.states.lock().unwrap();
        for node in nodes {
            states.insert(node.hostname.clone(), NodeState::Pending);
        }
    }

    pub fn running(&self, nodes: &NodeSet, step: &str) {
        self.set_all(nodes, || NodeState::Running {
            step: step.to_string(),
        });
    }

    pub fn succeeded(&self, nodes: &NodeSet, step: &str) {
        self.set_all(nodes, || NodeState::Ok {
            step: step.to_string(),
        });
    }

    pub fn failed(&self, nodes: &NodeSet, step: &str, reason: FailureReason) {
        self.set_all(nodes, || NodeState::Failed {
            step: step.to_string(),
            reason: reason.clone(),
        });
    }

    /// Get the state of a node
    pub fn get(&self, hostname: &str) -> Option<NodeState> {
        self.states.lock().unwrap().get(hostname).cloned()
    }

    /// Sorted snapshot of every node's state
    pub fn snapshot(&self) -> BTreeMap<String, NodeState> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .map(|(host, state)| (host.clone(), state.clone()))
            .collect()
    }

    /// Recorded failure of each node in `nodes`.
    ///
    /// A node without a recorded failure gets `default`.
    pub fn failures(&self, nodes: &NodeSet, default: &NodeFailure) -> BTreeMap<String, NodeFailure> {
        let states = self.states.lock().unwrap();
        nodes
            .iter()
            .map(|node| {
                let failure = match states.get(&node.hostname) {
                    Some(NodeState::Failed { step, reason }) => NodeFailure {
                        step: step.clone(),
                        reason: reason.clone(),
                    },
                    _ => default.clone(),
                };
                (node.hostname.clone(), failure)
            })
            .collect()
    }

    /// Number of nodes in each state: (pending, running, ok, failed)
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let states = self.states.lock().unwrap();
        states.values().fold((0, 0, 0, 0), |(p, r, o, f), state| match state {
            NodeState::Pending => (p + 1, r, o, f),
            NodeState::Running { .. } => (p, r + 1, o, f),
            NodeState::Ok { .. } => (p, r, o + 1, f),
            NodeState::Failed { .. } => (p, r, o, f + 1),
        })
    }

    fn set_all<F>(&self, nodes: &NodeSet, state: F)
    where
        F: Fn() -> NodeState,
    {
        let mut states = self.states.lock().unwrap();
        for node in nodes {
            states.insert(node.hostname.clone(), state());
        }
    }
}
