use anyhow::{Context, Result};
use nodeflow_core::events::EventLog;
use nodeflow_core::microsteps::{CommandMicrostep, NoopMicrostep};
use nodeflow_core::{ConfigOverrides, Macrostep, Node, NodeSet, Registry, Sequence, Workflow};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Deployment description loaded from TOML
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeploymentConfig {
    /// Workflow name, first segment of every step path
    pub name: String,

    #[serde(default)]
    pub nodes: Vec<NodeEntry>,

    #[serde(default)]
    pub microsteps: BTreeMap<String, MicrostepConfig>,

    #[serde(default)]
    pub macrosteps: Vec<Macrostep>,

    pub workflow: WorkflowConfig,

    #[serde(default)]
    pub overrides: ConfigOverrides,
}

/// A node given either as a bare hostname or as a table
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NodeEntry {
    Hostname(String),
    Node(Node),
}

impl From<NodeEntry> for Node {
    fn from(entry: NodeEntry) -> Self {
        match entry {
            NodeEntry::Hostname(hostname) => Node::new(hostname),
            NodeEntry::Node(node) => node,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MicrostepConfig {
    Command {
        command: String,
        #[serde(default = "default_parallelism")]
        parallelism: usize,
    },
    Noop,
}

fn default_parallelism() -> usize {
    CommandMicrostep::DEFAULT_PARALLELISM
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    /// Sequence of macrostep leaves
    pub tasks: Sequence,
}

impl DeploymentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse configuration file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Nodes declared in the file
    pub fn node_set(&self) -> NodeSet {
        self.nodes.iter().cloned().map(Node::from).collect()
    }

    /// Registry of the declared microsteps and macrosteps
    pub fn registry(&self) -> Result<Registry> {
        let mut registry = Registry::new();

        for (name, microstep) in &self.microsteps {
            match microstep {
                MicrostepConfig::Command {
                    command,
                    parallelism,
                } => registry.register_microstep(
                    CommandMicrostep::new(name.clone(), command.clone()).with_parallelism(*parallelism),
                )?,
                MicrostepConfig::Noop => registry.register_microstep(NoopMicrostep::named(name.clone()))?,
            }
        }

        for macrostep in &self.macrosteps {
            registry.register_macrostep(macrostep.clone())?;
        }

        Ok(registry)
    }

    /// Build and validate the workflow over `nodes`
    pub fn build(&self, nodes: NodeSet, event_log: Option<Arc<dyn EventLog>>) -> Result<Workflow> {
        let mut builder = Workflow::builder(self.name.clone())
            .nodes(nodes)
            .tasks(self.workflow.tasks.clone())
            .registry(self.registry()?)
            .overrides(self.overrides.clone());

        if let Some(event_log) = event_log {
            builder = builder.event_log(event_log);
        }

        builder
            .build()
            .with_context(|| format!("Invalid workflow {}", self.name))
    }
}

/// Read a node list: one hostname per line, blank lines and `#` comments
/// ignored
pub fn read_nodes_file(path: &Path) -> Result<NodeSet> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read node list {}", path.display()))?;
    Ok(parse_nodes(&content))
}

fn parse_nodes(content: &str) -> NodeSet {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(Node::new)
        .collect()
}
