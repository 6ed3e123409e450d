use super::context::RunContext;
use super::manager::TaskManager;
use super::plan::{compile_workflow, PlannedStep};
use super::registry::Registry;
use crate::config::ConfigOverrides;
use crate::error::{ConfigError, ConfigResult};
use crate::events::{EventLog, EventType, MemoryEventLog};
use crate::node::NodeSet;
use crate::status::{FailureReason, NodeFailure, StatusBoard};
use crate::step::Step;
use crate::types::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Final result of a workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub run_id: RunId,
    pub workflow: String,
    /// Nodes that passed every step
    pub ok: NodeSet,
    pub ko: NodeSet,
    /// Failing step and reason of every ko node
    pub failures: BTreeMap<String, NodeFailure>,
    /// Step path of the breakpoint that stopped the run, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakpoint: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl WorkflowReport {
    pub fn is_success(&self) -> bool {
        self.ko.is_empty()
    }
}

/// Builder for a [`Workflow`]
#[derive(Default)]
pub struct WorkflowBuilder {
    name: String,
    nodes: NodeSet,
    tasks: Vec<Step>,
    registry: Registry,
    overrides: ConfigOverrides,
    event_log: Option<Arc<dyn EventLog>>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn nodes(mut self, nodes: impl Into<NodeSet>) -> Self {
        self.nodes = nodes.into();
        self
    }

    /// Sequence of macrostep leaves
    pub fn tasks(mut self, tasks: impl IntoIterator<Item = Step>) -> Self {
        self.tasks = tasks.into_iter().collect();
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Where run events go; in memory when unset
    pub fn event_log(mut self, event_log: Arc<dyn EventLog>) -> Self {
        self.event_log = Some(event_log);
        self
    }

    /// Resolve and validate everything. No node is touched.
    pub fn build(self) -> ConfigResult<Workflow> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName {
                scope: "workflow".to_string(),
            });
        }

        let plan = compile_workflow(&self.name, &self.tasks, &self.registry, &self.overrides)?;
        tracing::debug!("Compiled workflow {} with {} steps", self.name, plan.len());

        Ok(Workflow {
            name: self.name,
            run_id: RunId::new(),
            nodes: self.nodes,
            plan,
            events: self
                .event_log
                .unwrap_or_else(|| Arc::new(MemoryEventLog::new())),
            board: StatusBoard::new(),
            cancel: CancellationToken::new(),
        })
    }
}

/// A validated workflow, ready to run once over its nodes
pub struct Workflow {
    name: String,
    run_id: RunId,
    nodes: NodeSet,
    plan: Vec<PlannedStep>,
    events: Arc<dyn EventLog>,
    board: StatusBoard,
    cancel: CancellationToken,
}

impl Workflow {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &NodeSet {
        &self.nodes
    }

    /// Live per-node state, readable while the run is in progress
    pub fn status(&self) -> StatusBoard {
        self.board.clone()
    }

    /// Token that cancels the run when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run the workflow to completion.
    ///
    /// Node failures never surface as errors: every input node ends up in
    /// exactly one of `ok` or `ko` of the report.
    pub async fn start(self) -> WorkflowReport {
        let started_at = Utc::now();
        let clock = std::time::Instant::now();

        tracing::info!(
            "Starting workflow {} (run {}) on {} nodes: {}",
            self.name,
            self.run_id,
            self.nodes.len(),
            self.nodes
        );

        self.board.register(&self.nodes);
        let run = RunContext::new(
            self.run_id,
            self.events.clone(),
            self.board.clone(),
            self.cancel.clone(),
        );
        run.emit(EventType::RunStarted {
            workflow: self.name.clone(),
            nodes: self.nodes.hostnames(),
        })
        .await;

        let outcome = TaskManager::new(&self.name, &self.plan, run.clone())
            .run(self.nodes.clone())
            .await;

        let default = NodeFailure {
            step: self.name.clone(),
            reason: FailureReason::StepFailed,
        };
        let failures = self.board.failures(&outcome.ko, &default);
        let breakpoint = run.breakpoint();

        run.emit(EventType::RunCompleted {
            ok: outcome.ok.hostnames(),
            ko: outcome.ko.hostnames(),
            duration_ms: clock.elapsed().as_millis() as u64,
        })
        .await;
        if let Err(e) = self.events.flush().await {
            tracing::warn!("Failed to flush events of run {}: {:#}", self.run_id, e);
        }

        tracing::info!(
            "Workflow {} completed: {} ok, {} ko",
            self.name,
            outcome.ok.len(),
            outcome.ko.len()
        );

        WorkflowReport {
            run_id: self.run_id,
            workflow: self.name,
            ok: outcome.ok,
            ko: outcome.ko,
            failures,
            breakpoint,
            started_at,
            completed_at: Utc::now(),
        }
    }
}
