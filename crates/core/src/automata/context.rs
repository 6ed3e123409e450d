use crate::events::{Event, EventLog, EventType};
use crate::node::NodeSet;
use crate::status::StatusBoard;
use crate::types::{Resolution, RunId};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Early resolution of a batch of nodes, sent by a running leaf
#[derive(Debug)]
pub(crate) struct Report {
    pub nodes: NodeSet,
    pub status: Resolution,
    pub message: Option<String>,
}

/// Handle a running leaf uses to resolve nodes before its call returns.
///
/// Cheap to clone, so it can be handed to spawned tasks. Reports are applied
/// by the task that owns the step; a node is claimed by the first report
/// naming it.
#[derive(Debug, Clone)]
pub struct Raiser {
    tx: mpsc::UnboundedSender<Report>,
}

impl Raiser {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Report>) -> Self {
        Self { tx }
    }

    /// Report `nodes` as concluded with `status`.
    ///
    /// Returns `false` once the step attempt is over and reports are no
    /// longer accepted.
    pub fn raise(&self, nodes: NodeSet, status: Resolution) -> bool {
        self.send(nodes, status, None)
    }

    pub fn ok(&self, nodes: NodeSet) -> bool {
        self.send(nodes, Resolution::Ok, None)
    }

    pub fn ko(&self, nodes: NodeSet) -> bool {
        self.send(nodes, Resolution::Ko, None)
    }

    /// Report `nodes` as failed with a message kept in the failure reason
    pub fn ko_with(&self, nodes: NodeSet, message: impl Into<String>) -> bool {
        self.send(nodes, Resolution::Ko, Some(message.into()))
    }

    fn send(&self, nodes: NodeSet, status: Resolution, message: Option<String>) -> bool {
        if nodes.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx
            .send(Report {
                nodes,
                status,
                message,
            })
            .is_ok()
    }
}

/// What a microstep sees of the step attempt it runs
pub struct TaskContext {
    nodes: NodeSet,
    args: Vec<serde_json::Value>,
    step: String,
    attempt: u32,
    raiser: Raiser,
    cancel: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(
        nodes: NodeSet,
        args: Vec<serde_json::Value>,
        step: String,
        attempt: u32,
        raiser: Raiser,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            nodes,
            args,
            step,
            attempt,
            raiser,
            cancel,
        }
    }

    /// Nodes still unresolved when this attempt started
    pub fn nodes(&self) -> &NodeSet {
        &self.nodes
    }

    pub fn args(&self) -> &[serde_json::Value] {
        &self.args
    }

    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.args.get(index).and_then(|v| v.as_str())
    }

    /// Full step path, e.g. `deploy/BroadcastEnv/send_environment`
    pub fn step(&self) -> &str {
        &self.step
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn raiser(&self) -> Raiser {
        self.raiser.clone()
    }

    pub fn raise_ok(&self, nodes: NodeSet) -> bool {
        self.raiser.ok(nodes)
    }

    pub fn raise_ko(&self, nodes: NodeSet) -> bool {
        self.raiser.ko(nodes)
    }

    /// Cancelled when the attempt times out, the run is cancelled, or the
    /// call has returned. Work spawned by the microstep must stop on it.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// State shared by every manager of one run
#[derive(Clone)]
pub(crate) struct RunContext {
    pub run_id: RunId,
    pub events: Arc<dyn EventLog>,
    pub board: StatusBoard,
    pub cancel: CancellationToken,
    breakpoint: Arc<Mutex<Option<String>>>,
}

impl RunContext {
    pub fn new(
        run_id: RunId,
        events: Arc<dyn EventLog>,
        board: StatusBoard,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            events,
            board,
            cancel,
            breakpoint: Arc::new(Mutex::new(None)),
        }
    }

    /// Same run, cancelled through `cancel` (a nested manager)
    pub fn scoped(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    /// Append an event; a failing event log never affects node outcomes
    pub async fn emit(&self, event_type: EventType) {
        if let Err(e) = self.events.append(Event::new(self.run_id, event_type)).await {
            tracing::warn!("Failed to append event for run {}: {:#}", self.run_id, e);
        }
    }

    /// Record that `step` reached a breakpoint. Returns `false` if an
    /// earlier breakpoint already stopped the run.
    pub fn hit_breakpoint(&self, step: &str) -> bool {
        let mut breakpoint = self.breakpoint.lock().unwrap();
        if breakpoint.is_some() {
            return false;
        }
        *breakpoint = Some(step.to_string());
        true
    }

    pub fn breakpoint(&self) -> Option<String> {
        self.breakpoint.lock().unwrap().clone()
    }

    pub fn breakpoint_reached(&self) -> bool {
        self.breakpoint.lock().unwrap().is_some()
    }
}
