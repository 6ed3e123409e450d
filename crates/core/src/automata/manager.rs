use super::context::RunContext;
use super::leaf::run_leaf;
use super::plan::PlannedStep;
use crate::events::EventType;
use crate::node::NodeSet;
use crate::status::FailureReason;
use futures::future::{BoxFuture, FutureExt};

/// Split of a manager's input
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    pub ok: NodeSet,
    pub ko: NodeSet,
}

/// Runs a compiled sequence over a set of nodes.
///
/// The same executor drives a workflow (leaves are macrosteps) and a
/// macrostep (leaves are microsteps). Each step only sees the nodes that
/// passed every step before it.
pub(crate) struct TaskManager<'a> {
    scope: &'a str,
    steps: &'a [PlannedStep],
    run: RunContext,
}

impl<'a> TaskManager<'a> {
    pub fn new(scope: &'a str, steps: &'a [PlannedStep], run: RunContext) -> Self {
        Self { scope, steps, run }
    }

    pub async fn run(&self, input: NodeSet) -> Outcome {
        let mut current = input;
        let mut ko = NodeSet::new();

        for (index, step) in self.steps.iter().enumerate() {
            if current.is_empty() {
                break;
            }

            if self.run.cancel.is_cancelled() {
                self.cancel_nodes(&mut current, &mut ko).await;
                break;
            }

            if self.run.breakpoint_reached() {
                tracing::debug!("Stopping {} at breakpoint", self.scope);
                // Nodes that ran none of the steps have not passed them
                if index == 0 {
                    current.move_to(&mut ko);
                }
                break;
            }

            let mut outcome = self.run_step(step, current).await;
            outcome.ko.move_to(&mut ko);
            current = outcome.ok;
        }

        Outcome { ok: current, ko }
    }

    // Boxed to allow recursion through nested groups and macrosteps
    fn run_step<'s>(&'s self, step: &'s PlannedStep, nodes: NodeSet) -> BoxFuture<'s, Outcome> {
        async move {
            match step {
                PlannedStep::Leaf(leaf) => run_leaf(&self.run, leaf, nodes).await,
                PlannedStep::Fallback(alternatives) => self.run_fallback(alternatives, nodes).await,
            }
        }
        .boxed()
    }

    async fn run_fallback(&self, alternatives: &[PlannedStep], nodes: NodeSet) -> Outcome {
        let mut remaining = nodes;
        let mut ok = NodeSet::new();

        for (index, alternative) in alternatives.iter().enumerate() {
            if remaining.is_empty() || self.run.cancel.is_cancelled() || self.run.breakpoint_reached() {
                break;
            }

            if index > 0 {
                tracing::info!(
                    "Falling back to alternative {} in {} for {}",
                    index + 1,
                    self.scope,
                    remaining
                );
                self.run
                    .emit(EventType::FallbackTriggered {
                        scope: self.scope.to_string(),
                        alternative: index,
                        nodes: remaining.hostnames(),
                    })
                    .await;
            }

            let mut outcome = self.run_step(alternative, remaining).await;
            outcome.ok.move_to(&mut ok);
            remaining = outcome.ko;
        }

        Outcome { ok, ko: remaining }
    }

    async fn cancel_nodes(&self, current: &mut NodeSet, ko: &mut NodeSet) {
        tracing::warn!("Run cancelled in {}, failing {}", self.scope, current);
        self.run.board.failed(current, self.scope, FailureReason::Cancelled);
        self.run
            .emit(EventType::RunCancelled {
                step: self.scope.to_string(),
                nodes: current.hostnames(),
            })
            .await;
        current.move_to(ko);
    }
}
