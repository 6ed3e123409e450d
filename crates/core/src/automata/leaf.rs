//! Execution of one leaf: retries, timeout, early resolution.

use super::context::{Raiser, Report, RunContext, TaskContext};
use super::manager::{Outcome, TaskManager};
use super::plan::{LeafWork, PlannedLeaf};
use crate::events::EventType;
use crate::node::NodeSet;
use crate::status::FailureReason;
use crate::types::Resolution;
use std::time::Duration;
use tokio::sync::mpsc;

/// How one attempt of a leaf call ended
#[derive(Debug)]
enum AttemptEnd {
    Returned(bool),
    Errored(String),
    TimedOut(Duration),
    Cancelled,
}

/// Nodes of a leaf: still unresolved, resolved ok, resolved ko
struct Partition {
    working: NodeSet,
    ok: NodeSet,
    ko: NodeSet,
}

/// Run a leaf over `nodes` until every node is resolved
pub(crate) async fn run_leaf(run: &RunContext, leaf: &PlannedLeaf, nodes: NodeSet) -> Outcome {
    let mut part = Partition {
        working: nodes,
        ok: NodeSet::new(),
        ko: NodeSet::new(),
    };
    let mut attempt = 0;

    loop {
        attempt += 1;
        tracing::info!("Running {} on {} (attempt {})", leaf.path, part.working, attempt);
        run.board.running(&part.working, &leaf.path);
        run.emit(EventType::StepStarted {
            step: leaf.path.clone(),
            attempt,
            nodes: part.working.hostnames(),
        })
        .await;

        let end = run_attempt(run, leaf, &mut part, attempt).await;

        // `None` keeps the reason already recorded by a nested step
        let (reason, error) = match end {
            AttemptEnd::Returned(true) => {
                run.board.succeeded(&part.working, &leaf.path);
                let mut working = std::mem::take(&mut part.working);
                working.move_to(&mut part.ok);
                break;
            }
            AttemptEnd::Returned(false) => match leaf.work {
                LeafWork::Micro(_) => (Some(FailureReason::StepFailed), None),
                LeafWork::Macro(_) => (None, None),
            },
            AttemptEnd::Errored(message) => {
                tracing::warn!("Step {} returned an error: {}", leaf.path, message);
                (
                    Some(FailureReason::Error {
                        message: message.clone(),
                    }),
                    Some(message),
                )
            }
            AttemptEnd::TimedOut(after) => {
                tracing::warn!(
                    "Step {} timed out after {:?} on {}",
                    leaf.path,
                    after,
                    part.working
                );
                run.emit(EventType::StepTimedOut {
                    step: leaf.path.clone(),
                    attempt,
                    timeout_ms: after.as_millis() as u64,
                    nodes: part.working.hostnames(),
                })
                .await;
                (
                    Some(FailureReason::TimedOut {
                        after_secs: after.as_secs_f64(),
                    }),
                    Some(format!("timed out after {:?}", after)),
                )
            }
            AttemptEnd::Cancelled => (Some(FailureReason::Cancelled), Some("cancelled".to_string())),
        };

        // Everything was reported early, nothing left to retry
        if part.working.is_empty() {
            break;
        }

        // No retry once the run is stopped at a breakpoint
        let will_retry =
            attempt <= leaf.config.retries && !run.cancel.is_cancelled() && !run.breakpoint_reached();
        run.emit(EventType::StepFailed {
            step: leaf.path.clone(),
            attempt,
            error,
            will_retry,
            nodes: part.working.hostnames(),
        })
        .await;

        if will_retry {
            tracing::warn!(
                "Step {} failed on {}, retrying ({}/{})",
                leaf.path,
                part.working,
                attempt,
                leaf.config.retries
            );
            continue;
        }

        tracing::warn!("Step {} failed on {}", leaf.path, part.working);
        if let Some(reason) = reason {
            run.board.failed(&part.working, &leaf.path, reason);
        }
        let mut working = std::mem::take(&mut part.working);
        working.move_to(&mut part.ko);
        break;
    }

    tracing::info!(
        "Step {} completed: ok {} ko {}",
        leaf.path,
        part.ok,
        part.ko
    );
    run.emit(EventType::StepCompleted {
        step: leaf.path.clone(),
        ok: part.ok.hostnames(),
        ko: part.ko.hostnames(),
    })
    .await;

    if leaf.config.breakpoint && run.hit_breakpoint(&leaf.path) {
        tracing::info!("Breakpoint reached at {}", leaf.path);
        run.emit(EventType::BreakpointReached {
            step: leaf.path.clone(),
        })
        .await;
    }

    Outcome {
        ok: part.ok,
        ko: part.ko,
    }
}

/// One call of the leaf, raced against its reports, deadline and the run's
/// cancellation.
///
/// Each attempt gets its own report channel and cancellation token: once the
/// attempt is over, reports it sends are refused and its spawned work is
/// told to stop.
async fn run_attempt(run: &RunContext, leaf: &PlannedLeaf, part: &mut Partition, attempt: u32) -> AttemptEnd {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = run.cancel.child_token();
    let ctx = TaskContext::new(
        part.working.clone(),
        leaf.args.clone(),
        leaf.path.clone(),
        attempt,
        Raiser::new(tx),
        cancel.clone(),
    );

    let deadline = leaf.config.timeout.duration();
    let end = {
        let call = invoke(run, leaf, &ctx);
        tokio::pin!(call);
        let timer = async move {
            match deadline {
                Some(after) => {
                    tokio::time::sleep(after).await;
                    after
                }
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;

                Some(report) = rx.recv() => settle(run, leaf, part, report).await,
                result = &mut call => {
                    break match result {
                        Ok(success) => AttemptEnd::Returned(success),
                        Err(e) => AttemptEnd::Errored(format!("{:#}", e)),
                    };
                }
                after = &mut timer => break AttemptEnd::TimedOut(after),
                _ = run.cancel.cancelled() => break AttemptEnd::Cancelled,
            }
        }
    };

    // The call future is gone; stop whatever it spawned and refuse late reports
    cancel.cancel();
    rx.close();
    while let Ok(report) = rx.try_recv() {
        settle(run, leaf, part, report).await;
    }

    end
}

async fn invoke(run: &RunContext, leaf: &PlannedLeaf, ctx: &TaskContext) -> anyhow::Result<bool> {
    match &leaf.work {
        LeafWork::Micro(microstep) => microstep.run(ctx).await,
        LeafWork::Macro(plan) => {
            tracing::debug!("Entering macrostep {} for {}", plan.name, ctx.nodes());
            let nested = run.scoped(ctx.cancellation().clone());
            let outcome = TaskManager::new(&leaf.path, &plan.steps, nested)
                .run(ctx.nodes().clone())
                .await;

            // Survivors resolve early; the rest take the failed disposition
            let success = outcome.ko.is_empty();
            ctx.raise_ok(outcome.ok);
            Ok(success)
        }
    }
}

/// Apply an early report. Only nodes still unresolved are claimed.
async fn settle(run: &RunContext, leaf: &PlannedLeaf, part: &mut Partition, report: Report) {
    let mut claimed = part.working.extract(&report.nodes);
    if claimed.len() < report.nodes.len() {
        tracing::debug!(
            "Ignoring report from {} for {} already resolved nodes",
            leaf.path,
            report.nodes.len() - claimed.len()
        );
    }
    if claimed.is_empty() {
        return;
    }

    tracing::debug!("{} resolved {} as {}", leaf.path, claimed, report.status);
    match report.status {
        Resolution::Ok => run.board.succeeded(&claimed, &leaf.path),
        Resolution::Ko => run.board.failed(
            &claimed,
            &leaf.path,
            FailureReason::Raised {
                message: report.message,
            },
        ),
    }
    run.emit(EventType::NodesRaised {
        step: leaf.path.clone(),
        status: report.status,
        nodes: claimed.hostnames(),
    })
    .await;

    match report.status {
        Resolution::Ok => claimed.move_to(&mut part.ok),
        Resolution::Ko => claimed.move_to(&mut part.ko),
    }
}
