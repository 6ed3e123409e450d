//! Engine scenarios, run on paused tokio time.

use super::context::RunContext;
use super::manager::TaskManager;
use super::plan::compile_workflow;
use super::*;
use crate::config::{ConfigOverrides, StepOverride};
use crate::error::ConfigError;
use crate::events::{EventType, MemoryEventLog};
use crate::node::{Node, NodeSet};
use crate::status::{FailureReason, StatusBoard};
use crate::step::{LeafStep, Step};
use crate::types::RunId;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const HOUR: Duration = Duration::from_secs(3600);

#[derive(Clone)]
enum Behavior {
    Succeed,
    Fail,
    /// Result of each call; the last one repeats
    Results(Vec<bool>),
    ErrorThenSucceed,
    Hang,
    RaiseOkThenHang(usize),
    RaiseOkThenSucceed(usize, Duration),
    /// Even nodes raised ok, the rest fail
    SplitHalf,
    /// Overlapping reports, then a raise from a task outliving the call
    Overlapping(Arc<Mutex<Option<bool>>>),
    RaiseAllKo,
}

type Calls = Arc<Mutex<Vec<NodeSet>>>;

/// Microstep following a scripted behavior and recording the nodes of
/// every call
struct Scripted {
    name: String,
    behavior: Behavior,
    calls: Calls,
}

impl Scripted {
    fn new(name: &str, behavior: Behavior) -> (Self, Calls) {
        let calls = Calls::default();
        let scripted = Self {
            name: name.to_string(),
            behavior,
            calls: calls.clone(),
        };
        (scripted, calls)
    }
}

#[async_trait::async_trait]
impl Microstep for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<bool> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(ctx.nodes().clone());
            calls.len()
        };

        match &self.behavior {
            Behavior::Succeed => Ok(true),
            Behavior::Fail => Ok(false),
            Behavior::Results(results) => Ok(results[(call - 1).min(results.len() - 1)]),
            Behavior::ErrorThenSucceed => {
                if call == 1 {
                    anyhow::bail!("connection refused");
                }
                Ok(true)
            }
            Behavior::Hang => {
                tokio::time::sleep(HOUR).await;
                Ok(true)
            }
            Behavior::RaiseOkThenHang(n) => {
                ctx.raise_ok(first(ctx.nodes(), *n));
                tokio::time::sleep(HOUR).await;
                Ok(true)
            }
            Behavior::RaiseOkThenSucceed(n, delay) => {
                ctx.raise_ok(first(ctx.nodes(), *n));
                tokio::time::sleep(*delay).await;
                Ok(true)
            }
            Behavior::SplitHalf => {
                let (even, _) = ctx.nodes().clone().partition(|n| index(n) % 2 == 0);
                ctx.raise_ok(even);
                Ok(false)
            }
            Behavior::Overlapping(late) => {
                ctx.raise_ok(first(ctx.nodes(), 4));
                ctx.raiser().ko_with(first(ctx.nodes(), 8), "disk not found");

                let raiser = ctx.raiser();
                let all = ctx.nodes().clone();
                let late = late.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    *late.lock().unwrap() = Some(raiser.ok(all));
                });
                Ok(false)
            }
            Behavior::RaiseAllKo => {
                ctx.raise_ko(ctx.nodes().clone());
                Ok(false)
            }
        }
    }
}

fn nodes(count: usize) -> NodeSet {
    (0..count).map(|i| Node::new(format!("node-{}", i))).collect()
}

fn index(node: &Node) -> usize {
    node.hostname
        .rsplit('-')
        .next()
        .and_then(|i| i.parse().ok())
        .unwrap()
}

fn first(set: &NodeSet, n: usize) -> NodeSet {
    set.iter().take(n).cloned().collect()
}

fn select(set: &NodeSet, pred: impl Fn(usize) -> bool) -> NodeSet {
    set.iter().filter(|n| pred(index(n))).cloned().collect()
}

fn call_count(calls: &Calls) -> usize {
    calls.lock().unwrap().len()
}

fn build_registry(microsteps: Vec<Scripted>, macrosteps: Vec<Macrostep>) -> Registry {
    let mut registry = Registry::new();
    for microstep in microsteps {
        registry.register_microstep(microstep).unwrap();
    }
    for macrostep in macrosteps {
        registry.register_macrostep(macrostep).unwrap();
    }
    registry
}

fn assert_partition(report: &WorkflowReport, input: &NodeSet) {
    assert_eq!(report.ok.len() + report.ko.len(), input.len());
    for node in input {
        assert!(
            report.ok.contains(node) ^ report.ko.contains(node),
            "{} must be in exactly one of ok/ko",
            node.hostname
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_failure_short_circuits_sequence() {
    let (fail, fail_calls) = Scripted::new("fail", Behavior::Fail);
    let (never, never_calls) = Scripted::new("never", Behavior::Succeed);
    let registry = build_registry(
        vec![fail, never],
        vec![
            Macrostep::new("Prepare", [Step::leaf("fail")]),
            Macrostep::new("Install", [Step::leaf("never")]),
        ],
    );

    let input = nodes(16);
    let report = Workflow::builder("deploy")
        .nodes(input.clone())
        .tasks([Step::leaf("Prepare"), Step::leaf("Install")])
        .registry(registry)
        .build()
        .unwrap()
        .start()
        .await;

    assert_eq!(call_count(&fail_calls), 1);
    assert_eq!(call_count(&never_calls), 0);
    assert!(report.ok.is_empty());
    assert_eq!(report.ko, input);
    assert!(!report.is_success());
    assert_eq!(report.failures["node-3"].step, "deploy/Prepare/fail");
    assert_eq!(report.failures["node-3"].reason, FailureReason::StepFailed);
}

#[tokio::test(start_paused = true)]
async fn test_success_propagates() {
    let (success, success_calls) = Scripted::new("success", Behavior::Succeed);
    let (end, end_calls) = Scripted::new("end", Behavior::Succeed);
    let registry = build_registry(
        vec![success, end],
        vec![
            Macrostep::new("Prepare", [Step::leaf("success")]),
            Macrostep::new("Finish", [Step::leaf("end")]),
        ],
    );

    let input = nodes(16);
    let report = Workflow::builder("deploy")
        .nodes(input.clone())
        .tasks([Step::leaf("Prepare"), Step::leaf("Finish")])
        .registry(registry)
        .build()
        .unwrap()
        .start()
        .await;

    assert_eq!(call_count(&success_calls), 1);
    assert_eq!(call_count(&end_calls), 1);
    assert_eq!(end_calls.lock().unwrap()[0], input);
    assert_eq!(report.ok, input);
    assert!(report.ko.is_empty());
    assert!(report.failures.is_empty());
    assert!(report.is_success());
}

#[tokio::test(start_paused = true)]
async fn test_retry_then_succeed() {
    let (flaky, calls) = Scripted::new("flaky", Behavior::Results(vec![false, true]));
    let registry = build_registry(
        vec![flaky],
        vec![Macrostep::new("Prepare", [Step::Leaf(LeafStep::new("flaky").retries(1))])],
    );

    let input = nodes(16);
    let report = Workflow::builder("deploy")
        .nodes(input.clone())
        .tasks([Step::leaf("Prepare")])
        .registry(registry)
        .build()
        .unwrap()
        .start()
        .await;

    assert_eq!(call_count(&calls), 2);
    assert_eq!(report.ok, input);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted() {
    let (fail, calls) = Scripted::new("fail", Behavior::Fail);
    let registry = build_registry(vec![fail], vec![Macrostep::new("Prepare", [Step::leaf("fail")])]);
    let overrides = ConfigOverrides::new().with(
        "Prepare",
        StepOverride::new().child("fail", StepOverride::new().retries(2)),
    );

    let report = Workflow::builder("deploy")
        .nodes(nodes(4))
        .tasks([Step::leaf("Prepare")])
        .registry(registry)
        .overrides(overrides)
        .build()
        .unwrap()
        .start()
        .await;

    // One call plus two retries
    assert_eq!(call_count(&calls), 3);
    assert_eq!(report.ko.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_all_nodes() {
    let (slow, calls) = Scripted::new("slow", Behavior::Hang);
    let registry = build_registry(
        vec![slow],
        vec![Macrostep::new(
            "Prepare",
            [Step::Leaf(LeafStep::new("slow").timeout(Duration::from_secs(1)))],
        )],
    );

    let input = nodes(16);
    let started = tokio::time::Instant::now();
    let report = Workflow::builder("deploy")
        .nodes(input.clone())
        .tasks([Step::leaf("Prepare")])
        .registry(registry)
        .build()
        .unwrap()
        .start()
        .await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(call_count(&calls), 1);
    assert_eq!(report.ko, input);
    assert_eq!(
        report.failures["node-0"].reason,
        FailureReason::TimedOut { after_secs: 1.0 }
    );
}

#[tokio::test(start_paused = true)]
async fn test_fallback_cascades_only_failures() {
    let (split, split_calls) = Scripted::new("split_half", Behavior::SplitHalf);
    let (slow, slow_calls) = Scripted::new("slow", Behavior::Hang);
    let (ok, ok_calls) = Scripted::new("ok", Behavior::Succeed);
    let registry = build_registry(
        vec![split, slow, ok],
        vec![
            Macrostep::new("Macro1", [Step::leaf("split_half")]),
            Macrostep::new(
                "Macro2",
                [Step::Leaf(LeafStep::new("slow").timeout(Duration::from_secs(1)))],
            ),
            Macrostep::new("Macro3", [Step::leaf("ok")]),
        ],
    );

    let input = nodes(16);
    let events = Arc::new(MemoryEventLog::new());
    let report = Workflow::builder("deploy")
        .nodes(input.clone())
        .tasks([Step::fallback([
            Step::leaf("Macro1"),
            Step::leaf("Macro2"),
            Step::leaf("Macro3"),
        ])])
        .registry(registry)
        .event_log(events.clone())
        .build()
        .unwrap()
        .start()
        .await;

    let odds = select(&input, |i| i % 2 == 1);
    assert_eq!(call_count(&split_calls), 1);
    assert_eq!(slow_calls.lock().unwrap().as_slice(), &[odds.clone()]);
    assert_eq!(ok_calls.lock().unwrap().as_slice(), &[odds]);
    assert_eq!(report.ok, input);
    assert!(report.ko.is_empty());

    let triggered: Vec<usize> = events
        .events()
        .iter()
        .filter_map(|e| match &e.event_type {
            EventType::FallbackTriggered { alternative, .. } => Some(*alternative),
            _ => None,
        })
        .collect();
    assert_eq!(triggered, vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_nested_fallback_groups() {
    let (split, split_calls) = Scripted::new("split_half", Behavior::SplitHalf);
    let (partial, partial_calls) = Scripted::new("partial", Behavior::RaiseOkThenHang(2));
    let (last, last_calls) = Scripted::new("last", Behavior::Fail);
    let registry = build_registry(
        vec![split, partial, last],
        vec![Macrostep::new(
            "Reboot",
            [Step::fallback([
                Step::leaf("split_half"),
                Step::fallback([
                    Step::Leaf(LeafStep::new("partial").timeout(Duration::from_secs(1))),
                    Step::leaf("last"),
                ]),
            ])],
        )],
    );

    let input = nodes(8);
    let events = Arc::new(MemoryEventLog::new());
    let report = Workflow::builder("deploy")
        .nodes(input.clone())
        .tasks([Step::leaf("Reboot")])
        .registry(registry)
        .event_log(events.clone())
        .build()
        .unwrap()
        .start()
        .await;

    // Each alternative only sees what the one before it failed
    let odds = select(&input, |i| i % 2 == 1);
    let timed_out = select(&input, |i| i % 2 == 1 && i > 3);
    assert_eq!(split_calls.lock().unwrap().as_slice(), &[input.clone()]);
    assert_eq!(partial_calls.lock().unwrap().as_slice(), &[odds]);
    assert_eq!(last_calls.lock().unwrap().as_slice(), &[timed_out.clone()]);

    assert_eq!(report.ok, select(&input, |i| i % 2 == 0 || i < 4));
    assert_eq!(report.ko, timed_out);
    assert_partition(&report, &input);
    assert_eq!(report.failures["node-5"].step, "deploy/Reboot/last");
    assert_eq!(report.failures["node-5"].reason, FailureReason::StepFailed);

    let triggered: Vec<usize> = events
        .events()
        .iter()
        .filter_map(|e| match &e.event_type {
            EventType::FallbackTriggered { alternative, .. } => Some(*alternative),
            _ => None,
        })
        .collect();
    assert_eq!(triggered, vec![1, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_early_raise_isolates_from_timeout() {
    let (partial, calls) = Scripted::new("partial", Behavior::RaiseOkThenHang(4));
    let registry = build_registry(
        vec![partial],
        vec![Macrostep::new(
            "Broadcast",
            [Step::Leaf(
                LeafStep::new("partial")
                    .timeout(Duration::from_secs(1))
                    .retries(1),
            )],
        )],
    );

    let input = nodes(16);
    let report = Workflow::builder("deploy")
        .nodes(input.clone())
        .tasks([Step::leaf("Broadcast")])
        .registry(registry)
        .build()
        .unwrap()
        .start()
        .await;

    // The retry only sees the 12 unresolved nodes, and raises 4 of them
    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], input);
    assert_eq!(calls[1], select(&input, |i| i >= 4));

    assert_eq!(report.ok, select(&input, |i| i < 8));
    assert_eq!(report.ko, select(&input, |i| i >= 8));
    assert_eq!(
        report.failures["node-12"].reason,
        FailureReason::TimedOut { after_secs: 1.0 }
    );
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_split_half() {
    let (split, _) = Scripted::new("split_half", Behavior::SplitHalf);
    let (record, record_calls) = Scripted::new("record", Behavior::Succeed);
    let registry = build_registry(
        vec![split, record],
        vec![
            Macrostep::new("Macro_A", [Step::leaf("split_half")]),
            Macrostep::new("Macro_B", [Step::leaf("record")]),
        ],
    );

    let input = nodes(16);
    let report = Workflow::builder("deploy")
        .nodes(input.clone())
        .tasks([Step::leaf("Macro_A"), Step::leaf("Macro_B")])
        .registry(registry)
        .build()
        .unwrap()
        .start()
        .await;

    let evens = select(&input, |i| i % 2 == 0);
    let odds = select(&input, |i| i % 2 == 1);
    assert_eq!(record_calls.lock().unwrap().as_slice(), &[evens.clone()]);
    assert_eq!(report.ok, evens);
    assert_eq!(report.ko, odds);
    assert_partition(&report, &input);
    assert_eq!(report.failures["node-1"].step, "deploy/Macro_A/split_half");
}

#[tokio::test(start_paused = true)]
async fn test_raised_nodes_wait_for_step_boundary() {
    let (partial, _) = Scripted::new("partial", Behavior::RaiseOkThenSucceed(4, Duration::from_secs(10)));
    let (next, next_calls) = Scripted::new("next", Behavior::Succeed);
    let registry = build_registry(
        vec![partial, next],
        vec![Macrostep::new("Install", [Step::leaf("partial"), Step::leaf("next")])],
    );

    let input = nodes(16);
    let report = Workflow::builder("deploy")
        .nodes(input.clone())
        .tasks([Step::leaf("Install")])
        .registry(registry)
        .build()
        .unwrap()
        .start()
        .await;

    // Early nodes join the others in a single batch for the next step
    assert_eq!(next_calls.lock().unwrap().as_slice(), &[input.clone()]);
    assert_eq!(report.ok, input);
}

#[tokio::test(start_paused = true)]
async fn test_error_is_a_transient_failure() {
    let (flaky, calls) = Scripted::new("flaky", Behavior::ErrorThenSucceed);
    let registry = build_registry(
        vec![flaky],
        vec![Macrostep::new("Prepare", [Step::Leaf(LeafStep::new("flaky").retries(1))])],
    );

    let report = Workflow::builder("deploy")
        .nodes(nodes(3))
        .tasks([Step::leaf("Prepare")])
        .registry(registry)
        .build()
        .unwrap()
        .start()
        .await;

    assert_eq!(call_count(&calls), 2);
    assert!(report.is_success());

    // Without a retry, the error becomes the failure reason
    let (broken, _) = Scripted::new("flaky", Behavior::ErrorThenSucceed);
    let registry = build_registry(vec![broken], vec![Macrostep::new("Prepare", [Step::leaf("flaky")])]);
    let report = Workflow::builder("deploy")
        .nodes(nodes(3))
        .tasks([Step::leaf("Prepare")])
        .registry(registry)
        .build()
        .unwrap()
        .start()
        .await;

    assert_eq!(report.ko.len(), 3);
    assert_eq!(
        report.failures["node-0"].reason,
        FailureReason::Error {
            message: "connection refused".to_string()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_first_report_wins_and_late_reports_ignored() {
    let late = Arc::new(Mutex::new(None));
    let (overlapping, _) = Scripted::new("overlapping", Behavior::Overlapping(late.clone()));
    let registry = build_registry(
        vec![overlapping],
        vec![Macrostep::new("Install", [Step::leaf("overlapping")])],
    );

    let input = nodes(16);
    let report = Workflow::builder("deploy")
        .nodes(input.clone())
        .tasks([Step::leaf("Install")])
        .registry(registry)
        .build()
        .unwrap()
        .start()
        .await;

    assert_eq!(report.ok, select(&input, |i| i < 4));
    assert_eq!(report.ko, select(&input, |i| i >= 4));
    assert_eq!(
        report.failures["node-5"].reason,
        FailureReason::Raised {
            message: Some("disk not found".to_string())
        }
    );
    assert_eq!(report.failures["node-9"].reason, FailureReason::StepFailed);

    // The spawned raise comes after the step concluded and is refused
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(*late.lock().unwrap(), Some(false));
}

#[tokio::test(start_paused = true)]
async fn test_no_retry_when_every_node_was_raised() {
    let (reject, calls) = Scripted::new("reject", Behavior::RaiseAllKo);
    let registry = build_registry(
        vec![reject],
        vec![Macrostep::new("Prepare", [Step::Leaf(LeafStep::new("reject").retries(3))])],
    );

    let report = Workflow::builder("deploy")
        .nodes(nodes(5))
        .tasks([Step::leaf("Prepare")])
        .registry(registry)
        .build()
        .unwrap()
        .start()
        .await;

    assert_eq!(call_count(&calls), 1);
    assert_eq!(report.ko.len(), 5);
    assert_eq!(report.failures["node-2"].reason, FailureReason::Raised { message: None });
}

#[tokio::test(start_paused = true)]
async fn test_macrostep_config_wraps_whole_macrostep() {
    let (flaky, flaky_calls) = Scripted::new("flaky", Behavior::Results(vec![false, true]));
    let (slow, _) = Scripted::new("slow", Behavior::Hang);
    let registry = build_registry(
        vec![flaky, slow],
        vec![
            Macrostep::new("Prepare", [Step::leaf("flaky")]),
            Macrostep::new("Reboot", [Step::leaf("slow")]),
        ],
    );
    let overrides = ConfigOverrides::new()
        .with("Prepare", StepOverride::new().retries(1))
        .with("Reboot", StepOverride::new().timeout(Duration::from_secs(30)));

    let input = nodes(6);
    let report = Workflow::builder("deploy")
        .nodes(input.clone())
        .tasks([Step::leaf("Prepare"), Step::leaf("Reboot")])
        .registry(registry)
        .overrides(overrides)
        .build()
        .unwrap()
        .start()
        .await;

    // The macrostep retry re-ran the whole macrostep for its ko nodes
    assert_eq!(call_count(&flaky_calls), 2);

    assert_eq!(report.ko, input);
    assert_eq!(report.failures["node-0"].step, "deploy/Reboot");
    assert_eq!(
        report.failures["node-0"].reason,
        FailureReason::TimedOut { after_secs: 30.0 }
    );
}

#[tokio::test(start_paused = true)]
async fn test_breakpoint_stops_run() {
    let (check, check_calls) = Scripted::new("check", Behavior::SplitHalf);
    let (never, never_calls) = Scripted::new("never", Behavior::Succeed);
    let registry = build_registry(
        vec![check, never],
        vec![
            Macrostep::new("Prepare", [Step::leaf("check"), Step::leaf("never")]),
            Macrostep::new("Install", [Step::leaf("never")]),
        ],
    );
    let overrides = ConfigOverrides::new().with(
        "Prepare",
        StepOverride::new().child("check", StepOverride::new().breakpoint()),
    );

    let input = nodes(8);
    let events = Arc::new(MemoryEventLog::new());
    let report = Workflow::builder("deploy")
        .nodes(input.clone())
        .tasks([Step::leaf("Prepare"), Step::leaf("Install")])
        .registry(registry)
        .overrides(overrides)
        .event_log(events.clone())
        .build()
        .unwrap()
        .start()
        .await;

    assert_eq!(call_count(&check_calls), 1);
    assert_eq!(call_count(&never_calls), 0);
    assert_eq!(report.breakpoint.as_deref(), Some("deploy/Prepare/check"));
    assert_eq!(report.ok, select(&input, |i| i % 2 == 0));
    assert_partition(&report, &input);
    assert!(events
        .events()
        .iter()
        .any(|e| matches!(e.event_type, EventType::BreakpointReached { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_breakpoint_blocks_macrostep_retry() {
    let (check, check_calls) = Scripted::new("check", Behavior::SplitHalf);
    let registry = build_registry(
        vec![check],
        vec![Macrostep::new("Prepare", [Step::leaf("check")])],
    );
    let overrides = ConfigOverrides::new().with(
        "Prepare",
        StepOverride::new()
            .retries(1)
            .child("check", StepOverride::new().breakpoint()),
    );

    let input = nodes(8);
    let report = Workflow::builder("deploy")
        .nodes(input.clone())
        .tasks([Step::leaf("Prepare")])
        .registry(registry)
        .overrides(overrides)
        .build()
        .unwrap()
        .start()
        .await;

    // The odd nodes failed `check` and stay failed
    let odds = select(&input, |i| i % 2 == 1);
    assert_eq!(call_count(&check_calls), 1);
    assert_eq!(report.breakpoint.as_deref(), Some("deploy/Prepare/check"));
    assert_eq!(report.ok, select(&input, |i| i % 2 == 0));
    assert_eq!(report.ko, odds);
    assert_partition(&report, &input);
    assert_eq!(report.failures["node-1"].step, "deploy/Prepare/check");
    assert_eq!(report.failures["node-1"].reason, FailureReason::StepFailed);
}

#[tokio::test(start_paused = true)]
async fn test_macrostep_started_after_breakpoint_promotes_nothing() {
    let (never, never_calls) = Scripted::new("never", Behavior::Succeed);
    let registry = build_registry(vec![never], vec![Macrostep::new("Install", [Step::leaf("never")])]);

    // Another step of the run already stopped it
    let input = nodes(4);
    let run = RunContext::new(
        RunId::new(),
        Arc::new(MemoryEventLog::new()),
        StatusBoard::new(),
        CancellationToken::new(),
    );
    assert!(run.hit_breakpoint("deploy/Prepare/check"));

    let plan =
        compile_workflow("deploy", &[Step::leaf("Install")], &registry, &ConfigOverrides::new()).unwrap();
    let outcome = TaskManager::new("deploy", &plan, run).run(input.clone()).await;

    assert_eq!(call_count(&never_calls), 0);
    assert!(outcome.ok.is_empty());
    assert_eq!(outcome.ko, input);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_fails_unresolved_nodes() {
    let (partial, _) = Scripted::new("partial", Behavior::RaiseOkThenHang(4));
    let (never, never_calls) = Scripted::new("never", Behavior::Succeed);
    let registry = build_registry(
        vec![partial, never],
        vec![
            Macrostep::new("Broadcast", [Step::leaf("partial")]),
            Macrostep::new("Reboot", [Step::leaf("never")]),
        ],
    );

    let input = nodes(16);
    let workflow = Workflow::builder("deploy")
        .nodes(input.clone())
        .tasks([Step::leaf("Broadcast"), Step::leaf("Reboot")])
        .registry(registry)
        .build()
        .unwrap();
    let status = workflow.status();
    let token = workflow.cancellation_token();

    let handle = tokio::spawn(workflow.start());
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(status.counts(), (0, 12, 4, 0));

    token.cancel();
    let report = handle.await.unwrap();

    // Nodes past the first macrostep are still unresolved for the run
    assert_eq!(call_count(&never_calls), 0);
    assert!(report.ok.is_empty());
    assert_eq!(report.ko, input);
    assert_eq!(report.failures["node-7"].reason, FailureReason::Cancelled);
    assert_eq!(report.failures["node-7"].step, "deploy/Broadcast/partial");
    assert_eq!(report.failures["node-1"].reason, FailureReason::Cancelled);
    assert_eq!(report.failures["node-1"].step, "deploy");
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_start() {
    let (never, never_calls) = Scripted::new("never", Behavior::Succeed);
    let registry = build_registry(vec![never], vec![Macrostep::new("Prepare", [Step::leaf("never")])]);

    let workflow = Workflow::builder("deploy")
        .nodes(nodes(3))
        .tasks([Step::leaf("Prepare")])
        .registry(registry)
        .build()
        .unwrap();
    workflow.cancel();
    let report = workflow.start().await;

    assert_eq!(call_count(&never_calls), 0);
    assert_eq!(report.ko.len(), 3);
    assert_eq!(report.failures["node-0"].reason, FailureReason::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_partition_invariant_with_mixed_outcomes() {
    let (split, _) = Scripted::new("split_half", Behavior::SplitHalf);
    let (partial, _) = Scripted::new("partial", Behavior::RaiseOkThenHang(2));
    let (flaky, _) = Scripted::new("flaky", Behavior::Results(vec![false, true]));
    let registry = build_registry(
        vec![split, partial, flaky],
        vec![
            Macrostep::new(
                "Prepare",
                [Step::fallback([
                    Step::leaf("split_half"),
                    Step::Leaf(LeafStep::new("partial").timeout(Duration::from_secs(2))),
                ])],
            ),
            Macrostep::new("Install", [Step::leaf("flaky")]),
        ],
    );

    let input = nodes(13);
    let report = Workflow::builder("deploy")
        .nodes(input.clone())
        .tasks([Step::leaf("Prepare"), Step::leaf("Install")])
        .registry(registry)
        .build()
        .unwrap()
        .start()
        .await;

    assert_partition(&report, &input);
    assert_eq!(report.ok.len(), 0);
    assert_eq!(report.failures.len(), 13);
}

#[tokio::test(start_paused = true)]
async fn test_config_errors_before_any_call() {
    let (scripted, calls) = Scripted::new("check", Behavior::Succeed);
    let registry = build_registry(vec![scripted], vec![Macrostep::new("Prepare", [Step::leaf("check")])]);

    let err = Workflow::builder("deploy")
        .nodes(nodes(2))
        .tasks([Step::leaf("Prepare"), Step::leaf("Install")])
        .registry(registry.clone())
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, ConfigError::UnknownStep { kind: "macrostep", .. }));

    let err = Workflow::builder("deploy")
        .nodes(nodes(2))
        .tasks([Step::leaf("Prepare")])
        .registry(registry.clone())
        .overrides(ConfigOverrides::new().with("Reboot", StepOverride::new().retries(1)))
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, ConfigError::UnknownOverride { .. }));

    assert!(matches!(
        Workflow::builder("").registry(registry).build().err(),
        Some(ConfigError::EmptyName { .. })
    ));
    assert_eq!(call_count(&calls), 0);
}

#[tokio::test(start_paused = true)]
async fn test_events_and_status_board() {
    let (split, _) = Scripted::new("split_half", Behavior::SplitHalf);
    let registry = build_registry(vec![split], vec![Macrostep::new("Prepare", [Step::leaf("split_half")])]);

    let events = Arc::new(MemoryEventLog::new());
    let workflow = Workflow::builder("deploy")
        .nodes(nodes(4))
        .tasks([Step::leaf("Prepare")])
        .registry(registry)
        .event_log(events.clone())
        .build()
        .unwrap();
    let status = workflow.status();
    let run_id = workflow.run_id();
    let report = workflow.start().await;

    assert_eq!(report.run_id, run_id);
    assert_eq!(status.counts(), (0, 0, 2, 2));

    let events = events.events();
    assert!(events.iter().all(|e| e.run_id == run_id));
    assert!(matches!(events.first().unwrap().event_type, EventType::RunStarted { .. }));
    assert!(matches!(events.last().unwrap().event_type, EventType::RunCompleted { .. }));

    let started: Vec<&str> = events
        .iter()
        .filter(|e| matches!(e.event_type, EventType::StepStarted { .. }))
        .filter_map(|e| e.event_type.step())
        .collect();
    assert_eq!(started, vec!["deploy/Prepare", "deploy/Prepare/split_half"]);

    let raised: usize = events
        .iter()
        .map(|e| match &e.event_type {
            EventType::NodesRaised { nodes, .. } => nodes.len(),
            _ => 0,
        })
        .sum();
    // Inner raise of the evens, then the macrostep's raise of its survivors
    assert_eq!(raised, 4);
}
