use nodeflow_core::WorkflowReport;
use std::fmt::Write;

/// Human-readable summary of a finished run
pub fn render_summary(report: &WorkflowReport) -> String {
    let mut out = String::new();
    let elapsed = (report.completed_at - report.started_at).num_milliseconds() as f64 / 1000.0;

    let _ = writeln!(
        out,
        "workflow {} (run {}) finished in {:.1}s",
        report.workflow, report.run_id, elapsed
    );
    if let Some(step) = &report.breakpoint {
        let _ = writeln!(out, "stopped at breakpoint {}", step);
    }
    let _ = writeln!(out, "ok ({}): {}", report.ok.len(), report.ok);
    let _ = writeln!(out, "ko ({}): {}", report.ko.len(), report.ko);

    let width = report.failures.keys().map(|h| h.len()).max().unwrap_or(0);
    for (hostname, failure) in &report.failures {
        let _ = writeln!(
            out,
            "  {:<width$}  {}  {}",
            hostname,
            failure.step,
            failure.reason,
            width = width
        );
    }

    out
}
