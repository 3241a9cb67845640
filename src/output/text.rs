//! Human-readable text output

use crate::cache::CacheStats;
use crate::health::HealthReport;
use crate::planner::streaming::StreamingPlan;
use crate::planner::OptimizationPlan;
use crate::probe::SystemInfo;
use std::fmt::Write;

pub fn render_plan(plan: &OptimizationPlan) -> String {
    let mut out = String::new();
    writeln!(out, "Plan:").unwrap();
    writeln!(out, "  executor:    {}", plan.executor_kind).unwrap();
    writeln!(out, "  workers:     {}", plan.n_workers).unwrap();
    writeln!(out, "  chunksize:   {}", plan.chunksize).unwrap();
    writeln!(
        out,
        "  predicted:   {:.3}s wall, {:.2}x speedup",
        plan.predicted_wall_seconds, plan.predicted_speedup
    )
    .unwrap();
    if let Some(count) = plan.count_total {
        writeln!(out, "  items:       {}", count).unwrap();
    }
    if let Some(workload) = plan.workload_type {
        writeln!(out, "  workload:    {}", workload).unwrap();
    }
    if let Some(fingerprint) = &plan.fingerprint {
        writeln!(out, "  fingerprint: {}", fingerprint).unwrap();
    }
    if plan.from_cache {
        writeln!(out, "  (served from decision cache)").unwrap();
    }
    if let Some(reason) = plan.rejection_reason {
        writeln!(out, "  rejected:    {} - {}", reason.code(), reason.message()).unwrap();
        if let Some(remediation) = reason.remediation() {
            writeln!(out, "  hint:        {}", remediation).unwrap();
        }
    }
    for warning in &plan.warnings {
        writeln!(out, "  warning:     {}", warning).unwrap();
    }
    writeln!(out, "  {}", plan.explanation).unwrap();
    out
}

pub fn render_streaming_plan(plan: &StreamingPlan) -> String {
    let mut out = render_plan(&plan.plan);
    writeln!(out, "  buffer:      {} items in flight", plan.buffer_size).unwrap();
    writeln!(
        out,
        "  ordering:    {}",
        if plan.ordered { "ordered" } else { "unordered" }
    )
    .unwrap();
    out
}

pub fn render_system(info: &SystemInfo) -> String {
    let mut out = String::new();
    writeln!(out, "System:").unwrap();
    writeln!(
        out,
        "  cores:       {} physical / {} logical (via {})",
        info.physical_cores, info.logical_cores, info.core_probe
    )
    .unwrap();
    writeln!(
        out,
        "  memory:      {} limit / {} available (via {})",
        format_bytes(info.memory_limit_bytes),
        format_bytes(info.available_memory_bytes),
        info.memory_probe
    )
    .unwrap();
    writeln!(
        out,
        "  spawn:       {:.1}ms process / {:.2}ms thread ({})",
        info.process_spawn_seconds * 1e3,
        info.thread_spawn_seconds * 1e3,
        if info.overhead_trusted { "measured" } else { "defaults" }
    )
    .unwrap();
    writeln!(out, "  dispatch:    {:.0}us per chunk", info.chunk_dispatch_seconds * 1e6).unwrap();
    for warning in &info.warnings {
        writeln!(out, "  warning:     {}", warning).unwrap();
    }
    out
}

pub fn render_health(report: &HealthReport) -> String {
    let mut out = String::new();
    writeln!(out, "Health:").unwrap();
    for check in &report.checks {
        writeln!(out, "  [{}] {}: {}", check.status, check.name, check.message).unwrap();
    }
    writeln!(out, "  overall: {}", if report.passed() { "pass" } else { "FAIL" }).unwrap();
    out
}

pub fn render_cache_stats(stats: &CacheStats) -> String {
    let mut out = String::new();
    writeln!(out, "Cache:").unwrap();
    writeln!(out, "  entries:     {} ({} expired)", stats.entries, stats.expired).unwrap();
    writeln!(out, "  quarantined: {}", stats.quarantined).unwrap();
    if let (Some(oldest), Some(newest)) = (stats.oldest_age_seconds, stats.newest_age_seconds) {
        writeln!(out, "  age:         {}s oldest, {}s newest", oldest, newest).unwrap();
    }
    out
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2}TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorKind;
    use crate::planner::RejectionReason;

    fn plan() -> OptimizationPlan {
        OptimizationPlan {
            n_workers: 8,
            chunksize: 20,
            executor_kind: ExecutorKind::Process,
            predicted_wall_seconds: 1.42,
            predicted_speedup: 7.0,
            rejection_reason: None,
            warnings: Vec::new(),
            explanation: "looks good".to_string(),
            fingerprint: Some("deadbeef".to_string()),
            count_total: Some(1000),
            workload_type: None,
            elapsed_planning_seconds: 0.02,
            from_cache: false,
        }
    }

    #[test]
    fn test_plan_render_mentions_parameters() {
        let text = render_plan(&plan());
        assert!(text.contains("process"));
        assert!(text.contains("8"));
        assert!(text.contains("20"));
        assert!(text.contains("deadbeef"));
    }

    #[test]
    fn test_rejected_plan_renders_hint() {
        let mut rejected = plan();
        rejected.executor_kind = ExecutorKind::Serial;
        rejected.rejection_reason = Some(RejectionReason::UnmarshalableFunction);
        let text = render_plan(&rejected);
        assert!(text.contains("unmarshalable_function"));
        assert!(text.contains("hint:"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.00KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00MB");
    }
}
