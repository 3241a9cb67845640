//! Streaming plan selection
//!
//! Specialisation for `imap`-style execution: results are yielded as they
//! arrive instead of collected at the end. On top of the batch decision this
//! picks a bounded in-flight buffer and whether output order must match
//! input order. An explicit caller preference for ordering always wins, on
//! every path including rejections; otherwise ordering is auto-decided.

use super::{decide, reject_degenerate, resolve_count, OptimizationPlan, PlanInputs};
use crate::config::PlanOptions;
use crate::data::DataSource;
use crate::pool;
use crate::probe;
use crate::sample::{self, fingerprint::fingerprint, SamplerConfig, WorkloadSample};
use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Buffer bounds relative to the worker count
const MIN_BUFFER_PER_WORKER: usize = 3;
const MAX_BUFFER_PER_WORKER: usize = 16;

/// Inputs larger than this stream unordered unless the caller insists
const UNORDERED_COUNT_THRESHOLD: usize = 10_000;

/// A batch plan extended with streaming parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamingPlan {
    pub plan: OptimizationPlan,
    /// Maximum items in flight between dispatch and yield
    pub buffer_size: usize,
    /// True when outputs must match input order
    pub ordered: bool,
}

impl fmt::Display for StreamingPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, buffer {}, {}",
            self.plan,
            self.buffer_size,
            if self.ordered { "ordered" } else { "unordered" }
        )
    }
}

/// A streaming plan together with the input handle
#[derive(Debug)]
pub struct StreamOutcome<I> {
    pub plan: StreamingPlan,
    pub data: DataSource<I>,
}

/// Plan streaming execution of `task` over `data`
///
/// Accepts every input shape, including unbounded streams; nothing is
/// materialised beyond the sampling prefix.
pub fn plan_stream<I, O>(
    task: &crate::task::TaskFn<I, O>,
    mut data: DataSource<I>,
    options: &PlanOptions,
) -> crate::Result<StreamOutcome<I>> {
    let started = Instant::now();
    if let Err(message) = options.validate() {
        bail!("invalid options: {}", message);
    }

    let system = probe::info();

    if let Some(plan) = reject_degenerate(&data, started) {
        let plan = finish_streaming(plan, options.prefer_ordered, 1);
        return Ok(StreamOutcome { plan, data });
    }

    let sample = sample::sample(task, &mut data, &SamplerConfig::from_options(options));
    tracing::info!(
        count_sampled = sample.count_sampled,
        mean_item_seconds = sample.mean_item_seconds,
        workload_type = %sample.workload_type,
        streaming = true,
        "sampling_complete"
    );

    if let Some(plan) = reject_degenerate(&data, started) {
        let plan = finish_streaming(plan, options.prefer_ordered, 1);
        return Ok(StreamOutcome { plan, data });
    }

    let (count_total, count_assumed) = resolve_count(&data, options);

    // The streaming buffer is the in-flight memory, so the guard budget is
    // the streaming fraction.
    let streaming_options = PlanOptions {
        memory_fraction: options.streaming_memory_fraction,
        ..options.clone()
    };

    let warm_pools = pool::manager().warm_keys();
    let inputs = PlanInputs {
        sample: &sample,
        system: &system,
        count_total,
        count_assumed,
        options: &streaming_options,
        nested: pool::in_worker(),
        warm_pools: &warm_pools,
    };
    let mut base = decide(&inputs);
    base.fingerprint = Some(fingerprint(
        task.identity(),
        std::any::type_name::<I>(),
        count_total,
        &sample,
        &system.signature(),
    ));
    base.elapsed_planning_seconds = started.elapsed().as_secs_f64();

    let plan = decide_streaming(base, &sample, &system, count_total, options);
    tracing::info!(
        fingerprint = plan.plan.fingerprint.as_deref().unwrap_or(""),
        buffer_size = plan.buffer_size,
        ordered = plan.ordered,
        "plan_decided"
    );
    Ok(StreamOutcome { plan, data })
}

/// Attach streaming parameters to a decided base plan
pub fn decide_streaming(
    base: OptimizationPlan,
    sample: &WorkloadSample,
    system: &probe::SystemInfo,
    count_total: Option<usize>,
    options: &PlanOptions,
) -> StreamingPlan {
    if base.is_serial() {
        return finish_streaming(base, options.prefer_ordered, 1);
    }

    let n = base.n_workers.max(1);
    let budget = options.streaming_memory_fraction * system.available_memory_bytes as f64;
    let fitting = if sample.mean_output_bytes > 0.0 {
        (budget / sample.mean_output_bytes) as usize
    } else {
        n * MAX_BUFFER_PER_WORKER
    };
    let buffer_size = fitting.clamp(n * MIN_BUFFER_PER_WORKER, n * MAX_BUFFER_PER_WORKER);

    let ordered = match options.prefer_ordered {
        Some(explicit) => explicit,
        None => {
            let large = count_total.map_or(true, |count| count > UNORDERED_COUNT_THRESHOLD);
            !(sample.heterogeneous() || large)
        }
    };

    StreamingPlan {
        plan: base,
        buffer_size,
        ordered,
    }
}

/// Serial and rejection paths still honor an explicit order preference
fn finish_streaming(
    base: OptimizationPlan,
    prefer_ordered: Option<bool>,
    buffer_size: usize,
) -> StreamingPlan {
    StreamingPlan {
        plan: base,
        buffer_size,
        ordered: prefer_ordered.unwrap_or(true),
    }
}
