//! Plan selection
//!
//! The planner turns a workload sample and a system snapshot into an
//! [`OptimizationPlan`]: how many workers, how large a chunk, which
//! executor. It rejects first (empty input, broken sampling, unmarshalable
//! functions, workloads too short to amortise a pool), then searches a
//! power-of-two worker ladder scored by the cost model, guards the result
//! against the memory budget, and finally refuses to parallelise at all
//! when the predicted speedup is not worth it.
//!
//! Planning is deterministic: identical samples, system snapshots, and
//! options produce the identical plan.

pub mod streaming;

use crate::cache::DecisionCache;
use crate::config::{ExecutorKind, NestedPolicy, PlanOptions};
use crate::data::{DataKind, DataSource};
use crate::model::CostContext;
use crate::pool::{self, PoolKey};
use crate::probe::{self, SystemInfo};
use crate::sample::{self, fingerprint::fingerprint, SamplerConfig, WorkloadSample, WorkloadType};
use crate::task::TaskFn;
use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Workloads shorter than spawn cost plus this margin stay serial
const SHORT_WORKLOAD_MARGIN_SECONDS: f64 = 0.005;

/// Assumed item count when a one-pass input reports nothing at all
const FALLBACK_ASSUMED_COUNT: usize = 1000;

/// Why a plan came back serial
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    EmptyInput,
    TrivialInput,
    UnmarshalableFunction,
    UnmarshalableData,
    SamplingError,
    WorkloadTooShort,
    MemoryConstrained,
    InsufficientSpeedup,
    NestedParallelism,
}

impl RejectionReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectionReason::EmptyInput => "empty_input",
            RejectionReason::TrivialInput => "trivial_input",
            RejectionReason::UnmarshalableFunction => "unmarshalable_function",
            RejectionReason::UnmarshalableData => "unmarshalable_data",
            RejectionReason::SamplingError => "sampling_error",
            RejectionReason::WorkloadTooShort => "workload_too_short",
            RejectionReason::MemoryConstrained => "memory_constrained",
            RejectionReason::InsufficientSpeedup => "insufficient_speedup",
            RejectionReason::NestedParallelism => "nested_parallelism",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            RejectionReason::EmptyInput => "input collection is empty",
            RejectionReason::TrivialInput => "a single item gains nothing from parallelism",
            RejectionReason::UnmarshalableFunction => {
                "function cannot be shipped to worker processes"
            }
            RejectionReason::UnmarshalableData => "sampled items could not be marshalled",
            RejectionReason::SamplingError => "the function failed on sampled items",
            RejectionReason::WorkloadTooShort => "total work is smaller than pool startup cost",
            RejectionReason::MemoryConstrained => "no worker/chunk combination fits in memory",
            RejectionReason::InsufficientSpeedup => "predicted speedup is below the threshold",
            RejectionReason::NestedParallelism => "already running inside a worker",
        }
    }

    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            RejectionReason::UnmarshalableFunction => Some(
                "register the function under a stable name with TaskFn::registered, \
                 or force executor_kind=thread to keep the closure in-process",
            ),
            RejectionReason::UnmarshalableData => {
                Some("make the item type serde-serializable, or force executor_kind=thread")
            }
            RejectionReason::SamplingError => {
                Some("fix the function for the failing items before parallelising")
            }
            RejectionReason::WorkloadTooShort => {
                Some("batch more items per call, or accept serial execution")
            }
            RejectionReason::MemoryConstrained => {
                Some("reduce item output size, raise memory_fraction, or process in smaller batches")
            }
            _ => None,
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Non-fatal observations attached to a plan, in the order they were made
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PlanWarning {
    IoBoundHint { cpu_time_ratio: f64 },
    Heterogeneous { cv: f64 },
    NestedParallelism,
    UnknownInputLength { assumed: usize },
    ProbeUntrusted,
    MemoryLimited { requested_chunksize: usize, fitted_chunksize: usize },
}

impl fmt::Display for PlanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanWarning::IoBoundHint { cpu_time_ratio } => write!(
                f,
                "workload is io-bound (cpu ratio {:.2}), switched to threads",
                cpu_time_ratio
            ),
            PlanWarning::Heterogeneous { cv } => {
                write!(f, "item times vary widely (cv {:.2}), using smaller chunks", cv)
            }
            PlanWarning::NestedParallelism => {
                write!(f, "called from inside a worker, capping at one worker")
            }
            PlanWarning::UnknownInputLength { assumed } => {
                write!(f, "input length unknown, planning for {} items", assumed)
            }
            PlanWarning::ProbeUntrusted => {
                write!(f, "overhead probe fell back to defaults")
            }
            PlanWarning::MemoryLimited { requested_chunksize, fitted_chunksize } => write!(
                f,
                "chunksize reduced from {} to {} to fit the memory budget",
                requested_chunksize, fitted_chunksize
            ),
        }
    }
}

/// The planner's decision: parameters, predictions, and provenance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizationPlan {
    pub n_workers: usize,
    pub chunksize: usize,
    pub executor_kind: ExecutorKind,
    pub predicted_wall_seconds: f64,
    pub predicted_speedup: f64,
    pub rejection_reason: Option<RejectionReason>,
    pub warnings: Vec<PlanWarning>,
    /// Human-readable account of the path the planner took
    pub explanation: String,
    pub fingerprint: Option<String>,
    pub count_total: Option<usize>,
    pub workload_type: Option<WorkloadType>,
    /// Time spent sampling and planning, for observability
    pub elapsed_planning_seconds: f64,
    /// True when this plan was served from the decision cache
    pub from_cache: bool,
}

impl OptimizationPlan {
    pub fn is_serial(&self) -> bool {
        self.executor_kind == ExecutorKind::Serial
    }
}

impl fmt::Display for OptimizationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rejection_reason {
            Some(reason) => write!(f, "serial ({})", reason.code()),
            None => write!(
                f,
                "{} x{} workers, chunks of {} ({:.1}x predicted)",
                self.executor_kind, self.n_workers, self.chunksize, self.predicted_speedup
            ),
        }
    }
}

/// A plan together with the (possibly re-spliced) input it was made for
#[derive(Debug)]
pub struct PlanOutcome<I> {
    pub plan: OptimizationPlan,
    pub data: DataSource<I>,
}

/// Pure planning inputs; everything the decision depends on
#[derive(Debug)]
pub struct PlanInputs<'a> {
    pub sample: &'a WorkloadSample,
    pub system: &'a SystemInfo,
    /// Exact count when known
    pub count_total: Option<usize>,
    /// Count used for the math (equals `count_total` when known)
    pub count_assumed: usize,
    pub options: &'a PlanOptions,
    /// True when planning happens inside a pool worker
    pub nested: bool,
    /// Pools the manager already holds idle, for spawn amortisation
    pub warm_pools: &'a [PoolKey],
}

/// Plan the batch execution of `task` over `data`
///
/// Samples first (strictly serial), consults the decision cache, then
/// searches candidates. The returned outcome carries the data handle back
/// so single-pass inputs can still be enumerated exactly once.
pub fn plan<I, O>(
    task: &TaskFn<I, O>,
    mut data: DataSource<I>,
    options: &PlanOptions,
) -> crate::Result<PlanOutcome<I>> {
    let started = Instant::now();
    if let Err(message) = options.validate() {
        bail!("invalid options: {}", message);
    }
    if data.kind() == DataKind::UnboundedStream {
        bail!("unbounded streams cannot be batch-planned; use plan_stream");
    }

    let system = probe::info();

    if let Some(plan) = reject_degenerate(&data, started) {
        return Ok(PlanOutcome { plan, data });
    }

    let sample = sample::sample(task, &mut data, &SamplerConfig::from_options(options));
    tracing::info!(
        count_sampled = sample.count_sampled,
        mean_item_seconds = sample.mean_item_seconds,
        cpu_time_ratio = sample.cpu_time_ratio,
        workload_type = %sample.workload_type,
        "sampling_complete"
    );

    // Buffering may have discovered that a one-pass input is degenerate
    if let Some(plan) = reject_degenerate(&data, started) {
        return Ok(PlanOutcome { plan, data });
    }

    let (count_total, count_assumed) = resolve_count(&data, options);
    let fp = fingerprint(
        task.identity(),
        std::any::type_name::<I>(),
        count_total,
        &sample,
        &system.signature(),
    );

    let cache = DecisionCache::open(options.no_cache);
    if let Some(entry) = cache.lookup(&fp, &system.signature()) {
        let mut plan = entry.plan;
        plan.from_cache = true;
        plan.fingerprint = Some(fp);
        plan.elapsed_planning_seconds = started.elapsed().as_secs_f64();
        return Ok(PlanOutcome { plan, data });
    }

    let warm_pools = pool::manager().warm_keys();
    let inputs = PlanInputs {
        sample: &sample,
        system: &system,
        count_total,
        count_assumed,
        options,
        nested: pool::in_worker(),
        warm_pools: &warm_pools,
    };
    let mut plan = decide(&inputs);
    plan.fingerprint = Some(fp.clone());
    plan.elapsed_planning_seconds = started.elapsed().as_secs_f64();

    // Transient sampling failures should not poison future lookups
    if plan.rejection_reason != Some(RejectionReason::SamplingError) {
        cache.store(&fp, &plan, options.cache_ttl_seconds, &system.signature());
    }

    emit_plan_events(&plan);
    Ok(PlanOutcome { plan, data })
}

fn emit_plan_events(plan: &OptimizationPlan) {
    if let Some(reason) = plan.rejection_reason {
        tracing::info!(
            fingerprint = plan.fingerprint.as_deref().unwrap_or(""),
            reason = reason.code(),
            "rejection"
        );
    }
    tracing::info!(
        fingerprint = plan.fingerprint.as_deref().unwrap_or(""),
        executor = %plan.executor_kind,
        n_workers = plan.n_workers,
        chunksize = plan.chunksize,
        predicted_speedup = plan.predicted_speedup,
        elapsed_seconds = plan.elapsed_planning_seconds,
        "plan_decided"
    );
}

/// Empty and single-item inputs short-circuit before any sampling
fn reject_degenerate(
    data: &DataSource<impl Sized>,
    started: Instant,
) -> Option<OptimizationPlan> {
    let reason = match data.len() {
        Some(0) => RejectionReason::EmptyInput,
        Some(1) => RejectionReason::TrivialInput,
        _ => return None,
    };
    let mut plan = serial_plan(reason, Vec::new(), 0.0, data.len(), None);
    plan.elapsed_planning_seconds = started.elapsed().as_secs_f64();
    Some(plan)
}

/// Resolve the item count the planner will reason with
fn resolve_count(data: &DataSource<impl Sized>, options: &PlanOptions) -> (Option<usize>, usize) {
    match data.len() {
        Some(count) => (Some(count), count),
        None => {
            let assumed = options
                .count_hint
                .unwrap_or_else(|| data.lower_bound().max(FALLBACK_ASSUMED_COUNT));
            (None, assumed)
        }
    }
}

fn serial_plan(
    reason: RejectionReason,
    warnings: Vec<PlanWarning>,
    serial_seconds: f64,
    count_total: Option<usize>,
    workload_type: Option<WorkloadType>,
) -> OptimizationPlan {
    let mut explanation = reason.message().to_string();
    if let Some(remediation) = reason.remediation() {
        explanation.push_str("; ");
        explanation.push_str(remediation);
    }
    OptimizationPlan {
        n_workers: 1,
        chunksize: 1,
        executor_kind: ExecutorKind::Serial,
        predicted_wall_seconds: serial_seconds,
        predicted_speedup: 1.0,
        rejection_reason: Some(reason),
        warnings,
        explanation,
        fingerprint: None,
        count_total,
        workload_type,
        elapsed_planning_seconds: 0.0,
        from_cache: false,
    }
}

/// The deterministic planning core
pub fn decide(inputs: &PlanInputs<'_>) -> OptimizationPlan {
    let sample = inputs.sample;
    let options = inputs.options;
    let system = inputs.system;
    let count = inputs.count_assumed;

    let mut warnings = Vec::new();
    if !system.overhead_trusted {
        warnings.push(PlanWarning::ProbeUntrusted);
    }
    if inputs.count_total.is_none() {
        warnings.push(PlanWarning::UnknownInputLength { assumed: count });
    }

    // Executor selection: an explicit choice always wins; io-bound
    // workloads otherwise move to threads where oversubscription is safe.
    let io_bound = sample.workload_type == WorkloadType::IoBound;
    let kind = match options.executor_kind {
        Some(kind) => kind,
        None if io_bound => {
            warnings.push(PlanWarning::IoBoundHint {
                cpu_time_ratio: sample.cpu_time_ratio,
            });
            ExecutorKind::Thread
        }
        None => ExecutorKind::Process,
    };

    let context = CostContext::new(sample, system, count);
    let serial_seconds = context.serial_seconds();

    if kind == ExecutorKind::Serial {
        return OptimizationPlan {
            n_workers: 1,
            chunksize: 1,
            executor_kind: ExecutorKind::Serial,
            predicted_wall_seconds: serial_seconds,
            predicted_speedup: 1.0,
            rejection_reason: None,
            warnings,
            explanation: "serial executor forced by options".to_string(),
            fingerprint: None,
            count_total: inputs.count_total,
            workload_type: Some(sample.workload_type),
            elapsed_planning_seconds: 0.0,
            from_cache: false,
        };
    }

    // Reject-first checks against the chosen executor
    if kind == ExecutorKind::Process && !sample.func_marshalable {
        return serial_plan(
            RejectionReason::UnmarshalableFunction,
            warnings,
            serial_seconds,
            inputs.count_total,
            Some(sample.workload_type),
        );
    }
    if kind == ExecutorKind::Process && !sample.all_items_marshalable {
        return serial_plan(
            RejectionReason::UnmarshalableData,
            warnings,
            serial_seconds,
            inputs.count_total,
            Some(sample.workload_type),
        );
    }
    if sample.errored() {
        let mut plan = serial_plan(
            RejectionReason::SamplingError,
            warnings,
            serial_seconds,
            inputs.count_total,
            Some(sample.workload_type),
        );
        if let Some(failure) = sample.failures.first() {
            plan.explanation =
                format!("{} (item {}: {})", plan.explanation, failure.index, failure.error);
        }
        return plan;
    }

    let spawn_cost = system.spawn_cost_seconds(match kind {
        ExecutorKind::Thread => probe::SpawnMethod::Thread,
        _ => probe::SpawnMethod::Spawn,
    });
    if serial_seconds < spawn_cost + SHORT_WORKLOAD_MARGIN_SECONDS {
        return serial_plan(
            RejectionReason::WorkloadTooShort,
            warnings,
            serial_seconds,
            inputs.count_total,
            Some(sample.workload_type),
        );
    }

    // Nested parallelism: serialize or reject per policy
    let mut max_workers = options.max_workers.unwrap_or_else(|| {
        if io_bound {
            system.physical_cores * 4
        } else {
            system.physical_cores
        }
    });
    if inputs.nested {
        match options.nested_parallelism_policy {
            NestedPolicy::Reject => {
                return serial_plan(
                    RejectionReason::NestedParallelism,
                    warnings,
                    serial_seconds,
                    inputs.count_total,
                    Some(sample.workload_type),
                );
            }
            NestedPolicy::Serialize => {
                warnings.push(PlanWarning::NestedParallelism);
                max_workers = 1;
            }
        }
    }

    let heterogeneous = sample.heterogeneous();
    if heterogeneous {
        warnings.push(PlanWarning::Heterogeneous { cv: sample.cv() });
    }

    let search = search_candidates(&context, kind, max_workers, count, inputs, &mut warnings);
    let (best, memory_rejected_all) = match search {
        Some(best) => (best, false),
        None => (Candidate::default(), true),
    };

    if memory_rejected_all {
        return serial_plan(
            RejectionReason::MemoryConstrained,
            warnings,
            serial_seconds,
            inputs.count_total,
            Some(sample.workload_type),
        );
    }

    if best.prediction.speedup < options.min_speedup {
        let mut plan = serial_plan(
            RejectionReason::InsufficientSpeedup,
            warnings,
            serial_seconds,
            inputs.count_total,
            Some(sample.workload_type),
        );
        plan.explanation = format!(
            "{}: best candidate {} workers x chunks of {} predicted only {:.2}x (threshold {:.2}x)",
            RejectionReason::InsufficientSpeedup.message(),
            best.n_workers,
            best.chunksize,
            best.prediction.speedup,
            options.min_speedup
        );
        return plan;
    }

    let explanation = format!(
        "workload {} (cpu ratio {:.2}); {} workers x chunks of {} predicted {:.2}s vs {:.2}s serial ({:.1}x)",
        sample.workload_type,
        sample.cpu_time_ratio,
        best.n_workers,
        best.chunksize,
        best.prediction.wall_seconds,
        serial_seconds,
        best.prediction.speedup
    );

    OptimizationPlan {
        n_workers: best.n_workers,
        chunksize: best.chunksize,
        executor_kind: kind,
        predicted_wall_seconds: best.prediction.wall_seconds,
        predicted_speedup: best.prediction.speedup,
        rejection_reason: None,
        warnings,
        explanation,
        fingerprint: None,
        count_total: inputs.count_total,
        workload_type: Some(sample.workload_type),
        elapsed_planning_seconds: 0.0,
        from_cache: false,
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    n_workers: usize,
    chunksize: usize,
    prediction: crate::model::Prediction,
}

impl Default for Candidate {
    fn default() -> Self {
        Self {
            n_workers: 1,
            chunksize: 1,
            prediction: crate::model::Prediction {
                wall_seconds: f64::INFINITY,
                speedup: 0.0,
                in_flight_bytes: 0.0,
            },
        }
    }
}

/// Enumerate the power-of-two worker ladder, score with the cost model,
/// and enforce the memory budget by stepping chunksize down before
/// abandoning a worker count.
fn search_candidates(
    context: &CostContext<'_>,
    kind: ExecutorKind,
    max_workers: usize,
    count: usize,
    inputs: &PlanInputs<'_>,
    warnings: &mut Vec<PlanWarning>,
) -> Option<Candidate> {
    let sample = inputs.sample;
    let options = inputs.options;
    let memory_budget =
        options.memory_fraction * inputs.system.available_memory_bytes as f64;

    let mean_item = sample.mean_item_seconds.max(1e-9);
    let base_chunksize = ((options.target_chunk_seconds / mean_item).round() as usize).max(1);

    let mut ladder = Vec::new();
    let mut n = 1usize;
    while n <= max_workers {
        ladder.push(n);
        n *= 2;
    }

    let mut best: Option<Candidate> = None;
    let mut memory_stepped: Option<(usize, usize)> = None;

    for &n_workers in &ladder {
        let per_worker_cap = ((count + n_workers - 1) / n_workers).max(1);
        let mut chunk_choices = vec![base_chunksize.min(per_worker_cap)];
        if sample.heterogeneous() {
            // Smaller chunks rebalance skewed item times at the cost of
            // extra dispatches.
            chunk_choices.push((base_chunksize / 2).max(1).min(per_worker_cap));
            chunk_choices.push((base_chunksize / 4).max(1).min(per_worker_cap));
        }
        chunk_choices.dedup();

        for &requested in &chunk_choices {
            let mut chunksize = requested;
            let mut prediction =
                context
                    .with_warm_pool(is_warm(inputs.warm_pools, kind, n_workers))
                    .predict(kind, n_workers, chunksize);

            while prediction.in_flight_bytes > memory_budget && chunksize > 1 {
                chunksize = (chunksize / 2).max(1);
                prediction = context
                    .with_warm_pool(is_warm(inputs.warm_pools, kind, n_workers))
                    .predict(kind, n_workers, chunksize);
            }
            if prediction.in_flight_bytes > memory_budget {
                continue;
            }
            if chunksize != requested {
                memory_stepped.get_or_insert((requested, chunksize));
            }

            let candidate = Candidate {
                n_workers,
                chunksize,
                prediction,
            };
            let replace = match best {
                None => true,
                // Strict improvement only: the ladder is ascending in n and
                // choices descend in c, so ties keep fewer workers and
                // larger chunks.
                Some(current) => prediction.wall_seconds < current.prediction.wall_seconds,
            };
            if replace {
                best = Some(candidate);
            }
        }
    }

    if let (Some((requested, fitted)), Some(_)) = (memory_stepped, best.as_ref()) {
        warnings.push(PlanWarning::MemoryLimited {
            requested_chunksize: requested,
            fitted_chunksize: fitted,
        });
    }

    best
}

fn is_warm(warm_pools: &[PoolKey], kind: ExecutorKind, workers: usize) -> bool {
    warm_pools.iter().any(|key| key.kind == kind && key.workers == workers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::WorkloadType;

    fn sample(mean: f64, stddev: f64, out_bytes: f64, ratio: f64) -> WorkloadSample {
        WorkloadSample {
            count_sampled: 5,
            mean_item_seconds: mean,
            stddev_item_seconds: stddev,
            mean_input_bytes: 8.0,
            mean_output_bytes: out_bytes,
            cpu_time_ratio: ratio,
            workload_type: WorkloadType::classify(ratio, 0.3, 0.7),
            func_marshalable: true,
            all_items_marshalable: true,
            failures: Vec::new(),
        }
    }

    fn inputs<'a>(
        sample: &'a WorkloadSample,
        system: &'a SystemInfo,
        count: usize,
        options: &'a PlanOptions,
    ) -> PlanInputs<'a> {
        PlanInputs {
            sample,
            system,
            count_total: Some(count),
            count_assumed: count,
            options,
            nested: false,
            warm_pools: &[],
        }
    }

    #[test]
    fn test_heavy_cpu_workload_uses_all_cores() {
        let system = SystemInfo::for_tests();
        let sample = sample(0.01, 0.0005, 8.0, 0.95);
        let options = PlanOptions::default();
        let plan = decide(&inputs(&sample, &system, 1000, &options));

        assert_eq!(plan.rejection_reason, None);
        assert_eq!(plan.executor_kind, ExecutorKind::Process);
        assert_eq!(plan.n_workers, 8);
        // target 0.2s / 10ms per item = 20 items per chunk
        assert_eq!(plan.chunksize, 20);
        assert!(plan.predicted_speedup >= 5.0 && plan.predicted_speedup <= 8.0);
    }

    #[test]
    fn test_trivial_compute_rejected_for_speedup() {
        let system = SystemInfo::for_tests();
        let sample = sample(0.3e-6, 0.0, 8.0, 0.95);
        let options = PlanOptions::default();
        let plan = decide(&inputs(&sample, &system, 10_000, &options));

        assert!(plan.is_serial());
        assert!(matches!(
            plan.rejection_reason,
            Some(RejectionReason::WorkloadTooShort) | Some(RejectionReason::InsufficientSpeedup)
        ));
        assert_eq!(plan.n_workers, 1);
    }

    #[test]
    fn test_heterogeneous_workload_picks_smaller_chunks() {
        let system = SystemInfo::for_tests();
        let homogeneous = sample(0.01, 0.0, 8.0, 0.95);
        let heterogeneous = sample(0.01, 0.012, 8.0, 0.95);
        let options = PlanOptions::default();

        let uniform_plan = decide(&inputs(&homogeneous, &system, 2000, &options));
        let skewed_plan = decide(&inputs(&heterogeneous, &system, 2000, &options));

        assert_eq!(uniform_plan.rejection_reason, None);
        assert_eq!(skewed_plan.rejection_reason, None);
        assert!(skewed_plan.chunksize < uniform_plan.chunksize);
        assert!(skewed_plan
            .warnings
            .iter()
            .any(|w| matches!(w, PlanWarning::Heterogeneous { .. })));
    }

    #[test]
    fn test_io_bound_switches_to_threads_and_oversubscribes() {
        let system = SystemInfo::for_tests();
        let sample = sample(0.01, 0.0, 8.0, 0.05);
        let options = PlanOptions::default();
        let plan = decide(&inputs(&sample, &system, 10_000, &options));

        assert_eq!(plan.rejection_reason, None);
        assert_eq!(plan.executor_kind, ExecutorKind::Thread);
        assert!(plan.n_workers > system.physical_cores);
        assert!(plan.n_workers <= system.physical_cores * 4);
        assert!(plan
            .warnings
            .iter()
            .any(|w| matches!(w, PlanWarning::IoBoundHint { .. })));
    }

    #[test]
    fn test_unmarshalable_function_rejected_with_remediation() {
        let system = SystemInfo::for_tests();
        let mut unmarshalable = sample(0.01, 0.0, 8.0, 0.95);
        unmarshalable.func_marshalable = false;
        let options = PlanOptions::default();
        let plan = decide(&inputs(&unmarshalable, &system, 1000, &options));

        assert!(plan.is_serial());
        assert_eq!(plan.rejection_reason, Some(RejectionReason::UnmarshalableFunction));
        assert!(plan.explanation.contains("TaskFn::registered"));
    }

    #[test]
    fn test_unmarshalable_closure_still_runs_on_forced_threads() {
        let system = SystemInfo::for_tests();
        let mut unmarshalable = sample(0.01, 0.0, 8.0, 0.95);
        unmarshalable.func_marshalable = false;
        let options = PlanOptions {
            executor_kind: Some(ExecutorKind::Thread),
            ..PlanOptions::default()
        };
        let plan = decide(&inputs(&unmarshalable, &system, 1000, &options));

        assert_eq!(plan.rejection_reason, None);
        assert_eq!(plan.executor_kind, ExecutorKind::Thread);
    }

    #[test]
    fn test_sampling_error_rejects_parallelism() {
        let system = SystemInfo::for_tests();
        let mut errored = sample(0.01, 0.0, 8.0, 0.95);
        errored.failures.push(crate::sample::ItemFailure {
            index: 2,
            error: crate::task::TaskError::Failed("boom".to_string()),
        });
        let options = PlanOptions::default();
        let plan = decide(&inputs(&errored, &system, 1000, &options));

        assert_eq!(plan.rejection_reason, Some(RejectionReason::SamplingError));
        assert!(plan.explanation.contains("boom"));
    }

    #[test]
    fn test_nested_serialize_policy_caps_workers() {
        let system = SystemInfo::for_tests();
        let sample = sample(0.01, 0.0, 8.0, 0.95);
        let options = PlanOptions::default();
        let mut nested_inputs = inputs(&sample, &system, 1000, &options);
        nested_inputs.nested = true;
        let plan = decide(&nested_inputs);

        // One worker cannot beat the speedup gate, so the plan is serial
        assert!(plan.is_serial());
        assert!(plan
            .warnings
            .iter()
            .any(|w| matches!(w, PlanWarning::NestedParallelism)));
    }

    #[test]
    fn test_nested_reject_policy() {
        let system = SystemInfo::for_tests();
        let sample = sample(0.01, 0.0, 8.0, 0.95);
        let options = PlanOptions {
            nested_parallelism_policy: NestedPolicy::Reject,
            ..PlanOptions::default()
        };
        let mut nested_inputs = inputs(&sample, &system, 1000, &options);
        nested_inputs.nested = true;
        let plan = decide(&nested_inputs);

        assert_eq!(plan.rejection_reason, Some(RejectionReason::NestedParallelism));
    }

    #[test]
    fn test_memory_guard_steps_chunksize_down() {
        let mut system = SystemInfo::for_tests();
        // Budget of 0.5 * available must be smaller than one default chunk
        system.available_memory_bytes = 2 * 1024 * 1024;
        let sample = sample(0.01, 0.0, 1024.0 * 1024.0, 0.95);
        let options = PlanOptions::default();
        let plan = decide(&inputs(&sample, &system, 1000, &options));

        if plan.rejection_reason.is_none() {
            assert!(plan.chunksize >= 1);
            let budget = 0.5 * system.available_memory_bytes as f64;
            let in_flight = plan.n_workers as f64
                * plan.chunksize as f64
                * (sample.mean_input_bytes + sample.mean_output_bytes);
            assert!(in_flight <= budget, "in-flight {} exceeds budget {}", in_flight, budget);
            assert!(plan
                .warnings
                .iter()
                .any(|w| matches!(w, PlanWarning::MemoryLimited { .. })));
        } else {
            assert_eq!(plan.rejection_reason, Some(RejectionReason::MemoryConstrained));
        }
    }

    #[test]
    fn test_memory_constrained_when_nothing_fits() {
        let mut system = SystemInfo::for_tests();
        system.available_memory_bytes = 16;
        let sample = sample(0.05, 0.0, 10.0 * 1024.0 * 1024.0, 0.95);
        let options = PlanOptions::default();
        let plan = decide(&inputs(&sample, &system, 1000, &options));

        assert_eq!(plan.rejection_reason, Some(RejectionReason::MemoryConstrained));
        assert_eq!(plan.n_workers, 1);
    }

    #[test]
    fn test_determinism() {
        let system = SystemInfo::for_tests();
        let sample = sample(0.004, 0.001, 64.0, 0.9);
        let options = PlanOptions::default();
        let first = decide(&inputs(&sample, &system, 5000, &options));
        let second = decide(&inputs(&sample, &system, 5000, &options));
        assert_eq!(first, second);
    }

    #[test]
    fn test_explicit_max_workers_is_honored() {
        let system = SystemInfo::for_tests();
        let sample = sample(0.01, 0.0, 8.0, 0.95);
        let options = PlanOptions {
            max_workers: Some(2),
            ..PlanOptions::default()
        };
        let plan = decide(&inputs(&sample, &system, 1000, &options));
        assert!(plan.n_workers <= 2);
    }

    #[test]
    fn test_forced_serial_has_no_rejection() {
        let system = SystemInfo::for_tests();
        let sample = sample(0.01, 0.0, 8.0, 0.95);
        let options = PlanOptions {
            executor_kind: Some(ExecutorKind::Serial),
            ..PlanOptions::default()
        };
        let plan = decide(&inputs(&sample, &system, 1000, &options));
        assert!(plan.is_serial());
        assert_eq!(plan.rejection_reason, None);
        assert_eq!(plan.n_workers, 1);
    }

    #[test]
    fn test_warm_pool_improves_prediction() {
        let system = SystemInfo::for_tests();
        let sample = sample(0.002, 0.0, 8.0, 0.95);
        let options = PlanOptions::default();

        let cold = decide(&inputs(&sample, &system, 400, &options));
        let warm_keys: Vec<PoolKey> = (0..6)
            .map(|i| PoolKey {
                kind: ExecutorKind::Process,
                workers: 1 << i,
            })
            .collect();
        let mut warm_inputs = inputs(&sample, &system, 400, &options);
        warm_inputs.warm_pools = &warm_keys;
        let warm = decide(&warm_inputs);

        if let (None, None) = (cold.rejection_reason, warm.rejection_reason) {
            assert!(warm.predicted_wall_seconds <= cold.predicted_wall_seconds);
        }
    }
}
