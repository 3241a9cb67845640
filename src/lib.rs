//! Amorsize - parallelism optimizer
//!
//! Given a unary function and a collection, amorsize decides the triple
//! (worker count, chunk size, executor) that minimizes expected wall-clock
//! time, using a dry-run sampler, system probes that honor container
//! quotas, and an analytical cost model. It returns a plan rather than
//! running the workload; executing the plan is a thin adapter on top.
//!
//! # Architecture
//!
//! - **Probe**: physical cores, cgroup memory limits, measured spawn and
//!   dispatch overheads, cached per process
//! - **Sampler**: per-item compute time, marshalled sizes, CPU-to-wall
//!   ratio, captured failures
//! - **Cost model**: Amdahl-style wall-clock prediction per candidate
//! - **Planner**: reject-first checks, candidate search, memory guard,
//!   minimum-speedup gate; batch and streaming variants
//! - **Decision cache**: fingerprint-keyed plans on disk with TTL and
//!   system-compatibility checks
//! - **Pool manager**: keyed, reusable thread and process pools
//! - **Executor**: chunked dispatch with ordered output, hooks, and
//!   cooperative cancellation
//!
//! # Example
//!
//! ```no_run
//! use amorsize::{execute, PlanOptions, TaskFn};
//!
//! let task = TaskFn::registered("square", |x: &i64| x * x);
//! let report = execute(&task, (0..10_000).collect::<Vec<i64>>().into(),
//!                      &PlanOptions::default())?;
//! println!("{} results in {:.2}s", report.outputs.len(), report.elapsed_seconds);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod cache;
pub mod config;
pub mod data;
pub mod executor;
pub mod health;
pub mod model;
pub mod output;
pub mod planner;
pub mod pool;
pub mod probe;
pub mod sample;
pub mod task;

// Re-export commonly used types
pub use config::{ExecutorKind, NestedPolicy, PlanOptions};
pub use data::DataSource;
pub use executor::{CancelToken, ExecContext, ExecutionReport};
pub use health::HealthReport;
pub use planner::streaming::{StreamOutcome, StreamingPlan};
pub use planner::{OptimizationPlan, PlanOutcome, RejectionReason};
pub use probe::SystemInfo;
pub use task::{TaskError, TaskFn};

/// Result type used throughout amorsize
pub type Result<T> = anyhow::Result<T>;

/// Decide how to run `task` over `data` without running it
pub fn plan<I, O>(
    task: &TaskFn<I, O>,
    data: DataSource<I>,
    options: &PlanOptions,
) -> Result<PlanOutcome<I>> {
    planner::plan(task, data, options)
}

/// Plan, then apply the plan (sugar for `plan` + the executor adapter)
pub fn execute<I, O>(
    task: &TaskFn<I, O>,
    data: DataSource<I>,
    options: &PlanOptions,
) -> Result<ExecutionReport<O>>
where
    I: Send + 'static,
    O: Send + 'static,
{
    execute_with(task, data, options, &ExecContext::default())
}

/// `execute` with caller-supplied hooks and cancellation
pub fn execute_with<I, O>(
    task: &TaskFn<I, O>,
    data: DataSource<I>,
    options: &PlanOptions,
    ctx: &ExecContext,
) -> Result<ExecutionReport<O>>
where
    I: Send + 'static,
    O: Send + 'static,
{
    let outcome = planner::plan(task, data, options)?;
    if ctx.hooks.active() {
        let mut payload = executor::hooks::HookPayload::new(executor::hooks::EventKind::PlanDecided);
        payload.fingerprint = outcome.plan.fingerprint.clone();
        payload.count_total = outcome.plan.count_total;
        payload.message = Some(outcome.plan.to_string());
        ctx.hooks.emit(&payload);
    }
    executor::execute_plan(&outcome.plan, task, outcome.data, options.stop_on_first, ctx)
}

/// Decide how to stream `task` over `data`
pub fn plan_stream<I, O>(
    task: &TaskFn<I, O>,
    data: DataSource<I>,
    options: &PlanOptions,
) -> Result<StreamOutcome<I>> {
    planner::streaming::plan_stream(task, data, options)
}

/// Plan and lazily stream results
pub fn execute_stream<I, O>(
    task: &TaskFn<I, O>,
    data: DataSource<I>,
    options: &PlanOptions,
) -> Result<executor::stream::ResultStream<O>>
where
    I: Send + 'static,
    O: Send + 'static,
{
    execute_stream_with(task, data, options, &ExecContext::default())
}

/// `execute_stream` with caller-supplied hooks and cancellation
pub fn execute_stream_with<I, O>(
    task: &TaskFn<I, O>,
    data: DataSource<I>,
    options: &PlanOptions,
    ctx: &ExecContext,
) -> Result<executor::stream::ResultStream<O>>
where
    I: Send + 'static,
    O: Send + 'static,
{
    let outcome = planner::streaming::plan_stream(task, data, options)?;
    if ctx.hooks.active() {
        let mut payload = executor::hooks::HookPayload::new(executor::hooks::EventKind::PlanDecided);
        payload.fingerprint = outcome.plan.plan.fingerprint.clone();
        payload.count_total = outcome.plan.plan.count_total;
        payload.message = Some(outcome.plan.to_string());
        ctx.hooks.emit(&payload);
    }
    executor::stream::execute_stream_plan(&outcome.plan, task, outcome.data, ctx)
}

/// The cached system snapshot (probed on first use)
pub fn system_info() -> std::sync::Arc<SystemInfo> {
    probe::info()
}

/// Run probes and self-checks
pub fn validate() -> HealthReport {
    health::validate()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_empty_input_is_serial() {
        let task = TaskFn::local(|x: &i64| *x);
        let outcome = plan(&task, DataSource::from_vec(Vec::<i64>::new()), &PlanOptions::default())
            .unwrap();
        assert!(outcome.plan.is_serial());
        assert_eq!(outcome.plan.rejection_reason, Some(RejectionReason::EmptyInput));
        assert_eq!(outcome.plan.n_workers, 1);
    }

    #[test]
    fn test_plan_single_item_is_serial() {
        let task = TaskFn::local(|x: &i64| *x);
        let outcome =
            plan(&task, DataSource::from_vec(vec![42i64]), &PlanOptions::default()).unwrap();
        assert_eq!(outcome.plan.rejection_reason, Some(RejectionReason::TrivialInput));
    }

    #[test]
    fn test_plan_returns_replayable_data() {
        let task = TaskFn::local(|x: &i64| x + 1);
        let options = PlanOptions {
            no_cache: true,
            ..PlanOptions::default()
        };
        let outcome = plan(&task, DataSource::from_iter(0..100i64), &options).unwrap();
        let items: Vec<i64> = outcome.data.into_iter().collect();
        assert_eq!(items, (0..100).collect::<Vec<i64>>());
    }

    #[test]
    fn test_plan_rejects_unbounded_batch() {
        let task = TaskFn::local(|x: &u64| *x);
        let result = plan(&task, DataSource::from_stream(0u64..), &PlanOptions::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_execute_serial_end_to_end() {
        let task = TaskFn::local(|x: &i64| x * x);
        let options = PlanOptions {
            no_cache: true,
            ..PlanOptions::default()
        };
        // Instant per-item work on a small input stays serial and correct
        let report =
            execute(&task, DataSource::from_vec((0..100).collect::<Vec<i64>>()), &options).unwrap();
        assert_eq!(report.executed, ExecutorKind::Serial);
        let outputs = report.into_outputs().unwrap();
        assert_eq!(outputs[7], 49);
        assert_eq!(outputs.len(), 100);
    }

    #[test]
    fn test_invalid_options_error_immediately() {
        let task = TaskFn::local(|x: &i64| *x);
        let options = PlanOptions {
            sample_size: 0,
            ..PlanOptions::default()
        };
        assert!(plan(&task, DataSource::from_vec(vec![1i64, 2]), &options).is_err());
    }

    #[test]
    fn test_system_info_is_shared() {
        let a = system_info();
        let b = system_info();
        assert!(std::sync::Arc::ptr_eq(&a, &b));
    }
}
