//! Plan execution
//!
//! Applies an [`OptimizationPlan`]: serial plans iterate on the calling
//! thread; thread and process plans borrow a pool from the manager and
//! dispatch in chunks of the planned size. Output order always matches
//! input order for batch execution. Item failures are collected per item
//! (or abort dispatch when `stop_on_first` is set); they never tear down
//! the run.
//!
//! Cancellation is cooperative: the flag is checked at chunk boundaries,
//! in-flight chunks get a bounded grace period, and process pools that
//! overstay it are force-terminated and discarded.

pub mod hooks;
pub mod stream;

use crate::config::ExecutorKind;
use crate::data::DataSource;
use crate::planner::OptimizationPlan;
use crate::pool::{self, PoolError, PoolKey, WorkerPool};
use crate::task::{TaskError, TaskFn};
use anyhow::{anyhow, Context};
use crossbeam::channel;
use hooks::{EventKind, HookPayload, HookRegistry};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default grace period for in-flight chunks after cancellation
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Cooperative cancellation flag, shared with the caller
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Execution-scoped context: hooks, cancellation, grace period
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub hooks: Arc<HookRegistry>,
    pub cancel: CancelToken,
    pub grace: Duration,
}

impl Default for ExecContext {
    fn default() -> Self {
        Self {
            hooks: Arc::new(HookRegistry::new()),
            cancel: CancelToken::new(),
            grace: DEFAULT_CANCEL_GRACE,
        }
    }
}

/// What execution produced
#[derive(Debug)]
pub struct ExecutionReport<O> {
    /// Per-item outcomes in input order (truncated if cancelled)
    pub outputs: Vec<Result<O, TaskError>>,
    pub executed: ExecutorKind,
    pub chunks_dispatched: usize,
    pub elapsed_seconds: f64,
    pub cancelled: bool,
}

impl<O> ExecutionReport<O> {
    pub fn failure_count(&self) -> usize {
        self.outputs.iter().filter(|r| r.is_err()).count()
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failure_count() == 0
    }

    /// Unwrap all outputs, failing on the first item error
    pub fn into_outputs(self) -> Result<Vec<O>, TaskError> {
        self.outputs.into_iter().collect()
    }
}

/// Apply a batch plan to the data it was made for
pub fn execute_plan<I, O>(
    plan: &OptimizationPlan,
    task: &TaskFn<I, O>,
    data: DataSource<I>,
    stop_on_first: bool,
    ctx: &ExecContext,
) -> crate::Result<ExecutionReport<O>>
where
    I: Send + 'static,
    O: Send + 'static,
{
    let started = Instant::now();
    let mut report = match plan.executor_kind {
        ExecutorKind::Serial => run_serial(plan, task, data, stop_on_first, ctx),
        ExecutorKind::Thread => run_threads(plan, task, data, stop_on_first, ctx)?,
        ExecutorKind::Process => run_processes(plan, task, data, stop_on_first, ctx)?,
    };
    report.elapsed_seconds = started.elapsed().as_secs_f64();
    Ok(report)
}

fn run_serial<I, O>(
    plan: &OptimizationPlan,
    task: &TaskFn<I, O>,
    data: DataSource<I>,
    stop_on_first: bool,
    ctx: &ExecContext,
) -> ExecutionReport<O>
where
    I: Send + 'static,
{
    let chunksize = plan.chunksize.max(1);
    let ticking = ctx.hooks.active();
    let mut outputs = Vec::new();
    let mut cancelled = false;
    let mut chunks = 0;

    for (index, item) in data.into_iter().enumerate() {
        if index % chunksize == 0 {
            if ctx.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            chunks += 1;
        }
        let result = task.apply(&item);
        if ticking {
            if let Err(error) = &result {
                let mut payload = HookPayload::new(EventKind::Error);
                payload.items_done = index;
                payload.message = Some(error.to_string());
                ctx.hooks.emit(&payload);
            }
            let mut payload = HookPayload::new(EventKind::Progress);
            payload.items_done = index + 1;
            payload.count_total = plan.count_total;
            ctx.hooks.emit(&payload);
            if (index + 1) % chunksize == 0 {
                let mut payload = HookPayload::new(EventKind::ChunkDone);
                payload.chunk_index = Some(index / chunksize);
                payload.items_done = index + 1;
                ctx.hooks.emit(&payload);
            }
        }
        let failed = result.is_err();
        outputs.push(result);
        if failed && stop_on_first {
            break;
        }
    }

    ExecutionReport {
        outputs,
        executed: ExecutorKind::Serial,
        chunks_dispatched: chunks,
        elapsed_seconds: 0.0,
        cancelled,
    }
}

/// Pull the next chunk off an iterator
fn next_chunk<I>(iter: &mut impl Iterator<Item = I>, chunksize: usize) -> Option<Vec<I>> {
    let mut chunk = Vec::with_capacity(chunksize);
    for item in iter.by_ref().take(chunksize) {
        chunk.push(item);
    }
    if chunk.is_empty() {
        None
    } else {
        Some(chunk)
    }
}

fn emit_chunk_done(ctx: &ExecContext, chunk_index: usize, items_done: usize, errors: usize) {
    if !ctx.hooks.active() {
        return;
    }
    if errors > 0 {
        let mut payload = HookPayload::new(EventKind::Error);
        payload.chunk_index = Some(chunk_index);
        payload.message = Some(format!("{} item(s) failed", errors));
        ctx.hooks.emit(&payload);
    }
    let mut payload = HookPayload::new(EventKind::ChunkDone);
    payload.chunk_index = Some(chunk_index);
    payload.items_done = items_done;
    ctx.hooks.emit(&payload);
    let mut payload = HookPayload::new(EventKind::Progress);
    payload.items_done = items_done;
    ctx.hooks.emit(&payload);
}

fn run_threads<I, O>(
    plan: &OptimizationPlan,
    task: &TaskFn<I, O>,
    data: DataSource<I>,
    stop_on_first: bool,
    ctx: &ExecContext,
) -> crate::Result<ExecutionReport<O>>
where
    I: Send + 'static,
    O: Send + 'static,
{
    let key = PoolKey {
        kind: ExecutorKind::Thread,
        workers: plan.n_workers,
    };
    let handle = pool::manager().acquire(key).context("acquiring thread pool")?;
    let chunksize = plan.chunksize.max(1);
    let max_in_flight = plan.n_workers * 2;

    let (result_sender, result_receiver) =
        channel::unbounded::<(usize, Vec<Result<O, TaskError>>)>();

    let mut iter = data.into_iter();
    let mut collected: BTreeMap<usize, Vec<Result<O, TaskError>>> = BTreeMap::new();
    let mut in_flight = 0usize;
    let mut dispatched = 0usize;
    let mut items_done = 0usize;
    let mut cancelled = false;
    let mut stopping = false;

    {
        let pool_guard = handle.pool().lock().expect("pool poisoned");
        let thread_pool = match &*pool_guard {
            WorkerPool::Threads(pool) => pool,
            WorkerPool::Processes(_) => {
                return Err(anyhow!("thread plan acquired a process pool"));
            }
        };

        loop {
            if ctx.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if stopping {
                break;
            }
            if in_flight >= max_in_flight {
                let (index, results) = result_receiver.recv().context("collecting chunk")?;
                in_flight -= 1;
                items_done += results.len();
                let errors = results.iter().filter(|r| r.is_err()).count();
                emit_chunk_done(ctx, index, items_done, errors);
                if errors > 0 && stop_on_first {
                    stopping = true;
                }
                collected.insert(index, results);
                continue;
            }
            let chunk = match next_chunk(&mut iter, chunksize) {
                Some(chunk) => chunk,
                None => break,
            };
            let chunk_index = dispatched;
            dispatched += 1;
            in_flight += 1;
            let task = task.clone();
            let sender = result_sender.clone();
            thread_pool
                .execute(Box::new(move || {
                    let results: Vec<Result<O, TaskError>> =
                        chunk.iter().map(|item| task.apply(item)).collect();
                    let _ = sender.send((chunk_index, results));
                }))
                .map_err(|e| anyhow!(e))
                .context("dispatching chunk")?;
        }

        // Drain in-flight chunks; after cancellation the wait is bounded
        while in_flight > 0 {
            let received = if cancelled {
                match result_receiver.recv_timeout(ctx.grace) {
                    Ok(received) => received,
                    Err(_) => break,
                }
            } else {
                match result_receiver.recv() {
                    Ok(received) => received,
                    Err(_) => break,
                }
            };
            in_flight -= 1;
            items_done += received.1.len();
            let errors = received.1.iter().filter(|r| r.is_err()).count();
            emit_chunk_done(ctx, received.0, items_done, errors);
            if errors > 0 && stop_on_first {
                stopping = true;
            }
            collected.insert(received.0, received.1);
        }
    }

    let outputs = collected.into_values().flatten().collect();
    Ok(ExecutionReport {
        outputs,
        executed: ExecutorKind::Thread,
        chunks_dispatched: dispatched,
        elapsed_seconds: 0.0,
        cancelled,
    })
}

/// One dispatched chunk's bookkeeping for the process path
struct PendingChunk {
    chunk_index: usize,
    /// `None` marks an item that failed to marshal and was never sent
    slots: Vec<Option<TaskError>>,
}

fn run_processes<I, O>(
    plan: &OptimizationPlan,
    task: &TaskFn<I, O>,
    data: DataSource<I>,
    stop_on_first: bool,
    ctx: &ExecContext,
) -> crate::Result<ExecutionReport<O>>
where
    I: Send + 'static,
    O: Send + 'static,
{
    let marshaller = task
        .marshaller()
        .cloned()
        .ok_or_else(|| anyhow!("process plan requires a registered, marshalable task"))?;
    let task_name = task
        .name()
        .ok_or_else(|| anyhow!("process plan requires a registered task name"))?
        .to_string();

    let key = PoolKey {
        kind: ExecutorKind::Process,
        workers: plan.n_workers,
    };
    let handle = pool::manager().acquire(key).context("acquiring process pool")?;
    let chunksize = plan.chunksize.max(1);

    let mut iter = data.into_iter();
    let mut collected: BTreeMap<usize, Vec<Result<O, TaskError>>> = BTreeMap::new();
    let mut pending: Vec<Option<PendingChunk>> = Vec::new();
    let mut dispatched = 0usize;
    let mut items_done = 0usize;
    let mut cancelled = false;
    let mut stopping = false;
    let mut broken = false;

    {
        let mut pool_guard = handle.pool().lock().expect("pool poisoned");
        let process_pool = match &mut *pool_guard {
            WorkerPool::Processes(pool) => pool,
            WorkerPool::Threads(_) => {
                return Err(anyhow!("process plan acquired a thread pool"));
            }
        };
        pending.resize_with(process_pool.worker_count(), || None);

        loop {
            if ctx.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if stopping {
                break;
            }
            let chunk = match next_chunk(&mut iter, chunksize) {
                Some(chunk) => chunk,
                None => break,
            };

            let child = dispatched % process_pool.worker_count();
            if process_pool.is_busy(child) {
                let meta = pending[child].take().expect("busy child without pending chunk");
                let outputs = process_pool.collect(child).context("collecting chunk")?;
                let results = merge_chunk(&marshaller, meta.slots, outputs);
                items_done += results.len();
                let errors = results.iter().filter(|r| r.is_err()).count();
                emit_chunk_done(ctx, meta.chunk_index, items_done, errors);
                if errors > 0 && stop_on_first {
                    stopping = true;
                }
                collected.insert(meta.chunk_index, results);
                if stopping {
                    break;
                }
            }

            // Encode items; failures stay local as per-item errors
            let mut slots = Vec::with_capacity(chunk.len());
            let mut encoded = Vec::with_capacity(chunk.len());
            for item in &chunk {
                match marshaller.encode_item(item) {
                    Ok(bytes) => {
                        slots.push(None);
                        encoded.push(bytes);
                    }
                    Err(error) => slots.push(Some(error)),
                }
            }
            let chunk_index = dispatched;
            dispatched += 1;
            if encoded.is_empty() {
                let results = slots
                    .into_iter()
                    .map(|slot| Err(slot.expect("empty chunk slot without error")))
                    .collect::<Vec<Result<O, TaskError>>>();
                items_done += results.len();
                emit_chunk_done(ctx, chunk_index, items_done, results.len());
                if stop_on_first && !results.is_empty() {
                    stopping = true;
                }
                collected.insert(chunk_index, results);
                continue;
            }
            process_pool
                .dispatch(child, &task_name, encoded)
                .context("dispatching chunk")?;
            pending[child] = Some(PendingChunk { chunk_index, slots });
        }

        // Collect in-flight chunks; bounded wait once cancelled
        for child in 0..process_pool.worker_count() {
            if let Some(meta) = pending[child].take() {
                let outputs = if cancelled {
                    match process_pool.collect_timeout(child, ctx.grace) {
                        Ok(outputs) => outputs,
                        Err(PoolError::Timeout) => {
                            process_pool.kill_all();
                            broken = true;
                            break;
                        }
                        Err(error) => return Err(anyhow!(error).context("collecting chunk")),
                    }
                } else {
                    process_pool.collect(child).context("collecting chunk")?
                };
                let results = merge_chunk(&marshaller, meta.slots, outputs);
                items_done += results.len();
                let errors = results.iter().filter(|r| r.is_err()).count();
                emit_chunk_done(ctx, meta.chunk_index, items_done, errors);
                collected.insert(meta.chunk_index, results);
            }
        }
    }

    if broken {
        handle.discard();
    }

    let outputs = collected.into_values().flatten().collect();
    Ok(ExecutionReport {
        outputs,
        executed: ExecutorKind::Process,
        chunks_dispatched: dispatched,
        elapsed_seconds: 0.0,
        cancelled,
    })
}

/// Reunite worker outputs with items that never left the parent
fn merge_chunk<I, O>(
    marshaller: &Arc<dyn crate::task::Marshaller<I, O>>,
    slots: Vec<Option<TaskError>>,
    outputs: Vec<Result<Vec<u8>, String>>,
) -> Vec<Result<O, TaskError>> {
    let mut outputs = outputs.into_iter();
    slots
        .into_iter()
        .map(|slot| match slot {
            Some(error) => Err(error),
            None => match outputs.next() {
                Some(Ok(bytes)) => marshaller.decode_output(&bytes),
                Some(Err(message)) => Err(TaskError::Failed(message)),
                None => Err(TaskError::Failed("worker returned too few outputs".to_string())),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::OptimizationPlan;
    use crate::sample::WorkloadType;

    fn plan(kind: ExecutorKind, n_workers: usize, chunksize: usize) -> OptimizationPlan {
        OptimizationPlan {
            n_workers,
            chunksize,
            executor_kind: kind,
            predicted_wall_seconds: 0.0,
            predicted_speedup: 1.0,
            rejection_reason: None,
            warnings: Vec::new(),
            explanation: String::new(),
            fingerprint: None,
            count_total: None,
            workload_type: Some(WorkloadType::CpuBound),
            elapsed_planning_seconds: 0.0,
            from_cache: false,
        }
    }

    #[test]
    fn test_serial_execution_preserves_order() {
        let task = TaskFn::local(|x: &i64| x * 2);
        let data = DataSource::from_vec((0..25).collect::<Vec<i64>>());
        let report = execute_plan(
            &plan(ExecutorKind::Serial, 1, 4),
            &task,
            data,
            false,
            &ExecContext::default(),
        )
        .unwrap();

        assert!(report.is_success());
        let outputs = report.into_outputs().unwrap();
        assert_eq!(outputs, (0..25).map(|x| x * 2).collect::<Vec<i64>>());
    }

    #[test]
    fn test_thread_execution_preserves_order() {
        let task = TaskFn::local(|x: &i64| x + 100);
        let data = DataSource::from_vec((0..1000).collect::<Vec<i64>>());
        let report = execute_plan(
            &plan(ExecutorKind::Thread, 4, 16),
            &task,
            data,
            false,
            &ExecContext::default(),
        )
        .unwrap();

        assert!(report.is_success());
        assert!(report.chunks_dispatched >= 1000 / 16);
        let outputs = report.into_outputs().unwrap();
        assert_eq!(outputs, (0..1000).map(|x| x + 100).collect::<Vec<i64>>());
    }

    #[test]
    fn test_thread_execution_collects_item_failures() {
        let task: TaskFn<i64, i64> = TaskFn::local_fallible(|x| {
            if x % 10 == 3 {
                Err(TaskError::Failed(format!("item {}", x)))
            } else {
                Ok(*x)
            }
        });
        let data = DataSource::from_vec((0..100).collect::<Vec<i64>>());
        let report = execute_plan(
            &plan(ExecutorKind::Thread, 2, 8),
            &task,
            data,
            false,
            &ExecContext::default(),
        )
        .unwrap();

        assert_eq!(report.failure_count(), 10);
        assert_eq!(report.outputs.len(), 100);
        assert!(report.outputs[3].is_err());
        assert!(report.outputs[4].is_ok());
    }

    #[test]
    fn test_stop_on_first_aborts_dispatch() {
        let task: TaskFn<i64, i64> = TaskFn::local_fallible(|x| {
            if *x == 5 {
                Err(TaskError::Failed("boom".to_string()))
            } else {
                Ok(*x)
            }
        });
        let data = DataSource::from_vec((0..10_000).collect::<Vec<i64>>());
        let report = execute_plan(
            &plan(ExecutorKind::Thread, 2, 4),
            &task,
            data,
            true,
            &ExecContext::default(),
        )
        .unwrap();

        assert!(report.failure_count() >= 1);
        // Dispatch stopped early; nowhere near all chunks ran
        assert!(report.outputs.len() < 10_000);
    }

    #[test]
    fn test_cancellation_stops_serial_run() {
        let ctx = ExecContext::default();
        let cancel = ctx.cancel.clone();
        let task = TaskFn::local(move |x: &i64| {
            if *x == 7 {
                cancel.cancel();
            }
            *x
        });
        let data = DataSource::from_vec((0..10_000).collect::<Vec<i64>>());
        let report = execute_plan(&plan(ExecutorKind::Serial, 1, 4), &task, data, false, &ctx).unwrap();

        assert!(report.cancelled);
        assert!(report.outputs.len() < 10_000);
    }

    #[test]
    fn test_hooks_observe_chunks() {
        use std::sync::atomic::AtomicUsize;

        let ctx = ExecContext::default();
        let chunk_events = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&chunk_events);
        ctx.hooks.register(EventKind::ChunkDone, move |_| {
            count.fetch_add(1, Ordering::Relaxed);
        });

        let task = TaskFn::local(|x: &i64| *x);
        let data = DataSource::from_vec((0..64).collect::<Vec<i64>>());
        let report = execute_plan(&plan(ExecutorKind::Thread, 2, 8), &task, data, false, &ctx).unwrap();

        assert!(report.is_success());
        assert_eq!(chunk_events.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn test_hook_panic_does_not_fail_execution() {
        let ctx = ExecContext::default();
        ctx.hooks.register(EventKind::Progress, |_| panic!("bad hook"));

        let task = TaskFn::local(|x: &i64| x + 1);
        let data = DataSource::from_vec((0..20).collect::<Vec<i64>>());
        let report = execute_plan(&plan(ExecutorKind::Serial, 1, 5), &task, data, false, &ctx).unwrap();
        assert!(report.is_success());
        assert_eq!(report.outputs.len(), 20);
    }

    #[test]
    fn test_one_pass_input_executes_exactly_once() {
        use std::sync::atomic::AtomicUsize;

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let data = DataSource::from_iter((0..50).map(move |x| {
            counter.fetch_add(1, Ordering::Relaxed);
            x as i64
        }));
        let task = TaskFn::local(|x: &i64| *x);
        let report = execute_plan(
            &plan(ExecutorKind::Thread, 2, 5),
            &task,
            data,
            false,
            &ExecContext::default(),
        )
        .unwrap();

        assert_eq!(report.outputs.len(), 50);
        assert_eq!(seen.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn test_process_plan_with_local_task_is_a_contract_error() {
        let task = TaskFn::local(|x: &i64| *x);
        let data = DataSource::from_vec(vec![1i64, 2, 3]);
        let result = execute_plan(
            &plan(ExecutorKind::Process, 2, 1),
            &task,
            data,
            false,
            &ExecContext::default(),
        );
        assert!(result.is_err());
    }
}
