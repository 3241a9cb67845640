//! Streaming plan execution
//!
//! Yields results lazily instead of collecting them. In-flight work is
//! bounded by the plan's buffer size, so an unbounded input stream never
//! materialises: dispatch blocks once the buffer is full and resumes as
//! the consumer drains results.
//!
//! Thread plans run a dispatcher thread feeding the pool, with a ticket
//! channel capping chunks in flight. Process plans pipeline chunks through
//! the worker children directly from `next()`, collecting oldest-first,
//! which preserves input order as a side effect.

use super::{next_chunk, CancelToken, ExecContext};
use crate::config::ExecutorKind;
use crate::data::DataSource;
use crate::planner::streaming::StreamingPlan;
use crate::pool::{self, PoolKey, WorkerPool};
use crate::task::{TaskError, TaskFn};
use anyhow::{anyhow, Context};
use crossbeam::channel::{self, Receiver};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Lazy sequence of per-item results
pub enum ResultStream<O> {
    Serial(SerialStream<O>),
    Threads(ThreadStream<O>),
    Processes(Box<ProcessStream<O>>),
}

impl<O> Iterator for ResultStream<O> {
    type Item = Result<O, TaskError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            ResultStream::Serial(stream) => stream.next(),
            ResultStream::Threads(stream) => stream.next(),
            ResultStream::Processes(stream) => stream.next(),
        }
    }
}

/// Start streaming execution of a plan
pub fn execute_stream_plan<I, O>(
    plan: &StreamingPlan,
    task: &TaskFn<I, O>,
    data: DataSource<I>,
    ctx: &ExecContext,
) -> crate::Result<ResultStream<O>>
where
    I: Send + 'static,
    O: Send + 'static,
{
    match plan.plan.executor_kind {
        ExecutorKind::Serial => Ok(ResultStream::Serial(SerialStream::new(task, data, ctx))),
        ExecutorKind::Thread => Ok(ResultStream::Threads(ThreadStream::new(plan, task, data, ctx)?)),
        ExecutorKind::Process => Ok(ResultStream::Processes(Box::new(ProcessStream::new(
            plan, task, data, ctx,
        )?))),
    }
}

pub struct SerialStream<O> {
    inner: Box<dyn Iterator<Item = Result<O, TaskError>> + Send>,
}

impl<O> SerialStream<O> {
    fn new<I>(task: &TaskFn<I, O>, data: DataSource<I>, ctx: &ExecContext) -> Self
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        let task = task.clone();
        let cancel = ctx.cancel.clone();
        let mut iter = data.into_iter();
        let inner = std::iter::from_fn(move || {
            if cancel.is_cancelled() {
                return None;
            }
            iter.next().map(|item| task.apply(&item))
        });
        Self {
            inner: Box::new(inner),
        }
    }

    fn next(&mut self) -> Option<Result<O, TaskError>> {
        self.inner.next()
    }
}

type ChunkResult<O> = (usize, Vec<Result<O, TaskError>>);

pub struct ThreadStream<O> {
    results: Receiver<ChunkResult<O>>,
    tickets: Receiver<()>,
    dispatcher: Option<JoinHandle<()>>,
    cancel: CancelToken,
    ordered: bool,
    /// Chunks that arrived ahead of the next expected index
    reorder: BTreeMap<usize, Vec<Result<O, TaskError>>>,
    next_expected: usize,
    current: VecDeque<Result<O, TaskError>>,
}

impl<O> ThreadStream<O> {
    fn new<I>(
        plan: &StreamingPlan,
        task: &TaskFn<I, O>,
        data: DataSource<I>,
        ctx: &ExecContext,
    ) -> crate::Result<Self>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        let chunksize = plan.plan.chunksize.max(1);
        let buffer_chunks = (plan.buffer_size / chunksize).max(1);
        let key = PoolKey {
            kind: ExecutorKind::Thread,
            workers: plan.plan.n_workers,
        };
        let handle = pool::manager().acquire(key).context("acquiring thread pool")?;

        let (result_sender, result_receiver) = channel::unbounded::<ChunkResult<O>>();
        let (ticket_sender, ticket_receiver) = channel::bounded::<()>(buffer_chunks);

        let task = task.clone();
        let cancel = ctx.cancel.clone();
        let dispatcher = std::thread::Builder::new()
            .name("amorsize-stream-dispatch".to_string())
            .spawn(move || {
                let mut iter = data.into_iter();
                let mut chunk_index = 0usize;
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let chunk = match next_chunk(&mut iter, chunksize) {
                        Some(chunk) => chunk,
                        None => break,
                    };
                    // Blocks while the buffer is full; erroring means the
                    // consumer is gone
                    if ticket_sender.send(()).is_err() {
                        break;
                    }
                    let task = task.clone();
                    let sender = result_sender.clone();
                    let index = chunk_index;
                    chunk_index += 1;
                    let dispatched = {
                        let guard = handle.pool().lock().expect("pool poisoned");
                        match &*guard {
                            WorkerPool::Threads(thread_pool) => thread_pool
                                .execute(Box::new(move || {
                                    let results: Vec<Result<O, TaskError>> =
                                        chunk.iter().map(|item| task.apply(item)).collect();
                                    let _ = sender.send((index, results));
                                }))
                                .is_ok(),
                            WorkerPool::Processes(_) => false,
                        }
                    };
                    if !dispatched {
                        break;
                    }
                }
                // handle drops here, returning the pool warm
            })
            .map_err(|e| anyhow!("failed to start stream dispatcher: {}", e))?;

        Ok(Self {
            results: result_receiver,
            tickets: ticket_receiver,
            dispatcher: Some(dispatcher),
            cancel: ctx.cancel.clone(),
            ordered: plan.ordered,
            reorder: BTreeMap::new(),
            next_expected: 0,
            current: VecDeque::new(),
        })
    }

    fn next(&mut self) -> Option<Result<O, TaskError>> {
        loop {
            if let Some(result) = self.current.pop_front() {
                return Some(result);
            }
            if self.ordered {
                if let Some(results) = self.reorder.remove(&self.next_expected) {
                    self.next_expected += 1;
                    self.current = results.into();
                    continue;
                }
            }
            match self.results.recv() {
                Ok((index, results)) => {
                    let _ = self.tickets.try_recv();
                    if self.ordered && index != self.next_expected {
                        self.reorder.insert(index, results);
                    } else {
                        if self.ordered {
                            self.next_expected += 1;
                        }
                        self.current = results.into();
                    }
                }
                Err(_) => {
                    // Dispatcher and all jobs are done; flush any buffered
                    // out-of-order chunks
                    if let Some((&index, _)) = self.reorder.iter().next() {
                        let results = self.reorder.remove(&index).unwrap();
                        self.next_expected = index + 1;
                        self.current = results.into();
                        continue;
                    }
                    return None;
                }
            }
        }
    }
}

impl<O> Drop for ThreadStream<O> {
    fn drop(&mut self) {
        self.cancel.cancel();
        // Unblock a dispatcher waiting on a full buffer
        while self.tickets.try_recv().is_ok() {}
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
    }
}

/// One marshalled chunk: sendable bytes plus the per-item marshal failures
/// that never leave the parent
type EncodedChunk = (Vec<Vec<u8>>, Vec<Option<TaskError>>);

struct PendingProcessChunk {
    slots: Vec<Option<TaskError>>,
    child: usize,
}

pub struct ProcessStream<O> {
    handle: Option<pool::PoolHandle>,
    chunks: Box<dyn Iterator<Item = EncodedChunk> + Send>,
    task_name: String,
    decode: Box<dyn Fn(&[u8]) -> Result<O, TaskError> + Send>,
    pending: VecDeque<PendingProcessChunk>,
    current: VecDeque<Result<O, TaskError>>,
    next_child: usize,
    cancel: CancelToken,
    done: bool,
}

impl<O> ProcessStream<O> {
    fn new<I>(
        plan: &StreamingPlan,
        task: &TaskFn<I, O>,
        data: DataSource<I>,
        ctx: &ExecContext,
    ) -> crate::Result<Self>
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
            workers: plan.plan.n_workers,
        };
        let handle = pool::manager().acquire(key).context("acquiring process pool")?;

        let chunksize = plan.plan.chunksize.max(1);
        let encode = Arc::clone(&marshaller);
        let mut raw = data.into_iter();
        // Chunks are encoded lazily as the pipeline pulls them
        let chunks = std::iter::from_fn(move || {
            let chunk = next_chunk(&mut raw, chunksize)?;
            let mut encoded = Vec::with_capacity(chunk.len());
            let mut slots = Vec::with_capacity(chunk.len());
            for item in &chunk {
                match encode.encode_item(item) {
                    Ok(bytes) => {
                        slots.push(None);
                        encoded.push(bytes);
                    }
                    Err(error) => slots.push(Some(error)),
                }
            }
            Some((encoded, slots))
        });

        Ok(Self {
            handle: Some(handle),
            chunks: Box::new(chunks),
            task_name,
            decode: Box::new(move |bytes| marshaller.decode_output(bytes)),
            pending: VecDeque::new(),
            current: VecDeque::new(),
            next_child: 0,
            cancel: ctx.cancel.clone(),
            done: false,
        })
    }

    fn next(&mut self) -> Option<Result<O, TaskError>> {
        loop {
            if let Some(result) = self.current.pop_front() {
                return Some(result);
            }
            if self.cancel.is_cancelled() {
                self.done = true;
            }

            let handle = self.handle.as_ref()?;
            let mut guard = handle.pool().lock().expect("pool poisoned");
            let process_pool = match &mut *guard {
                WorkerPool::Processes(pool) => pool,
                WorkerPool::Threads(_) => return None,
            };

            // Fill the pipeline: one in-flight chunk per child
            while !self.done && self.pending.len() < process_pool.worker_count() {
                match self.chunks.next() {
                    Some((encoded, slots)) => {
                        if encoded.is_empty() {
                            // Every item in the chunk failed to marshal
                            self.current = slots
                                .into_iter()
                                .map(|slot| Err(slot.expect("unsent chunk slot without error")))
                                .collect();
                            break;
                        }
                        let child = self.next_child;
                        self.next_child = (self.next_child + 1) % process_pool.worker_count();
                        if process_pool.dispatch(child, &self.task_name, encoded).is_err() {
                            self.done = true;
                            break;
                        }
                        self.pending.push_back(PendingProcessChunk { slots, child });
                    }
                    None => {
                        self.done = true;
                        break;
                    }
                }
            }
            if !self.current.is_empty() {
                continue;
            }

            // Collect the oldest chunk; FIFO keeps input order
            match self.pending.pop_front() {
                Some(chunk) => match process_pool.collect(chunk.child) {
                    Ok(outputs) => {
                        let mut outputs = outputs.into_iter();
                        self.current = chunk
                            .slots
                            .into_iter()
                            .map(|slot| match slot {
                                Some(error) => Err(error),
                                None => match outputs.next() {
                                    Some(Ok(bytes)) => (self.decode)(&bytes),
                                    Some(Err(message)) => Err(TaskError::Failed(message)),
                                    None => Err(TaskError::Failed(
                                        "worker returned too few outputs".to_string(),
                                    )),
                                },
                            })
                            .collect();
                    }
                    Err(error) => {
                        self.done = true;
                        self.current =
                            VecDeque::from(vec![Err(TaskError::Failed(error.to_string()))]);
                    }
                },
                None => {
                    drop(guard);
                    self.handle.take();
                    return None;
                }
            }
        }
    }
}

impl<O> Drop for ProcessStream<O> {
    fn drop(&mut self) {
        // A consumer that stops early leaves chunks in flight; the pool can
        // only go back warm once its children are idle again.
        if self.pending.is_empty() {
            return;
        }
        if let Some(handle) = self.handle.take() {
            let mut healthy = true;
            if let Ok(mut guard) = handle.pool().lock() {
                if let WorkerPool::Processes(pool) = &mut *guard {
                    while let Some(chunk) = self.pending.pop_front() {
                        if pool.collect_timeout(chunk.child, super::DEFAULT_CANCEL_GRACE).is_err() {
                            pool.kill_all();
                            healthy = false;
                            break;
                        }
                    }
                }
            }
            if !healthy {
                handle.discard();
            }
        }
    }
}
