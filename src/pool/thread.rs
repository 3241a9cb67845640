//! Thread worker pool
//!
//! A fixed set of worker threads draining a shared job channel. Jobs are
//! plain boxed closures, so nothing is marshalled; this is the executor for
//! io-bound workloads and for closures that cannot cross a process
//! boundary. Worker threads carry the ambient in-worker marker so planning
//! from inside a job sees the nesting.

use super::PoolError;
use crossbeam::channel::{self, Sender};
use std::thread::JoinHandle;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct ThreadPool {
    sender: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    workers: usize,
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.workers)
            .field("running", &self.sender.is_some())
            .finish()
    }
}

impl ThreadPool {
    pub fn new(workers: usize) -> Result<Self, PoolError> {
        let workers = workers.max(1);
        let (sender, receiver) = channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("amorsize-worker-{}", index))
                .spawn(move || {
                    super::set_worker_marker(true);
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })
                .map_err(PoolError::Spawn)?;
            handles.push(handle);
        }
        Ok(Self {
            sender: Some(sender),
            handles,
            workers,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Queue a job; it runs on the first free worker
    pub fn execute(&self, job: Job) -> Result<(), PoolError> {
        match &self.sender {
            Some(sender) => sender.send(job).map_err(|_| PoolError::Closed),
            None => Err(PoolError::Closed),
        }
    }

    /// Stop accepting jobs, finish queued work, join all workers
    pub fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_jobs_run_on_all_workers() {
        let pool = ThreadPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_sender, done_receiver) = crossbeam::channel::unbounded();

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            let done = done_sender.clone();
            pool.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                let _ = done.send(());
            }))
            .unwrap();
        }
        for _ in 0..100 {
            done_receiver
                .recv_timeout(std::time::Duration::from_secs(5))
                .unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let mut pool = ThreadPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::Relaxed), 20);
        assert!(pool.execute(Box::new(|| {})).is_err());
    }

    #[test]
    fn test_workers_carry_nested_marker() {
        let pool = ThreadPool::new(1).unwrap();
        let (sender, receiver) = crossbeam::channel::bounded(1);
        pool.execute(Box::new(move || {
            let _ = sender.send(super::super::in_worker());
        }))
        .unwrap();
        assert!(receiver.recv_timeout(std::time::Duration::from_secs(5)).unwrap());
        assert!(!super::super::in_worker());
    }
}
