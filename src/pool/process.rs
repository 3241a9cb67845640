//! Process worker pool
//!
//! Spawns worker processes running this same executable in its hidden
//! worker mode and talks to them over stdin/stdout with the framed
//! protocol. Children are tagged with the `AMORSIZE_WORKER` environment
//! marker, which is how nested-parallelism detection recognises them (and
//! their descendants, since the environment is inherited).
//!
//! Dispatch is one chunk per child at a time; the executor pipelines by
//! dispatching to every child before collecting from the first.

use super::{PoolError, WORKER_ENV};
use crate::pool::protocol::{
    read_frame, write_frame, ProtocolError, WorkerRequest, WorkerResponse, PROTOCOL_VERSION,
};
use std::io::BufReader;
use std::os::unix::io::AsRawFd;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

struct ChildWorker {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    busy: bool,
}

pub struct ProcessPool {
    children: Vec<ChildWorker>,
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("workers", &self.children.len())
            .finish()
    }
}

impl ProcessPool {
    /// Spawn `workers` children and handshake with each
    pub fn new(workers: usize) -> Result<Self, PoolError> {
        let exe = std::env::current_exe().map_err(PoolError::Spawn)?;
        let mut children = Vec::with_capacity(workers.max(1));
        for _ in 0..workers.max(1) {
            let mut child = Command::new(&exe)
                .arg("__worker")
                .env(WORKER_ENV, "1")
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .spawn()
                .map_err(PoolError::Spawn)?;
            let stdin = child.stdin.take().ok_or(PoolError::Closed)?;
            let stdout = BufReader::new(child.stdout.take().ok_or(PoolError::Closed)?);
            children.push(ChildWorker {
                child,
                stdin,
                stdout,
                busy: false,
            });
        }

        let mut pool = Self { children };
        for index in 0..pool.children.len() {
            pool.handshake(index)?;
        }
        Ok(pool)
    }

    pub fn worker_count(&self) -> usize {
        self.children.len()
    }

    fn handshake(&mut self, index: usize) -> Result<(), PoolError> {
        let worker = &mut self.children[index];
        write_frame(&mut worker.stdin, &WorkerRequest::Hello { version: PROTOCOL_VERSION })?;
        match read_frame::<WorkerResponse>(&mut worker.stdout)? {
            WorkerResponse::HelloOk { version } if version == PROTOCOL_VERSION => Ok(()),
            WorkerResponse::HelloOk { version } => Err(PoolError::Protocol(
                ProtocolError::VersionMismatch {
                    ours: PROTOCOL_VERSION,
                    theirs: version,
                },
            )),
            WorkerResponse::Failed { message } => Err(PoolError::Worker(message)),
            _ => Err(PoolError::Protocol(ProtocolError::Unexpected("handshake"))),
        }
    }

    /// Round-trip a ping on every child (health checks)
    pub fn ping_all(&mut self) -> Result<(), PoolError> {
        for worker in &mut self.children {
            write_frame(&mut worker.stdin, &WorkerRequest::Ping)?;
            match read_frame::<WorkerResponse>(&mut worker.stdout)? {
                WorkerResponse::Pong => {}
                _ => return Err(PoolError::Protocol(ProtocolError::Unexpected("ping"))),
            }
        }
        Ok(())
    }

    /// Send a chunk to one child without waiting for the result
    pub fn dispatch(
        &mut self,
        index: usize,
        task: &str,
        items: Vec<Vec<u8>>,
    ) -> Result<(), PoolError> {
        let worker = self.children.get_mut(index).ok_or(PoolError::Closed)?;
        debug_assert!(!worker.busy, "dispatch to a busy worker");
        write_frame(
            &mut worker.stdin,
            &WorkerRequest::Run {
                task: task.to_string(),
                items,
            },
        )?;
        worker.busy = true;
        Ok(())
    }

    pub fn is_busy(&self, index: usize) -> bool {
        self.children.get(index).map_or(false, |worker| worker.busy)
    }

    /// Block until the child's in-flight chunk completes
    pub fn collect(&mut self, index: usize) -> Result<Vec<Result<Vec<u8>, String>>, PoolError> {
        let worker = self.children.get_mut(index).ok_or(PoolError::Closed)?;
        let response = read_frame::<WorkerResponse>(&mut worker.stdout)?;
        worker.busy = false;
        match response {
            WorkerResponse::Done { outputs } => Ok(outputs),
            WorkerResponse::Failed { message } => Err(PoolError::Worker(message)),
            _ => Err(PoolError::Protocol(ProtocolError::Unexpected("collect"))),
        }
    }

    /// Like `collect`, but give up if the child stays silent past `timeout`
    ///
    /// Used on cancellation: in-flight chunks get a bounded grace period
    /// before the pool is force-terminated.
    pub fn collect_timeout(
        &mut self,
        index: usize,
        timeout: Duration,
    ) -> Result<Vec<Result<Vec<u8>, String>>, PoolError> {
        let worker = self.children.get_mut(index).ok_or(PoolError::Closed)?;
        // Anything already buffered means the response has started arriving
        if worker.stdout.buffer().is_empty() {
            let mut pollfd = libc::pollfd {
                fd: worker.stdout.get_ref().as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
            // SAFETY: pollfd is a valid pointer for the duration of the call.
            let rc = unsafe { libc::poll(&mut pollfd, 1, millis) };
            if rc == 0 {
                return Err(PoolError::Timeout);
            }
            if rc < 0 {
                return Err(PoolError::Spawn(std::io::Error::last_os_error()));
            }
        }
        self.collect(index)
    }

    /// Ask every child to exit and reap them within the grace period
    pub fn shutdown(&mut self, grace: Duration) {
        for worker in &mut self.children {
            let _ = write_frame(&mut worker.stdin, &WorkerRequest::Shutdown);
        }
        let deadline = Instant::now() + grace;
        for worker in &mut self.children {
            loop {
                match worker.child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    _ => {
                        let _ = worker.child.kill();
                        let _ = worker.child.wait();
                        break;
                    }
                }
            }
        }
        self.children.clear();
    }

    /// Terminate children immediately (cancellation past the grace period)
    pub fn kill_all(&mut self) {
        for worker in &mut self.children {
            let _ = worker.child.kill();
            let _ = worker.child.wait();
        }
        self.children.clear();
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(1));
    }
}

/// Worker-side entry: serve the protocol on this process's stdio
///
/// The binary's hidden worker mode calls this after registering tasks.
pub fn serve_stdio() -> Result<(), ProtocolError> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut reader = stdin.lock();
    let mut writer = stdout.lock();
    crate::pool::protocol::serve(&mut reader, &mut writer)
}
