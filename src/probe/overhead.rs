//! Empirical overhead measurement
//!
//! Times what the cost model needs: worker pool startup/teardown (threads
//! and processes), marginal per-chunk dispatch, and marshalling throughput.
//! Each spawn measurement runs three trials of create-dispatch-noop-teardown
//! on a trivial pool and keeps the minimum, then passes four validation
//! layers before it is trusted:
//!
//! 1. positive and finite;
//! 2. below 5 s (else the probe is untrusted and a conservative 0.5 s is used);
//! 3. spread across trials below 50% of the minimum;
//! 4. thread spawn not dearer than process spawn, when both measured — this
//!    layer is soft: failing it downgrades trust without discarding values.

use super::ProbeWarning;
use crossbeam::channel;
use std::process::{Command, Stdio};
use std::time::Instant;

const TRIALS: usize = 3;
const SPAWN_CEILING_SECONDS: f64 = 5.0;
const CONSERVATIVE_SPAWN_SECONDS: f64 = 0.5;
const DEFAULT_THREAD_SPAWN_SECONDS: f64 = 0.002;
const DEFAULT_PROCESS_SPAWN_SECONDS: f64 = 0.05;
const DEFAULT_CHUNK_DISPATCH_SECONDS: f64 = 50e-6;
const DEFAULT_MARSHAL_SECONDS_PER_BYTE: f64 = 5e-9;
const DISPATCH_ROUND_TRIPS: usize = 64;
const MARSHAL_REFERENCE_BYTES: usize = 64 * 1024;
const MARSHAL_ITERATIONS: usize = 8;

/// Measured (or defaulted) overheads
#[derive(Debug, Clone)]
pub struct Overheads {
    pub thread_spawn_seconds: f64,
    pub process_spawn_seconds: f64,
    pub chunk_dispatch_seconds: f64,
    pub marshal_seconds_per_byte: f64,
    pub collect_seconds_per_byte: f64,
    pub trusted: bool,
}

/// Run all overhead measurements
pub fn measure(physical_cores: usize, warnings: &mut Vec<ProbeWarning>) -> Overheads {
    let pool_size = physical_cores.min(2).max(1);

    let thread_trials = spawn_trials(|| time_thread_pool(pool_size));
    let process_trials = spawn_trials(|| time_process_pool(pool_size));

    let (thread_spawn, thread_ok) = validate_trials(
        "thread_spawn",
        &thread_trials,
        DEFAULT_THREAD_SPAWN_SECONDS,
        warnings,
    );
    let (process_spawn, process_ok) = validate_trials(
        "process_spawn",
        &process_trials,
        DEFAULT_PROCESS_SPAWN_SECONDS,
        warnings,
    );

    let mut trusted = thread_ok && process_ok;

    // Soft ordering check: the cheap start method must not be dearer than
    // the expensive one. Downgrades trust without discarding the values.
    if thread_ok && process_ok && thread_spawn > process_spawn {
        warnings.push(ProbeWarning::new(
            "spawn_ordering",
            format!(
                "thread spawn ({:.3}ms) measured above process spawn ({:.3}ms)",
                thread_spawn * 1e3,
                process_spawn * 1e3
            ),
        ));
        trusted = false;
    }

    let chunk_dispatch = match time_chunk_dispatch() {
        Some(cost) if cost.is_finite() && cost > 0.0 => cost,
        _ => {
            warnings.push(ProbeWarning::new(
                "chunk_dispatch",
                "dispatch measurement failed, using default",
            ));
            trusted = false;
            DEFAULT_CHUNK_DISPATCH_SECONDS
        }
    };

    let (marshal_rate, collect_rate) = match time_marshal_rates() {
        Some(rates) => rates,
        None => {
            warnings.push(ProbeWarning::new(
                "marshal_rate",
                "marshalling measurement failed, using default",
            ));
            trusted = false;
            (DEFAULT_MARSHAL_SECONDS_PER_BYTE, DEFAULT_MARSHAL_SECONDS_PER_BYTE)
        }
    };

    Overheads {
        thread_spawn_seconds: thread_spawn,
        process_spawn_seconds: process_spawn,
        chunk_dispatch_seconds: chunk_dispatch,
        marshal_seconds_per_byte: marshal_rate,
        collect_seconds_per_byte: collect_rate,
        trusted,
    }
}

fn spawn_trials<F: FnMut() -> Option<f64>>(mut run: F) -> Vec<f64> {
    (0..TRIALS).filter_map(|_| run()).collect()
}

/// Apply validation layers 1-3 to a set of trials
///
/// Returns the accepted value and whether measurement (vs defaults) is in use.
fn validate_trials(
    probe: &str,
    trials: &[f64],
    default: f64,
    warnings: &mut Vec<ProbeWarning>,
) -> (f64, bool) {
    if trials.len() < TRIALS {
        warnings.push(ProbeWarning::new(
            probe,
            format!("only {}/{} trials completed, using default", trials.len(), TRIALS),
        ));
        return (default, false);
    }

    let minimum = trials.iter().cloned().fold(f64::INFINITY, f64::min);
    let maximum = trials.iter().cloned().fold(0.0f64, f64::max);

    if !minimum.is_finite() || minimum <= 0.0 {
        warnings.push(ProbeWarning::new(probe, "non-positive measurement, using default"));
        return (default, false);
    }
    if minimum >= SPAWN_CEILING_SECONDS {
        warnings.push(ProbeWarning::new(
            probe,
            format!("measured {:.2}s, above the 5s ceiling", minimum),
        ));
        return (CONSERVATIVE_SPAWN_SECONDS, false);
    }
    if maximum - minimum > 0.5 * minimum {
        warnings.push(ProbeWarning::new(
            probe,
            format!(
                "unstable across trials (min {:.3}ms, max {:.3}ms), using default",
                minimum * 1e3,
                maximum * 1e3
            ),
        ));
        return (default, false);
    }

    (minimum, true)
}

/// Create a pool of worker threads, run one no-op each, tear down
fn time_thread_pool(workers: usize) -> Option<f64> {
    let start = Instant::now();
    let (sender, receiver) = channel::unbounded::<()>();
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let receiver = receiver.clone();
            std::thread::spawn(move || {
                let _ = receiver.recv();
            })
        })
        .collect();
    for _ in 0..workers {
        sender.send(()).ok()?;
    }
    for handle in handles {
        handle.join().ok()?;
    }
    Some(start.elapsed().as_secs_f64())
}

/// Spawn trivial child processes and wait for them
fn time_process_pool(workers: usize) -> Option<f64> {
    let start = Instant::now();
    let mut children = Vec::with_capacity(workers);
    for _ in 0..workers {
        let child = Command::new("true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .or_else(|_| {
                Command::new("/bin/true")
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()
            })
            .ok()?;
        children.push(child);
    }
    for mut child in children {
        child.wait().ok()?;
    }
    Some(start.elapsed().as_secs_f64())
}

/// Marginal cost of pushing one unit of work to a live worker and hearing back
fn time_chunk_dispatch() -> Option<f64> {
    let (job_sender, job_receiver) = channel::unbounded::<u64>();
    let (done_sender, done_receiver) = channel::unbounded::<u64>();
    let echo = std::thread::spawn(move || {
        while let Ok(value) = job_receiver.recv() {
            if done_sender.send(value).is_err() {
                break;
            }
        }
    });

    let start = Instant::now();
    for round in 0..DISPATCH_ROUND_TRIPS as u64 {
        job_sender.send(round).ok()?;
        done_receiver.recv().ok()?;
    }
    let elapsed = start.elapsed().as_secs_f64();

    drop(job_sender);
    echo.join().ok()?;
    Some(elapsed / DISPATCH_ROUND_TRIPS as f64)
}

/// Serialize and deserialize a reference buffer to derive per-byte rates
fn time_marshal_rates() -> Option<(f64, f64)> {
    let reference = vec![0xA5u8; MARSHAL_REFERENCE_BYTES];
    let total_bytes = (MARSHAL_REFERENCE_BYTES * MARSHAL_ITERATIONS) as f64;

    let start = Instant::now();
    let mut encoded = Vec::new();
    for _ in 0..MARSHAL_ITERATIONS {
        encoded = bincode::serialize(&reference).ok()?;
    }
    let marshal_rate = start.elapsed().as_secs_f64() / total_bytes;

    let start = Instant::now();
    for _ in 0..MARSHAL_ITERATIONS {
        let decoded: Vec<u8> = bincode::deserialize(&encoded).ok()?;
        if decoded.len() != MARSHAL_REFERENCE_BYTES {
            return None;
        }
    }
    let collect_rate = start.elapsed().as_secs_f64() / total_bytes;

    // Rates of exactly zero would zero out model terms downstream
    Some((marshal_rate.max(1e-12), collect_rate.max(1e-12)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measure_produces_usable_overheads() {
        let mut warnings = Vec::new();
        let overheads = measure(2, &mut warnings);
        assert!(overheads.thread_spawn_seconds > 0.0);
        assert!(overheads.process_spawn_seconds > 0.0);
        assert!(overheads.chunk_dispatch_seconds > 0.0);
        assert!(overheads.marshal_seconds_per_byte > 0.0);
        assert!(overheads.collect_seconds_per_byte > 0.0);
    }

    #[test]
    fn test_validation_rejects_unstable_trials() {
        let mut warnings = Vec::new();
        let (value, trusted) = validate_trials("test", &[0.001, 0.01, 0.001], 0.5, &mut warnings);
        assert!(!trusted);
        assert!((value - 0.5).abs() < f64::EPSILON);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_validation_accepts_stable_trials() {
        let mut warnings = Vec::new();
        let (value, trusted) = validate_trials("test", &[0.0011, 0.0012, 0.0010], 0.5, &mut warnings);
        assert!(trusted);
        assert!((value - 0.0010).abs() < 1e-9);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_validation_caps_slow_spawn() {
        let mut warnings = Vec::new();
        let (value, trusted) = validate_trials("test", &[6.0, 6.1, 6.2], 0.05, &mut warnings);
        assert!(!trusted);
        assert!((value - CONSERVATIVE_SPAWN_SECONDS).abs() < f64::EPSILON);
    }

    #[test]
    fn test_validation_requires_all_trials() {
        let mut warnings = Vec::new();
        let (value, trusted) = validate_trials("test", &[0.001], 0.05, &mut warnings);
        assert!(!trusted);
        assert!((value - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn test_marshal_rates_are_sane() {
        let (marshal, collect) = time_marshal_rates().unwrap();
        // Far below one second per byte on any real machine
        assert!(marshal < 1e-3);
        assert!(collect < 1e-3);
    }
}
