//! System introspection
//!
//! Builds a [`SystemInfo`] snapshot once per process: core topology, the
//! effective memory limit (container quotas included), and empirically
//! measured spawn/dispatch/marshal overheads. Every detector is a named
//! probe returning an optional value plus diagnostics; detection failures
//! become warnings and coarse defaults, never errors — callers always get a
//! usable snapshot.

pub mod cores;
pub mod memory;
pub mod overhead;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

/// Worker start method
///
/// This implementation only ever uses `Spawn` (fork+exec via the standard
/// library) for processes and `Thread` for threads; `Fork` and `Forkserver`
/// remain so cache signatures stay comparable across implementations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMethod {
    Fork,
    Spawn,
    Forkserver,
    Thread,
}

impl fmt::Display for SpawnMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnMethod::Fork => write!(f, "fork"),
            SpawnMethod::Spawn => write!(f, "spawn"),
            SpawnMethod::Forkserver => write!(f, "forkserver"),
            SpawnMethod::Thread => write!(f, "thread"),
        }
    }
}

/// Diagnostic from a detector that fell back or misbehaved
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeWarning {
    /// Name of the probe that produced the diagnostic
    pub probe: String,
    pub message: String,
}

impl ProbeWarning {
    pub fn new(probe: &str, message: impl Into<String>) -> Self {
        Self {
            probe: probe.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ProbeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.probe, self.message)
    }
}

/// Compatibility key stored with cache entries
///
/// A cached plan is only valid on a host that looks like the one that
/// produced it. Memory is bucketed to the nearest power of two so minor
/// fluctuations in the reported limit do not invalidate entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SystemSignature {
    pub physical_cores: usize,
    pub spawn_method: SpawnMethod,
    pub memory_bucket: u32,
}

impl fmt::Display for SystemSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}c/{}/2^{}B",
            self.physical_cores, self.spawn_method, self.memory_bucket
        )
    }
}

/// Snapshot of host capabilities and measured overheads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Independent execution units (hyperthread siblings collapsed)
    pub physical_cores: usize,
    pub logical_cores: usize,
    /// Effective limit: min(cgroup quota, host total)
    pub memory_limit_bytes: u64,
    /// Free-for-use estimate at probe time, clamped to the limit
    pub available_memory_bytes: u64,
    pub spawn_method: SpawnMethod,
    /// One-time cost of bringing up and tearing down a process worker pool
    pub process_spawn_seconds: f64,
    /// Same, for a thread pool
    pub thread_spawn_seconds: f64,
    /// Marginal cost of dispatching one chunk to an already-running worker
    pub chunk_dispatch_seconds: f64,
    /// Marshalling throughput, seconds per byte
    pub marshal_seconds_per_byte: f64,
    /// Result collection throughput, seconds per byte
    pub collect_seconds_per_byte: f64,
    /// False when overhead measurement failed validation and defaults are in use
    pub overhead_trusted: bool,
    /// Which detector produced the core count
    pub core_probe: String,
    /// Which detector produced the memory limit
    pub memory_probe: String,
    pub warnings: Vec<ProbeWarning>,
}

impl SystemInfo {
    pub fn signature(&self) -> SystemSignature {
        SystemSignature {
            physical_cores: self.physical_cores,
            spawn_method: self.spawn_method,
            memory_bucket: memory_bucket(self.memory_limit_bytes),
        }
    }

    /// One-time pool startup cost for the given spawn method
    pub fn spawn_cost_seconds(&self, method: SpawnMethod) -> f64 {
        match method {
            SpawnMethod::Thread => self.thread_spawn_seconds,
            _ => self.process_spawn_seconds,
        }
    }

    /// A fixed snapshot for deterministic tests: 8 physical cores, 16 GiB,
    /// overheads typical of a healthy Linux host.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            physical_cores: 8,
            logical_cores: 16,
            memory_limit_bytes: 16 * 1024 * 1024 * 1024,
            available_memory_bytes: 12 * 1024 * 1024 * 1024,
            spawn_method: SpawnMethod::Spawn,
            process_spawn_seconds: 0.05,
            thread_spawn_seconds: 0.002,
            chunk_dispatch_seconds: 20e-6,
            marshal_seconds_per_byte: 2e-9,
            collect_seconds_per_byte: 2e-9,
            overhead_trusted: true,
            core_probe: "test".to_string(),
            memory_probe: "test".to_string(),
            warnings: Vec::new(),
        }
    }
}

impl fmt::Display for SystemInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} physical / {} logical cores, limit {} bytes ({} available), spawn {:.1}ms process / {:.1}ms thread",
            self.physical_cores,
            self.logical_cores,
            self.memory_limit_bytes,
            self.available_memory_bytes,
            self.process_spawn_seconds * 1e3,
            self.thread_spawn_seconds * 1e3,
        )
    }
}

/// Round a byte count to its power-of-two bucket
pub fn memory_bucket(bytes: u64) -> u32 {
    if bytes <= 1 {
        return 0;
    }
    (bytes as f64).log2().round() as u32
}

fn cached() -> &'static Mutex<Option<Arc<SystemInfo>>> {
    static CACHE: OnceLock<Mutex<Option<Arc<SystemInfo>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(None))
}

/// The process-wide system snapshot, built on first use
pub fn info() -> Arc<SystemInfo> {
    let mut slot = cached().lock().expect("probe cache poisoned");
    if let Some(info) = slot.as_ref() {
        return Arc::clone(info);
    }
    let built = Arc::new(build());
    *slot = Some(Arc::clone(&built));
    built
}

/// Drop the cached snapshot so the next `info()` re-probes
///
/// Intended for tests and for explicit re-probe after host changes.
pub fn reset() {
    let mut slot = cached().lock().expect("probe cache poisoned");
    *slot = None;
}

/// Run every detector and assemble a snapshot
pub fn build() -> SystemInfo {
    let mut warnings = Vec::new();

    let logical_cores = num_cpus::get().max(1);
    let (physical_cores, core_probe) = cores::detect_physical(logical_cores, &mut warnings);

    let (memory_limit_bytes, memory_probe) = memory::detect_limit(&mut warnings);
    let available_memory_bytes = memory::detect_available(memory_limit_bytes, &mut warnings);

    let overheads = overhead::measure(physical_cores, &mut warnings);

    for warning in &warnings {
        tracing::warn!(
            probe = %warning.probe,
            message = %warning.message,
            "probe_warning"
        );
    }

    SystemInfo {
        physical_cores,
        logical_cores,
        memory_limit_bytes,
        available_memory_bytes,
        spawn_method: SpawnMethod::Spawn,
        process_spawn_seconds: overheads.process_spawn_seconds,
        thread_spawn_seconds: overheads.thread_spawn_seconds,
        chunk_dispatch_seconds: overheads.chunk_dispatch_seconds,
        marshal_seconds_per_byte: overheads.marshal_seconds_per_byte,
        collect_seconds_per_byte: overheads.collect_seconds_per_byte,
        overhead_trusted: overheads.trusted,
        core_probe: core_probe.to_string(),
        memory_probe: memory_probe.to_string(),
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_is_cached_and_resettable() {
        reset();
        let first = info();
        let second = info();
        assert!(Arc::ptr_eq(&first, &second));
        reset();
        let third = info();
        // A fresh build, but with the same host underneath
        assert_eq!(first.physical_cores, third.physical_cores);
    }

    #[test]
    fn test_built_info_is_always_usable() {
        let info = build();
        assert!(info.physical_cores >= 1);
        assert!(info.logical_cores >= info.physical_cores);
        assert!(info.memory_limit_bytes > 0);
        assert!(info.available_memory_bytes <= info.memory_limit_bytes);
        assert!(info.process_spawn_seconds.is_finite() && info.process_spawn_seconds > 0.0);
        assert!(info.thread_spawn_seconds.is_finite() && info.thread_spawn_seconds > 0.0);
    }

    #[test]
    fn test_memory_bucket_rounds_to_power_of_two() {
        assert_eq!(memory_bucket(1024), 10);
        assert_eq!(memory_bucket(1000), 10);
        assert_eq!(memory_bucket(16 * 1024 * 1024 * 1024), 34);
        assert_eq!(memory_bucket(0), 0);
    }

    #[test]
    fn test_signature_stability() {
        let info = SystemInfo::for_tests();
        let a = info.signature();
        let b = info.signature();
        assert_eq!(a, b);

        let mut bigger = SystemInfo::for_tests();
        // Small drift inside the same power-of-two bucket keeps the signature
        bigger.memory_limit_bytes += 1024;
        assert_eq!(bigger.signature(), a);

        bigger.memory_limit_bytes *= 4;
        assert_ne!(bigger.signature(), a);
    }

    #[test]
    fn test_signature_round_trip() {
        let signature = SystemInfo::for_tests().signature();
        let json = serde_json::to_string(&signature).unwrap();
        let back: SystemSignature = serde_json::from_str(&json).unwrap();
        assert_eq!(back, signature);
    }
}
