//! Configuration module
//!
//! Handles planner options, CLI argument parsing, and validation.

pub mod cli;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the work is executed once a plan is chosen
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Worker processes; items cross a marshalling boundary
    Process,
    /// In-process worker threads; no marshalling cost
    Thread,
    /// Plain iteration on the calling thread
    Serial,
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorKind::Process => write!(f, "process"),
            ExecutorKind::Thread => write!(f, "thread"),
            ExecutorKind::Serial => write!(f, "serial"),
        }
    }
}

/// Policy when planning is requested from inside a worker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum NestedPolicy {
    /// Return a serial plan with a rejection reason
    Reject,
    /// Cap the worker count at 1 and warn
    Serialize,
}

impl Default for NestedPolicy {
    fn default() -> Self {
        Self::Serialize
    }
}

impl fmt::Display for NestedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NestedPolicy::Reject => write!(f, "reject"),
            NestedPolicy::Serialize => write!(f, "serialize"),
        }
    }
}

/// Tuning knobs for planning and execution
///
/// Every field has a default matching the documented behaviour; construct
/// with `PlanOptions::default()` and override what you need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOptions {
    /// Number of items the sampler runs before planning (min 1)
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    /// Target wall-clock duration of one dispatched chunk, in seconds
    #[serde(default = "default_target_chunk_seconds")]
    pub target_chunk_seconds: f64,
    /// Upper bound on workers; defaults to detected physical cores
    pub max_workers: Option<usize>,
    /// Force an executor instead of letting the planner choose
    pub executor_kind: Option<ExecutorKind>,
    /// Streaming order preference: Some(true)/Some(false) are explicit, None auto-decides
    pub prefer_ordered: Option<bool>,
    /// Predicted speedup below this returns a serial plan
    #[serde(default = "default_min_speedup")]
    pub min_speedup: f64,
    /// Fraction of available memory a batch plan may hold in flight
    #[serde(default = "default_memory_fraction")]
    pub memory_fraction: f64,
    /// Fraction of available memory a streaming buffer may hold
    #[serde(default = "default_streaming_memory_fraction")]
    pub streaming_memory_fraction: f64,
    /// Decision cache entry lifetime
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    /// Behaviour when called from inside a worker
    #[serde(default)]
    pub nested_parallelism_policy: NestedPolicy,
    /// Skip decision cache lookups and stores
    #[serde(default)]
    pub no_cache: bool,
    /// Assumed total item count when a one-pass input cannot report one
    pub count_hint: Option<usize>,
    /// Abort execution at the first item failure instead of collecting
    #[serde(default)]
    pub stop_on_first: bool,
    /// cpu_time/wall_time below this classifies the workload as io_bound
    #[serde(default = "default_io_bound_below")]
    pub io_bound_below: f64,
    /// cpu_time/wall_time at or above this classifies the workload as cpu_bound
    #[serde(default = "default_cpu_bound_above")]
    pub cpu_bound_above: f64,
    /// Measure per-item CPU time alongside wall time during sampling
    #[serde(default = "default_true")]
    pub profile_cpu_time: bool,
}

fn default_sample_size() -> usize {
    5
}

fn default_target_chunk_seconds() -> f64 {
    0.2
}

fn default_min_speedup() -> f64 {
    1.2
}

fn default_memory_fraction() -> f64 {
    0.5
}

fn default_streaming_memory_fraction() -> f64 {
    0.1
}

fn default_cache_ttl_seconds() -> u64 {
    7 * 24 * 60 * 60
}

fn default_io_bound_below() -> f64 {
    0.3
}

fn default_cpu_bound_above() -> f64 {
    0.7
}

fn default_true() -> bool {
    true
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            sample_size: default_sample_size(),
            target_chunk_seconds: default_target_chunk_seconds(),
            max_workers: None,
            executor_kind: None,
            prefer_ordered: None,
            min_speedup: default_min_speedup(),
            memory_fraction: default_memory_fraction(),
            streaming_memory_fraction: default_streaming_memory_fraction(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
            nested_parallelism_policy: NestedPolicy::default(),
            no_cache: false,
            count_hint: None,
            stop_on_first: false,
            io_bound_below: default_io_bound_below(),
            cpu_bound_above: default_cpu_bound_above(),
            profile_cpu_time: default_true(),
        }
    }
}

impl PlanOptions {
    /// Validate the option set
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_size == 0 {
            return Err("sample_size must be at least 1".to_string());
        }
        if !self.target_chunk_seconds.is_finite() || self.target_chunk_seconds <= 0.0 {
            return Err(format!(
                "target_chunk_seconds must be positive, got {}",
                self.target_chunk_seconds
            ));
        }
        if let Some(max) = self.max_workers {
            if max == 0 {
                return Err("max_workers must be at least 1 if specified".to_string());
            }
        }
        if !self.min_speedup.is_finite() || self.min_speedup <= 0.0 {
            return Err(format!("min_speedup must be positive, got {}", self.min_speedup));
        }
        for (name, fraction) in [
            ("memory_fraction", self.memory_fraction),
            ("streaming_memory_fraction", self.streaming_memory_fraction),
        ] {
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(format!("{} must be in (0, 1], got {}", name, fraction));
            }
        }
        if self.cache_ttl_seconds == 0 {
            return Err("cache_ttl_seconds must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.io_bound_below) || !(0.0..=1.0).contains(&self.cpu_bound_above)
        {
            return Err("workload type thresholds must be in [0, 1]".to_string());
        }
        if self.io_bound_below >= self.cpu_bound_above {
            return Err(format!(
                "io_bound_below ({}) must be below cpu_bound_above ({})",
                self.io_bound_below, self.cpu_bound_above
            ));
        }
        Ok(())
    }
}

impl fmt::Display for PlanOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sample_size={}, target_chunk={}s, min_speedup={}x",
            self.sample_size, self.target_chunk_seconds, self.min_speedup
        )?;
        if let Some(max) = self.max_workers {
            write!(f, ", max_workers={}", max)?;
        }
        if let Some(kind) = self.executor_kind {
            write!(f, ", executor={}", kind)?;
        }
        if self.no_cache {
            write!(f, ", no_cache")?;
        }
        Ok(())
    }
}
