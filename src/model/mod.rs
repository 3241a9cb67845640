//! Analytical cost model
//!
//! Predicts wall-clock time for a candidate `(n_workers, chunksize)` from
//! sampled workload statistics and probed system overheads:
//!
//! ```text
//! T_parallel(n, c) = spawn
//!                  + (count / n) * (item + marshal)
//!                  + ceil(count / c) * dispatch
//!                  + straggler_tail
//!                  + collection_tail
//! ```
//!
//! The straggler tail models load imbalance: with skewed item times the
//! run ends when the unluckiest worker finishes its last chunk, and that
//! tail grows with both the skew (CV) and the chunk duration. This is what
//! lets smaller chunks win for heterogeneous workloads despite their extra
//! dispatch cost.
//!
//! Thread executors skip the marshal term entirely; warm pools zero the
//! spawn term. Predicted speedup is `T_serial / T_parallel`, clamped so the
//! model never promises more than `n`.

use crate::config::ExecutorKind;
use crate::probe::{SpawnMethod, SystemInfo};
use crate::sample::WorkloadSample;

/// Fraction of the collection tail hidden by pipelining outputs
pub const DEFAULT_COLLECTION_OVERLAP: f64 = 0.5;

/// Everything a prediction needs
#[derive(Debug, Clone, Copy)]
pub struct CostContext<'a> {
    pub sample: &'a WorkloadSample,
    pub system: &'a SystemInfo,
    pub count_total: usize,
    /// When the pool manager already holds a matching warm pool,
    /// startup cost is sunk and the spawn term drops out.
    pub pool_warm: bool,
    pub collection_overlap: f64,
}

/// Outcome of evaluating one candidate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub wall_seconds: f64,
    pub speedup: f64,
    /// Worst-case bytes staged in flight across workers
    pub in_flight_bytes: f64,
}

impl<'a> CostContext<'a> {
    pub fn new(sample: &'a WorkloadSample, system: &'a SystemInfo, count_total: usize) -> Self {
        Self {
            sample,
            system,
            count_total,
            pool_warm: false,
            collection_overlap: DEFAULT_COLLECTION_OVERLAP,
        }
    }

    pub fn with_warm_pool(mut self, warm: bool) -> Self {
        self.pool_warm = warm;
        self
    }

    /// Baseline: apply the function serially on the calling thread
    pub fn serial_seconds(&self) -> f64 {
        self.count_total as f64 * self.sample.mean_item_seconds
    }

    /// Predict wall-clock time and memory for a candidate
    pub fn predict(&self, kind: ExecutorKind, n_workers: usize, chunksize: usize) -> Prediction {
        let n = n_workers.max(1) as f64;
        let c = chunksize.max(1);
        let count = self.count_total as f64;
        let serial = self.serial_seconds();

        if kind == ExecutorKind::Serial || n_workers <= 1 {
            return Prediction {
                wall_seconds: serial,
                speedup: 1.0,
                in_flight_bytes: 0.0,
            };
        }

        let spawn = if self.pool_warm {
            0.0
        } else {
            match kind {
                ExecutorKind::Process => self.system.spawn_cost_seconds(SpawnMethod::Spawn),
                ExecutorKind::Thread => self.system.spawn_cost_seconds(SpawnMethod::Thread),
                ExecutorKind::Serial => 0.0,
            }
        };

        let per_item_marshal = if kind == ExecutorKind::Process {
            (self.sample.mean_input_bytes + self.sample.mean_output_bytes)
                * self.system.marshal_seconds_per_byte
        } else {
            0.0
        };

        let compute = (count / n) * (self.sample.mean_item_seconds + per_item_marshal);
        let chunks = (self.count_total + c - 1) / c;
        let dispatch = chunks as f64 * self.system.chunk_dispatch_seconds;

        // Expected wait for the last worker's final chunk; one chunk's
        // worth of skew per run
        let straggler = self.sample.cv() * self.sample.mean_item_seconds * c as f64;

        // Serial tail of gathering outputs, partly hidden by pipelining
        let collection = count
            * self.sample.mean_output_bytes
            * self.system.collect_seconds_per_byte
            * (1.0 - self.collection_overlap);

        let mut wall = spawn + compute + dispatch + straggler + collection;

        // Monotone safety: never predict beyond perfect scaling
        let floor = serial / n;
        if wall < floor {
            wall = floor;
        }

        let speedup = if wall > 0.0 { (serial / wall).min(n) } else { 1.0 };

        let in_flight_bytes = n
            * c as f64
            * (self.sample.mean_input_bytes + self.sample.mean_output_bytes);

        Prediction {
            wall_seconds: wall,
            speedup: speedup.max(0.0),
            in_flight_bytes,
        }
    }
}
