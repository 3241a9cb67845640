//! Workload sampling
//!
//! Dry-runs the task on a small prefix of the input to learn its shape:
//! per-item compute time (mean, stddev, CV), marshalled input/output sizes,
//! and the CPU-to-wall ratio that classifies the workload as cpu-bound,
//! mixed, or io-bound. Sampling is strictly serial in the calling context;
//! no parallelism exists before a plan does.
//!
//! Item failures are captured, not raised: the planner inspects them and
//! refuses to parallelise an already-broken workload rather than mask the
//! bug behind a pool.

pub mod fingerprint;

use crate::data::DataSource;
use crate::task::{TaskError, TaskFn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// CV above this flags the workload as heterogeneous
pub const HETEROGENEOUS_CV: f64 = 0.5;

/// Workload classification by CPU-to-wall ratio
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadType {
    CpuBound,
    Mixed,
    IoBound,
}

impl WorkloadType {
    pub fn classify(cpu_time_ratio: f64, io_bound_below: f64, cpu_bound_above: f64) -> Self {
        if cpu_time_ratio < io_bound_below {
            WorkloadType::IoBound
        } else if cpu_time_ratio >= cpu_bound_above {
            WorkloadType::CpuBound
        } else {
            WorkloadType::Mixed
        }
    }
}

impl fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadType::CpuBound => write!(f, "cpu_bound"),
            WorkloadType::Mixed => write!(f, "mixed"),
            WorkloadType::IoBound => write!(f, "io_bound"),
        }
    }
}

/// A task failure observed on one sampled item
#[derive(Debug, Clone)]
pub struct ItemFailure {
    pub index: usize,
    pub error: TaskError,
}

/// What sampling learned about the workload
#[derive(Debug, Clone)]
pub struct WorkloadSample {
    pub count_sampled: usize,
    pub mean_item_seconds: f64,
    pub stddev_item_seconds: f64,
    pub mean_input_bytes: f64,
    pub mean_output_bytes: f64,
    /// cpu_time / wall_time over the sampling window, in [0, 1]
    pub cpu_time_ratio: f64,
    pub workload_type: WorkloadType,
    pub func_marshalable: bool,
    pub all_items_marshalable: bool,
    pub failures: Vec<ItemFailure>,
}

impl WorkloadSample {
    /// Coefficient of variation of per-item compute time
    pub fn cv(&self) -> f64 {
        if self.mean_item_seconds > 0.0 {
            self.stddev_item_seconds / self.mean_item_seconds
        } else {
            0.0
        }
    }

    pub fn heterogeneous(&self) -> bool {
        self.cv() > HETEROGENEOUS_CV
    }

    pub fn errored(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Sampler knobs, extracted from the full option set
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub sample_size: usize,
    pub profile_cpu_time: bool,
    pub io_bound_below: f64,
    pub cpu_bound_above: f64,
}

impl SamplerConfig {
    pub fn from_options(options: &crate::config::PlanOptions) -> Self {
        Self {
            sample_size: options.sample_size.max(1),
            profile_cpu_time: options.profile_cpu_time,
            io_bound_below: options.io_bound_below,
            cpu_bound_above: options.cpu_bound_above,
        }
    }
}

/// Run the task on up to `sample_size` items and measure
///
/// For single-pass inputs the sampled items stay buffered inside the data
/// handle and are replayed by execution, so nothing is lost.
pub fn sample<I, O>(
    task: &TaskFn<I, O>,
    data: &mut DataSource<I>,
    config: &SamplerConfig,
) -> WorkloadSample {
    let items = data.buffer_prefix(config.sample_size);
    let count_sampled = items.len();

    let func_marshalable = task.marshalable();
    let marshaller = task.marshaller().cloned();

    let mut wall_times = Vec::with_capacity(count_sampled);
    let mut input_bytes: u64 = 0;
    let mut output_bytes: u64 = 0;
    let mut measured_inputs = 0usize;
    let mut measured_outputs = 0usize;
    let mut all_items_marshalable = true;
    let mut failures = Vec::new();

    let cpu_start = if config.profile_cpu_time {
        process_cpu_time()
    } else {
        None
    };
    let window_start = Instant::now();

    for (index, item) in items.iter().enumerate() {
        if let Some(marshaller) = marshaller.as_ref() {
            match marshaller.encode_item(item) {
                Ok(encoded) => {
                    input_bytes += encoded.len() as u64;
                    measured_inputs += 1;
                }
                Err(_) => all_items_marshalable = false,
            }
        }

        let item_start = Instant::now();
        match task.apply(item) {
            Ok(output) => {
                wall_times.push(item_start.elapsed().as_secs_f64());
                if let Some(marshaller) = marshaller.as_ref() {
                    if let Ok(encoded) = marshaller.encode_output(&output) {
                        output_bytes += encoded.len() as u64;
                        measured_outputs += 1;
                    }
                }
            }
            Err(error) => failures.push(ItemFailure { index, error }),
        }
    }

    let window_wall = window_start.elapsed().as_secs_f64();
    let cpu_time_ratio = match (cpu_start, process_cpu_time()) {
        (Some(start), Some(end)) if window_wall > 0.0 => ((end - start) / window_wall).clamp(0.0, 1.0),
        // Without a CPU clock, assume compute-heavy; the conservative choice
        // keeps us on processes rather than oversubscribed threads.
        _ => 1.0,
    };

    let (mean, stddev) = mean_stddev(&wall_times);

    WorkloadSample {
        count_sampled,
        mean_item_seconds: mean,
        stddev_item_seconds: stddev,
        mean_input_bytes: mean_bytes(input_bytes, measured_inputs),
        mean_output_bytes: mean_bytes(output_bytes, measured_outputs),
        cpu_time_ratio,
        workload_type: WorkloadType::classify(
            cpu_time_ratio,
            config.io_bound_below,
            config.cpu_bound_above,
        ),
        func_marshalable,
        all_items_marshalable,
        failures,
    }
}

fn mean_bytes(total: u64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}

fn mean_stddev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    (mean, variance.sqrt())
}

/// Total CPU time (user + system) of this process, in seconds
fn process_cpu_time() -> Option<f64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer for the duration of the call.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_PROCESS_CPUTIME_ID, &mut ts) };
    if rc == 0 {
        Some(ts.tv_sec as f64 + ts.tv_nsec as f64 * 1e-9)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SamplerConfig {
        SamplerConfig {
            sample_size: 5,
            profile_cpu_time: true,
            io_bound_below: 0.3,
            cpu_bound_above: 0.7,
        }
    }

    #[test]
    fn test_sample_counts_and_means() {
        let task = TaskFn::registered("sample-inc", |x: &i64| x + 1);
        let mut data = DataSource::from_vec((0..100).collect::<Vec<i64>>());
        let sample = sample(&task, &mut data, &config());

        assert_eq!(sample.count_sampled, 5);
        assert!(sample.func_marshalable);
        assert!(sample.all_items_marshalable);
        assert!(!sample.errored());
        assert!(sample.mean_item_seconds >= 0.0);
        // i64 marshals to 8 bytes under bincode
        assert!((sample.mean_input_bytes - 8.0).abs() < f64::EPSILON);
        assert!((sample.mean_output_bytes - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_local_task_skips_size_measurement() {
        let task = TaskFn::local(|x: &i64| x + 1);
        let mut data = DataSource::from_vec(vec![1i64, 2, 3]);
        let sample = sample(&task, &mut data, &config());
        assert!(!sample.func_marshalable);
        assert_eq!(sample.mean_input_bytes, 0.0);
        assert_eq!(sample.mean_output_bytes, 0.0);
    }

    #[test]
    fn test_item_failures_are_captured_not_raised() {
        let task: TaskFn<i64, i64> = TaskFn::local_fallible(|x| {
            if *x == 1 {
                Err(TaskError::Failed("bad item".to_string()))
            } else {
                Ok(*x)
            }
        });
        let mut data = DataSource::from_vec(vec![0i64, 1, 2]);
        let sample = sample(&task, &mut data, &config());
        assert!(sample.errored());
        assert_eq!(sample.failures.len(), 1);
        assert_eq!(sample.failures[0].index, 1);
        assert_eq!(sample.count_sampled, 3);
    }

    #[test]
    fn test_panicking_item_is_a_failure() {
        let task: TaskFn<i64, i64> = TaskFn::local(|x| {
            if *x == 2 {
                panic!("sampled panic");
            }
            *x
        });
        let mut data = DataSource::from_vec(vec![0i64, 1, 2, 3]);
        let sample = sample(&task, &mut data, &config());
        assert_eq!(sample.failures.len(), 1);
        assert!(matches!(sample.failures[0].error, TaskError::Panicked(_)));
    }

    #[test]
    fn test_cpu_heavy_classifies_cpu_bound() {
        let task = TaskFn::local(|x: &u64| {
            let mut acc = *x;
            for i in 0..200_000u64 {
                acc = acc.wrapping_mul(6364136223846793005).wrapping_add(i);
            }
            acc
        });
        let mut data = DataSource::from_vec(vec![1u64, 2, 3]);
        let sample = sample(&task, &mut data, &config());
        assert!(sample.cpu_time_ratio > 0.5, "ratio was {}", sample.cpu_time_ratio);
        assert_ne!(sample.workload_type, WorkloadType::IoBound);
    }

    #[test]
    fn test_sleeping_classifies_io_bound() {
        let task = TaskFn::local(|_x: &u64| {
            std::thread::sleep(std::time::Duration::from_millis(10));
        });
        let mut data = DataSource::from_vec(vec![1u64, 2, 3]);
        let sample = sample(&task, &mut data, &config());
        assert!(sample.cpu_time_ratio < 0.3, "ratio was {}", sample.cpu_time_ratio);
        assert_eq!(sample.workload_type, WorkloadType::IoBound);
    }

    #[test]
    fn test_heterogeneous_flag() {
        let uniform = WorkloadSample {
            count_sampled: 5,
            mean_item_seconds: 0.01,
            stddev_item_seconds: 0.001,
            mean_input_bytes: 8.0,
            mean_output_bytes: 8.0,
            cpu_time_ratio: 0.9,
            workload_type: WorkloadType::CpuBound,
            func_marshalable: true,
            all_items_marshalable: true,
            failures: Vec::new(),
        };
        assert!(!uniform.heterogeneous());

        let skewed = WorkloadSample {
            stddev_item_seconds: 0.012,
            ..uniform
        };
        assert!(skewed.cv() > 1.0);
        assert!(skewed.heterogeneous());
    }

    #[test]
    fn test_classification_thresholds() {
        assert_eq!(WorkloadType::classify(0.05, 0.3, 0.7), WorkloadType::IoBound);
        assert_eq!(WorkloadType::classify(0.5, 0.3, 0.7), WorkloadType::Mixed);
        assert_eq!(WorkloadType::classify(0.7, 0.3, 0.7), WorkloadType::CpuBound);
        assert_eq!(WorkloadType::classify(0.95, 0.3, 0.7), WorkloadType::CpuBound);
    }
}
