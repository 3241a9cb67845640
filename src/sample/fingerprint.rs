//! Workload fingerprinting
//!
//! A fingerprint is a stable content-addressed key over what the workload
//! looked like and where it ran. Continuous measurements are rounded to
//! log-scaled buckets first so near-identical workloads collide onto the
//! same cache entry instead of each earning their own.

use super::WorkloadSample;
use crate::probe::SystemSignature;
use sha2::{Digest, Sha256};
use std::fmt;

/// Log-scaled per-item duration bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBucket {
    Instant,
    Fast,
    Moderate,
    Slow,
    VerySlow,
}

impl TimeBucket {
    pub fn from_seconds(seconds: f64) -> Self {
        if seconds < 10e-6 {
            TimeBucket::Instant
        } else if seconds < 1e-3 {
            TimeBucket::Fast
        } else if seconds < 100e-3 {
            TimeBucket::Moderate
        } else if seconds < 10.0 {
            TimeBucket::Slow
        } else {
            TimeBucket::VerySlow
        }
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeBucket::Instant => write!(f, "instant"),
            TimeBucket::Fast => write!(f, "fast"),
            TimeBucket::Moderate => write!(f, "moderate"),
            TimeBucket::Slow => write!(f, "slow"),
            TimeBucket::VerySlow => write!(f, "very_slow"),
        }
    }
}

/// Log-scaled marshalled size bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeBucket {
    Tiny,
    Small,
    Medium,
    Large,
    XLarge,
}

impl SizeBucket {
    pub fn from_bytes(bytes: f64) -> Self {
        if bytes < 512.0 {
            SizeBucket::Tiny
        } else if bytes < 16.0 * 1024.0 {
            SizeBucket::Small
        } else if bytes < 512.0 * 1024.0 {
            SizeBucket::Medium
        } else if bytes < 16.0 * 1024.0 * 1024.0 {
            SizeBucket::Large
        } else {
            SizeBucket::XLarge
        }
    }
}

impl fmt::Display for SizeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeBucket::Tiny => write!(f, "tiny"),
            SizeBucket::Small => write!(f, "small"),
            SizeBucket::Medium => write!(f, "medium"),
            SizeBucket::Large => write!(f, "large"),
            SizeBucket::XLarge => write!(f, "xlarge"),
        }
    }
}

/// Compute the fingerprint for a sampled workload on a given system
///
/// The same function, data shape, and host yield the same fingerprint
/// across processes; registered task names (not closure addresses) anchor
/// the function identity.
pub fn fingerprint(
    func_identity: &str,
    item_type: &str,
    count_total: Option<usize>,
    sample: &WorkloadSample,
    signature: &SystemSignature,
) -> String {
    let canonical = format!(
        "{}|{}|{}|{}|{}|{}|{}",
        func_identity,
        item_type,
        count_total.map_or_else(|| "unknown".to_string(), |n| n.to_string()),
        TimeBucket::from_seconds(sample.mean_item_seconds),
        SizeBucket::from_bytes(sample.mean_output_bytes),
        sample.workload_type,
        signature,
    );

    let digest = Sha256::digest(canonical.as_bytes());
    let mut out = String::with_capacity(32);
    for byte in digest.iter().take(16) {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::SystemInfo;
    use crate::sample::WorkloadType;

    fn sample_with(mean_seconds: f64, out_bytes: f64) -> WorkloadSample {
        WorkloadSample {
            count_sampled: 5,
            mean_item_seconds: mean_seconds,
            stddev_item_seconds: 0.0,
            mean_input_bytes: 8.0,
            mean_output_bytes: out_bytes,
            cpu_time_ratio: 0.9,
            workload_type: WorkloadType::CpuBound,
            func_marshalable: true,
            all_items_marshalable: true,
            failures: Vec::new(),
        }
    }

    #[test]
    fn test_time_buckets() {
        assert_eq!(TimeBucket::from_seconds(1e-6), TimeBucket::Instant);
        assert_eq!(TimeBucket::from_seconds(100e-6), TimeBucket::Fast);
        assert_eq!(TimeBucket::from_seconds(10e-3), TimeBucket::Moderate);
        assert_eq!(TimeBucket::from_seconds(1.0), TimeBucket::Slow);
        assert_eq!(TimeBucket::from_seconds(60.0), TimeBucket::VerySlow);
    }

    #[test]
    fn test_size_buckets() {
        assert_eq!(SizeBucket::from_bytes(8.0), SizeBucket::Tiny);
        assert_eq!(SizeBucket::from_bytes(1024.0), SizeBucket::Small);
        assert_eq!(SizeBucket::from_bytes(100.0 * 1024.0), SizeBucket::Medium);
        assert_eq!(SizeBucket::from_bytes(1024.0 * 1024.0), SizeBucket::Large);
        assert_eq!(SizeBucket::from_bytes(64.0 * 1024.0 * 1024.0), SizeBucket::XLarge);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let signature = SystemInfo::for_tests().signature();
        let a = fingerprint("registered:square", "i64", Some(1000), &sample_with(0.01, 8.0), &signature);
        let b = fingerprint("registered:square", "i64", Some(1000), &sample_with(0.01, 8.0), &signature);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_near_identical_workloads_collide() {
        let signature = SystemInfo::for_tests().signature();
        // Both 10ms and 12ms are "moderate"; both 8B and 100B are "tiny"
        let a = fingerprint("registered:square", "i64", Some(1000), &sample_with(0.010, 8.0), &signature);
        let b = fingerprint("registered:square", "i64", Some(1000), &sample_with(0.012, 100.0), &signature);
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_workloads_differ() {
        let signature = SystemInfo::for_tests().signature();
        let base = fingerprint("registered:square", "i64", Some(1000), &sample_with(0.01, 8.0), &signature);

        let other_func = fingerprint("registered:cube", "i64", Some(1000), &sample_with(0.01, 8.0), &signature);
        assert_ne!(base, other_func);

        let other_count = fingerprint("registered:square", "i64", Some(2000), &sample_with(0.01, 8.0), &signature);
        assert_ne!(base, other_count);

        let other_speed = fingerprint("registered:square", "i64", Some(1000), &sample_with(1.0, 8.0), &signature);
        assert_ne!(base, other_speed);
    }
}
