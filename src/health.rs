//! Health validation
//!
//! `validate()` runs the probes plus a round of self-checks and reports
//! each as pass/warn/fail. Warnings mean a fallback is in effect (coarse
//! probe defaults, no process workers); failures mean planning cannot be
//! trusted on this host.

use crate::cache;
use crate::pool::process::ProcessPool;
use crate::pool::thread::ThreadPool;
use crate::probe;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckStatus::Pass => write!(f, "pass"),
            CheckStatus::Warn => write!(f, "warn"),
            CheckStatus::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub name: &'static str,
    pub status: CheckStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|check| check.status != CheckStatus::Fail)
    }
}

/// Run every probe and self-check
pub fn validate() -> HealthReport {
    validate_with(true)
}

/// Like `validate`, optionally skipping the process-worker round trip
///
/// The worker check spawns this executable in worker mode, which only
/// works from binaries that wire up the hidden worker entry; embedders
/// and test harnesses skip it.
pub fn validate_with(check_process_workers: bool) -> HealthReport {
    let mut checks = Vec::new();
    let info = probe::info();

    checks.push(HealthCheck {
        name: "physical_cores",
        status: if info.physical_cores >= 1 {
            CheckStatus::Pass
        } else {
            CheckStatus::Fail
        },
        message: format!(
            "{} physical / {} logical (via {})",
            info.physical_cores, info.logical_cores, info.core_probe
        ),
    });

    checks.push(HealthCheck {
        name: "memory_limit",
        status: if info.memory_limit_bytes > 0 {
            CheckStatus::Pass
        } else {
            CheckStatus::Fail
        },
        message: format!(
            "{} bytes limit, {} available (via {})",
            info.memory_limit_bytes, info.available_memory_bytes, info.memory_probe
        ),
    });

    checks.push(HealthCheck {
        name: "overhead_probe",
        status: if info.overhead_trusted {
            CheckStatus::Pass
        } else {
            CheckStatus::Warn
        },
        message: if info.overhead_trusted {
            format!(
                "spawn {:.1}ms process / {:.2}ms thread, dispatch {:.0}us",
                info.process_spawn_seconds * 1e3,
                info.thread_spawn_seconds * 1e3,
                info.chunk_dispatch_seconds * 1e6
            )
        } else {
            "measurement failed validation, defaults in use".to_string()
        },
    });

    for warning in &info.warnings {
        checks.push(HealthCheck {
            name: "probe_warning",
            status: CheckStatus::Warn,
            message: warning.to_string(),
        });
    }

    checks.push(cache_root_check());
    checks.push(thread_pool_check());
    if check_process_workers {
        checks.push(process_worker_check());
    }

    HealthReport { checks }
}

fn cache_root_check() -> HealthCheck {
    let dir = cache::default_root().join("cache");
    let result = std::fs::create_dir_all(&dir).and_then(|_| {
        let probe_path = dir.join(".health_probe");
        std::fs::write(&probe_path, b"ok")?;
        std::fs::remove_file(&probe_path)
    });
    match result {
        Ok(()) => HealthCheck {
            name: "cache_root",
            status: CheckStatus::Pass,
            message: format!("{} is writable", dir.display()),
        },
        Err(error) => HealthCheck {
            name: "cache_root",
            status: CheckStatus::Warn,
            message: format!("{} not writable ({}); caching disabled", dir.display(), error),
        },
    }
}

fn thread_pool_check() -> HealthCheck {
    let result = ThreadPool::new(1).and_then(|pool| {
        let (sender, receiver) = crossbeam::channel::bounded(1);
        pool.execute(Box::new(move || {
            let _ = sender.send(42u32);
        }))?;
        receiver
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| crate::pool::PoolError::Closed)
    });
    match result {
        Ok(42) => HealthCheck {
            name: "thread_pool",
            status: CheckStatus::Pass,
            message: "round trip ok".to_string(),
        },
        Ok(other) => HealthCheck {
            name: "thread_pool",
            status: CheckStatus::Fail,
            message: format!("round trip returned {}", other),
        },
        Err(error) => HealthCheck {
            name: "thread_pool",
            status: CheckStatus::Fail,
            message: error.to_string(),
        },
    }
}

fn process_worker_check() -> HealthCheck {
    match ProcessPool::new(1) {
        Ok(mut pool) => {
            let status = match pool.ping_all() {
                Ok(()) => CheckStatus::Pass,
                Err(_) => CheckStatus::Warn,
            };
            let message = match status {
                CheckStatus::Pass => "worker spawn and ping ok".to_string(),
                _ => "worker spawned but did not answer".to_string(),
            };
            pool.shutdown(Duration::from_secs(2));
            HealthCheck {
                name: "process_workers",
                status,
                message,
            }
        }
        Err(error) => HealthCheck {
            name: "process_workers",
            status: CheckStatus::Warn,
            message: format!("cannot spawn workers ({}); process plans unavailable", error),
        },
    }
}
