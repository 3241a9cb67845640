//! Physical core detection
//!
//! Detectors run in order and the first one that yields a count ≥ 1 wins:
//! platform API, `/proc/cpuinfo` topology, `lscpu -p`, then `logical/2`.
//! When hyperthreading cannot be ruled out the conservative half-of-logical
//! estimate is preferred over the logical count.

use super::ProbeWarning;
use std::collections::HashSet;
use std::fs;
use std::process::Command;

/// Detect physical cores, returning the count and the probe that fired
pub fn detect_physical(logical_cores: usize, warnings: &mut Vec<ProbeWarning>) -> (usize, &'static str) {
    if let Some(count) = platform_api() {
        return (count, "platform_api");
    }
    warnings.push(ProbeWarning::new(
        "platform_api",
        "physical core count unavailable from platform API",
    ));

    match proc_cpuinfo() {
        Some(count) => return (count, "proc_cpuinfo"),
        None => warnings.push(ProbeWarning::new(
            "proc_cpuinfo",
            "/proc/cpuinfo missing or without core topology",
        )),
    }

    match lscpu() {
        Some(count) => return (count, "lscpu"),
        None => warnings.push(ProbeWarning::new("lscpu", "lscpu -p unavailable or unparsable")),
    }

    warnings.push(ProbeWarning::new(
        "half_logical",
        format!(
            "falling back to logical/2 ({} of {} logical cores)",
            (logical_cores / 2).max(1),
            logical_cores
        ),
    ));
    ((logical_cores / 2).max(1), "half_logical")
}

fn platform_api() -> Option<usize> {
    let count = num_cpus::get_physical();
    if count >= 1 {
        Some(count)
    } else {
        None
    }
}

/// Count distinct (physical id, core id) pairs in /proc/cpuinfo
fn proc_cpuinfo() -> Option<usize> {
    let cpuinfo = fs::read_to_string("/proc/cpuinfo").ok()?;
    parse_cpuinfo(&cpuinfo)
}

fn parse_cpuinfo(cpuinfo: &str) -> Option<usize> {
    let mut cores = HashSet::new();
    let mut physical_id: Option<u32> = None;
    let mut core_id: Option<u32> = None;

    for line in cpuinfo.lines() {
        if line.trim().is_empty() {
            if let (Some(package), Some(core)) = (physical_id, core_id) {
                cores.insert((package, core));
            }
            physical_id = None;
            core_id = None;
            continue;
        }
        let mut parts = line.splitn(2, ':');
        let key = parts.next()?.trim();
        let value = parts.next().map(str::trim);
        match (key, value) {
            ("physical id", Some(value)) => physical_id = value.parse().ok(),
            ("core id", Some(value)) => core_id = value.parse().ok(),
            _ => {}
        }
    }
    if let (Some(package), Some(core)) = (physical_id, core_id) {
        cores.insert((package, core));
    }

    if cores.is_empty() {
        None
    } else {
        Some(cores.len())
    }
}

/// Count unique CORE fields in `lscpu -p=CORE,SOCKET` output
fn lscpu() -> Option<usize> {
    let output = Command::new("lscpu").arg("-p=CORE,SOCKET").output().ok()?;
    if !output.status.success() {
        return None;
    }
    parse_lscpu(&String::from_utf8_lossy(&output.stdout))
}

fn parse_lscpu(output: &str) -> Option<usize> {
    let cores: HashSet<&str> = output
        .lines()
        .filter(|line| !line.starts_with('#') && !line.trim().is_empty())
        .collect();
    if cores.is_empty() {
        None
    } else {
        Some(cores.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_CORE_HT: &str = "\
processor\t: 0
physical id\t: 0
core id\t: 0

processor\t: 1
physical id\t: 0
core id\t: 1

processor\t: 2
physical id\t: 0
core id\t: 0

processor\t: 3
physical id\t: 0
core id\t: 1
";

    #[test]
    fn test_cpuinfo_collapses_hyperthread_siblings() {
        assert_eq!(parse_cpuinfo(TWO_CORE_HT), Some(2));
    }

    #[test]
    fn test_cpuinfo_without_topology_yields_none() {
        let minimal = "processor\t: 0\nmodel name\t: Some CPU\n";
        assert_eq!(parse_cpuinfo(minimal), None);
    }

    #[test]
    fn test_lscpu_parse_ignores_comments() {
        let output = "# comment\n# another\n0,0\n1,0\n0,0\n";
        assert_eq!(parse_lscpu(output), Some(2));
    }

    #[test]
    fn test_lscpu_empty_yields_none() {
        assert_eq!(parse_lscpu("# only comments\n"), None);
    }

    #[test]
    fn test_detect_never_returns_zero() {
        let mut warnings = Vec::new();
        let (count, probe) = detect_physical(1, &mut warnings);
        assert!(count >= 1, "probe {} returned zero cores", probe);
    }
}
