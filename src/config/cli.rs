//! CLI argument parsing using clap

use crate::config::ExecutorKind;
use crate::data::DataSource;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Amorsize - parallelism optimizer
///
/// Decides worker count, chunk size, and executor for applying a function
/// across a collection, then optionally runs the plan.
#[derive(Parser, Debug)]
#[command(name = "amorsize")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose (debug-level) logging
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Emit JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Skip decision cache lookups and stores (also via AMORSIZE_NO_CACHE=1)
    #[arg(long, global = true)]
    pub no_cache: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Decide parameters for a registered function over a data spec
    Plan {
        /// Registered function name (see `plan --help` for the demo set)
        func: String,
        /// Data spec: `0..N`, a plain count `N`, or `@file` with one
        /// integer per line
        data: String,
        #[command(flatten)]
        tuning: Tuning,
        /// Produce a streaming plan instead of a batch plan
        #[arg(long)]
        stream: bool,
    },
    /// Plan and run, printing a result summary
    Execute {
        func: String,
        data: String,
        #[command(flatten)]
        tuning: Tuning,
        /// Stream results instead of collecting them
        #[arg(long)]
        stream: bool,
        /// Abort at the first item failure
        #[arg(long)]
        stop_on_first: bool,
    },
    /// Probe the system and run self-checks
    Validate,
    /// Decision cache administration
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
    /// Internal worker-process entry; not for direct use
    #[command(name = "__worker", hide = true)]
    Worker,
}

/// Planner overrides shared by `plan` and `execute`
#[derive(clap::Args, Debug, Default)]
pub struct Tuning {
    /// Items to sample before planning
    #[arg(long)]
    pub sample_size: Option<usize>,
    /// Upper bound on workers
    #[arg(long)]
    pub max_workers: Option<usize>,
    /// Force an executor
    #[arg(long, value_enum)]
    pub executor: Option<ExecutorKind>,
    /// Speedup below which the plan stays serial
    #[arg(long)]
    pub min_speedup: Option<f64>,
    /// Target per-chunk duration in seconds
    #[arg(long)]
    pub target_chunk_seconds: Option<f64>,
    /// Streaming order preference (true/false; omit for auto)
    #[arg(long)]
    pub ordered: Option<bool>,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// List cached fingerprints
    List,
    /// Show one cache entry
    Show { fingerprint: String },
    /// Remove expired and incompatible entries
    Prune,
    /// Remove all entries
    Clear,
    /// Entry counts and age distribution
    Stats,
}

impl Tuning {
    /// Fold CLI overrides into a full option set
    pub fn into_options(self, no_cache: bool) -> crate::config::PlanOptions {
        let mut options = crate::config::PlanOptions {
            no_cache,
            ..Default::default()
        };
        if let Some(sample_size) = self.sample_size {
            options.sample_size = sample_size;
        }
        options.max_workers = self.max_workers;
        options.executor_kind = self.executor;
        if let Some(min_speedup) = self.min_speedup {
            options.min_speedup = min_speedup;
        }
        if let Some(target) = self.target_chunk_seconds {
            options.target_chunk_seconds = target;
        }
        options.prefer_ordered = self.ordered;
        options
    }
}

/// Parse a data spec into a source of integers
///
/// Accepted forms: `A..B` (half-open range), `N` (shorthand for `0..N`),
/// and `@path` (one integer per line).
pub fn parse_data_spec(spec: &str) -> Result<DataSource<i64>, String> {
    if let Some(path) = spec.strip_prefix('@') {
        return parse_data_file(&PathBuf::from(path));
    }
    if let Some((start, end)) = spec.split_once("..") {
        let start: i64 = start
            .trim()
            .parse()
            .map_err(|_| format!("invalid range start: '{}'", start))?;
        let end: i64 = end
            .trim()
            .parse()
            .map_err(|_| format!("invalid range end: '{}'", end))?;
        if end < start {
            return Err(format!("range end {} is below start {}", end, start));
        }
        return Ok(DataSource::from_vec((start..end).collect()));
    }
    let count: i64 = spec
        .trim()
        .parse()
        .map_err(|_| format!("invalid data spec: '{}' (expected A..B, N, or @file)", spec))?;
    if count < 0 {
        return Err(format!("item count cannot be negative: {}", count));
    }
    Ok(DataSource::from_vec((0..count).collect()))
}

fn parse_data_file(path: &PathBuf) -> Result<DataSource<i64>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let mut items = Vec::new();
    for (line_number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: i64 = line
            .parse()
            .map_err(|_| format!("{}:{}: not an integer: '{}'", path.display(), line_number + 1, line))?;
        items.push(value);
    }
    Ok(DataSource::from_vec(items))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_spec() {
        let data = parse_data_spec("5..10").unwrap();
        assert_eq!(data.len(), Some(5));
    }

    #[test]
    fn test_count_spec() {
        let data = parse_data_spec("100").unwrap();
        assert_eq!(data.len(), Some(100));
    }

    #[test]
    fn test_invalid_specs() {
        assert!(parse_data_spec("abc").is_err());
        assert!(parse_data_spec("10..5").is_err());
        assert!(parse_data_spec("-3").is_err());
        assert!(parse_data_spec("@/definitely/not/a/file").is_err());
    }

    #[test]
    fn test_file_spec() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("items.txt");
        std::fs::write(&path, "1\n2\n\n3\n").unwrap();
        let data = parse_data_spec(&format!("@{}", path.display())).unwrap();
        assert_eq!(data.len(), Some(3));
    }

    #[test]
    fn test_tuning_folds_into_options() {
        let tuning = Tuning {
            sample_size: Some(9),
            max_workers: Some(2),
            executor: Some(ExecutorKind::Thread),
            min_speedup: Some(2.0),
            target_chunk_seconds: None,
            ordered: Some(false),
        };
        let options = tuning.into_options(true);
        assert_eq!(options.sample_size, 9);
        assert_eq!(options.max_workers, Some(2));
        assert_eq!(options.executor_kind, Some(ExecutorKind::Thread));
        assert!((options.min_speedup - 2.0).abs() < f64::EPSILON);
        assert_eq!(options.prefer_ordered, Some(false));
        assert!(options.no_cache);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_cli_parses_plan_command() {
        let cli = Cli::try_parse_from(["amorsize", "plan", "square", "0..100", "--json"]).unwrap();
        assert!(cli.json);
        match cli.command {
            Command::Plan { func, data, stream, .. } => {
                assert_eq!(func, "square");
                assert_eq!(data, "0..100");
                assert!(!stream);
            }
            other => panic!("expected Plan, got {:?}", other),
        }
    }
}
