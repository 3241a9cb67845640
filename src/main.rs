//! Amorsize CLI entry point

use amorsize::cache::DecisionCache;
use amorsize::config::cli::{parse_data_spec, CacheCommand, Cli, Command};
use amorsize::output::{json, text};
use amorsize::{ExecContext, PlanOptions, TaskFn};
use anyhow::{bail, Result};
use clap::Parser;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;

fn main() -> Result<()> {
    // Worker mode is decided before clap runs: worker stdout carries
    // protocol frames only, so nothing may print first.
    if std::env::args().nth(1).as_deref() == Some("__worker") {
        register_demo_tasks();
        return amorsize::pool::process::serve_stdio().map_err(Into::into);
    }

    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let tasks = register_demo_tasks();

    match cli.command {
        Command::Plan { func, data, tuning, stream } => {
            let task = resolve_task(&tasks, &func)?;
            let source = parse_data_spec(&data).unwrap_or_else(|message| bad_args(&message));
            let options = tuning.into_options(cli.no_cache);
            if stream {
                let outcome = amorsize::plan_stream(task, source, &options)?;
                print_streaming_plan(&outcome.plan, cli.json)?;
            } else {
                let outcome = amorsize::plan(task, source, &options)?;
                print_plan(&outcome.plan, cli.json)?;
            }
            Ok(())
        }
        Command::Execute { func, data, tuning, stream, stop_on_first } => {
            let task = resolve_task(&tasks, &func)?;
            let source = parse_data_spec(&data).unwrap_or_else(|message| bad_args(&message));
            let mut options = tuning.into_options(cli.no_cache);
            options.stop_on_first = stop_on_first;
            let failures = if stream {
                run_stream(task, source, &options)?
            } else {
                run_batch(task, source, &options, cli.json)?
            };
            if failures > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Validate => {
            let report = amorsize::validate();
            if cli.json {
                println!("{}", json::render(json::HealthPayload { health: &report })?);
            } else {
                print!("{}", text::render_system(&amorsize::system_info()));
                print!("{}", text::render_health(&report));
            }
            if !report.passed() {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Cache { command } => run_cache_command(command, cli.json),
        Command::Worker => unreachable!("worker mode is handled before argument parsing"),
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "amorsize=debug" } else { "amorsize=info" })
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let format = std::env::var("AMORSIZE_LOG_FORMAT").unwrap_or_default();
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Register the demo task set and index it by name
///
/// The same registrations run in worker mode, so process pools can resolve
/// every name a parent might dispatch.
fn register_demo_tasks() -> HashMap<&'static str, TaskFn<i64, i64>> {
    let mut tasks = HashMap::new();
    tasks.insert("square", TaskFn::registered("square", |x: &i64| x.wrapping_mul(*x)));
    tasks.insert(
        "busy-10ms",
        TaskFn::registered("busy-10ms", |x: &i64| {
            let deadline = std::time::Instant::now() + Duration::from_millis(10);
            let mut acc = *x;
            while std::time::Instant::now() < deadline {
                acc = acc.wrapping_mul(6364136223846793005).wrapping_add(1);
            }
            acc
        }),
    );
    tasks.insert(
        "hash",
        TaskFn::registered("hash", |x: &i64| {
            let mut bytes = x.to_le_bytes().to_vec();
            for _ in 0..1000 {
                bytes = Sha256::digest(&bytes).to_vec();
            }
            i64::from_le_bytes(bytes[..8].try_into().expect("digest is 32 bytes"))
        }),
    );
    tasks.insert(
        "io-sleep",
        TaskFn::registered("io-sleep", |x: &i64| {
            std::thread::sleep(Duration::from_millis(5));
            *x
        }),
    );
    tasks
}

fn resolve_task<'a>(
    tasks: &'a HashMap<&'static str, TaskFn<i64, i64>>,
    name: &str,
) -> Result<&'a TaskFn<i64, i64>> {
    tasks.get(name).ok_or_else(|| {
        let mut known: Vec<&str> = tasks.keys().copied().collect();
        known.sort();
        anyhow::anyhow!("unknown function '{}'; available: {}", name, known.join(", "))
    })
}

fn bad_args(message: &str) -> ! {
    eprintln!("error: {}", message);
    std::process::exit(2);
}

fn print_plan(plan: &amorsize::OptimizationPlan, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", json::render(json::PlanPayload { plan })?);
    } else {
        print!("{}", text::render_plan(plan));
    }
    Ok(())
}

fn print_streaming_plan(plan: &amorsize::StreamingPlan, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", json::render(json::StreamingPlanPayload { plan })?);
    } else {
        print!("{}", text::render_streaming_plan(plan));
    }
    Ok(())
}

fn run_batch(
    task: &TaskFn<i64, i64>,
    source: amorsize::DataSource<i64>,
    options: &PlanOptions,
    as_json: bool,
) -> Result<usize> {
    let report = amorsize::execute_with(task, source, options, &ExecContext::default())?;
    let failures = report.failure_count();
    if as_json {
        #[derive(serde::Serialize)]
        struct Summary {
            executed: amorsize::ExecutorKind,
            items: usize,
            failures: usize,
            chunks: usize,
            elapsed_seconds: f64,
        }
        println!(
            "{}",
            json::render(Summary {
                executed: report.executed,
                items: report.outputs.len(),
                failures,
                chunks: report.chunks_dispatched,
                elapsed_seconds: report.elapsed_seconds,
            })?
        );
    } else {
        println!(
            "{} items via {} in {:.3}s ({} chunks, {} failed)",
            report.outputs.len(),
            report.executed,
            report.elapsed_seconds,
            report.chunks_dispatched,
            failures
        );
    }
    Ok(failures)
}

fn run_stream(
    task: &TaskFn<i64, i64>,
    source: amorsize::DataSource<i64>,
    options: &PlanOptions,
) -> Result<usize> {
    let stream = amorsize::execute_stream(task, source, options)?;
    let mut items = 0usize;
    let mut failures = 0usize;
    for result in stream {
        items += 1;
        if result.is_err() {
            failures += 1;
        }
    }
    println!("{} items streamed ({} failed)", items, failures);
    Ok(failures)
}

fn run_cache_command(command: CacheCommand, as_json: bool) -> Result<()> {
    let cache = DecisionCache::open(false);
    match command {
        CacheCommand::List => {
            for fingerprint in cache.list() {
                println!("{}", fingerprint);
            }
        }
        CacheCommand::Show { fingerprint } => match cache.show(&fingerprint) {
            Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
            None => bail!("no cache entry for '{}'", fingerprint),
        },
        CacheCommand::Prune => {
            let signature = amorsize::system_info().signature();
            let removed = cache.prune(&signature);
            println!("pruned {} entries", removed);
        }
        CacheCommand::Clear => {
            let removed = cache.clear();
            println!("removed {} files", removed);
        }
        CacheCommand::Stats => {
            let stats = cache.stats();
            if as_json {
                println!("{}", json::render(json::CacheStatsPayload { cache: &stats })?);
            } else {
                print!("{}", text::render_cache_stats(&stats));
            }
        }
    }
    Ok(())
}
