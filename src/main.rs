//! Bear CLI Entry Point
//!
//! Runs the batches of a YAML manifest and reports per-task results.
//!
//! # Usage
//!
//! ```bash
//! # Run a manifest
//! bear batches.yaml
//!
//! # Skip tasks that succeeded last time
//! bear batches.yaml --resume --state .bear/state.json
//!
//! # Limit parallelism, sample host memory, print charts and save stats
//! bear batches.yaml --parallel 8 --monitor-interval 1 --chart --stats stats.json
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use colored::Colorize;
use log::{error, info, warn};

use bear::execution::{samples, worker};
use bear::monitoring::{duration_chart, format_bytes, memory_chart};
use bear::pipeline::{load_manifest, Mode};
use bear::{Error, Pipeline, PipelineConfig, TaskState, WorkerCommand, APP_NAME, VERSION, WORKER_ARG};

/// Default manifest used when none is specified.
const DEFAULT_MANIFEST: &str = "bear.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    manifest_path: Option<String>,
    parallel: Option<usize>,
    resume: bool,
    state_path: Option<PathBuf>,
    stats_path: Option<PathBuf>,
    monitor_interval: Option<Duration>,
    chart: bool,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Local Task Orchestration");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: bear [OPTIONS] <MANIFEST>");
    println!();
    println!("Arguments:");
    println!("  <MANIFEST>              Path to batch manifest YAML (default: {})", DEFAULT_MANIFEST);
    println!();
    println!("Options:");
    println!("  --parallel N            Default concurrency ceiling (default: CPU count)");
    println!("  --resume                Skip tasks that succeeded in a previous run");
    println!("  --state PATH            Resume snapshot location (default: ~/.bear/state.json)");
    println!("  --stats PATH            Write per-task stats as JSON");
    println!("  --monitor-interval SEC  Sample host memory every SEC seconds (>= 1)");
    println!("  --chart                 Print duration and memory charts");
    println!("  --verbose               Enable debug logging");
    println!("  --help                  Show this help message");
    println!("  --version               Show version information");
    println!();
    println!("Examples:");
    println!("  bear batches.yaml");
    println!("  bear batches.yaml --resume --stats stats.json");
    println!("  bear batches.yaml --parallel 8 --monitor-interval 1 --chart");
}

/// Returns the value following the option at `i`.
fn option_value<'a>(args: &'a [String], i: &mut usize, option: &str, what: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires {} argument", option, what))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--resume" => {
                config.resume = true;
            }
            "--chart" => {
                config.chart = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--parallel" => {
                let value = option_value(args, &mut i, "--parallel", "a number")?;
                let parallel: usize = value
                    .parse()
                    .map_err(|_| format!("Invalid parallel value: {}", value))?;
                if parallel == 0 {
                    return Err("--parallel must be at least 1".to_string());
                }
                config.parallel = Some(parallel);
            }
            "--state" => {
                let value = option_value(args, &mut i, "--state", "a path")?;
                config.state_path = Some(PathBuf::from(value));
            }
            "--stats" => {
                let value = option_value(args, &mut i, "--stats", "a path")?;
                config.stats_path = Some(PathBuf::from(value));
            }
            "--monitor-interval" => {
                let value = option_value(args, &mut i, "--monitor-interval", "a number of seconds")?;
                let secs: f64 = value
                    .parse()
                    .map_err(|_| format!("Invalid monitor interval: {}", value))?;
                if !secs.is_finite() || secs < 1.0 {
                    return Err(format!("--monitor-interval cannot be less than 1 (got {})", value));
                }
                let interval = Duration::try_from_secs_f64(secs)
                    .map_err(|_| format!("--monitor-interval is out of range (got {})", value))?;
                config.monitor_interval = Some(interval);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.manifest_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.manifest_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Prints one line per task and returns the number of failed tasks.
fn print_summary(pipeline: &Pipeline) -> usize {
    let mut failed = 0;

    println!();
    println!("{}", "Task summary".bold());
    for task in pipeline.tasks() {
        let state = match task.state() {
            TaskState::Succeeded => "OK  ".green(),
            TaskState::Failed => {
                failed += 1;
                "FAIL".red()
            }
            other => other.to_string().as_str().yellow(),
        };
        let id: String = task.id().chars().take(8).collect();
        let duration = task.duration().unwrap_or_default();
        let memory = format_bytes(task.max_mem().unwrap_or(0));

        println!(
            "  [{}] {} {:>8.2}s {:>10}  {}:{}",
            state,
            id.as_str().dimmed(),
            duration.as_secs_f64(),
            memory,
            task.group_id(),
            task.func_name()
        );
        if let Some(error) = task.error() {
            let first = error.lines().next().unwrap_or_default();
            println!("         {}", first.red());
        }
    }
    println!();
    failed
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    // Load manifest
    let manifest_path = config
        .manifest_path
        .clone()
        .unwrap_or_else(|| DEFAULT_MANIFEST.to_string());
    let manifest = load_manifest(&manifest_path).map_err(|e| {
        error!("Failed to load manifest: {}", e);
        format!("Could not load manifest from '{}': {}", manifest_path, e)
    })?;

    // Build pipeline configuration: manifest first, CLI flags on top
    let mut pipeline_config = manifest.pipeline_config(PipelineConfig {
        worker: WorkerCommand::current_exe()?,
        ..PipelineConfig::default()
    })?;
    if config.resume {
        pipeline_config.resume = true;
    }
    if let Some(path) = config.state_path {
        pipeline_config.resume_path = path;
    }
    if let Some(interval) = config.monitor_interval {
        pipeline_config.memory_monitor_interval = Some(interval);
    }

    let ceiling = config
        .parallel
        .or(manifest.concurrency)
        .unwrap_or_else(num_cpus::get);

    info!(
        "Running {} batches (default concurrency: {}, resume: {})",
        manifest.batches.len(),
        ceiling,
        pipeline_config.resume
    );
    if pipeline_config.resume {
        info!("Resume snapshot: {}", pipeline_config.resume_path.display());
    }

    let mut pipeline = Pipeline::with_config(pipeline_config)?;

    // Execute batches in order
    for (index, spec) in manifest.batches.iter().enumerate() {
        let batch = spec.to_batch(Some(ceiling))?;
        match spec.mode {
            Mode::Sync => match pipeline.dispatch_sync(batch) {
                Ok(results) => info!("Batch {} finished with {} results", index + 1, results.len()),
                Err(e @ Error::BatchFailed { .. }) => warn!("Batch {}: {}", index + 1, e),
                Err(e) => return Err(e.into()),
            },
            Mode::Async => {
                let tasks = pipeline.dispatch_async(batch)?;
                info!("Batch {} started {} tasks in the background", index + 1, tasks.len());
            }
        }
    }

    pipeline.wait_all();
    let failed = print_summary(&pipeline);

    if config.chart {
        let data = pipeline.chart_data();
        println!("{}", duration_chart(&data.tasks));
        println!("{}", memory_chart(&data.tasks));
        if let Some(peak) = data.host.iter().max_by_key(|s| s.used_mem) {
            println!(
                "Host memory: {} samples, peak {} ({:.1}%)",
                data.host.len(),
                format_bytes(peak.used_mem),
                peak.percent
            );
        }
    }

    if let Some(path) = config.stats_path {
        pipeline.save_stats(&path)?;
    }

    pipeline.terminate();

    if failed > 0 {
        return Err(Error::BatchFailed {
            failed,
            total: pipeline.tasks().len(),
        }
        .into());
    }

    println!("All {} tasks succeeded", pipeline.tasks().len());
    Ok(())
}

fn main() -> ExitCode {
    // Worker mode: serve one call for a function task
    if env::args().nth(1).as_deref() == Some(WORKER_ARG) {
        return worker::serve(&samples::registry());
    }

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("bear")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_defaults() {
        let config = parse_arguments(&args(&["batches.yaml"])).unwrap();
        assert_eq!(config.manifest_path.as_deref(), Some("batches.yaml"));
        assert!(config.parallel.is_none());
        assert!(!config.resume);
        assert!(!config.chart);
    }

    #[test]
    fn test_parse_all_options() {
        let config = parse_arguments(&args(&[
            "batches.yaml",
            "--parallel",
            "8",
            "--resume",
            "--state",
            "/tmp/state.json",
            "--stats",
            "stats.json",
            "--monitor-interval",
            "2",
            "--chart",
            "--verbose",
        ]))
        .unwrap();

        assert_eq!(config.parallel, Some(8));
        assert!(config.resume);
        assert_eq!(config.state_path, Some(PathBuf::from("/tmp/state.json")));
        assert_eq!(config.stats_path, Some(PathBuf::from("stats.json")));
        assert_eq!(config.monitor_interval, Some(Duration::from_secs(2)));
        assert!(config.chart);
        assert!(config.verbose);
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        assert!(parse_arguments(&args(&["--parallel", "zero"])).is_err());
        assert!(parse_arguments(&args(&["--parallel", "0"])).is_err());
        assert!(parse_arguments(&args(&["--monitor-interval", "0.5"])).is_err());
        assert!(parse_arguments(&args(&["--monitor-interval", "1e20"])).is_err());
        assert!(parse_arguments(&args(&["--state"])).is_err());
        assert!(parse_arguments(&args(&["--bogus"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "b.yaml"])).is_err());
    }
}
