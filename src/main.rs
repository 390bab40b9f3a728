//! SlideGraph CLI Entry Point
//!
//! # Usage
//!
//! ```bash
//! # Predict every dataset under the input root
//! slidegraph
//!
//! # Only some datasets
//! slidegraph ds1 ds2
//!
//! # Preview the jobs that would run
//! slidegraph --dry-run
//!
//! # Re-run prediction for all datasets with 8 parallel jobs
//! slidegraph --force-rule predict --parallel 8 all
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use colored::Colorize;
use log::{info, warn};

use slidegraph::execution::{Engine, RunSummary};
use slidegraph::workflow::discovery::ALL_DATASETS;
use slidegraph::workflow::parser::DEFAULT_CONFIG_FILE;
use slidegraph::workflow::{
    build_registry, discover_datasets, final_targets, load_config, LocalStorage, PipelineConfig,
    Resolver, RunJournal,
};
use slidegraph::{APP_NAME, VERSION};

/// Command-line options parsed from arguments.
#[derive(Debug, Default)]
struct CliOptions {
    config_path: Option<PathBuf>,
    input_root: Option<PathBuf>,
    output_root: Option<PathBuf>,
    max_parallel: Option<usize>,
    working_dir: Option<PathBuf>,
    dry_run: bool,
    fail_fast: bool,
    force_all: bool,
    force_rules: Vec<String>,
    list: bool,
    print_config: bool,
    verbose: bool,
    targets: Vec<String>,
}

impl CliOptions {
    /// `--print-config` and `--list` write machine-readable stdout, so
    /// nothing else may be printed there.
    fn is_query(&self) -> bool {
        self.print_config || self.list
    }
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

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Whole-slide image prediction pipeline");
    println!();
}

fn print_usage() {
    println!("Usage: slidegraph [OPTIONS] [DATASET...]");
    println!();
    println!("Arguments:");
    println!("  [DATASET...]        Datasets to build, or '{}' (default)", ALL_DATASETS);
    println!();
    println!("Options:");
    println!("  --config PATH       Pipeline config (default: {} if present)", DEFAULT_CONFIG_FILE);
    println!("  --input-root PATH   Directory with one subdirectory per dataset");
    println!("  --output-root PATH  Directory for prediction outputs");
    println!("  --parallel N        Maximum parallel jobs");
    println!("  --working-dir PATH  Directory relative paths are resolved against");
    println!("  --dry-run           List the jobs that would run without running them");
    println!("  --fail-fast         Stop starting jobs after the first failure");
    println!("  --force-all         Re-run every job");
    println!("  --force-rule NAME   Re-run every job of a rule and its dependents (repeatable)");
    println!("  --list              List discovered datasets and exit");
    println!("  --print-config      Print the effective configuration and exit");
    println!("  --verbose           Enable debug logging and the timeline chart");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
}

/// Returns the value following a flag.
fn flag_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", flag))
}

fn parse_arguments(args: &[String]) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    let mut i = 1;

    while i < args.len() {
        let arg = args[i].as_str();

        match arg {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" | "-n" => options.dry_run = true,
            "--fail-fast" => options.fail_fast = true,
            "--force-all" => options.force_all = true,
            "--list" => options.list = true,
            "--print-config" => options.print_config = true,
            "--verbose" | "-v" => options.verbose = true,
            "--config" => {
                options.config_path = Some(PathBuf::from(flag_value(args, &mut i, arg)?));
            }
            "--input-root" => {
                options.input_root = Some(PathBuf::from(flag_value(args, &mut i, arg)?));
            }
            "--output-root" => {
                options.output_root = Some(PathBuf::from(flag_value(args, &mut i, arg)?));
            }
            "--working-dir" => {
                options.working_dir = Some(PathBuf::from(flag_value(args, &mut i, arg)?));
            }
            "--parallel" | "-j" => {
                let value = flag_value(args, &mut i, arg)?;
                let n: usize = value
                    .parse()
                    .map_err(|_| format!("Invalid parallel value: {}", value))?;
                if n == 0 {
                    return Err("--parallel must be at least 1".to_string());
                }
                options.max_parallel = Some(n);
            }
            "--force-rule" => {
                options
                    .force_rules
                    .push(flag_value(args, &mut i, arg)?.to_string());
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            target => options.targets.push(target.to_string()),
        }
        i += 1;
    }

    if options.targets.is_empty() {
        options.targets.push(ALL_DATASETS.to_string());
    }

    Ok(options)
}

/// Changes into the working directory so every relative path, in the
/// config and in job commands, means the same thing.
fn setup_working_directory(working_dir: Option<&Path>) -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Some(dir) = working_dir {
        if !dir.is_dir() {
            return Err(format!("Working directory is not a directory: {}", dir.display()).into());
        }
        env::set_current_dir(dir)?;
    }

    let current = env::current_dir()?;
    info!("Working directory: {}", current.display());
    Ok(current)
}

/// Loads the config file, or the defaults when no file is given and
/// the default file is absent.
fn load_pipeline_config(options: &CliOptions) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    let mut config = match &options.config_path {
        Some(path) => load_config(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            load_config(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => {
            info!("No {} found, using built-in defaults", DEFAULT_CONFIG_FILE);
            PipelineConfig::default()
        }
    };

    if let Some(root) = &options.input_root {
        config.input_root = root.clone();
    }
    if let Some(root) = &options.output_root {
        config.output_root = root.clone();
    }
    if let Some(n) = options.max_parallel {
        config.max_parallel = n;
    }
    config.fail_fast |= options.fail_fast;

    Ok(config)
}

fn print_summary(summary: &RunSummary) {
    println!();
    if summary.is_success() {
        println!(
            "{} {} job(s) run, {} already up to date",
            "Pipeline complete:".green().bold(),
            summary.executed,
            summary.satisfied
        );
        return;
    }

    println!(
        "{} {} job(s) failed, {} not run, {} succeeded",
        "Pipeline incomplete:".red().bold(),
        summary.failures.len(),
        summary.blocked + summary.cancelled,
        summary.executed
    );
    for failure in &summary.failures {
        println!("  {} {}", "x".red(), failure.job());
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let options = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(options.verbose);
    if !options.is_query() {
        print_banner();
    }

    let cwd = setup_working_directory(options.working_dir.as_deref())?;
    let mut config = load_pipeline_config(&options)?;
    config.absolutize(&cwd);

    if options.print_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    let datasets = discover_datasets(&config.input_root)?;
    if options.list {
        for name in datasets.names() {
            println!("{}", name);
        }
        return Ok(());
    }

    let selected = datasets.select(&options.targets)?;
    if selected.is_empty() {
        warn!("No datasets found under {}", config.input_root.display());
        return Ok(());
    }
    info!("Datasets: {}", selected.join(", "));

    let registry = build_registry(&config, &datasets)?;

    let mut journal = RunJournal::load(&config.journal_path())?;
    if options.force_all {
        // Every job reruns, so earlier progress is irrelevant.
        journal.clear();
    } else if journal.is_resume() {
        info!("Resuming after an unfinished or failed run");
    }

    let storage = LocalStorage;
    let mut resolver = Resolver::new(&registry, &storage)
        .with_incomplete(journal.incomplete_outputs().cloned())
        .force_all(options.force_all);
    for rule in &options.force_rules {
        if registry.get(rule).is_none() {
            return Err(format!("--force-rule: unknown rule '{}'", rule).into());
        }
        resolver = resolver.force_rule(rule.clone());
    }

    let graph = resolver.resolve_all(&final_targets(&config, &selected))?;

    if options.dry_run {
        info!("Mode: DRY RUN (commands will not execute)");
    }

    let mut engine = Engine::new(graph);
    engine.set_max_parallel(config.max_parallel);
    engine.set_dry_run(options.dry_run);
    engine.set_fail_fast(config.fail_fast);
    engine.set_working_dir(cwd);
    engine.set_journal(journal);
    engine.set_show_timeline(options.verbose);

    let summary = engine.run()?;
    if !options.dry_run {
        print_summary(&summary);
    }
    summary.into_result()?;

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
