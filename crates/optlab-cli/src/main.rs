use anyhow::Result;
use clap::{Parser, Subcommand};
use optlab_runner::{GridState, GridStore};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "optlab", version = "0.3.0", about = "Dispatches and supervises objective-function jobs")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the dispatch loop for an experiment until it is finished.
    Run {
        experiment: PathBuf,
        #[arg(long, default_value_t = 1)]
        max_concurrent: usize,
        #[arg(long, default_value_t = 10_000)]
        max_finished_jobs: usize,
        #[arg(long, default_value = "sequential")]
        method: String,
        #[arg(long, default_value = "")]
        method_args: String,
        #[arg(long, default_value = "local")]
        driver: String,
        #[arg(long, default_value_t = 20_000)]
        grid_size: usize,
        #[arg(long, default_value_t = 1)]
        grid_seed: u64,
        /// Seconds to sleep between dispatch iterations.
        #[arg(long, default_value_t = 3.0)]
        polling_time: f64,
        #[arg(long)]
        json: bool,
    },
    /// Worker mode: evaluates a single job record. Started by the local driver.
    RunJob {
        job: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Prints the current state of an experiment's grid.
    Describe {
        experiment: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            experiment,
            max_concurrent,
            max_finished_jobs,
            method,
            method_args,
            driver,
            grid_size,
            grid_seed,
            polling_time,
            json,
        } => {
            let expt = optlab_core::load_experiment(&experiment)?;
            let expt_dir = optlab_core::experiment_dir_for(&experiment)?;
            optlab_runner::check_experiment_dirs(&expt_dir)?;
            if !polling_time.is_finite() || polling_time < 0.0 {
                anyhow::bail!("--polling-time must be a non-negative number of seconds");
            }
            let options = optlab_runner::DispatchOptions {
                max_concurrent,
                max_finished_jobs,
                polling_time: Duration::from_secs_f64(polling_time),
            };

            let store = optlab_runner::FileGridStore::create_or_open(
                &expt_dir,
                &expt.variables,
                grid_size,
                grid_seed,
            )?;
            let mut chooser =
                optlab_runner::ChooserRegistry::default().resolve(&method, &expt_dir, &method_args)?;
            let driver_config = optlab_runner::DriverConfig::current_exe()?;
            let driver = optlab_runner::DriverRegistry::default().resolve(&driver, &driver_config)?;

            let iterations = optlab_runner::run_dispatch_loop(
                &expt,
                &expt_dir,
                chooser.as_mut(),
                driver.as_ref(),
                &store,
                &options,
            )?;
            let state = store.load_state()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "iterations": iterations,
                    "summary": state_to_json(&expt.name, &expt_dir, &state)
                })));
            }
            println!("iterations: {}", iterations);
            print_state(&expt.name, &expt_dir, &state);
        }
        Commands::RunJob { job, json } => {
            let outcome = optlab_runner::run_job_file(&job)?;
            if json {
                let (value, duration) = match outcome {
                    optlab_runner::JobOutcome::Complete { value, duration } => (Some(value), duration),
                    optlab_runner::JobOutcome::Broken { duration } => (None, duration),
                };
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run-job",
                    "job": job.display().to_string(),
                    "status": outcome.status().as_str(),
                    "value": value,
                    "duration": duration
                })));
            }
            println!("job: {}", job.display());
            println!("status: {}", outcome.status());
        }
        Commands::Describe { experiment, json } => {
            let expt = optlab_core::load_experiment(&experiment)?;
            let expt_dir = optlab_core::experiment_dir_for(&experiment)?;
            let store = optlab_runner::FileGridStore::open(&expt_dir)?;
            let state = store.load_state()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": state_to_json(&expt.name, &expt_dir, &state)
                })));
            }
            print_state(&expt.name, &expt_dir, &state);
        }
    }
    Ok(None)
}

fn print_state(name: &str, expt_dir: &Path, state: &GridState) {
    println!("experiment: {}", name);
    println!("experiment_dir: {}", expt_dir.display());
    println!("grid_size: {}", state.snapshot.len());
    println!("candidates: {}", state.candidates.len());
    println!("pending: {}", state.pending.len());
    println!("complete: {}", state.complete.len());
    println!("broken: {}", state.broken.len());
    match state.best() {
        Some((value, id)) => {
            println!("best_value: {}", value);
            println!("best_job_id: {}", id);
            for param in state.snapshot.params.get(id as usize).into_iter().flatten() {
                println!("  {}", param);
            }
        }
        None => println!("best_value: none"),
    }
}

fn state_to_json(name: &str, expt_dir: &Path, state: &GridState) -> Value {
    let best = state.best().map(|(value, id)| {
        let params: serde_json::Map<String, Value> = state
            .snapshot
            .params
            .get(id as usize)
            .into_iter()
            .flatten()
            .map(|p| (p.name.clone(), p.value.to_json()))
            .collect();
        json!({
            "job_id": id,
            "value": value,
            "params": params
        })
    });
    json!({
        "experiment": name,
        "experiment_dir": expt_dir.display().to_string(),
        "grid_size": state.snapshot.len(),
        "candidates": state.candidates.len(),
        "pending": state.pending,
        "complete": state.complete.len(),
        "broken": state.broken,
        "best": best
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::RunJob { json, .. } | Commands::Describe { json, .. } => {
            *json
        }
    }
}
