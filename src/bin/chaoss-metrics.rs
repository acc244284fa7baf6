use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use chaoss_metrics::{
    bucketize, Database, Frequency, HttpBackend, MemoryBackend, MetricsRun, RunProgress,
    RunReport, RunState, TimeWindow,
};

#[derive(Parser)]
#[command(
    name = "chaoss-metrics",
    about = "Compute CHAOSS community health metrics from a search index"
)]
struct Cli {
    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute metrics for every scope and bucket and write them to the sink
    Run {
        /// YAML run configuration
        #[arg(long)]
        config: PathBuf,
        /// Write records to this SQLite database instead of the backend's output index
        #[arg(long)]
        sqlite: Option<PathBuf>,
        /// Query fixture documents ({"index": [docs]}) instead of the backend
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// Output the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the work units and query documents a run would execute
    Plan {
        #[arg(long)]
        config: PathBuf,
    },
    /// List the buckets a window splits into
    Buckets {
        /// Window start (inclusive)
        #[arg(long)]
        from: String,
        /// Window end (exclusive)
        #[arg(long)]
        to: String,
        /// D, W, W-MON .. W-SUN, or MS
        #[arg(long, default_value = "W-MON")]
        frequency: String,
    },
    /// List the scopes a configuration resolves to
    Scopes {
        #[arg(long)]
        config: PathBuf,
    },
    /// Show past runs recorded in the SQLite database
    History {
        /// Database path (default: ~/.chaoss-metrics/metrics.db)
        #[arg(long)]
        sqlite: Option<PathBuf>,
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Show metric records stored in the SQLite database
    Records {
        /// Output index the records were written to
        out_index: String,
        /// Only this scope identifier
        #[arg(long)]
        scope: Option<String>,
        /// Database path (default: ~/.chaoss-metrics/metrics.db)
        #[arg(long)]
        sqlite: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl RunProgress for StderrProgress {
    fn on_state(&self, state: RunState) {
        match state {
            RunState::Querying => eprintln!("Querying backend..."),
            RunState::Emitting => eprintln!("Writing remaining records..."),
            _ => {}
        }
    }

    fn on_unit_complete(&self, completed: u64, total: u64) {
        if completed == total {
            eprint!("\r  Units: {completed}/{total}   \n");
        } else {
            eprint!("\r  Units: {completed}/{total}   ");
        }
    }
}

async fn open_db(path: Option<&Path>) -> anyhow::Result<Database> {
    Ok(match path {
        Some(path) => Database::open_at(path).await?,
        None => Database::open().await?,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Run {
            config,
            sqlite,
            fixture,
            json,
        } => handle_run(&config, sqlite.as_deref(), fixture.as_deref(), json).await?,
        Commands::Plan { config } => {
            let run = MetricsRun::load(&config)?;
            let plan = run.plan()?;
            let units: Vec<serde_json::Value> = plan
                .units
                .iter()
                .map(|unit| {
                    let queries: Vec<serde_json::Value> = unit
                        .spec
                        .queries()
                        .iter()
                        .map(|q| serde_json::json!({ "index": q.index, "body": q.to_document() }))
                        .collect();
                    serde_json::json!({
                        "scope": unit.scope_identifier,
                        "level": unit.scope_level,
                        "window": unit.window,
                        "metric": unit.spec.name(),
                        "queries": queries,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&units)?);
        }
        Commands::Buckets {
            from,
            to,
            frequency,
        } => {
            let window = TimeWindow::parse(from.as_str(), to.as_str())?;
            let frequency = Frequency::parse(&frequency)?;
            let buckets = bucketize(&window, frequency);
            if buckets.is_empty() {
                eprintln!("No {frequency} buckets fit in {window}");
            }
            for bucket in buckets {
                println!("{bucket}");
            }
        }
        Commands::Scopes { config } => {
            let run = MetricsRun::load(&config)?;
            for scope in run.scopes()? {
                println!(
                    "{} ({}): {} repos",
                    scope.identifier,
                    scope.level,
                    scope.repos.len()
                );
                for repo in &scope.repos {
                    println!("  {repo}");
                }
            }
        }
        Commands::History {
            sqlite,
            limit,
            json,
        } => {
            let db = open_db(sqlite.as_deref()).await?;
            let runs = db.runs(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else if runs.is_empty() {
                println!("No runs recorded.");
            } else {
                for run in runs {
                    println!(
                        "#{} {} {} {} -> {}: {} ({}/{} units, {} records)",
                        run.id,
                        run.started_at,
                        run.model_name,
                        run.level,
                        run.out_index,
                        run.status,
                        run.units_succeeded,
                        run.units_total,
                        run.records_written
                    );
                }
            }
        }
        Commands::Records {
            out_index,
            scope,
            sqlite,
            json,
        } => {
            let db = open_db(sqlite.as_deref()).await?;
            let records = db.metric_records(&out_index, scope.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for r in records {
                    let value = r.value.map_or_else(|| "-".to_string(), |v| v.to_string());
                    println!(
                        "{} {} {}..{} {} = {value}",
                        r.scope_level, r.scope_identifier, r.from_date, r.to_date, r.metric_name
                    );
                }
            }
        }
    }

    Ok(())
}

async fn handle_run(
    config: &Path,
    sqlite: Option<&Path>,
    fixture: Option<&Path>,
    json: bool,
) -> anyhow::Result<()> {
    let run = MetricsRun::load(config)?;
    let db = match sqlite {
        Some(path) => Some(Database::open_at(path).await?),
        None => None,
    };
    let progress = StderrProgress;

    let outcome = match (fixture, db.clone()) {
        (Some(path), Some(db)) => {
            let backend = Arc::new(MemoryBackend::load(path)?);
            run.execute(backend, Arc::new(db), &progress).await
        }
        (Some(path), None) => {
            let backend = Arc::new(MemoryBackend::load(path)?);
            run.execute(Arc::clone(&backend), backend, &progress).await
        }
        (None, Some(db)) => {
            let backend = Arc::new(HttpBackend::new(
                &run.config().url,
                run.config().http_options(),
            )?);
            run.execute(backend, Arc::new(db), &progress).await
        }
        (None, None) => {
            let backend = Arc::new(HttpBackend::new(
                &run.config().url,
                run.config().http_options(),
            )?);
            run.execute(Arc::clone(&backend), backend, &progress).await
        }
    };

    // aborted runs carry their report in the error
    let report = match &outcome {
        Ok(report) => Some(report),
        Err(e) => e.run_report(),
    };
    if let Some(report) = report {
        if let Some(db) = &db {
            db.record_run(report).await?;
        }
        print_report(report, json)?;
    }
    outcome?;
    Ok(())
}

fn print_report(report: &RunReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!(
        "{} metrics at {} level -> {}",
        report.model_name, report.level, report.out_index
    );
    println!("  Status:   {}", report.status.as_str());
    println!(
        "  Scopes:   {} x {} buckets = {} units",
        report.scopes, report.buckets, report.units_total
    );
    println!(
        "  Units:    {} succeeded, {} failed, {} skipped",
        report.units_succeeded, report.units_failed, report.units_skipped
    );
    println!(
        "  Records:  {} written, {} dropped",
        report.records_written, report.records_dropped
    );
    for error in report.errors.iter().take(5) {
        println!("  Error:    {error}");
    }
    if report.errors.len() > 5 {
        println!("  ... and {} more errors", report.errors.len() - 5);
    }
    Ok(())
}
