//! CLI binary for ingesting event streams and running Chronicle batches.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::SecondsFormat;
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast;

use chronicle_pipeline::ir::ir_v1_columns;
use chronicle_pipeline::{
    builtin_views, canonical_registry, CheckpointJournal, DigestAgent, PipelineConfig,
    PipelineEvent, PipelineRunner, RunTracker, Store, WindowOutcome,
    WindowPlanner,
};
use chronicle_types::{RunId, RunRecord, Table};

#[derive(Parser)]
#[command(name = "chron", version, about = "Windowed, checkpointed processing of conversation streams")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and lock canonical schema versions
    Schema {
        #[command(subcommand)]
        command: SchemaCommand,
    },

    /// List the built-in views
    Views,

    /// Show the windows a batch over an events file would process
    Plan {
        /// JSON Lines file of ir_v1 events
        events: PathBuf,

        #[arg(long)]
        tenant: String,

        #[arg(long)]
        source: String,

        /// Also show each window cut into this many equal time spans
        #[arg(long)]
        split: Option<usize>,

        #[command(flatten)]
        settings: Settings,
    },

    /// Append events from a JSON Lines file to the store
    Ingest {
        /// JSON Lines file of ir_v1 events
        events: PathBuf,

        #[command(flatten)]
        settings: Settings,
    },

    /// Process every pending window of a stream
    Run {
        #[arg(long)]
        tenant: String,

        #[arg(long)]
        source: String,

        /// Ingest this JSON Lines file before running
        #[arg(long)]
        events: Option<PathBuf>,

        /// Correlation id stamped on every run of this invocation
        #[arg(long)]
        trace_id: Option<String>,

        #[command(flatten)]
        settings: Settings,
    },

    /// Inspect recorded runs
    Runs {
        #[command(subcommand)]
        command: RunsCommand,

        #[command(flatten)]
        settings: Settings,
    },

    /// List completed windows of a stream
    Journals {
        #[arg(long)]
        tenant: String,

        #[arg(long)]
        source: String,

        #[command(flatten)]
        settings: Settings,
    },
}

#[derive(Subcommand)]
enum SchemaCommand {
    /// List registered versions
    List,

    /// Print one version's lockfile
    Show { version: String },

    /// Write lockfiles, or verify them with --check
    Lock {
        #[arg(long, default_value = "schema")]
        dir: PathBuf,

        /// Fail if the lockfiles differ from the registry instead of writing
        #[arg(long)]
        check: bool,
    },
}

#[derive(Subcommand)]
enum RunsCommand {
    /// Most recently started runs
    List {
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// One run in full
    Show { run_id: String },

    /// A run and its ancestors, nearest first
    Lineage { run_id: String },
}

/// Configuration file plus command-line overrides.
#[derive(Args, Clone, Default)]
struct Settings {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path (overrides the configuration file)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Windows processed concurrently (overrides the configuration file)
    #[arg(long)]
    workers: Option<usize>,
}

impl Settings {
    fn resolve(&self) -> anyhow::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(db) = &self.db {
            config.database_path = db.clone();
        }
        if let Some(workers) = self.workers {
            config.max_workers = workers;
        }
        config.validate()?;
        Ok(config)
    }

    async fn open(&self) -> anyhow::Result<(PipelineConfig, Store)> {
        let config = self.resolve()?;
        let store = Store::open(&config.database_path, config.max_connections).await?;
        Ok((config, store))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Schema { command } => cmd_schema(command)?,
        Commands::Views => cmd_views().await?,
        Commands::Plan {
            events,
            tenant,
            source,
            split,
            settings,
        } => cmd_plan(&events, &tenant, &source, split, &settings).await?,
        Commands::Ingest { events, settings } => cmd_ingest(&events, &settings).await?,
        Commands::Run {
            tenant,
            source,
            events,
            trace_id,
            settings,
        } => cmd_run(&tenant, &source, events.as_deref(), trace_id, &settings).await?,
        Commands::Runs { command, settings } => cmd_runs(command, &settings).await?,
        Commands::Journals {
            tenant,
            source,
            settings,
        } => cmd_journals(&tenant, &source, &settings).await?,
    }

    Ok(())
}

/// Parse a JSON Lines file of ir_v1 records. Blank lines are ignored.
fn read_events(path: &Path) -> anyhow::Result<Table> {
    let raw = std::fs::read_to_string(path)?;
    let mut records = Vec::new();
    for (n, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| anyhow::anyhow!("{}:{}: {e}", path.display(), n + 1))?;
        records.push(record);
    }
    Ok(Table::from_records(ir_v1_columns(), &records)?)
}

fn fmt_ts(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn cmd_schema(command: SchemaCommand) -> anyhow::Result<()> {
    let registry = canonical_registry()?;
    match command {
        SchemaCommand::List => {
            for version in registry.versions() {
                let definition = registry.get(version)?;
                println!("{} ({} columns)", version, definition.columns.len());
            }
        }
        SchemaCommand::Show { version } => {
            print!("{}", registry.lockfile(&version)?);
        }
        SchemaCommand::Lock { dir, check } => {
            if check {
                let checked = registry.check_lockfiles(&dir)?;
                println!("{} lockfile(s) match the registry", checked);
            } else {
                for path in registry.write_lockfiles(&dir)? {
                    println!("Wrote {}", path.display());
                }
            }
        }
    }
    Ok(())
}

async fn cmd_views() -> anyhow::Result<()> {
    let store = Store::in_memory().await?;
    let views = builtin_views(&store)?;
    for name in views.list() {
        match chronicle_pipeline::views::builtin_contract(name) {
            Some((input, output)) => println!("{name}  {input} -> {output}"),
            None => println!("{name}"),
        }
    }
    Ok(())
}

async fn cmd_plan(
    events: &Path,
    tenant: &str,
    source: &str,
    split: Option<usize>,
    settings: &Settings,
) -> anyhow::Result<()> {
    let config = settings.resolve()?;
    // Round-trip through a scratch store to get the stream in (ts, event_id) order.
    let scratch = Store::in_memory().await?;
    scratch.insert_events(&read_events(events)?).await?;
    let table = scratch.load_events(tenant, source).await?;

    let planner = WindowPlanner::new(config.windowing.clone())?.with_range(config.date_range);
    let mut count = 0;
    for window in planner.plan(tenant, source, &table) {
        let window = window?;
        println!(
            "{:>4}  {}  {}  rows={} carried={}",
            window.index,
            fmt_ts(window.key.start),
            fmt_ts(window.key.end),
            window.len(),
            window.carried
        );
        if let Some(parts) = split {
            for part in WindowPlanner::split(&window, parts)? {
                println!(
                    "      {}  {}  rows={} carried={}",
                    fmt_ts(part.key.start),
                    fmt_ts(part.key.end),
                    part.len(),
                    part.carried
                );
            }
        }
        count += 1;
    }
    println!("\n{} window(s) over {} event(s)", count, table.len());
    Ok(())
}

async fn cmd_ingest(events: &Path, settings: &Settings) -> anyhow::Result<()> {
    let (_, store) = settings.open().await?;
    let table = read_events(events)?;
    let inserted = store.insert_events(&table).await?;
    println!(
        "Ingested {} of {} event(s) ({} already present)",
        inserted,
        table.len(),
        table.len() as u64 - inserted
    );
    Ok(())
}

async fn cmd_run(
    tenant: &str,
    source: &str,
    events: Option<&Path>,
    trace_id: Option<String>,
    settings: &Settings,
) -> anyhow::Result<()> {
    let (config, store) = settings.open().await?;
    if let Some(path) = events {
        let inserted = store.insert_events(&read_events(path)?).await?;
        println!("Ingested {} new event(s)", inserted);
    }

    tracing::info!(tenant, source, "Starting batch");
    let views = builtin_views(&store)?;
    let runner = PipelineRunner::new(
        store.clone(),
        canonical_registry()?,
        &views,
        Arc::new(DigestAgent::default()),
        config,
    )?;
    let runner = match trace_id {
        Some(id) => runner.with_trace_id(id),
        None => runner,
    };

    let cancel = runner.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted; finishing in-flight windows");
            cancel.cancel();
        }
    });

    let mut rx = runner.events().subscribe();
    let progress = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event {
                PipelineEvent::WindowCompleted { window, artifacts, .. } => {
                    println!("  done     {}  ({} artifact(s))", fmt_ts(window.start), artifacts)
                }
                PipelineEvent::WindowSkipped { window } => {
                    println!("  skipped  {}", fmt_ts(window.start))
                }
                PipelineEvent::WindowFailed { window, error, .. } => {
                    println!("  failed   {}  {}", fmt_ts(window.start), error)
                }
                PipelineEvent::WindowRetrying { window, attempt } => {
                    println!("  retry    {}  attempt {}", fmt_ts(window.start), attempt)
                }
                _ => {}
            }
        }
    });

    let report = runner.run_stored(tenant, source).await;
    progress.abort();
    let report = report?;

    println!("\nBatch {} {}", report.run_id, report.status);
    println!(
        "Windows: {} completed, {} skipped, {} failed, {} cancelled",
        report.completed(),
        report.skipped(),
        report.failed(),
        report.cancelled()
    );
    for window in &report.windows {
        if let WindowOutcome::Failed { error } = &window.outcome {
            println!("  {}: {}", window.window, error);
        }
    }
    store.close().await;
    Ok(())
}

fn print_run(run: &RunRecord) {
    println!(
        "{}  {:<9}  {:<8}  {}  rows {}->{}{}",
        run.run_id,
        run.status,
        run.stage,
        fmt_ts(run.started_at),
        run.metrics.rows_in,
        run.metrics.rows_out,
        run.error
            .as_deref()
            .map(|e| format!("  error: {e}"))
            .unwrap_or_default()
    );
}

async fn cmd_runs(command: RunsCommand, settings: &Settings) -> anyhow::Result<()> {
    let (_, store) = settings.open().await?;
    let tracker = RunTracker::new(store);
    match command {
        RunsCommand::List { limit } => {
            for run in tracker.recent(limit).await? {
                print_run(&run);
            }
        }
        RunsCommand::Show { run_id } => {
            let run: RunId = run_id.parse()?;
            let Some(record) = tracker.get(run).await? else {
                anyhow::bail!("No run {run}");
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
            let children = tracker.children(run).await?;
            if !children.is_empty() {
                println!("\nChildren:");
                for child in &children {
                    print_run(child);
                }
            }
        }
        RunsCommand::Lineage { run_id } => {
            let run: RunId = run_id.parse()?;
            for (depth, record) in tracker.lineage(run).await?.iter().enumerate() {
                print!("{}", "  ".repeat(depth));
                print_run(record);
            }
        }
    }
    Ok(())
}

async fn cmd_journals(tenant: &str, source: &str, settings: &Settings) -> anyhow::Result<()> {
    let (_, store) = settings.open().await?;
    let journals = CheckpointJournal::new(store).journals(tenant, source).await?;
    for journal in &journals {
        let bounds = journal
            .window_start
            .zip(journal.window_end)
            .map(|(s, e)| format!("{} .. {}", fmt_ts(s), fmt_ts(e)))
            .unwrap_or_default();
        println!("{}  run {}  {}", bounds, journal.produced_by, journal.body.replace('\n', ", "));
    }
    println!("\n{} completed window(s)", journals.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_events(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    const EVENT: &str = r#"{"event_id":"00000000-0000-0000-0000-000000000001","tenant_id":"acme","source":"chat","thread_id":"00000000-0000-0000-0000-0000000000aa","msg_id":"m1","ts":"2024-03-01T09:30:00Z","author_uuid":"00000000-0000-0000-0000-0000000000bb","text":"hello","created_at":"2024-03-01T09:30:01Z"}"#;

    #[test]
    fn reads_jsonl_events() {
        let file = write_events(&[EVENT, "", EVENT]);
        let table = read_events(file.path()).unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.value(0, "media_url").unwrap().is_null());
        assert_eq!(table.value(0, "text").unwrap().as_str(), Some("hello"));
    }

    #[test]
    fn bad_line_reports_position() {
        let file = write_events(&[EVENT, "{not json"]);
        let err = read_events(file.path()).unwrap_err().to_string();
        assert!(err.contains(":2:"), "{err}");
    }

    #[test]
    fn flags_override_config() {
        let settings = Settings {
            config: None,
            db: Some(PathBuf::from("/tmp/x.db")),
            workers: Some(2),
        };
        let config = settings.resolve().unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.max_workers, 2);

        let zero = Settings {
            workers: Some(0),
            ..Default::default()
        };
        assert!(zero.resolve().is_err());
    }

    #[test]
    fn cli_parses_nested_commands() {
        let cli = Cli::try_parse_from(["chron", "-v", "runs", "--db", "x.db", "list", "--limit", "5"])
            .unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Runs {
                command: RunsCommand::List { limit: 5 },
                ..
            }
        ));
    }

    #[test]
    fn run_and_plan_flags() {
        let cli = Cli::try_parse_from([
            "chron", "run", "--tenant", "acme", "--source", "chat", "--trace-id", "req-1",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Run { trace_id: Some(ref id), .. } if id == "req-1"
        ));

        let cli = Cli::try_parse_from([
            "chron", "plan", "events.jsonl", "--tenant", "acme", "--source", "chat", "--split", "4",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Plan { split: Some(4), .. }));
    }
}
