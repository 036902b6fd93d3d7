//! # Taskherd
//!
//! Schedule, run and monitor predefined commands.
//!
//! Usage:
//!   taskherd serve                        # Gateway API + worker in one process
//!   taskherd worker                       # Worker only (shared redis queue)
//!   taskherd task create nightly emit_logs --args "--verbosity 2, --info hello" --every "1 day"
//!   taskherd task run 3                   # Run a task in the foreground
//!   taskherd report lines 12 --level error

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use taskherd_core::config::TaskherdConfig;
use taskherd_scheduler::{Engine, NewTask, RepetitionPeriod, Task};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taskherd", version, about = "🐑 Taskherd: scheduled commands with per-run logs")]
struct Cli {
    /// Config file (default ~/.taskherd/config.toml)
    #[arg(short, long, env = "TASKHERD_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Run the gateway API together with a queue worker
    Serve {
        /// Only serve the API, leave jobs to separate workers
        #[arg(long)]
        no_worker: bool,
    },
    /// Run a queue worker
    Worker,
    /// Sync and list predefined commands
    Commands,
    /// Manage tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Inspect execution reports
    Report {
        #[command(subcommand)]
        action: ReportAction,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// List tasks
    List,
    /// Show one task as JSON
    Show { id: i64 },
    /// Create an idle task
    Create {
        name: String,
        command: String,
        /// Argument string, e.g. "--verbose, --level=3, --input data.csv"
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        args: String,
        /// First run, RFC 3339 (e.g. 2026-11-01T08:00:00Z)
        #[arg(long)]
        at: Option<String>,
        /// Repetition, "<rate> <period>" (e.g. "2 hour")
        #[arg(long)]
        every: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        note: Option<String>,
    },
    /// Submit tasks to the queue
    Launch { ids: Vec<i64> },
    /// Cancel tasks' queued jobs
    Stop { ids: Vec<i64> },
    /// Run a task now, in this process
    Run { id: i64 },
    /// Delete a task and its reports
    Delete { id: i64 },
}

#[derive(Subcommand)]
enum ReportAction {
    /// Reports of a task, newest first
    List { task_id: i64 },
    /// Report summary with log tail
    Show { id: i64 },
    /// Formatted log lines
    Lines {
        id: i64,
        /// Only lines of this level (debug, info, warning, error)
        #[arg(long)]
        level: Option<String>,
    },
    /// Delete one report
    Delete { id: i64 },
    /// Keep only the most recent reports of a task
    Prune {
        task_id: i64,
        #[arg(long)]
        keep: usize,
    },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn load_config(path: Option<&PathBuf>) -> Result<TaskherdConfig> {
    let config = match path {
        Some(path) => TaskherdConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TaskherdConfig::load()?,
    };
    Ok(config)
}

async fn open_engine(config: &TaskherdConfig) -> Result<Arc<Engine>> {
    let db_path = expand_path(&config.database.path);
    let engine = Engine::start(config, &db_path).await?;
    Ok(Arc::new(engine))
}

fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, shutting down");
        }
        let _ = tx.send(true);
    });
    rx
}

fn parse_every(raw: &str) -> Result<(u32, RepetitionPeriod)> {
    let mut parts = raw.split_whitespace();
    let (Some(rate), Some(period), None) = (parts.next(), parts.next(), parts.next()) else {
        bail!("--every expects \"<rate> <period>\", got '{raw}'");
    };
    let rate: u32 = rate.parse().with_context(|| format!("bad rate '{rate}'"))?;
    let period = period
        .trim_end_matches('s')
        .parse::<RepetitionPeriod>()
        .map_err(anyhow::Error::msg)?;
    Ok((rate, period))
}

fn print_task_row(task: &Task) {
    println!(
        "{:>5}  {:<24} {:<16} {:<10} {:<10} {:<8} {}",
        task.id,
        task.name,
        task.command,
        task.status,
        task.repetition(),
        task.cache
            .last_invocation_result
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".into()),
        task.next_ride
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".into()),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "taskherd=debug,taskherd_scheduler=debug,taskherd_gateway=debug,tower_http=debug"
    } else {
        "taskherd=info,taskherd_scheduler=info,taskherd_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    if let Commands::Init { force } = cli.command {
        let path = cli.config.clone().unwrap_or_else(TaskherdConfig::default_path);
        if path.exists() && !force {
            bail!("{} already exists (use --force to overwrite)", path.display());
        }
        TaskherdConfig::default().save_to(&path)?;
        println!("✅ Config written to {}", path.display());
        return Ok(());
    }

    let config = load_config(cli.config.as_ref())?;
    let engine = open_engine(&config).await?;
    let service = engine.service.clone();

    match cli.command {
        Commands::Init { .. } => {}
        Commands::Serve { no_worker } => {
            println!("🐑 Taskherd v{}", env!("CARGO_PKG_VERSION"));
            println!("   🌐 API:      http://{}:{}/api/v1", config.gateway.host, config.gateway.port);
            println!("   📦 Queue:    {}", engine.backend.name());
            println!("   🗄️  Database: {}", config.database.path);
            println!();

            let shutdown = shutdown_on_ctrl_c();
            let worker = (!no_worker).then(|| {
                let worker = engine.worker(&config);
                let rx = shutdown.clone();
                tokio::spawn(async move { worker.run(rx).await })
            });
            taskherd_gateway::start(&config, engine.clone(), shutdown).await?;
            if let Some(handle) = worker {
                handle.await.context("worker task")?;
            }
        }
        Commands::Worker => {
            let worker = engine.worker(&config);
            worker.run(shutdown_on_ctrl_c()).await;
        }
        Commands::Commands => {
            for command in service.list_commands()? {
                println!(
                    "{:>4}  {:<10} {:<24} {}",
                    command.id,
                    command.namespace,
                    command.name,
                    if command.active { "active" } else { "inactive" }
                );
            }
        }
        Commands::Task { action } => match action {
            TaskAction::List => {
                for task in service.list_tasks()? {
                    print_task_row(&task);
                }
            }
            TaskAction::Show { id } => {
                println!("{}", serde_json::to_string_pretty(&service.get_task(id)?)?);
            }
            TaskAction::Create {
                name,
                command,
                args,
                at,
                every,
                category,
                note,
            } => {
                let scheduling = at
                    .map(|raw| {
                        chrono::DateTime::parse_from_rfc3339(&raw)
                            .map(|t| t.with_timezone(&chrono::Utc))
                            .with_context(|| format!("bad --at '{raw}'"))
                    })
                    .transpose()?;
                let (repetition_rate, repetition_period) = match every {
                    Some(raw) => {
                        let (rate, period) = parse_every(&raw)?;
                        (Some(rate), Some(period))
                    }
                    None => (None, None),
                };
                let task = service.create_task(NewTask {
                    name,
                    command,
                    arguments: args,
                    category,
                    note,
                    scheduling,
                    repetition_period,
                    repetition_rate,
                })?;
                println!("✅ Task {} created", task.id);
            }
            TaskAction::Launch { ids } => {
                for outcome in service.bulk_launch(&ids).await {
                    match outcome.error {
                        None => println!("🚀 Task {} launched", outcome.id),
                        Some(e) => println!("❌ Task {}: {e}", outcome.id),
                    }
                }
            }
            TaskAction::Stop { ids } => {
                for outcome in service.bulk_stop(&ids).await {
                    match outcome.error {
                        None => println!("⏹️  Task {} stopped", outcome.id),
                        Some(e) => println!("❌ Task {}: {e}", outcome.id),
                    }
                }
            }
            TaskAction::Run { id } => {
                service.get_task(id)?;
                match engine.executor.execute(id).await? {
                    Some(report) => {
                        let view = service.report_view(report.id)?;
                        println!(
                            "{} (report {}): {}, {} error(s), {} warning(s)",
                            view.task_name,
                            report.id,
                            report.invocation_result,
                            view.n_log_errors,
                            view.n_log_warnings
                        );
                    }
                    None => bail!("task {id} disappeared before it could run"),
                }
            }
            TaskAction::Delete { id } => {
                service.delete(id).await?;
                println!("🗑️  Task {id} deleted");
            }
        },
        Commands::Report { action } => match action {
            ReportAction::List { task_id } => {
                for report in service.list_reports(task_id)? {
                    println!(
                        "{:>6}  {}  {}",
                        report.id,
                        report.invocation_datetime.to_rfc3339(),
                        report.invocation_result
                    );
                }
            }
            ReportAction::Show { id } => {
                let view = service.report_view(id)?;
                println!(
                    "{} (report {}) at {}: {}",
                    view.task_name,
                    id,
                    view.report.invocation_datetime.to_rfc3339(),
                    view.report.invocation_result
                );
                println!(
                    "{} line(s), {} error(s), {} warning(s)\n",
                    view.n_log_lines, view.n_log_errors, view.n_log_warnings
                );
                for line in view.tail {
                    println!("{line}");
                }
            }
            ReportAction::Lines { id, level } => {
                let level = level
                    .map(|l| l.parse().map_err(anyhow::Error::msg))
                    .transpose()?;
                for line in service.report_lines(id, level)? {
                    println!("{line}");
                }
            }
            ReportAction::Delete { id } => {
                service.delete_report(id)?;
                println!("🗑️  Report {id} deleted");
            }
            ReportAction::Prune { task_id, keep } => {
                let deleted = service.prune(task_id, keep)?;
                println!("🧹 {deleted} report(s) pruned");
            }
        },
    }

    Ok(())
}
