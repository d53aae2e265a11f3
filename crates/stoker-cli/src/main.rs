//! Administrative access to the stoker database.
//!
//! Operates on the database of the current working directory, the same
//! one a supervisor started here would use.

use anyhow::Context as _;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use stoker_core::Context;
use stoker_store::{Settings, TaskStore};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "stoker-admin",
    version,
    about = "Inspect waiting tasks and adjust stoker settings"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit JSON instead of plain text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show settings and row counts
    Info,
    /// List the tasks currently due
    Tasks,
    /// Set the number of allowed concurrent handler runs
    SetMaxWorkers {
        #[arg(value_parser = clap::value_parser!(u32).range(1..))]
        workers: u32,
    },
    /// Restore the default settings: max_workers=1, running_workers=0
    ResetDefaults,
    /// Delete the database file and recreate an empty schema
    DeleteDatabase {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "stoker=warn".into()))
        .init();

    let cli = Cli::parse();
    let ctx = Context::initialize()?;

    match cli.command {
        Commands::Info => info(&ctx, cli.json),
        Commands::Tasks => tasks(&ctx, cli.json),
        Commands::SetMaxWorkers { workers } => set_max_workers(&ctx, workers),
        Commands::ResetDefaults => reset_defaults(&ctx),
        Commands::DeleteDatabase { yes } => delete_database(&ctx, yes),
    }
}

fn open_store(ctx: &Context) -> anyhow::Result<TaskStore> {
    let path = ctx.db_path();
    TaskStore::open(&path).with_context(|| format!("opening {}", path.display()))
}

fn info(ctx: &Context, json: bool) -> anyhow::Result<()> {
    let store = open_store(ctx)?;
    let settings = store.get_settings()?;
    let tasks = store.count_tasks()?;
    let due = store.get_tasks_on_due(Utc::now())?.len();
    let results = store.count_results()?;

    if json {
        let doc = json!({
            "database": ctx.db_path().display().to_string(),
            "settings": settings,
            "tasks": tasks,
            "due": due,
            "results": results,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        println!("database:        {}", ctx.db_path().display());
        println!("max_workers:     {}", settings.max_workers);
        println!("running_workers: {}", settings.running_workers);
        println!("tasks:           {tasks} ({due} due)");
        println!("results:         {results}");
    }
    Ok(())
}

fn tasks(ctx: &Context, json: bool) -> anyhow::Result<()> {
    let store = open_store(ctx)?;
    let due = store.get_tasks_on_due(Utc::now())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&due)?);
        return Ok(());
    }
    if due.is_empty() {
        println!("no tasks due");
        return Ok(());
    }
    for task in due {
        let kind = if task.is_recurring() {
            task.crontab.as_str()
        } else {
            "one-shot"
        };
        println!(
            "#{:<6} {}  {}  [{kind}]",
            task.id,
            task.schedule.format("%Y-%m-%d %H:%M:%S"),
            task.handler,
        );
    }
    Ok(())
}

fn set_max_workers(ctx: &Context, workers: u32) -> anyhow::Result<()> {
    let store = open_store(ctx)?;
    let mut settings = store.get_settings()?;
    settings.max_workers = workers;
    store.set_settings(&settings)?;
    println!("max_workers set to {workers}");
    Ok(())
}

fn reset_defaults(ctx: &Context) -> anyhow::Result<()> {
    let store = open_store(ctx)?;
    store.set_settings(&Settings::default())?;
    println!("settings restored to defaults");
    Ok(())
}

fn delete_database(ctx: &Context, yes: bool) -> anyhow::Result<()> {
    if !yes {
        anyhow::bail!("refusing to delete the database without --yes");
    }
    let path = ctx.db_path();
    match std::fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("removing {}", path.display())),
    }
    // WAL sidecars belong to the removed file.
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.clone().into_os_string();
        sidecar.push(suffix);
        let _ = std::fs::remove_file(sidecar);
    }
    TaskStore::open(&path).with_context(|| format!("recreating {}", path.display()))?;
    println!("database recreated at {}", path.display());
    Ok(())
}
