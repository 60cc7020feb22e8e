mod output;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tidemark_common::MigrationKey;
use tidemark_config::{AppConfig, ConfigLoader, LogConfig};
use tidemark_db::{Applier, DefinitionLoader, MigrateOptions, MigrationGraph, sql_for};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tidemark", version, about = "Dependency-ordered schema migrations for SQLite")]
struct Cli {
    /// Config file (defaults to tidemark.yml / .yaml / .toml in the working directory)
    #[arg(long, global = true, env = "TIDEMARK_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file, overriding the config
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Migration directories, comma separated, overriding the config
    #[arg(long, global = true, value_delimiter = ',')]
    migrations: Vec<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the migrations that would be applied, in order
    Plan {
        /// Only plan up to this migration (app.name)
        #[arg(long)]
        target: Option<MigrationKey>,
    },
    /// Apply pending migrations
    Migrate {
        /// Only apply up to this migration (app.name)
        #[arg(long)]
        target: Option<MigrationKey>,
        /// Record migrations as applied without running their DDL
        #[arg(long)]
        fake: bool,
    },
    /// List every migration and whether it is applied
    Showmigrations,
    /// Print the SQL a migration would run
    Sqlmigrate { app: String, name: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, source) = load_config(&cli)?;
    init_logging(&config.log);
    match &source {
        Some(path) => info!("using config {}", path.display()),
        None => info!("no config file found, using defaults"),
    }
    debug!("database: {}", config.database.path.display());

    let migrations = DefinitionLoader::new(&config.swappable)
        .load_dirs(&config.migrations.dirs)
        .context("failed to load migration definitions")?;
    let graph = MigrationGraph::build(migrations).context("invalid migration graph")?;

    match cli.command {
        Command::Plan { target } => {
            let applier = open_applier(&config)?;
            let plan = applier.plan(&graph, target.as_ref())?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&output::plan_json(&plan))?);
            } else {
                print!("{}", output::render_plan(&plan));
            }
        }
        Command::Migrate { target, fake } => {
            let applier = open_applier(&config)?;
            let report = applier
                .migrate(&graph, &MigrateOptions { target, fake })
                .context("migration failed")?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", output::render_report(&report));
            }
        }
        Command::Showmigrations => {
            let applier = open_applier(&config)?;
            let rows = applier.show(&graph)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print!("{}", output::render_status(&rows));
            }
        }
        Command::Sqlmigrate { app, name } => {
            let statements = sql_for(&graph, &MigrationKey::new(app, name))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&statements)?);
            } else {
                print!("{}", output::render_sql(&statements));
            }
        }
    }

    Ok(())
}

/// Config from file and environment with command-line flags on top, plus the
/// file it was read from. Runs before logging is set up.
fn load_config(cli: &Cli) -> Result<(AppConfig, Option<PathBuf>)> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_path(path);
    }
    let (mut config, source) = loader
        .load_with_source()
        .context("failed to load configuration")?;

    if let Some(database) = &cli.database {
        config.database.path = database.clone();
    }
    if !cli.migrations.is_empty() {
        config.migrations.dirs = cli.migrations.clone();
    }
    Ok((config, source))
}

fn init_logging(log: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if log.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn open_applier(config: &AppConfig) -> Result<Applier> {
    let applier = Applier::open(&config.database.path).with_context(|| {
        format!(
            "failed to open database {}",
            config.database.path.display()
        )
    })?;
    applier.set_busy_timeout(Duration::from_millis(config.database.busy_timeout_ms))?;
    Ok(applier)
}
