mod commands;
mod logging;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use steward_migrate::{MigrationConfig, MigrationError, MigrationResult};

use commands::migrate;

#[derive(Parser)]
#[command(name = "steward")]
#[command(about = "Apply and roll back ordered SQL migrations")]
#[command(version)]
struct Cli {
    /// Connection URL; overrides DATABASE_URL and the DB_* variables
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Directory holding the .sql migration files
    #[arg(long, global = true)]
    migrations_dir: Option<PathBuf>,

    /// Table used to track applied migrations
    #[arg(long, global = true)]
    migrations_table: Option<String>,

    /// Log level filter, ignored when RUST_LOG is set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply all pending migrations
    Migrate,

    /// Roll back the most recently applied migrations
    Rollback {
        /// How many migrations to revert (default 1)
        #[arg(allow_hyphen_values = true, allow_negative_numbers = true)]
        count: Option<String>,
    },

    /// Show applied and pending migrations
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create a new migration file
    Make {
        /// Migration name
        name: String,
    },
}

impl Cli {
    fn config(&self) -> MigrationResult<MigrationConfig> {
        let mut config = MigrationConfig::from_env()?;

        if let Some(url) = &self.database_url {
            config.database_url = Some(url.clone());
        }
        if let Some(dir) = &self.migrations_dir {
            config.migrations_dir = dir.clone();
        }
        if let Some(table) = &self.migrations_table {
            config.migrations_table = table.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config()?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Migrate => migrate::run(&config).await,
        Commands::Rollback { count } => migrate::rollback(&config, count.as_deref()).await,
        Commands::Status { json } => migrate::status(&config, json).await,
        Commands::Make { name } => migrate::make(&config, &name),
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<MigrationError>()
        .map(MigrationError::exit_code)
        .unwrap_or(1)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = logging::init_logging(&cli.log_level, cli.json_logs) {
        eprintln!("Invalid log configuration: {}", err);
        std::process::exit(2);
    }

    if let Err(err) = run(cli).await {
        tracing::error!(error = %err, "command failed");
        eprintln!("Error: {:#}", err);
        std::process::exit(exit_code(&err));
    }
}
