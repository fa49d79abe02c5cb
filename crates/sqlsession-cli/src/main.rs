//! sqlsession CLI
//!
//! Command-line interface for installing and maintaining a PostgreSQL
//! session-state database

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlsession_core::{LockCookie, SessionStateStore};
use sqlsession_engine::StoreConfig;
use sqlsession_postgres::{PgConnector, PostgresSessionStateStore, install_schema};
use std::path::PathBuf;
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "sqlsession")]
#[command(about = "sqlsession - relational session-state store administration", long_about = None)]
struct Cli {
    /// Path to a YAML or TOML store configuration
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// PostgreSQL connection string (overrides the configuration file)
    #[arg(long)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install or upgrade the session-state schema
    Migrate,
    /// Show the applied schema version
    Status,
    /// Print the stored row for a session as JSON
    Inspect {
        session_id: String,
    },
    /// Push a session's expiry forward by its timeout
    ResetTimeout {
        session_id: String,
    },
    /// Release an exclusive lock held under `cookie`
    Release {
        session_id: String,
        #[arg(long)]
        cookie: i32,
    },
    /// Delete a session whose lock cookie matches
    Remove {
        session_id: String,
        #[arg(long)]
        cookie: i32,
    },
    /// Delete every expired session
    PurgeExpired,
}

fn load_config(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let path = shellexpand::tilde(&path.to_string_lossy()).to_string();
            StoreConfig::from_file(&path)
                .with_context(|| format!("Failed to load configuration from {}", path))?
        }
        None => StoreConfig::default(),
    };

    // Environment overrides the file, the command line overrides both
    config.merge_env();
    if let Some(url) = &cli.database_url {
        config.connection_string = url.clone();
    }

    config.validate()?;
    Ok(config)
}

fn init_tracing(config: &StoreConfig) -> anyhow::Result<()> {
    let log_level = match config.logging.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::new(format!("{}", log_level));

    // sqlx logs every statement at debug; keep it quiet unless asked
    if !config.logging.log_sql_queries {
        match "sqlx=warn".parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => tracing::warn!("Failed to set sqlx log filter: {}", e),
        }
    }

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config)?;

    if let Commands::Migrate = cli.command {
        let connector = PgConnector::from_config(&config)?;
        install_schema(&connector).await?;
        info!("Schema is up to date");
        return Ok(());
    }

    let store = PostgresSessionStateStore::with_config(&config).await?;
    let result = run(&store, cli.command).await;
    store.shutdown().await;
    result
}

async fn run(store: &PostgresSessionStateStore, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Migrate => {}
        Commands::Status => match store.schema_version().await? {
            Some(version) => println!("schema version {}", version),
            None => println!("schema not installed"),
        },
        Commands::Inspect { session_id } => match store.inspect(&session_id).await? {
            Some(row) => println!("{}", serde_json::to_string_pretty(&row)?),
            None => anyhow::bail!("session {} not found", session_id),
        },
        Commands::ResetTimeout { session_id } => {
            store.reset_item_timeout(&session_id).await?;
            info!(session_id = %session_id, "Timeout reset");
        }
        Commands::Release { session_id, cookie } => {
            store
                .release_item_exclusive(&session_id, LockCookie(cookie))
                .await?;
            info!(session_id = %session_id, cookie, "Lock released");
        }
        Commands::Remove { session_id, cookie } => {
            store.remove_item(&session_id, LockCookie(cookie)).await?;
            info!(session_id = %session_id, cookie, "Session removed");
        }
        Commands::PurgeExpired => {
            let purged = store.purge_expired().await?;
            println!("purged {} expired sessions", purged);
        }
    }
    Ok(())
}
