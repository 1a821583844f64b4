use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use weather_engine::cleaner::run_aggregation;
use weather_engine::config::{Config, DatabaseConfig};
use weather_engine::db::Repository;
use weather_engine::fetcher::Fetcher;
use weather_engine::integrity::{IntegrityChecker, IntegrityReport};
use weather_engine::loader::Loader;
use weather_engine::scheduler::{fetch_exports, Scheduler};
use weather_engine::store::MemoryStore;

#[derive(Parser)]
#[command(name = "weather-engine")]
#[command(about = "Fetch, load and aggregate IMS weather station observations")]
#[command(version)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, global = true, default_value = "config/config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or migrate the raw table
    InitDb,
    /// Download station data from the API into CSV exports
    Fetch,
    /// Load CSV and XLSX exports into the raw table
    Ingest,
    /// Rebuild the hourly clean table from the raw table
    Clean,
    /// Run integrity checks against the clean table
    Check {
        /// Number of violations to print
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Check the newest raw rows of each station instead of the clean table
        #[arg(long)]
        raw: bool,

        /// Raw rows per station read with --raw
        #[arg(long, default_value_t = 2000)]
        rows: i64,
    },
    /// Fetch, ingest and clean once
    Run,
    /// Run the whole pipeline on the configured interval until interrupted
    Schedule,
    /// Aggregate the export directory in memory and report integrity, without a database
    Preview {
        /// Directory of exports (defaults to loader.data_dir)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Number of violations to print
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,weather_engine=debug,sqlx=warn")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    info!("Configuration loaded from {}", cli.config.display());

    match cli.command {
        Commands::InitDb => {
            let repository = connect(&config.database).await?;
            repository.run_migrations().await?;
        }
        Commands::Fetch => {
            let fetcher = Fetcher::from_config(&config.source)?;
            let summary = fetch_exports(&fetcher, &config).await?;
            info!(
                "Fetch finished: {} stations, {} rows written",
                summary.stations, summary.rows_written
            );
        }
        Commands::Ingest => {
            let repository = connect(&config.database).await?;
            repository.run_migrations().await?;
            let summary = scheduler(config, repository.clone()).run_ingest().await?;
            if summary.files_failed > 0 {
                warn!("{} files failed to load", summary.files_failed);
            }
            info!("Raw table holds {} rows", repository.count_raw().await?);
        }
        Commands::Clean => {
            let repository = connect(&config.database).await?;
            run_aggregation(repository.as_ref(), &config.aggregation).await?;
        }
        Commands::Check { limit, raw, rows } => {
            let repository = connect(&config.database).await?;
            let report = if raw {
                let observations = repository.latest_raw(rows).await?;
                if observations.is_empty() {
                    warn!("Raw table is empty, run `ingest` first");
                }
                IntegrityChecker::new().check_raw(&observations)
            } else {
                let (_, rows) = repository.fetch_clean().await?;
                if rows.is_empty() {
                    warn!("Clean table is empty or missing, run `clean` first");
                }
                IntegrityChecker::new().check_hourly(&rows)
            };
            print_report(&report, limit);
        }
        Commands::Run => {
            let repository = connect(&config.database).await?;
            repository.run_migrations().await?;
            scheduler(config, repository.clone()).run_once().await?;
            info!("Raw table holds {} rows", repository.count_raw().await?);
        }
        Commands::Schedule => {
            let repository = connect(&config.database).await?;
            repository.run_migrations().await?;
            run_scheduled(config, repository).await;
        }
        Commands::Preview { data_dir, limit } => {
            let data_dir = data_dir.unwrap_or_else(|| config.loader.data_dir.clone());
            let store = MemoryStore::new();
            let loader = Loader::new(&config.loader, &config.source.stations)?;
            loader.ingest_directory(&store, &data_dir).await?;

            let summary = run_aggregation(&store, &config.aggregation).await?;
            for warning in &summary.warnings {
                println!("warning: {}", warning);
            }
            let report = IntegrityChecker::new().check_hourly(&store.clean_rows()?);
            print_report(&report, limit);
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::load(path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration: {}\n\n\
             Make sure:\n\
             1. {} exists\n\
             2. All required environment variables are set (check .env.example)\n\
             3. Create a .env file if needed",
            e,
            path.display()
        )
    })
}

async fn connect(database: &DatabaseConfig) -> anyhow::Result<Arc<Repository>> {
    let pool = PgPoolOptions::new()
        .max_connections(database.max_connections)
        .connect(&database.connection_string())
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to connect to database: {}\n\n\
                 Host: {}:{}\n\
                 Database: {}\n\
                 User: {}\n\n\
                 Common fixes:\n\
                 1. Ensure PostgreSQL is running\n\
                 2. Check username/password are correct (DB_USER, DB_PASSWORD)\n\
                 3. Verify database exists: createdb {}\n\
                 4. Check host and port (DB_HOST, DB_PORT)",
                e,
                database.host,
                database.port,
                database.name,
                database.user,
                database.name
            )
        })?;

    info!(
        "Connected to database: {}@{}:{}/{}",
        database.user, database.host, database.port, database.name
    );
    Ok(Arc::new(Repository::new(pool)))
}

fn scheduler(config: Config, repository: Arc<Repository>) -> Scheduler<Repository> {
    // One-shot commands never signal shutdown.
    let (_, shutdown_rx) = watch::channel(false);
    Scheduler::new(config, repository, shutdown_rx)
}

async fn run_scheduled(config: Config, repository: Arc<Repository>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let mut scheduler = Scheduler::new(config, repository, shutdown_rx);
    if let Err(e) = scheduler.run().await {
        error!("Scheduler error: {}", e);
    }

    info!("Weather engine shutting down");
}

fn print_report(report: &IntegrityReport, limit: usize) {
    println!("{}", report.summary());
    for violation in report.violations.iter().take(limit) {
        println!("  {}", violation);
    }
    if report.violations.len() > limit {
        println!("  ... {} more", report.violations.len() - limit);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
