//! mailrag server and command line.

use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mailrag::services::LogProgress;
use mailrag::{api, config, db, AppState, Error, Result};

#[derive(Debug, Parser)]
#[clap(name = "mailrag", version, about = "Email ingestion and question answering")]
struct Cli {
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the web API (default)
    Serve,
    /// Fetch, store and process emails received in a date range
    Ingest {
        /// First day, YYYY-MM-DD
        #[clap(long)]
        start: String,
        /// Last day, YYYY-MM-DD
        #[clap(long)]
        end: String,
    },
    /// Rebuild the full-text search index
    RebuildIndex,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = config::init();
    config.log_summary();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::Ingest { start, end } => ingest(&start, &end).await,
        Command::RebuildIndex => rebuild_index().await,
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mailrag=debug,tower_http=debug".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

async fn serve() -> Result<()> {
    let config = config::config();
    tracing::info!(
        "Starting mailrag server on {}:{}",
        config.server.host,
        config.server.port
    );

    let state = AppState::new(config).await?;
    tracing::info!("Application state initialized");

    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| Error::Validation(format!("Invalid address: {}", e)))?;

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn ingest(start: &str, end: &str) -> Result<()> {
    let state = AppState::new(config::config()).await?;

    let outcome = state.ingest.process_emails(start, end, &LogProgress).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if outcome.success {
        Ok(())
    } else {
        Err(Error::Internal(
            outcome.error.unwrap_or_else(|| "Ingestion failed".to_string()),
        ))
    }
}

async fn rebuild_index() -> Result<()> {
    let config = config::config();
    let pool = db::init_pool(&config.database.path).await?;
    db::initialize_schema(&pool).await?;
    db::rebuild_fts_index(&pool).await?;
    tracing::info!("Full-text index rebuilt");
    Ok(())
}
