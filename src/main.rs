use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use ripd::core::Orchestrator;
use ripd::web::WebServer;
use ripd::{config, context, db, logging};

#[derive(Parser)]
#[command(name = "ripd")]
#[command(about = "Unattended optical disc backup daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon.
    Daemon(ServerArgs),
    /// Show the jobs known to a running daemon.
    Status,
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    video_output_dir: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    audio_output_dir: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rom_output_dir: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    db_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    http_bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    cancel_grace_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Daemon(args) => config::AppConfig::new(Some(args))?,
        _ => config::AppConfig::new(None::<&ServerArgs>)?,
    };

    match &cli.command {
        Commands::Daemon(_) => {
            logging::init(logging::LogConfig {
                json: false,
                verbose: config.verbose,
            });
            run_daemon(config).await.context("Failed to start daemon")?
        }
        Commands::Status => run_status(&config).await.context("Failed to check daemon status")?,
    }

    Ok(())
}

async fn run_daemon(config: config::AppConfig) -> Result<()> {
    let db = db::init(&config.db_path).await?;
    let ctx = context::AppContext::new(config, db);

    // Corrupted persisted state is fatal here, before anything starts.
    let restored = ctx.store.bootstrap().await?;
    info!(restored, "Job store restored");

    let bind = ctx
        .config
        .http_bind
        .parse()
        .with_context(|| format!("Invalid bind address {}", ctx.config.http_bind))?;
    let server = WebServer::new(ctx.clone(), bind);
    let orchestrator = Orchestrator::new(ctx);

    tokio::select! {
        res = server.start() => res.context("Control API failed"),
        res = orchestrator.start() => res.context("Orchestrator failed"),
    }
}

async fn run_status(config: &config::AppConfig) -> Result<()> {
    let url = format!("http://{}/api/jobs", config.http_bind);
    let jobs: Vec<serde_json::Value> = reqwest::get(&url)
        .await
        .with_context(|| format!("Is the daemon running at {}?", config.http_bind))?
        .json()
        .await?;

    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    for job in jobs {
        println!(
            "{}  {:<10} {:>3}%  {}",
            job["id"].as_str().unwrap_or("?"),
            job["status"].as_str().unwrap_or("?"),
            job["progress_overall"].as_u64().unwrap_or(0),
            job["disc_label"].as_str().unwrap_or(""),
        );
    }
    Ok(())
}
