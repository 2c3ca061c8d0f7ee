use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crawlherd::{
    config::Config, database::Database, pipeline, progress::ProgressTracker,
    scheduler::SchedulerLoop, supervisor::RunSupervisor, web::WebServer,
};

#[derive(Parser)]
#[command(name = "crawlherd")]
#[command(version)]
#[command(about = "Web crawl job scheduler and worker supervisor")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(short = 'd', long, value_name = "URL")]
    database_url: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one crawl as an isolated worker process (spawned by the
    /// supervisor; not meant to be invoked by hand).
    #[command(hide = true)]
    Worker {
        /// Path to the run request file
        #[arg(long)]
        request: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Worker { request }) = cli.command {
        // Workers keep stdout reserved for the event stream; tracing goes
        // to stderr.
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| format!("crawlherd={}", cli.log_level).into()),
            )
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
        let code = pipeline::run_worker(&request).await;
        std::process::exit(code);
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("crawlherd={},tower_http=warn", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting crawlherd v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration from specified file
    std::env::set_var("CONFIG_FILE", &cli.config);
    let mut config = Config::load()?;
    info!("Configuration loaded from: {}", cli.config);

    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    if let Some(database_url) = cli.database_url {
        config.database.url = database_url;
    }

    info!("Using database: {}", config.database.url);

    let database = Database::new(&config.database).await?;
    database.migrate().await?;
    info!("Database connection established and migrations applied");

    let progress = ProgressTracker::new();

    let supervisor = RunSupervisor::new(
        database.clone(),
        progress.clone(),
        config.supervisor.clone(),
        config.storage.clone(),
        config.fetch.clone(),
        config.pipeline.clone(),
    );

    // Runs left behind by a crash must be reclassified before anything new
    // starts.
    let reclassified = supervisor.reconcile_orphans().await?;
    if reclassified > 0 {
        info!("Startup reconciliation reclassified {} run(s)", reclassified);
    }

    let scheduler = SchedulerLoop::new(
        database.clone(),
        Arc::new(supervisor.clone()),
        config.scheduler.tick_seconds,
    );
    tokio::spawn(async move {
        if let Err(e) = scheduler.run().await {
            tracing::error!("Scheduler loop failed: {}", e);
        }
    });
    info!("Scheduler loop started");

    let web_server = WebServer::new(&config, database, supervisor, progress)?;
    info!(
        "Starting web server on {}:{}",
        web_server.host(),
        web_server.port()
    );
    web_server.serve().await?;

    Ok(())
}
