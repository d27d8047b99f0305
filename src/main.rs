use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use flagshift::cache::FlagCache;
use flagshift::config::Config;
use flagshift::queue::SqliteDelayQueue;
use flagshift::server::{AppState, create_router};
use flagshift::store::{SqliteStore, Store};
use flagshift::worker::ScheduleConsumer;

#[derive(Parser)]
#[command(name = "flagshift")]
#[command(about = "Scheduled feature-flag changes and dependency cascades", long_about = None)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and database
    Init {
        /// Data directory for the database
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Start the server and the schedule consumer
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(long, short)]
        port: Option<u16>,

        /// Data directory for the database
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn open_databases(config: &Config) -> anyhow::Result<(SqliteStore, SqliteDelayQueue)> {
    let db_path = config.server.db_path();
    let store = SqliteStore::new(&db_path)?;
    store.initialize()?;
    let queue = SqliteDelayQueue::new(&db_path, config.worker.queue_config())?;
    queue.initialize()?;
    Ok((store, queue))
}

fn run_init(config: &Config) -> anyhow::Result<()> {
    fs::create_dir_all(&config.server.data_dir)?;

    let db_path = config.server.db_path();
    if db_path.exists() {
        bail!("Already initialized: {} exists", db_path.display());
    }

    open_databases(config)?;
    println!("Initialized database at {}", db_path.display());
    Ok(())
}

async fn run_serve(config: Config) -> anyhow::Result<()> {
    if !config.server.db_path().exists() {
        bail!("Server not initialized. Run 'flagshift init' first to create the database.");
    }

    let (store, queue) = open_databases(&config)?;
    let queue = Arc::new(queue);
    let cache = Arc::new(FlagCache::new(config.cache.ttl()));
    let state = Arc::new(AppState::new(Arc::new(store), queue.clone(), cache));

    let consumer = ScheduleConsumer::start(
        config.worker.consumer_config(),
        queue,
        state.worker.clone(),
    );

    let app = create_router(state);
    let addr = config.server.socket_addr()?;

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    consumer.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("flagshift=info".parse()?))
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Init { data_dir } => {
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            run_init(&config)?;
        }
        Commands::Serve {
            host,
            port,
            data_dir,
        } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            run_serve(config).await?;
        }
    }

    Ok(())
}
