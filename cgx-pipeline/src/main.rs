//! cgx-pipeline - chat archive clustering service
//!
//! `serve` (default) exposes the trigger/status API on port 5790.
//! `run <export.json>` performs one pipeline run offline and exits.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cgx_common::config::{self, CompiledDefaults, RootFolderInitializer, RootFolderResolver, TomlConfig};
use cgx_common::events::EventBus;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cgx_pipeline::services::{OpenAiClient, PipelineCoordinator};
use cgx_pipeline::AppState;

const MODULE_NAME: &str = "cgx-pipeline";

/// Command-line arguments for cgx-pipeline
#[derive(Parser, Debug)]
#[command(name = "cgx-pipeline")]
#[command(about = "Chat archive enrichment and clustering pipeline")]
#[command(version)]
struct Args {
    /// Root folder holding cgx.db
    #[arg(short, long, env = "CGX_ROOT_FOLDER", global = true)]
    root_folder: Option<PathBuf>,

    /// Bootstrap TOML (default: <config dir>/cgx/cgx-pipeline.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API (default)
    Serve {
        /// Port to listen on
        #[arg(short, long, env = "CGX_PORT")]
        port: Option<u16>,
    },
    /// Run the pipeline once over an export file
    Run {
        /// Exported conversations (JSON array)
        export: PathBuf,

        /// Fix the clustering and layout seed
        #[arg(long)]
        seed: Option<u64>,

        /// Cluster count (computed from the corpus size when unset)
        #[arg(long)]
        n_clusters: Option<usize>,

        #[arg(long)]
        max_parallel_requests: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().or_else(|| config::config_file_path(MODULE_NAME));
    let toml_config = match &config_path {
        Some(path) => config::load_toml_config(path)
            .with_context(|| format!("Failed to load {}", path.display()))?
            .unwrap_or_default(),
        None => TomlConfig::default(),
    };

    init_tracing(&toml_config)?;

    info!("Starting {} v{} ({})", MODULE_NAME, env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));
    if let Some(path) = &config_path {
        info!("Config: {}", path.display());
    }

    // Root folder and database
    let mut resolver = RootFolderResolver::new(MODULE_NAME).with_cli_arg(args.root_folder.clone());
    if let Some(path) = args.config.clone() {
        resolver = resolver.with_config_path(path);
    }
    let initializer = RootFolderInitializer::new(resolver.resolve());
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;

    let db_path = initializer.database_path();
    info!("Database: {}", db_path.display());
    let db_pool = cgx_pipeline::db::init_database_pool(&db_path).await?;

    let interrupted = cgx_pipeline::db::runs::fail_interrupted_runs(&db_pool).await?;
    if interrupted > 0 {
        warn!("Marked {} interrupted pipeline run(s) as failed", interrupted);
    }

    // External AI provider
    let api_key = cgx_pipeline::config::resolve_api_key(&toml_config)?;
    let client = Arc::new(OpenAiClient::new(&toml_config.provider, api_key)?);
    info!(
        base_url = %toml_config.provider.base_url,
        chat_model = %toml_config.provider.chat_model,
        embedding_model = %toml_config.provider.embedding_model,
        "AI provider configured"
    );

    let event_bus = EventBus::new(256);
    let coordinator = Arc::new(PipelineCoordinator::new(
        db_pool.clone(),
        event_bus.clone(),
        client.clone(),
        client,
    ));

    let pipeline_defaults = cgx_pipeline::config::pipeline_options_from_toml(&toml_config)?;

    match args.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => {
            let port = port
                .or(toml_config.port)
                .unwrap_or_else(|| CompiledDefaults::for_current_platform().port);
            let state = AppState::new(db_pool, event_bus, coordinator).with_pipeline_defaults(pipeline_defaults);
            serve(state, port).await
        }
        Command::Run {
            export,
            seed,
            n_clusters,
            max_parallel_requests,
        } => {
            let mut options = pipeline_defaults;
            if seed.is_some() {
                options.random_seed = seed;
            }
            if n_clusters.is_some() {
                options.n_clusters = n_clusters;
            }
            if let Some(limit) = max_parallel_requests {
                options.max_parallel_requests = limit;
            }
            run_once(&coordinator, &export, options).await
        }
    }
}

/// `RUST_LOG` wins; otherwise the TOML `[logging] level` applies to this service's crates
fn init_tracing(toml_config: &TomlConfig) -> Result<()> {
    let level = &toml_config.logging.level;
    let default_filter = format!("cgx_pipeline={level},cgx_common={level},tower_http={level}");
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(filter);

    match &toml_config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(std::sync::Mutex::new(file)),
                )
                .init();
        }
        None => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    Ok(())
}

async fn serve(state: AppState, port: u16) -> Result<()> {
    let app = cgx_pipeline::build_router(state.clone());

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            state.cancel_active_runs().await;
        })
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

async fn run_once(
    coordinator: &PipelineCoordinator,
    export_path: &Path,
    options: cgx_pipeline::models::PipelineOptions,
) -> Result<()> {
    let content = std::fs::read_to_string(export_path)
        .with_context(|| format!("Failed to read {}", export_path.display()))?;
    let export = match serde_json::from_str::<Value>(&content).context("Export is not valid JSON")? {
        Value::Array(entries) => entries,
        _ => bail!("Export must be a JSON array of conversations"),
    };
    info!("Loaded {} conversations from {}", export.len(), export_path.display());

    let cancel_token = CancellationToken::new();
    let on_signal = cancel_token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Cancelling run; the current stage will finish first");
        on_signal.cancel();
    });

    match coordinator.run_pipeline(&export, options, cancel_token).await {
        Ok(solution) => {
            info!(
                cluster_solution_id = %solution.cluster_solution_id,
                n_clusters = solution.n_clusters,
                random_seed = solution.random_seed,
                "Pipeline run finished"
            );
            println!("{}", solution.cluster_solution_id);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Pipeline run did not produce a solution");
            Err(e.into())
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
