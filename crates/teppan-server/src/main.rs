//! teppan-server: HTTP front end for the teppan generation engine
//!
//! Serves run-to-completion generation as JSON and streaming generation as
//! server-sent events, one event per token.

mod handlers;
mod routes;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use teppan::{CharBigramLoader, Engine, EngineConfig};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::handlers::AppState;

#[derive(Parser, Debug)]
#[command(name = "teppan-server")]
#[command(about = "Batched text generation with token streaming over HTTP")]
#[command(version)]
struct Args {
    /// Engine configuration file (YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model to load; for the built-in bigram model, a path to a text corpus
    #[arg(short, long)]
    model: Option<String>,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8000")]
    port: u16,

    /// Requests advanced together per model invocation
    #[arg(long)]
    batch_size: Option<usize>,

    /// Maximum tokens streamed per request
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Sampling temperature (0 for greedy decoding)
    #[arg(long)]
    temperature: Option<f32>,

    /// Seed for reproducible sampling
    #[arg(long)]
    seed: Option<u64>,
}

impl Args {
    /// Build the engine configuration: file first, flags on top
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match (&self.config, &self.model) {
            (Some(path), _) => EngineConfig::from_path(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            (None, Some(model)) => EngineConfig::new(model.clone()),
            (None, None) => anyhow::bail!("either --config or --model is required"),
        };

        if let (Some(_), Some(model)) = (&self.config, &self.model) {
            config.model = model.clone();
        }
        if let Some(batch_size) = self.batch_size {
            config = config.with_batch_size(batch_size);
        }
        if let Some(max_tokens) = self.max_tokens {
            config = config.with_max_tokens(max_tokens);
        }
        if let Some(temperature) = self.temperature {
            config.worker.temperature = temperature;
        }
        if self.seed.is_some() {
            config.worker.seed = self.seed;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "teppan=info,teppan_server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.engine_config()?;

    info!(
        model = %config.model,
        batch_size = config.batch_size,
        max_tokens = config.max_tokens,
        "starting engine"
    );
    let engine = Arc::new(
        Engine::start(config, CharBigramLoader::default())
            .await
            .context("starting engine")?,
    );

    let app = routes::router(AppState::new(engine.clone()));

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .context("invalid listen address")?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(engine.clone()))
        .await?;

    engine.shutdown().await;
    info!("server stopped");
    Ok(())
}

/// Resolves on ctrl-c once the engine has closed every open stream, so
/// in-flight SSE responses finish and graceful shutdown can complete.
async fn shutdown_signal(engine: Arc<Engine>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
    engine.shutdown().await;
}
