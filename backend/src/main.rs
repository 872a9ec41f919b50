use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use grounded_ai::services::{DummyRegistry, HttpGraphStore, LlmRunner, VlmRunner};
use grounded_ai::{AppState, Config, create_router};

#[derive(Debug, Parser)]
#[command(name = "grounded-ai", about = "Multi-modal medical-image reasoning orchestrator")]
struct Args {
    /// Override the configured bind host
    #[arg(long)]
    host: Option<String>,
    /// Override the configured bind port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = Config::load().context("failed to load configuration")?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let env_filter = EnvFilter::try_new(&config.logging.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Keep the appender guard alive for the process lifetime.
    let _file_guard = match config.logging.file.as_deref() {
        Some(file) => {
            let path = std::path::Path::new(file);
            let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("grounded-ai.log");
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(non_blocking))
                .init();
            Some(guard)
        },
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        },
    };

    let registry = DummyRegistry::load(&config.registry.dummy_dir)
        .context("failed to load dummy registry")?;

    let state = Arc::new(AppState {
        llm: Arc::new(LlmRunner::new(&config.llm)),
        vlm: Arc::new(VlmRunner::new(&config.vlm)),
        graph: Arc::new(HttpGraphStore::new(&config.graph)),
        registry: Arc::new(registry),
        config,
    });

    let address = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {}", address))?;
    tracing::info!("grounded-ai listening on {}", address);

    axum::serve(listener, create_router(state)).await.context("server error")?;
    Ok(())
}
