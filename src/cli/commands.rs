//! CLI command implementations
//!
//! `serve` wires store, cache, hooks, executor and live-query server from
//! the configuration and runs until interrupted. `check-config` validates
//! a file and prints it with defaults filled in.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cache::DocumentCache;
use crate::config::{EngineConfig, LogFormat};
use crate::hooks::HookRegistry;
use crate::query::QueryExecutor;
use crate::realtime::{LiveQueryEngine, LiveQueryServer};
use crate::store::{DocumentStore, MemoryStore, MongoStore};

use super::args::Command;
use super::errors::{CliError, CliResult};

/// Dispatch a parsed command
pub async fn run_command(command: Command) -> CliResult<()> {
    match command {
        Command::Serve { config } => serve(&config).await,
        Command::CheckConfig { config } => check_config(&config),
    }
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the
/// configured level.
pub fn init_logging(config: &EngineConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    // a subscriber may already be installed (tests, embedding)
    let _ = match config.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
}

/// Build the engine from configuration
pub async fn build_server(config: &EngineConfig) -> CliResult<LiveQueryServer> {
    let store: Arc<dyn DocumentStore> = match &config.store.uri {
        Some(uri) => Arc::new(
            MongoStore::connect(uri, &config.store.database)
                .await
                .map_err(|e| CliError::boot_failed(e.to_string()))?,
        ),
        None => {
            info!("no store.uri configured, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let cache = if config.cache_enabled {
        DocumentCache::new(config.cache_ttl())
    } else {
        DocumentCache::disabled(config.cache_ttl())
    };

    let executor = QueryExecutor::new(
        store,
        Arc::new(cache),
        Arc::new(HookRegistry::new()),
        config.executor_config(),
    );
    let engine = LiveQueryEngine::new(Arc::new(executor));

    Ok(LiveQueryServer::new(config.server_config(), Arc::new(engine)))
}

/// Run the live-query server until Ctrl-C
pub async fn serve(config_path: &Path) -> CliResult<()> {
    let config = EngineConfig::load(config_path)?;
    init_logging(&config);

    info!(
        config = %config_path.display(),
        bind_addr = %config.live_query.bind_addr,
        query_limit = config.query_limit,
        cache_enabled = config.cache_enabled,
        "starting docflux"
    );

    let server = build_server(&config).await?;

    tokio::select! {
        result = server.run() => {
            result.map_err(|e| CliError::serve_failed(e.to_string()))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
            server.shutdown();
        }
    }

    info!("docflux stopped");
    Ok(())
}

/// Validate a configuration file and print it resolved
pub fn check_config(config_path: &Path) -> CliResult<()> {
    let config = EngineConfig::load(config_path)?;
    let rendered = serde_json::to_string_pretty(&config.redacted())?;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", rendered)?;
    Ok(())
}
