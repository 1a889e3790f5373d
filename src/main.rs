use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use daigent::config::{RuntimeConfig, ServerConfig};
use daigent::llm::DefaultClientFactory;
use daigent::registry::{RegistryDeps, TaskRegistry};
use daigent::scheduler::Scheduler;
use daigent::server::task_routes;
use daigent::store::{LibSqlBackend, TaskStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let server_config = ServerConfig::from_env()?;
    let runtime_config = RuntimeConfig::from_env()?;

    let _log_guard = init_tracing(&server_config);

    eprintln!("🤖 Daigent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api/tasks", server_config.port);

    // ── Database ─────────────────────────────────────────────────────────
    if let Some(parent) = server_config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let backend = Arc::new(
        LibSqlBackend::new_local(&server_config.db_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open database at {}",
                    server_config.db_path.display()
                )
            })?
            .with_user_language(server_config.user_language.clone()),
    );
    eprintln!("   Database: {}", server_config.db_path.display());

    // ── Runtime ──────────────────────────────────────────────────────────
    let store: Arc<dyn TaskStore> = backend.clone();
    let scheduler = Arc::new(Scheduler::start("daigent-scheduler")?);
    let registry = Arc::new(TaskRegistry::new(RegistryDeps {
        scheduler: Arc::clone(&scheduler),
        store: Arc::clone(&store),
        resolver: backend,
        llm_factory: Arc::new(DefaultClientFactory),
        config: runtime_config,
    }));

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = task_routes(Arc::clone(&registry), store);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", server_config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", server_config.port))?;
    tracing::info!(port = server_config.port, "Task server started");

    let shutdown_registry = Arc::clone(&registry);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
            }
            tracing::info!("Shutting down");
            // Stopping every runtime ends the open SSE streams.
            let registry = shutdown_registry;
            if let Err(e) = tokio::task::spawn_blocking(move || registry.shutdown()).await {
                tracing::error!(error = %e, "Registry shutdown panicked");
            }
        })
        .await?;

    tokio::task::spawn_blocking(move || scheduler.shutdown()).await?;
    eprintln!("Goodbye!");
    Ok(())
}

/// Log to stderr, and to a daily rolling file when a log directory is set.
fn init_tracing(config: &ServerConfig) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "daigent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}
