//! Live-preview edit server.
//!
//! Run with: cargo run -p forge-server -- --sandbox-backend local
//!
//! Clients connect to `ws://localhost:8000/ws/{session_id}`.

mod config;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::Parser;
use forge_core::{EditModel, SessionStore};
use forge_llm::{CommandBuilder, CommandEditModel};
use forge_sandbox::{BackendKind, SandboxOrchestrator, build_backend};
use forge_session::{
    EditCoordinator, LocalProjectStore, SessionRegistry,
    storage::{MemoryStore, SqliteStore},
};
use forge_transport::{AppState, create_router};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, ModelSection, PersistenceSection, StoreKind};

#[derive(Parser)]
#[command(name = "forge-server")]
#[command(about = "Live-preview edit server")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "FORGE_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long, env = "FORGE_BIND")]
    bind: Option<String>,

    /// Sandbox backend: memory, local or docker (overrides config)
    #[arg(long, env = "FORGE_SANDBOX_BACKEND")]
    sandbox_backend: Option<BackendKind>,
}

fn build_model(section: &ModelSection) -> Result<Arc<dyn EditModel>> {
    let Some(command) = section.command.as_deref().filter(|c| !c.trim().is_empty()) else {
        bail!("No edit model command configured, set [model].command");
    };

    let mut model =
        CommandEditModel::new(CommandBuilder::new(command).params(section.args.clone()));
    if let Some(dir) = &section.working_dir {
        model = model.working_dir(dir.clone());
    }
    for (key, value) in &section.env {
        model = model.env(key.clone(), value.clone());
    }
    tracing::info!("Edit model command: {command}");
    Ok(Arc::new(model))
}

async fn build_store(section: &PersistenceSection) -> Result<Arc<dyn SessionStore>> {
    match section.store {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreKind::Sqlite => {
            if let Some(parent) = section.database_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let store = SqliteStore::new(&section.database_url())
                .await
                .context("Failed to open session database")?;
            tracing::info!("Session store: {}", section.database_path.display());
            Ok(Arc::new(store))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C, shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut config = Config::resolve(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(backend) = args.sandbox_backend {
        config.sandbox.backend = backend;
    }

    let backend = build_backend(&config.sandbox).context("Failed to start sandbox backend")?;
    tracing::info!("Sandbox backend: {}", backend.kind());
    let orchestrator = Arc::new(SandboxOrchestrator::new(backend, config.sandbox.clone()));

    let store = build_store(&config.persistence).await?;
    let registry = Arc::new(
        SessionRegistry::new(orchestrator.clone(), store)
            .with_history_limit(config.persistence.history_limit),
    );
    let coordinator = EditCoordinator::new(registry, build_model(&config.model)?)
        .with_buffer(config.server.turn_buffer);
    let projects = Arc::new(LocalProjectStore::new(config.projects.root.clone()));

    let app = create_router(AppState::new(coordinator, projects));

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    tracing::info!("Server listening on http://{}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    for sandbox in orchestrator.live_sandboxes() {
        if let Err(e) = orchestrator.cleanup(&sandbox.sandbox_id).await {
            tracing::warn!("Failed to clean up sandbox {}: {e}", sandbox.sandbox_id);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_command_is_required() {
        let err = build_model(&ModelSection::default()).err().unwrap();
        assert!(err.to_string().contains("No edit model command"));

        let blank = ModelSection {
            command: Some("  ".into()),
            ..ModelSection::default()
        };
        assert!(build_model(&blank).is_err());

        let configured = ModelSection {
            command: Some("edit-model --stream".into()),
            ..ModelSection::default()
        };
        assert!(build_model(&configured).is_ok());
    }
}
