use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ps_domain::config::{Config, ConfigSeverity};
use ps_gateway::cli::{load_config, Cli, Command, ConfigCommand};
use ps_gateway::runtime::kube::UnconfiguredBackend;
use ps_gateway::state::AppState;
use ps_store::EventStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = load_config(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = load_config(&cli.config)?;
            let issues = config.validate();
            for issue in &issues {
                println!("{issue}");
            }
            if issues
                .iter()
                .any(|i| i.severity == ConfigSeverity::Error)
            {
                std::process::exit(1);
            }
            println!("config ok");
            Ok(())
        }
        Some(Command::Version) => {
            println!("podscope {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON logging for the serve command.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ps_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("podscope starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Storage ──────────────────────────────────────────────────────
    let db_path = config.storage.database_path();
    let store = Arc::new(EventStore::open(&db_path)?);
    tracing::info!(path = %db_path.display(), "event store ready");

    // ── Runtime state ────────────────────────────────────────────────
    // The bundled binary has no cluster clients wired; diagnostic tools
    // answer with "not configured" until an embedder injects a backend.
    let state = AppState::build(config.clone(), store, Arc::new(UnconfiguredBackend));

    let app = ps_gateway::api::router().with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
