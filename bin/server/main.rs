//! Challenge Teams Server
//!
//! Runs registration and team formation as a standalone HTTP service.

use anyhow::{Context, Result};
use challenge_teams::{
    run_server, spawn_formation_sweeper, ApiState, ChallengeStorage, LocalStorage, PgStorage,
    RegistrationService, TeamsConfig,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "challenge-teams-server")]
#[command(about = "Challenge registration and team formation server")]
struct Args {
    /// Config file (TOML)
    #[arg(short, long, env = "TEAMS_CONFIG")]
    config: Option<PathBuf>,

    /// Server host (overrides config)
    #[arg(long, env = "TEAMS_HOST")]
    host: Option<String>,

    /// Server port (overrides config)
    #[arg(short, long, env = "TEAMS_PORT")]
    port: Option<u16>,

    /// PostgreSQL URL; SQLite is used when unset
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Data directory for the SQLite database (overrides config)
    #[arg(short, long, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("challenge_teams=debug".parse()?)
                .add_directive("info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TeamsConfig::from_file(path)?,
        None => {
            warn!("No config file given, running with defaults and no challenges");
            TeamsConfig::default()
        }
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(url) = args.database_url {
        config.storage.database_url = Some(url);
    }
    if let Some(dir) = args.data_dir {
        config.storage.sqlite_path = dir.join("teams.db");
    }

    info!("Starting Challenge Teams Server");
    info!("  Challenges: {}", config.challenges.len());
    for challenge in &config.challenges {
        info!("    {} (team size {})", challenge.id, challenge.team_size);
    }
    info!("  Storage: {:?}", config.storage);

    let storage: Arc<dyn ChallengeStorage> = match &config.storage.database_url {
        Some(url) => Arc::new(
            PgStorage::new(url)
                .await
                .context("Failed to connect to PostgreSQL")?,
        ),
        None => Arc::new(
            LocalStorage::new(&config.storage.sqlite_path)
                .context("Failed to open SQLite storage")?,
        ),
    };

    let catalog = Arc::new(config.catalog());
    let service = Arc::new(RegistrationService::with_storage(storage, catalog.clone()));

    if config.sweeper.enabled {
        spawn_formation_sweeper(
            service.formation().clone(),
            catalog,
            config.sweeper.clone(),
        );
    }

    let state = Arc::new(ApiState::new(service));

    // Blocks until shutdown
    run_server(state, &config.server.host, config.server.port).await?;

    Ok(())
}
