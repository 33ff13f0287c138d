//! Service Configuration
//!
//! Loaded from a TOML file. Every section is optional and falls back to its
//! defaults:
//! - `[server]`: HTTP bind address
//! - `[storage]`: SQLite path or PostgreSQL URL
//! - `[sweeper]`: background formation sweep
//! - `[[challenges]]`: team size per challenge

use crate::challenge::StaticCatalog;
use crate::sweeper::SweeperConfig;
use crate::types::TeamSize;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Complete service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamsConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub sweeper: SweeperConfig,
    pub challenges: Vec<ChallengeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file, used when no database URL is set
    pub sqlite_path: PathBuf,
    /// PostgreSQL connection URL
    pub database_url: Option<String>,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("sqlite_path", &self.sqlite_path)
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("/data/teams.db"),
            database_url: None,
        }
    }
}

/// One challenge and the team size its groups are formed with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeEntry {
    pub id: String,
    pub team_size: TeamSize,
}

impl TeamsConfig {
    /// Load and validate a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml_str(&raw).with_context(|| format!("Invalid config file {:?}", path))
    }

    /// Parse and validate config from TOML text
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for challenge in &self.challenges {
            if challenge.id.trim().is_empty() {
                bail!("Challenge id must not be empty");
            }
            if !seen.insert(challenge.id.as_str()) {
                bail!("Duplicate challenge id: {}", challenge.id);
            }
        }
        if self.sweeper.enabled && self.sweeper.poll_interval_secs == 0 {
            bail!("sweeper.poll_interval_secs must be greater than zero");
        }
        Ok(())
    }

    /// Challenge catalog built from the `[[challenges]]` entries
    pub fn catalog(&self) -> StaticCatalog {
        self.challenges
            .iter()
            .map(|c| (c.id.clone(), c.team_size))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::ChallengeCatalog;

    #[test]
    fn test_defaults() {
        let config = TeamsConfig::from_toml_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.storage.database_url.is_none());
        assert!(config.sweeper.enabled);
        assert!(config.challenges.is_empty());
    }

    #[tokio::test]
    async fn test_full_config() {
        let config = TeamsConfig::from_toml_str(
            r#"
            [server]
            port = 9000

            [storage]
            database_url = "postgres://teams:secret@db/teams"

            [sweeper]
            poll_interval_secs = 5

            [[challenges]]
            id = "koans"
            team_size = 3

            [[challenges]]
            id = "solo"
            team_size = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.sweeper.poll_interval_secs, 5);
        assert_eq!(config.sweeper.max_groups_per_tick, 64);
        assert!(!format!("{:?}", config.storage).contains("secret"));

        let catalog = config.catalog();
        assert_eq!(catalog.team_size("koans").await.unwrap().unwrap().get(), 3);
        assert_eq!(catalog.team_size("solo").await.unwrap().unwrap().get(), 1);
    }

    #[test]
    fn test_rejects_zero_team_size() {
        let err = TeamsConfig::from_toml_str(
            r#"
            [[challenges]]
            id = "broken"
            team_size = 0
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_rejects_duplicate_challenge() {
        let err = TeamsConfig::from_toml_str(
            r#"
            [[challenges]]
            id = "koans"
            team_size = 2

            [[challenges]]
            id = "koans"
            team_size = 3
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Duplicate challenge id"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("teams.toml");
        std::fs::write(&path, "[[challenges]]\nid = \"koans\"\nteam_size = 2\n").unwrap();

        let config = TeamsConfig::from_file(&path).unwrap();
        assert_eq!(config.challenges.len(), 1);

        assert!(TeamsConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
