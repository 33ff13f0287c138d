//! Challenge lookup
//!
//! Challenges are owned by the surrounding platform; this crate only needs
//! the team size of each one.

use crate::storage::StorageError;
use crate::types::TeamSize;
use async_trait::async_trait;
use std::collections::BTreeMap;

#[async_trait]
pub trait ChallengeCatalog: Send + Sync {
    /// Team size for a challenge, `None` if the challenge is unknown
    async fn team_size(&self, challenge_id: &str) -> Result<Option<TeamSize>, StorageError>;

    /// All known challenges
    async fn challenge_ids(&self) -> Result<Vec<String>, StorageError>;
}

/// Fixed set of challenges, usually loaded from the config file
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    challenges: BTreeMap<String, TeamSize>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_challenge(mut self, challenge_id: impl Into<String>, team_size: TeamSize) -> Self {
        self.challenges.insert(challenge_id.into(), team_size);
        self
    }

    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }
}

impl FromIterator<(String, TeamSize)> for StaticCatalog {
    fn from_iter<I: IntoIterator<Item = (String, TeamSize)>>(iter: I) -> Self {
        Self {
            challenges: iter.into_iter().collect(),
        }
    }
}

#[async_trait]
impl ChallengeCatalog for StaticCatalog {
    async fn team_size(&self, challenge_id: &str) -> Result<Option<TeamSize>, StorageError> {
        Ok(self.challenges.get(challenge_id).copied())
    }

    async fn challenge_ids(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.challenges.keys().cloned().collect())
    }
}
