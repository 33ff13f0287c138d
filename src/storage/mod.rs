//! Data persistence layer.
//!
//! Registrations and groups live in one relational store so the formation
//! claim can bind members and create the group in a single transaction.

pub mod local;
pub mod pg;

use crate::types::{Group, Registration, TeamSize};
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("pool error: {0}")]
    Pool(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

impl From<tokio_postgres::Error> for StorageError {
    fn from(err: tokio_postgres::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for StorageError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        StorageError::Pool(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Result of inserting a registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Registration),
    /// An active registration for the pair already existed
    AlreadyExists(Registration),
}

/// Result of deleting a registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    /// The registrant already belongs to a formed group; nothing was deleted
    Grouped { group_id: String },
}

/// Result of an atomic claim of the oldest queued registrants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Not enough registrants queued; nothing was written
    Insufficient { waiting: usize },
    /// The group was created with exactly these members, oldest first
    Claimed(Vec<Registration>),
}

#[async_trait]
pub trait ChallengeStorage: Send + Sync {
    // ==================== Registrations ====================

    /// Active registration for a (user, challenge) pair
    async fn find_registration(
        &self,
        user_id: &str,
        challenge_id: &str,
    ) -> Result<Option<Registration>>;

    /// Insert a queued registration unless the pair is already registered
    async fn insert_registration(&self, registration: &Registration) -> Result<InsertOutcome>;

    /// Delete the pair's registration if it has not been grouped yet
    async fn delete_registration(&self, user_id: &str, challenge_id: &str)
        -> Result<DeleteOutcome>;

    /// Number of unassigned registrations for a challenge
    async fn queue_depth(&self, challenge_id: &str) -> Result<usize>;

    /// 1-based position of the user in the challenge queue, `None` if not queued
    async fn queue_position(&self, user_id: &str, challenge_id: &str) -> Result<Option<usize>>;

    // ==================== Groups ====================

    /// Atomically bind the `team_size` oldest unassigned registrations of
    /// `group.challenge_id` to `group` and persist it. Either the group and
    /// every assignment become visible together or nothing is written.
    async fn claim_group(&self, group: &Group, team_size: TeamSize) -> Result<ClaimOutcome>;

    async fn get_group(&self, group_id: &str) -> Result<Option<Group>>;

    /// Groups of a challenge in formation order
    async fn list_groups(&self, challenge_id: &str) -> Result<Vec<Group>>;

    /// Members of a group in join order
    async fn group_members(&self, group_id: &str) -> Result<Vec<Registration>>;
}
