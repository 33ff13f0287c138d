//! Error types for the registration service and the formation routine.

use crate::storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Authentication required")]
    Unauthenticated,
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Challenge not found: {0}")]
    ChallengeNotFound(String),
    #[error("Already assigned to group {group_id}")]
    AlreadyGrouped { group_id: String },
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl RegistrationError {
    /// Message safe to show to the caller. Storage details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Storage(_) => "Registration is temporarily unavailable, please retry".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FormationError {
    #[error("Storage error during formation: {0}")]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_details_not_exposed() {
        let err = RegistrationError::from(StorageError::Database("connection reset".to_string()));
        assert!(!err.public_message().contains("connection reset"));
        assert!(err.to_string().contains("connection reset"));

        let err = RegistrationError::ChallengeNotFound("koans".to_string());
        assert_eq!(err.public_message(), "Challenge not found: koans");
    }
}
