//! Core record types for challenge registration and team formation.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;

/// Current time at the millisecond precision both stores persist
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Number of registrants required to form one group. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct TeamSize(NonZeroU32);

impl TeamSize {
    pub fn new(size: u32) -> Option<Self> {
        NonZeroU32::new(size).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    pub fn as_usize(self) -> usize {
        self.0.get() as usize
    }
}

impl TryFrom<u32> for TeamSize {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| "team_size must be at least 1".to_string())
    }
}

impl From<TeamSize> for u32 {
    fn from(size: TeamSize) -> Self {
        size.get()
    }
}

impl fmt::Display for TeamSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical state of a registration, independent of group assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Registered,
    Unregistered,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Unregistered => "unregistered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "registered" => Some(Self::Registered),
            "unregistered" => Some(Self::Unregistered),
            _ => None,
        }
    }
}

/// One user's intent to join one challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub id: String,
    pub user_id: String,
    pub challenge_id: String,
    /// `None` while queued
    pub group_id: Option<String>,
    pub joined_at: DateTime<Utc>,
    /// Store-assigned insertion sequence, breaks `joined_at` ties.
    /// Zero until the row has been persisted.
    pub seq: i64,
    pub status: RegistrationStatus,
}

impl Registration {
    /// New queued registration stamped with the current time
    pub fn new(user_id: &str, challenge_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            challenge_id: challenge_id.to_string(),
            group_id: None,
            joined_at: now_millis(),
            seq: 0,
            status: RegistrationStatus::Registered,
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.group_id.is_some()
    }
}

/// An immutable cohort of registrants for one challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub challenge_id: String,
    pub size: u32,
    pub created_at: DateTime<Utc>,
}

impl Group {
    pub fn new(challenge_id: &str, size: TeamSize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            challenge_id: challenge_id.to_string(),
            size: size.get(),
            created_at: now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_team_size_rejects_zero() {
        assert!(TeamSize::new(0).is_none());
        assert_eq!(TeamSize::new(3).unwrap().as_usize(), 3);
        assert!(TeamSize::try_from(0).is_err());
    }

    #[test]
    fn test_team_size_serde() {
        let size: TeamSize = serde_json::from_str("4").unwrap();
        assert_eq!(size.get(), 4);
        assert!(serde_json::from_str::<TeamSize>("0").is_err());
        assert_eq!(serde_json::to_string(&size).unwrap(), "4");
    }

    #[test]
    fn test_new_registration_is_queued() {
        let reg = Registration::new("alice", "koans");
        assert!(!reg.is_assigned());
        assert_eq!(reg.status, RegistrationStatus::Registered);
        assert_eq!(RegistrationStatus::parse(reg.status.as_str()), Some(reg.status));
    }
}
