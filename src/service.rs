//! Registration Service
//!
//! Public surface for joining, leaving and inspecting challenge registrations.
//! Every successful new registration triggers one formation attempt for its
//! challenge. Formation failures are logged and swallowed: the registration
//! itself has already been persisted and the queue is retried on the next
//! registration or sweeper tick.

use crate::challenge::ChallengeCatalog;
use crate::error::RegistrationError;
use crate::formation::{FormationOutcome, GroupFormation};
use crate::storage::{ChallengeStorage, DeleteOutcome, InsertOutcome};
use crate::types::{Group, Registration};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Typed result of a successful register call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterOutcome {
    pub registration: Registration,
    pub already_registered: bool,
}

impl RegisterOutcome {
    pub fn group_id(&self) -> Option<&str> {
        self.registration.group_id.as_deref()
    }
}

/// Typed result of a successful unregister call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisterOutcome {
    Unregistered,
    /// Nothing to delete; still a success
    NotRegistered,
}

/// Result object handed to the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResult {
    pub success: bool,
    pub message: String,
    pub is_registered: bool,
    #[serde(default)]
    pub already_registered: bool,
    #[serde(default)]
    pub group_id: Option<String>,
}

impl RegistrationResult {
    pub fn registered(outcome: &RegisterOutcome) -> Self {
        let challenge_id = &outcome.registration.challenge_id;
        let message = match (outcome.already_registered, outcome.group_id()) {
            (true, _) => format!("Already registered for challenge {}", challenge_id),
            (false, Some(group_id)) => format!(
                "Registered for challenge {} and assigned to group {}",
                challenge_id, group_id
            ),
            (false, None) => format!(
                "Registered for challenge {}, waiting for a group",
                challenge_id
            ),
        };
        Self {
            success: true,
            message,
            is_registered: true,
            already_registered: outcome.already_registered,
            group_id: outcome.registration.group_id.clone(),
        }
    }

    pub fn unregistered(outcome: UnregisterOutcome, challenge_id: &str) -> Self {
        let message = match outcome {
            UnregisterOutcome::Unregistered => {
                format!("Unregistered from challenge {}", challenge_id)
            }
            UnregisterOutcome::NotRegistered => {
                format!("Not registered for challenge {}", challenge_id)
            }
        };
        Self {
            success: true,
            message,
            is_registered: false,
            already_registered: false,
            group_id: None,
        }
    }

    pub fn failed(err: &RegistrationError) -> Self {
        let group_id = match err {
            RegistrationError::AlreadyGrouped { group_id } => Some(group_id.clone()),
            _ => None,
        };
        Self {
            success: false,
            message: err.public_message(),
            is_registered: group_id.is_some(),
            already_registered: false,
            group_id,
        }
    }
}

/// Registration state as seen by the caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResult {
    pub is_registered: bool,
    pub group_id: Option<String>,
    /// 1-based position among queued registrants; `None` once grouped
    pub queue_position: Option<usize>,
}

/// A formed group together with its members' user ids in join order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupView {
    #[serde(flatten)]
    pub group: Group,
    pub members: Vec<String>,
}

/// Absent or blank identity means the caller is unauthenticated
fn caller_id(caller: Option<&str>) -> Option<&str> {
    caller.map(str::trim).filter(|id| !id.is_empty())
}

fn require_challenge(challenge_id: &str) -> Result<&str, RegistrationError> {
    let challenge_id = challenge_id.trim();
    if challenge_id.is_empty() {
        return Err(RegistrationError::InvalidInput(
            "challenge_id must not be empty".to_string(),
        ));
    }
    Ok(challenge_id)
}

pub struct RegistrationService {
    storage: Arc<dyn ChallengeStorage>,
    catalog: Arc<dyn ChallengeCatalog>,
    formation: Arc<GroupFormation>,
}

impl RegistrationService {
    pub fn new(
        storage: Arc<dyn ChallengeStorage>,
        catalog: Arc<dyn ChallengeCatalog>,
        formation: Arc<GroupFormation>,
    ) -> Self {
        Self {
            storage,
            catalog,
            formation,
        }
    }

    /// Build a service with its own formation routine over `storage`
    pub fn with_storage(
        storage: Arc<dyn ChallengeStorage>,
        catalog: Arc<dyn ChallengeCatalog>,
    ) -> Self {
        let formation = Arc::new(GroupFormation::new(storage.clone()));
        Self::new(storage, catalog, formation)
    }

    pub fn formation(&self) -> &Arc<GroupFormation> {
        &self.formation
    }

    // ========================================================================
    // REGISTER
    // ========================================================================

    pub async fn register(&self, caller: Option<&str>, challenge_id: &str) -> RegistrationResult {
        match self.try_register(caller, challenge_id).await {
            Ok(outcome) => RegistrationResult::registered(&outcome),
            Err(e) => {
                log_failure("register", challenge_id, &e);
                RegistrationResult::failed(&e)
            }
        }
    }

    pub async fn try_register(
        &self,
        caller: Option<&str>,
        challenge_id: &str,
    ) -> Result<RegisterOutcome, RegistrationError> {
        let user_id = caller_id(caller).ok_or(RegistrationError::Unauthenticated)?;
        let challenge_id = require_challenge(challenge_id)?;

        if let Some(existing) = self.storage.find_registration(user_id, challenge_id).await? {
            debug!("{} already registered for {}", user_id, challenge_id);
            return Ok(RegisterOutcome {
                registration: existing,
                already_registered: true,
            });
        }

        let team_size = self
            .catalog
            .team_size(challenge_id)
            .await?
            .ok_or_else(|| RegistrationError::ChallengeNotFound(challenge_id.to_string()))?;

        let mut registration = match self
            .storage
            .insert_registration(&Registration::new(user_id, challenge_id))
            .await?
        {
            InsertOutcome::Inserted(registration) => registration,
            // Lost an insert race against a concurrent call for the same pair
            InsertOutcome::AlreadyExists(existing) => {
                return Ok(RegisterOutcome {
                    registration: existing,
                    already_registered: true,
                })
            }
        };
        info!(
            "Registered {} for challenge {} (registration {})",
            user_id, challenge_id, registration.id
        );

        match self.formation.form(challenge_id, team_size).await {
            Ok(FormationOutcome::Formed { group, members })
                if members.iter().any(|m| m.id == registration.id) =>
            {
                registration.group_id = Some(group.id);
            }
            Ok(_) => {
                // A concurrent formation may have grouped us already
                match self.storage.find_registration(user_id, challenge_id).await {
                    Ok(Some(current)) => registration.group_id = current.group_id,
                    Ok(None) => {}
                    Err(e) => warn!(
                        "Failed to refresh registration {} after formation: {}",
                        registration.id, e
                    ),
                }
            }
            Err(e) => {
                error!(
                    "Group formation failed for challenge {}, queue left as is: {}",
                    challenge_id, e
                );
            }
        }

        Ok(RegisterOutcome {
            registration,
            already_registered: false,
        })
    }

    // ========================================================================
    // UNREGISTER
    // ========================================================================

    pub async fn unregister(&self, caller: Option<&str>, challenge_id: &str) -> RegistrationResult {
        match self.try_unregister(caller, challenge_id).await {
            Ok(outcome) => RegistrationResult::unregistered(outcome, challenge_id.trim()),
            Err(e) => {
                log_failure("unregister", challenge_id, &e);
                RegistrationResult::failed(&e)
            }
        }
    }

    pub async fn try_unregister(
        &self,
        caller: Option<&str>,
        challenge_id: &str,
    ) -> Result<UnregisterOutcome, RegistrationError> {
        let user_id = caller_id(caller).ok_or(RegistrationError::Unauthenticated)?;
        let challenge_id = require_challenge(challenge_id)?;

        match self.storage.delete_registration(user_id, challenge_id).await? {
            DeleteOutcome::Deleted => {
                info!("Unregistered {} from challenge {}", user_id, challenge_id);
                Ok(UnregisterOutcome::Unregistered)
            }
            DeleteOutcome::NotFound => Ok(UnregisterOutcome::NotRegistered),
            DeleteOutcome::Grouped { group_id } => {
                Err(RegistrationError::AlreadyGrouped { group_id })
            }
        }
    }

    // ========================================================================
    // STATUS & LISTINGS
    // ========================================================================

    /// Unknown pairs and anonymous callers get an empty status, not an error
    pub async fn check_status(
        &self,
        caller: Option<&str>,
        challenge_id: &str,
    ) -> Result<StatusResult, RegistrationError> {
        let (Some(user_id), Ok(challenge_id)) = (caller_id(caller), require_challenge(challenge_id))
        else {
            return Ok(StatusResult::default());
        };

        let Some(mut registration) = self.storage.find_registration(user_id, challenge_id).await?
        else {
            return Ok(StatusResult::default());
        };

        let mut queue_position = None;
        if !registration.is_assigned() {
            queue_position = self.storage.queue_position(user_id, challenge_id).await?;
            if queue_position.is_none() {
                // Left the queue between the two reads: grouped or unregistered
                match self.storage.find_registration(user_id, challenge_id).await? {
                    Some(current) => registration = current,
                    None => return Ok(StatusResult::default()),
                }
            }
        }

        Ok(StatusResult {
            is_registered: true,
            group_id: registration.group_id,
            queue_position,
        })
    }

    /// Groups formed for a challenge with their members
    pub async fn list_groups(&self, challenge_id: &str) -> Result<Vec<GroupView>, RegistrationError> {
        let challenge_id = require_challenge(challenge_id)?;
        let groups = self.storage.list_groups(challenge_id).await?;

        let mut views = Vec::with_capacity(groups.len());
        for group in groups {
            let members = self
                .storage
                .group_members(&group.id)
                .await?
                .into_iter()
                .map(|m| m.user_id)
                .collect();
            views.push(GroupView { group, members });
        }
        Ok(views)
    }

    /// Number of registrants waiting for a group
    pub async fn queue_depth(&self, challenge_id: &str) -> Result<usize, RegistrationError> {
        let challenge_id = require_challenge(challenge_id)?;
        Ok(self.storage.queue_depth(challenge_id).await?)
    }
}

pub(crate) fn log_failure(op: &str, challenge_id: &str, err: &RegistrationError) {
    match err {
        RegistrationError::Storage(e) => {
            error!("{} failed for challenge {}: {}", op, challenge_id, e)
        }
        other => debug!("{} rejected for challenge {}: {}", op, challenge_id, other),
    }
}
