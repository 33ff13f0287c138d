//! Group Formation
//!
//! Turns a long enough FIFO queue of registrants into a new group.
//!
//! Flow for one challenge:
//! 1. Take the challenge's in-process formation lock
//! 2. Ask the store to atomically claim the `team_size` oldest unassigned
//!    registrations (ordered by join time, then insertion sequence)
//! 3. Either the queue is still short and nothing changes, or exactly
//!    `team_size` registrants are bound to a freshly created group
//!
//! The in-process lock keeps callers in this process from piling onto the
//! store for the same challenge; the store claim itself is transactional, so
//! several server processes sharing one database stay consistent too.

use crate::error::FormationError;
use crate::storage::{ChallengeStorage, ClaimOutcome};
use crate::types::{Group, Registration, TeamSize};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Result of one formation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormationOutcome {
    /// Queue shorter than the team size, nothing was written
    Queued { waiting: usize },
    /// A new group was created with these members, oldest first
    Formed {
        group: Group,
        members: Vec<Registration>,
    },
}

impl FormationOutcome {
    pub fn group(&self) -> Option<&Group> {
        match self {
            Self::Formed { group, .. } => Some(group),
            Self::Queued { .. } => None,
        }
    }
}

pub struct GroupFormation {
    storage: Arc<dyn ChallengeStorage>,
    /// One lock per challenge; unrelated challenges never contend
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl GroupFormation {
    pub fn new(storage: Arc<dyn ChallengeStorage>) -> Self {
        Self {
            storage,
            locks: DashMap::new(),
        }
    }

    fn challenge_lock(&self, challenge_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(challenge_id.to_string())
            .or_default()
            .clone()
    }

    /// Run one formation attempt for a challenge
    pub async fn form(
        &self,
        challenge_id: &str,
        team_size: TeamSize,
    ) -> Result<FormationOutcome, FormationError> {
        let lock = self.challenge_lock(challenge_id);
        let _guard = lock.lock().await;

        let group = Group::new(challenge_id, team_size);
        match self.storage.claim_group(&group, team_size).await? {
            ClaimOutcome::Insufficient { waiting } => {
                debug!(
                    "Challenge {} has {}/{} registrants queued",
                    challenge_id, waiting, team_size
                );
                Ok(FormationOutcome::Queued { waiting })
            }
            ClaimOutcome::Claimed(members) => {
                info!(
                    "Formed group {} for challenge {} with {} members",
                    group.id,
                    challenge_id,
                    members.len()
                );
                Ok(FormationOutcome::Formed { group, members })
            }
        }
    }

    /// Form groups until the queue is short or `max_groups` were formed
    pub async fn drain(
        &self,
        challenge_id: &str,
        team_size: TeamSize,
        max_groups: usize,
    ) -> Result<Vec<Group>, FormationError> {
        let mut formed = Vec::new();
        while formed.len() < max_groups {
            match self.form(challenge_id, team_size).await? {
                FormationOutcome::Formed { group, .. } => formed.push(group),
                FormationOutcome::Queued { .. } => break,
            }
        }
        Ok(formed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::local::LocalStorage;
    use crate::storage::InsertOutcome;

    fn size(n: u32) -> TeamSize {
        TeamSize::new(n).unwrap()
    }

    async fn setup(users: &[&str], challenge: &str) -> (Arc<LocalStorage>, GroupFormation) {
        let storage = Arc::new(LocalStorage::in_memory().unwrap());
        for user in users {
            let outcome = storage
                .insert_registration(&Registration::new(user, challenge))
                .await
                .unwrap();
            assert!(matches!(outcome, InsertOutcome::Inserted(_)));
        }
        let formation = GroupFormation::new(storage.clone());
        (storage, formation)
    }

    #[tokio::test]
    async fn test_short_queue_stays_queued() {
        let (storage, formation) = setup(&["a", "b"], "koans").await;

        let outcome = formation.form("koans", size(3)).await.unwrap();
        assert_eq!(outcome, FormationOutcome::Queued { waiting: 2 });
        assert_eq!(storage.queue_depth("koans").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_forms_group_from_oldest() {
        let (storage, formation) = setup(&["a", "b", "c", "d"], "koans").await;

        let outcome = formation.form("koans", size(3)).await.unwrap();
        let FormationOutcome::Formed { group, members } = outcome else {
            panic!("expected a group");
        };
        let users: Vec<_> = members.iter().map(|m| m.user_id.as_str()).collect();
        assert_eq!(users, vec!["a", "b", "c"]);
        assert_eq!(group.size, 3);

        let d = storage.find_registration("d", "koans").await.unwrap().unwrap();
        assert!(d.group_id.is_none());
    }

    #[tokio::test]
    async fn test_team_size_one() {
        let (storage, formation) = setup(&["solo"], "sprint").await;

        let outcome = formation.form("sprint", size(1)).await.unwrap();
        let group = outcome.group().cloned().unwrap();
        let reg = storage.find_registration("solo", "sprint").await.unwrap().unwrap();
        assert_eq!(reg.group_id, Some(group.id));
    }

    #[tokio::test]
    async fn test_drain_respects_limit() {
        let (storage, formation) = setup(&["a", "b", "c", "d", "e"], "koans").await;

        let groups = formation.drain("koans", size(2), 1).await.unwrap();
        assert_eq!(groups.len(), 1);

        let groups = formation.drain("koans", size(2), 10).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(storage.queue_depth("koans").await.unwrap(), 1);
        assert_eq!(storage.list_groups("koans").await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_attempts_form_one_group() {
        let (storage, formation) = setup(&["a", "b", "c"], "koans").await;
        let formation = Arc::new(formation);

        let attempts = (0..8).map(|_| {
            let formation = formation.clone();
            tokio::spawn(async move { formation.form("koans", size(3)).await.unwrap() })
        });
        let outcomes = futures::future::join_all(attempts).await;

        let formed = outcomes
            .into_iter()
            .map(|o| o.unwrap())
            .filter(|o| o.group().is_some())
            .count();
        assert_eq!(formed, 1);
        assert_eq!(storage.list_groups("koans").await.unwrap().len(), 1);
        assert_eq!(storage.queue_depth("koans").await.unwrap(), 0);
    }
}
