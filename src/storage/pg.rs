//! PostgreSQL Storage for Server Mode
//!
//! Shared backend for multi-instance deployments. Formation claims are
//! serialized per challenge with a transaction-scoped advisory lock, so
//! servers racing on the same challenge queue never bind a registrant twice
//! while claims for different challenges proceed in parallel.

use super::{ChallengeStorage, ClaimOutcome, DeleteOutcome, InsertOutcome, Result, StorageError};
use crate::types::{Group, Registration, RegistrationStatus, TeamSize};
use async_trait::async_trait;
use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS challenge_groups (
    id TEXT PRIMARY KEY,
    challenge_id TEXT NOT NULL,
    size INTEGER NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_groups_challenge ON challenge_groups(challenge_id, created_at);

CREATE TABLE IF NOT EXISTS registrations (
    seq BIGSERIAL PRIMARY KEY,
    id TEXT NOT NULL UNIQUE,
    user_id TEXT NOT NULL,
    challenge_id TEXT NOT NULL,
    group_id TEXT REFERENCES challenge_groups(id),
    status TEXT NOT NULL DEFAULT 'registered',
    joined_at TIMESTAMPTZ NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_registrations_active
    ON registrations(user_id, challenge_id) WHERE status = 'registered';
CREATE INDEX IF NOT EXISTS idx_registrations_queue
    ON registrations(challenge_id, joined_at, seq) WHERE group_id IS NULL;
CREATE INDEX IF NOT EXISTS idx_registrations_group ON registrations(group_id);
"#;

const REGISTRATION_COLUMNS: &str =
    "seq, id, user_id, challenge_id, group_id, status, joined_at";

/// Upper bound on waiting for another server's claim on the same challenge
const CLAIM_LOCK_TIMEOUT: &str = "5s";

fn registration_from_row(r: &Row) -> Result<Registration> {
    let status: String = r.get(5);
    Ok(Registration {
        seq: r.get(0),
        id: r.get(1),
        user_id: r.get(2),
        challenge_id: r.get(3),
        group_id: r.get(4),
        status: RegistrationStatus::parse(&status).ok_or_else(|| {
            StorageError::InvalidData(format!("unknown registration status: {}", status))
        })?,
        joined_at: r.get(6),
    })
}

fn group_from_row(r: &Row) -> Group {
    Group {
        id: r.get(0),
        challenge_id: r.get(1),
        size: r.get::<_, i32>(2) as u32,
        created_at: r.get(3),
    }
}

#[derive(Clone)]
pub struct PgStorage {
    pool: Pool,
}

impl PgStorage {
    /// Create storage from a connection URL
    pub async fn new(database_url: &str) -> Result<Self> {
        let mut config = Config::new();
        config.url = Some(database_url.to_string());
        let pool = config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StorageError::Pool(e.to_string()))?;

        // Test connection
        let client = pool.get().await?;
        info!("Connected to PostgreSQL database");

        client.batch_execute(SCHEMA).await?;
        info!("Database schema initialized");

        Ok(Self { pool })
    }

    /// Create storage from DATABASE_URL environment variable
    pub async fn from_env() -> Result<Self> {
        let url = std::env::var("DATABASE_URL")
            .map_err(|_| StorageError::Pool("DATABASE_URL not set".to_string()))?;
        Self::new(&url).await
    }

    async fn find_active(
        &self,
        user_id: &str,
        challenge_id: &str,
    ) -> Result<Option<Registration>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM registrations
                     WHERE user_id = $1 AND challenge_id = $2 AND status = 'registered'",
                    REGISTRATION_COLUMNS
                ),
                &[&user_id, &challenge_id],
            )
            .await?;
        row.as_ref().map(registration_from_row).transpose()
    }
}

#[async_trait]
impl ChallengeStorage for PgStorage {
    // ========================================================================
    // REGISTRATIONS
    // ========================================================================

    async fn find_registration(
        &self,
        user_id: &str,
        challenge_id: &str,
    ) -> Result<Option<Registration>> {
        self.find_active(user_id, challenge_id).await
    }

    async fn insert_registration(&self, registration: &Registration) -> Result<InsertOutcome> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "INSERT INTO registrations (id, user_id, challenge_id, group_id, status, joined_at)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (user_id, challenge_id) WHERE status = 'registered' DO NOTHING
                 RETURNING seq",
                &[
                    &registration.id,
                    &registration.user_id,
                    &registration.challenge_id,
                    &registration.group_id,
                    &registration.status.as_str(),
                    &registration.joined_at,
                ],
            )
            .await?;
        drop(client);

        match row {
            Some(r) => {
                let mut stored = registration.clone();
                stored.seq = r.get(0);
                debug!(
                    "Stored registration {} (seq {}) for {} in {}",
                    stored.id, stored.seq, stored.user_id, stored.challenge_id
                );
                Ok(InsertOutcome::Inserted(stored))
            }
            None => self
                .find_active(&registration.user_id, &registration.challenge_id)
                .await?
                .map(InsertOutcome::AlreadyExists)
                .ok_or_else(|| {
                    StorageError::InvalidData(format!(
                        "registration {} was rejected but no active row exists",
                        registration.id
                    ))
                }),
        }
    }

    async fn delete_registration(
        &self,
        user_id: &str,
        challenge_id: &str,
    ) -> Result<DeleteOutcome> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        // Same lock as claim_group, so a claim never sees a queue shrink under it
        tx.batch_execute(&format!("SET LOCAL lock_timeout = '{}'", CLAIM_LOCK_TIMEOUT))
            .await?;
        tx.execute(
            "SELECT pg_advisory_xact_lock(hashtextextended($1, 0))",
            &[&challenge_id],
        )
        .await?;

        let deleted = tx
            .execute(
                "DELETE FROM registrations
                 WHERE user_id = $1 AND challenge_id = $2 AND status = 'registered' AND group_id IS NULL",
                &[&user_id, &challenge_id],
            )
            .await?;
        tx.commit().await?;
        drop(client);

        if deleted > 0 {
            return Ok(DeleteOutcome::Deleted);
        }

        Ok(match self.find_active(user_id, challenge_id).await? {
            Some(Registration {
                group_id: Some(group_id),
                ..
            }) => DeleteOutcome::Grouped { group_id },
            _ => DeleteOutcome::NotFound,
        })
    }

    async fn queue_depth(&self, challenge_id: &str) -> Result<usize> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM registrations
                 WHERE challenge_id = $1 AND status = 'registered' AND group_id IS NULL",
                &[&challenge_id],
            )
            .await?;
        Ok(row.get::<_, i64>(0) as usize)
    }

    async fn queue_position(&self, user_id: &str, challenge_id: &str) -> Result<Option<usize>> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM registrations q, registrations me
                 WHERE me.user_id = $1 AND me.challenge_id = $2
                   AND me.status = 'registered' AND me.group_id IS NULL
                   AND q.challenge_id = me.challenge_id
                   AND q.status = 'registered' AND q.group_id IS NULL
                   AND (q.joined_at < me.joined_at OR (q.joined_at = me.joined_at AND q.seq <= me.seq))",
                &[&user_id, &challenge_id],
            )
            .await?;
        let position = row.get::<_, i64>(0);
        Ok((position > 0).then_some(position as usize))
    }

    // ========================================================================
    // GROUPS
    // ========================================================================

    async fn claim_group(&self, group: &Group, team_size: TeamSize) -> Result<ClaimOutcome> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        tx.batch_execute(&format!("SET LOCAL lock_timeout = '{}'", CLAIM_LOCK_TIMEOUT))
            .await?;
        tx.execute(
            "SELECT pg_advisory_xact_lock(hashtextextended($1, 0))",
            &[&group.challenge_id],
        )
        .await?;

        let rows = tx
            .query(
                &format!(
                    "SELECT {} FROM registrations
                     WHERE challenge_id = $1 AND status = 'registered' AND group_id IS NULL
                     ORDER BY joined_at ASC, seq ASC
                     LIMIT $2
                     FOR UPDATE",
                    REGISTRATION_COLUMNS
                ),
                &[&group.challenge_id, &(team_size.get() as i64)],
            )
            .await?;
        let mut members = rows
            .iter()
            .map(registration_from_row)
            .collect::<Result<Vec<_>>>()?;

        if members.len() < team_size.as_usize() {
            tx.rollback().await?;
            return Ok(ClaimOutcome::Insufficient {
                waiting: members.len(),
            });
        }

        tx.execute(
            "INSERT INTO challenge_groups (id, challenge_id, size, created_at) VALUES ($1, $2, $3, $4)",
            &[
                &group.id,
                &group.challenge_id,
                &(group.size as i32),
                &group.created_at,
            ],
        )
        .await?;

        let seqs: Vec<i64> = members.iter().map(|m| m.seq).collect();
        let bound = tx
            .execute(
                "UPDATE registrations SET group_id = $1 WHERE seq = ANY($2) AND group_id IS NULL",
                &[&group.id, &seqs],
            )
            .await?;
        if bound != team_size.get() as u64 {
            tx.rollback().await?;
            return Err(StorageError::InvalidData(format!(
                "group {} bound {} of {} registrations",
                group.id, bound, team_size
            )));
        }

        tx.commit().await?;

        for member in &mut members {
            member.group_id = Some(group.id.clone());
        }
        Ok(ClaimOutcome::Claimed(members))
    }

    async fn get_group(&self, group_id: &str) -> Result<Option<Group>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, challenge_id, size, created_at FROM challenge_groups WHERE id = $1",
                &[&group_id],
            )
            .await?;
        Ok(row.as_ref().map(group_from_row))
    }

    async fn list_groups(&self, challenge_id: &str) -> Result<Vec<Group>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id, challenge_id, size, created_at FROM challenge_groups
                 WHERE challenge_id = $1 ORDER BY created_at ASC, id ASC",
                &[&challenge_id],
            )
            .await?;
        Ok(rows.iter().map(group_from_row).collect())
    }

    async fn group_members(&self, group_id: &str) -> Result<Vec<Registration>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM registrations WHERE group_id = $1 ORDER BY joined_at ASC, seq ASC",
                    REGISTRATION_COLUMNS
                ),
                &[&group_id],
            )
            .await?;
        rows.iter().map(registration_from_row).collect()
    }
}
