//! Local SQLite storage
//!
//! Single-node backend used for small deployments and tests. All access goes
//! through one connection behind a mutex, so every method (including the
//! formation claim) is serialized against every other write.

use super::{ChallengeStorage, ClaimOutcome, DeleteOutcome, InsertOutcome, Result, StorageError};
use crate::types::{Group, Registration, RegistrationStatus, TeamSize};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS challenge_groups (
    id TEXT PRIMARY KEY,
    challenge_id TEXT NOT NULL,
    size INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_groups_challenge ON challenge_groups(challenge_id, created_at);

CREATE TABLE IF NOT EXISTS registrations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    user_id TEXT NOT NULL,
    challenge_id TEXT NOT NULL,
    group_id TEXT REFERENCES challenge_groups(id),
    status TEXT NOT NULL DEFAULT 'registered',
    joined_at INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_registrations_active
    ON registrations(user_id, challenge_id) WHERE status = 'registered';
CREATE INDEX IF NOT EXISTS idx_registrations_queue
    ON registrations(challenge_id, joined_at, seq) WHERE group_id IS NULL;
CREATE INDEX IF NOT EXISTS idx_registrations_group ON registrations(group_id);
"#;

const REGISTRATION_COLUMNS: &str =
    "seq, id, user_id, challenge_id, group_id, status, joined_at";

fn millis_to_datetime(idx: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {}", millis).into(),
        )
    })
}

fn registration_from_row(row: &Row<'_>) -> rusqlite::Result<Registration> {
    let status: String = row.get(5)?;
    let status = RegistrationStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            Type::Text,
            format!("unknown registration status: {}", status).into(),
        )
    })?;

    Ok(Registration {
        seq: row.get(0)?,
        id: row.get(1)?,
        user_id: row.get(2)?,
        challenge_id: row.get(3)?,
        group_id: row.get(4)?,
        status,
        joined_at: millis_to_datetime(6, row.get(6)?)?,
    })
}

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        challenge_id: row.get(1)?,
        size: row.get(2)?,
        created_at: millis_to_datetime(3, row.get(3)?)?,
    })
}

fn find_active(
    conn: &Connection,
    user_id: &str,
    challenge_id: &str,
) -> rusqlite::Result<Option<Registration>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM registrations
             WHERE user_id = ?1 AND challenge_id = ?2 AND status = 'registered'",
            REGISTRATION_COLUMNS
        ),
        params![user_id, challenge_id],
        registration_from_row,
    )
    .optional()
}

#[derive(Clone)]
pub struct LocalStorage {
    conn: Arc<Mutex<Connection>>,
}

impl LocalStorage {
    /// Create storage at the specified path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Database(format!("Failed to create {:?}: {}", parent, e))
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let storage = Self::with_connection(conn)?;
        info!("Local storage initialized at {:?}", path);
        Ok(storage)
    }

    /// Create in-memory storage (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl ChallengeStorage for LocalStorage {
    // ========================================================================
    // REGISTRATIONS
    // ========================================================================

    async fn find_registration(
        &self,
        user_id: &str,
        challenge_id: &str,
    ) -> Result<Option<Registration>> {
        let conn = self.conn.lock();
        Ok(find_active(&conn, user_id, challenge_id)?)
    }

    async fn insert_registration(&self, registration: &Registration) -> Result<InsertOutcome> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO registrations (id, user_id, challenge_id, group_id, status, joined_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                registration.id,
                registration.user_id,
                registration.challenge_id,
                registration.group_id,
                registration.status.as_str(),
                registration.joined_at.timestamp_millis(),
            ],
        )?;

        if inserted == 0 {
            return find_active(&conn, &registration.user_id, &registration.challenge_id)?
                .map(InsertOutcome::AlreadyExists)
                .ok_or_else(|| {
                    StorageError::InvalidData(format!(
                        "registration {} was rejected but no active row exists",
                        registration.id
                    ))
                });
        }

        let mut stored = registration.clone();
        stored.seq = conn.last_insert_rowid();
        debug!(
            "Stored registration {} (seq {}) for {} in {}",
            stored.id, stored.seq, stored.user_id, stored.challenge_id
        );
        Ok(InsertOutcome::Inserted(stored))
    }

    async fn delete_registration(
        &self,
        user_id: &str,
        challenge_id: &str,
    ) -> Result<DeleteOutcome> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM registrations
             WHERE user_id = ?1 AND challenge_id = ?2 AND status = 'registered' AND group_id IS NULL",
            params![user_id, challenge_id],
        )?;
        if deleted > 0 {
            return Ok(DeleteOutcome::Deleted);
        }

        Ok(match find_active(&conn, user_id, challenge_id)? {
            Some(Registration {
                group_id: Some(group_id),
                ..
            }) => DeleteOutcome::Grouped { group_id },
            _ => DeleteOutcome::NotFound,
        })
    }

    async fn queue_depth(&self, challenge_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM registrations
             WHERE challenge_id = ?1 AND status = 'registered' AND group_id IS NULL",
            params![challenge_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    async fn queue_position(&self, user_id: &str, challenge_id: &str) -> Result<Option<usize>> {
        let conn = self.conn.lock();
        let position: i64 = conn.query_row(
            "SELECT COUNT(*) FROM registrations q, registrations me
             WHERE me.user_id = ?1 AND me.challenge_id = ?2
               AND me.status = 'registered' AND me.group_id IS NULL
               AND q.challenge_id = me.challenge_id
               AND q.status = 'registered' AND q.group_id IS NULL
               AND (q.joined_at < me.joined_at OR (q.joined_at = me.joined_at AND q.seq <= me.seq))",
            params![user_id, challenge_id],
            |row| row.get(0),
        )?;
        Ok((position > 0).then_some(position as usize))
    }

    // ========================================================================
    // GROUPS
    // ========================================================================

    async fn claim_group(&self, group: &Group, team_size: TeamSize) -> Result<ClaimOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut members = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM registrations
                 WHERE challenge_id = ?1 AND status = 'registered' AND group_id IS NULL
                 ORDER BY joined_at ASC, seq ASC
                 LIMIT ?2",
                REGISTRATION_COLUMNS
            ))?;
            let rows = stmt
                .query_map(
                    params![group.challenge_id, team_size.get() as i64],
                    registration_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        if members.len() < team_size.as_usize() {
            // Dropping the transaction rolls it back; nothing was written.
            return Ok(ClaimOutcome::Insufficient {
                waiting: members.len(),
            });
        }

        tx.execute(
            "INSERT INTO challenge_groups (id, challenge_id, size, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                group.id,
                group.challenge_id,
                group.size,
                group.created_at.timestamp_millis()
            ],
        )?;

        let mut bound = 0;
        for member in &members {
            bound += tx.execute(
                "UPDATE registrations SET group_id = ?1 WHERE seq = ?2 AND group_id IS NULL",
                params![group.id, member.seq],
            )?;
        }
        if bound != team_size.as_usize() {
            return Err(StorageError::InvalidData(format!(
                "group {} bound {} of {} registrations",
                group.id, bound, team_size
            )));
        }

        tx.commit()?;

        for member in &mut members {
            member.group_id = Some(group.id.clone());
        }
        Ok(ClaimOutcome::Claimed(members))
    }

    async fn get_group(&self, group_id: &str) -> Result<Option<Group>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT id, challenge_id, size, created_at FROM challenge_groups WHERE id = ?1",
                params![group_id],
                group_from_row,
            )
            .optional()?)
    }

    async fn list_groups(&self, challenge_id: &str) -> Result<Vec<Group>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, challenge_id, size, created_at FROM challenge_groups
             WHERE challenge_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let groups = stmt
            .query_map(params![challenge_id], group_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    async fn group_members(&self, group_id: &str) -> Result<Vec<Registration>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM registrations WHERE group_id = ?1 ORDER BY joined_at ASC, seq ASC",
            REGISTRATION_COLUMNS
        ))?;
        let members = stmt
            .query_map(params![group_id], registration_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(members)
    }
}
