//! Challenge registration and team formation
//!
//! Users register for a challenge and wait in a per-challenge FIFO queue.
//! As soon as a challenge has `team_size` queued registrants, the oldest
//! of them are bound to a new group in one atomic step.
//!
//! ## Module Structure
//!
//! - `types`: Registration, Group and TeamSize records
//! - `storage`: persistence trait with SQLite and PostgreSQL backends
//! - `challenge`: team size lookup per challenge
//! - `formation`: the group formation routine
//! - `service`: register / unregister / status operations
//! - `sweeper`: background formation sweep
//! - `config`: TOML service configuration
//! - `api`: REST API

pub mod api;
pub mod challenge;
pub mod config;
pub mod error;
pub mod formation;
pub mod service;
pub mod storage;
pub mod sweeper;
pub mod types;

pub use api::{router, run_server, ApiState, USER_ID_HEADER};
pub use challenge::{ChallengeCatalog, StaticCatalog};
pub use config::{ChallengeEntry, ServerConfig, StorageConfig, TeamsConfig};
pub use error::{FormationError, RegistrationError};
pub use formation::{FormationOutcome, GroupFormation};
pub use service::{
    GroupView, RegisterOutcome, RegistrationResult, RegistrationService, StatusResult,
    UnregisterOutcome,
};
pub use storage::local::LocalStorage;
pub use storage::pg::PgStorage;
pub use storage::{ChallengeStorage, ClaimOutcome, DeleteOutcome, InsertOutcome, StorageError};
pub use sweeper::{spawn_formation_sweeper, FormationSweeper, SweeperConfig};
pub use types::{Group, Registration, RegistrationStatus, TeamSize};
