//! Formation Sweeper
//!
//! Background service that periodically re-runs group formation for every
//! known challenge. Registration already triggers formation inline; the
//! sweeper only drains queues left over after a formation attempt failed.
//!
//! Flow:
//! 1. Every `poll_interval_secs`, list challenges from the catalog
//! 2. For each challenge, form groups until its queue is shorter than the
//!    team size (at most `max_groups_per_tick` groups per challenge)

use crate::challenge::ChallengeCatalog;
use crate::formation::GroupFormation;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info};

/// Configuration for the formation sweeper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// Run the sweeper at all (default: true)
    pub enabled: bool,
    /// How often to sweep (default: 30 seconds)
    pub poll_interval_secs: u64,
    /// Upper bound on groups formed per challenge per tick (default: 64)
    pub max_groups_per_tick: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 30,
            max_groups_per_tick: 64,
        }
    }
}

pub struct FormationSweeper {
    formation: Arc<GroupFormation>,
    catalog: Arc<dyn ChallengeCatalog>,
    config: SweeperConfig,
}

impl FormationSweeper {
    pub fn new(
        formation: Arc<GroupFormation>,
        catalog: Arc<dyn ChallengeCatalog>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            formation,
            catalog,
            config,
        }
    }

    /// Start the sweeper (runs forever)
    pub async fn run(&self) {
        info!(
            "Formation sweeper started (poll={}s, max_groups_per_tick={})",
            self.config.poll_interval_secs, self.config.max_groups_per_tick
        );

        let mut ticker = interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));

        loop {
            ticker.tick().await;

            if let Err(e) = self.sweep_once().await {
                error!("Error sweeping challenge queues: {}", e);
            }
        }
    }

    /// Drain every challenge queue once, returning the number of groups formed
    pub async fn sweep_once(&self) -> anyhow::Result<usize> {
        let mut total = 0;

        for challenge_id in self.catalog.challenge_ids().await? {
            let Some(team_size) = self.catalog.team_size(&challenge_id).await? else {
                continue;
            };

            // One failing challenge must not stop the others
            match self
                .formation
                .drain(&challenge_id, team_size, self.config.max_groups_per_tick)
                .await
            {
                Ok(groups) if !groups.is_empty() => {
                    info!(
                        "Sweeper formed {} group(s) for challenge {}",
                        groups.len(),
                        challenge_id
                    );
                    total += groups.len();
                }
                Ok(_) => {}
                Err(e) => error!("Sweeper failed to form groups for {}: {}", challenge_id, e),
            }
        }

        if total == 0 {
            debug!("Sweeper found no queue to drain");
        }
        Ok(total)
    }
}

/// Start the sweeper in background
pub fn spawn_formation_sweeper(
    formation: Arc<GroupFormation>,
    catalog: Arc<dyn ChallengeCatalog>,
    config: SweeperConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let sweeper = FormationSweeper::new(formation, catalog, config);
        sweeper.run().await;
    })
}
