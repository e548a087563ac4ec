//! Participant and challenge directories
//!
//! Write-through mirror of the `players` and `challenges` tables. Every
//! mutation hits the database first; memory changes only on success.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::core::model::{Challenge, Participant};
use crate::core::traits::{ChallengeDirectory, PlayerDirectory};

use super::db::Database;
use super::ServiceError;

pub const MAX_NAME_LEN: usize = 30;
pub const DEFAULT_RADIUS_KM: f64 = 50.0;
pub const DEFAULT_DURATION_HOURS: i64 = 24;

/// Parameters for a new challenge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChallenge {
    pub city_name: String,
    pub city_lat: f64,
    pub city_lon: f64,
    pub radius_km: Option<f64>,
    pub target_host: String,
    pub duration_hours: Option<i64>,
}

pub struct Directory {
    players: RwLock<HashMap<String, Participant>>,
    /// Challenges flagged active, insertion order
    challenges: RwLock<Vec<Challenge>>,
    db: Arc<Database>,
}

impl Directory {
    /// Load players and active challenges from `db`
    pub fn load(db: Arc<Database>) -> Result<Self, ServiceError> {
        let players: HashMap<String, Participant> = db
            .load_players()?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        let challenges = db.load_active_challenges()?;
        info!(
            players = players.len(),
            challenges = challenges.len(),
            "[DIR] Directory loaded"
        );
        Ok(Self {
            players: RwLock::new(players),
            challenges: RwLock::new(challenges),
            db,
        })
    }

    /// Create a participant, or rename the one with `existing_id`
    pub fn register_player(
        &self,
        existing_id: Option<&str>,
        display_name: &str,
    ) -> Result<Participant, ServiceError> {
        let name = display_name.trim();
        if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
            return Err(ServiceError::InvalidName(format!(
                "display name must be 1-{MAX_NAME_LEN} characters"
            )));
        }

        let mut players = self.players.write();
        let participant = match existing_id.and_then(|id| players.get(id)) {
            Some(existing) => Participant {
                display_name: name.to_string(),
                ..existing.clone()
            },
            None => Participant {
                id: Uuid::new_v4().to_string(),
                display_name: name.to_string(),
                created_at: Utc::now(),
            },
        };

        self.db.save_player(&participant)?;
        players.insert(participant.id.clone(), participant.clone());
        info!(participant = %participant.id, name = %participant.display_name, "[DIR] Player registered");
        Ok(participant)
    }

    pub fn create_challenge(&self, new: NewChallenge) -> Result<Challenge, ServiceError> {
        if !(-90.0..=90.0).contains(&new.city_lat) || !(-180.0..=180.0).contains(&new.city_lon) {
            return Err(ServiceError::InvalidChallenge(
                "coordinates out of range".to_string(),
            ));
        }
        let radius_km = new.radius_km.unwrap_or(DEFAULT_RADIUS_KM);
        if radius_km.is_nan() || radius_km < 0.0 {
            return Err(ServiceError::InvalidChallenge(
                "radius must be non-negative".to_string(),
            ));
        }
        if new.target_host.trim().is_empty() {
            return Err(ServiceError::InvalidChallenge(
                "target host is required".to_string(),
            ));
        }

        let now = Utc::now();
        let hours = new.duration_hours.unwrap_or(DEFAULT_DURATION_HOURS).max(1);
        let challenge = Challenge {
            id: Uuid::new_v4().to_string(),
            city_name: new.city_name,
            city_lat: new.city_lat,
            city_lon: new.city_lon,
            radius_km,
            target_host: new.target_host.trim().to_string(),
            start_time: now,
            end_time: Some(now + Duration::hours(hours)),
            created_at: now,
        };

        let mut challenges = self.challenges.write();
        self.db.save_challenge(&challenge, true)?;
        challenges.push(challenge.clone());
        info!(
            challenge = %challenge.id,
            city = %challenge.city_name,
            radius_km,
            "[DIR] Challenge created"
        );
        Ok(challenge)
    }

    /// Enable or disable every challenge
    pub fn set_challenge_mode(&self, enabled: bool) -> Result<(), ServiceError> {
        let mut challenges = self.challenges.write();
        self.db.set_all_challenges_active(enabled)?;
        *challenges = if enabled {
            self.db.load_active_challenges()?
        } else {
            Vec::new()
        };
        info!(enabled, "[DIR] Challenge mode changed");
        Ok(())
    }

    /// Most recently created challenge, even if inactive
    pub fn latest_challenge(&self) -> Result<Option<Challenge>, ServiceError> {
        Ok(self.db.latest_challenge()?)
    }

    pub fn player_count(&self) -> usize {
        self.players.read().len()
    }

    pub fn challenge_count(&self) -> Result<usize, ServiceError> {
        Ok(self.db.challenge_count()?)
    }
}

impl PlayerDirectory for Directory {
    fn participant(&self, id: &str) -> Option<Participant> {
        self.players.read().get(id).cloned()
    }
}

impl ChallengeDirectory for Directory {
    fn active_challenge(&self) -> Option<Challenge> {
        let now = Utc::now();
        self.challenges
            .read()
            .iter()
            .find(|c| c.is_active_at(now))
            .cloned()
    }

    fn challenge(&self, id: &str) -> Option<Challenge> {
        self.challenges.read().iter().find(|c| c.id == id).cloned()
    }
}
