//! Service module - runtime wiring around the race engine
//!
//! This module contains the I/O side of the crate:
//! - Configuration loading and logging setup
//! - SQLite persistence and the participant/challenge directories
//! - The traceroute process prober and HTTP geolocation
//! - The WebSocket observer feed and the control channel into `serve`
//! - `RaceService`, the facade the CLI drives

pub mod config;
pub mod control;
pub mod db;
pub mod directory;
pub mod geo;
pub mod logging;
pub mod observer;
pub mod prober;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::core::broadcast::EventBroadcaster;
use crate::core::leaderboard::{LeaderboardStore, PersistError, StoreError};
use crate::core::model::{Challenge, LeaderboardEntry, Participant, RaceRecord};
use crate::core::orchestrator::{ProbeRequest, RaceOrchestrator};
use crate::core::protocol::{BroadcastEvent, ProbeEvent};
use crate::core::session::RaceSessionTracker;
use crate::core::traits::{ChallengeDirectory, HopLocator, PathProber, ProbeError};
use crate::core::types::HopLocation;

use self::config::Config;
use self::control::RequestHandler;
use self::db::Database;
use self::directory::{Directory, NewChallenge};
use self::geo::{IpApiLocator, PublicLocation};
use self::observer::ObserverServer;
use self::prober::TracerouteProber;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("invalid challenge: {0}")]
    InvalidChallenge(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("persistence: {0}")]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
}

// =============================================================================
// REPORTS
// =============================================================================

/// Live standings of the active challenge
#[derive(Debug, Clone, Serialize)]
pub struct Scoreboard {
    pub challenge: Challenge,
    pub results: Vec<LeaderboardEntry>,
    pub timestamp: DateTime<Utc>,
}

/// Full result dump of one challenge
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub challenge: Challenge,
    pub results: Vec<RaceRecord>,
    pub export_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub players: usize,
    pub challenges: usize,
    pub results: usize,
    pub active_races: usize,
    pub observers: usize,
    pub active_challenge: Option<Challenge>,
    pub database: PathBuf,
}

// =============================================================================
// RACE SERVICE
// =============================================================================

pub struct RaceService {
    config: Config,
    db: Arc<Database>,
    directory: Arc<Directory>,
    leaderboard: Arc<LeaderboardStore>,
    sessions: Arc<RaceSessionTracker>,
    broadcaster: Arc<EventBroadcaster>,
    orchestrator: Arc<RaceOrchestrator>,
    locator: Arc<dyn HopLocator>,
    ip_api: Option<Arc<IpApiLocator>>,
}

impl RaceService {
    /// Open the configured database and wire the real prober and locator
    pub fn open(config: Config) -> Result<Self, ServiceError> {
        let prober = Arc::new(TracerouteProber::new(&config.probe));
        let ip_api = Arc::new(IpApiLocator::new(&config.geo));
        let mut service = Self::with_components(config, prober, ip_api.clone())?;
        service.ip_api = Some(ip_api);
        Ok(service)
    }

    /// Wire the service around the given prober and locator
    pub fn with_components(
        config: Config,
        prober: Arc<dyn PathProber>,
        locator: Arc<dyn HopLocator>,
    ) -> Result<Self, ServiceError> {
        let db = Arc::new(Database::open(&config.database.path)?);
        let directory = Arc::new(Directory::load(db.clone())?);
        let records = db.load_race_results()?;
        info!(records = records.len(), "[STORE] Race results loaded");

        let leaderboard = Arc::new(LeaderboardStore::with_records(db.clone(), records));
        let sessions = Arc::new(RaceSessionTracker::new());
        let broadcaster = Arc::new(EventBroadcaster::new(config.observer.channel_capacity));
        let orchestrator = Arc::new(RaceOrchestrator::new(
            prober,
            locator.clone(),
            directory.clone(),
            directory.clone(),
            sessions.clone(),
            leaderboard.clone(),
            broadcaster.clone(),
        ));

        Ok(Self {
            config,
            db,
            directory,
            leaderboard,
            sessions,
            broadcaster,
            orchestrator,
            locator,
            ip_api: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register (or rename) a participant and enter them in the active
    /// challenge
    pub fn register(
        &self,
        existing_id: Option<&str>,
        display_name: &str,
    ) -> Result<Participant, ServiceError> {
        let participant = self.directory.register_player(existing_id, display_name)?;

        if let Some(challenge) = self.directory.active_challenge() {
            if let Some(record) = self
                .leaderboard
                .ensure_placeholder(&participant, &challenge.id)?
            {
                self.broadcaster.publish(BroadcastEvent::ParticipantJoined {
                    participant: participant.clone(),
                    record,
                });
            }
        }
        Ok(participant)
    }

    pub fn create_challenge(&self, new: NewChallenge) -> Result<Challenge, ServiceError> {
        let challenge = self.directory.create_challenge(new)?;
        self.broadcaster.publish(BroadcastEvent::ChallengeCreated {
            challenge: challenge.clone(),
        });
        Ok(challenge)
    }

    pub fn set_challenge_mode(&self, enabled: bool) -> Result<(), ServiceError> {
        self.directory.set_challenge_mode(enabled)?;
        self.broadcaster
            .publish(BroadcastEvent::ChallengeModeChanged { enabled });
        Ok(())
    }

    /// Create the configured default challenge unless one is already active
    pub fn seed_default_challenge(&self) -> Result<Option<Challenge>, ServiceError> {
        if self.directory.active_challenge().is_some() {
            return Ok(None);
        }
        let seed = &self.config.challenge;
        let challenge = self.create_challenge(NewChallenge {
            city_name: seed.city_name.clone(),
            city_lat: seed.city_lat,
            city_lon: seed.city_lon,
            radius_km: Some(seed.radius_km),
            target_host: seed.target_host.clone(),
            duration_hours: Some(seed.duration_hours),
        })?;
        info!(city = %challenge.city_name, "[RACE] Default challenge seeded");
        Ok(Some(challenge))
    }

    pub fn scoreboard(&self) -> Option<Scoreboard> {
        let challenge = self.directory.active_challenge()?;
        let results = self.leaderboard.leaderboard_for(&challenge.id);
        Some(Scoreboard {
            challenge,
            results,
            timestamp: Utc::now(),
        })
    }

    /// Results of the active challenge, or of the latest one if none is active
    pub fn export(&self) -> Result<Option<ExportReport>, ServiceError> {
        let challenge = match self.directory.active_challenge() {
            Some(challenge) => Some(challenge),
            None => self.directory.latest_challenge()?,
        };
        Ok(challenge.map(|challenge| ExportReport {
            results: self.leaderboard.export_for(&challenge.id),
            challenge,
            export_time: Utc::now(),
        }))
    }

    pub fn stats(&self) -> Result<ServiceStats, ServiceError> {
        Ok(ServiceStats {
            players: self.directory.player_count(),
            challenges: self.directory.challenge_count()?,
            results: self.leaderboard.len(),
            active_races: self.sessions.active_count(),
            observers: self.broadcaster.observer_count(),
            active_challenge: self.directory.active_challenge(),
            database: self.db.path().to_path_buf(),
        })
    }

    /// Start a probe; events arrive on the returned receiver, ending with
    /// `End`. Dropping the receiver cancels the probe.
    pub fn probe(&self, request: ProbeRequest) -> Result<Receiver<ProbeEvent>, ServiceError> {
        let target = request.target.trim();
        if target.is_empty() {
            return Err(ServiceError::InvalidAddress("empty target".to_string()));
        }
        let request = ProbeRequest {
            target: target.to_string(),
            ..request
        };
        Ok(self
            .orchestrator
            .start(request, self.config.probe.event_capacity)?)
    }

    pub fn locate(&self, ip: &str) -> Result<Option<HopLocation>, ServiceError> {
        let addr: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| ServiceError::InvalidAddress(ip.to_string()))?;
        Ok(self.locator.locate(&addr.to_string()))
    }

    pub fn public_location(&self) -> Option<PublicLocation> {
        match &self.ip_api {
            Some(ip_api) => ip_api.public_location(),
            None => {
                warn!("[GEO] Public location lookup not available");
                None
            }
        }
    }

    pub fn subscribe(&self) -> Receiver<BroadcastEvent> {
        self.broadcaster.subscribe()
    }

    /// Serve the observer feed and the control channel on the configured
    /// address; control requests run on this service
    pub fn start_observer(self: &Arc<Self>) -> std::io::Result<ObserverServer> {
        let handler: Arc<dyn RequestHandler> = self.clone();
        ObserverServer::start(
            &self.config.observer.bind,
            self.broadcaster.clone(),
            handler,
        )
    }
}
