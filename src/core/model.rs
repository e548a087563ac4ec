//! Race data model
//!
//! Challenges, participants, and the per-participant race record that
//! the leaderboard ranks. Field names match the persisted and wire shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::geofence::Geofence;
use super::types::{GeoPoint, HopLocation};

/// Rank carried by a record that has not (successfully) finished yet
pub const UNRANKED: u32 = 999;

/// Points awarded for the first arrival; each later rank earns one less
pub const MAX_POINTS: u32 = 10;

/// Highest rank a finalized record can hold; ranks must stay below the
/// `UNRANKED` sentinel
pub const MAX_RANK: u32 = UNRANKED - 1;

/// Rank for the next arrival given how many are already finalized, or
/// `None` once every rank up to `MAX_RANK` is taken
pub fn next_rank(finalized: u32) -> Option<u32> {
    let rank = finalized.checked_add(1)?;
    (rank <= MAX_RANK).then_some(rank)
}

/// `max(0, 10 - (rank - 1))`
pub fn points_for_rank(rank: u32) -> u32 {
    MAX_POINTS.saturating_sub(rank.saturating_sub(1))
}

// =============================================================================
// CHALLENGE
// =============================================================================

/// A geofenced target region with an activation window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub city_name: String,
    pub city_lat: f64,
    pub city_lon: f64,
    pub radius_km: f64,
    pub target_host: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Challenge {
    pub fn target_point(&self) -> GeoPoint {
        GeoPoint::new(self.city_lat, self.city_lon)
    }

    pub fn geofence(&self) -> Geofence {
        Geofence::new(self.target_point(), self.radius_km)
    }

    /// Whether the activation window contains `now` (both ends inclusive)
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.start_time <= now && self.end_time.map_or(true, |end| now <= end)
    }
}

// =============================================================================
// PARTICIPANT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// RACE RECORD
// =============================================================================

/// One participant's standing in one challenge.
///
/// A record is a placeholder while `rank == UNRANKED`; it becomes finalized
/// once a successful arrival assigns it a rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceRecord {
    /// Database row backing this record, once persisted
    #[serde(skip)]
    pub row_id: Option<i64>,
    pub player_id: String,
    pub player_name: String,
    pub challenge_id: String,
    pub finish_time: DateTime<Utc>,
    pub rank: u32,
    pub points: u32,
    pub final_hop_lat: f64,
    pub final_hop_lon: f64,
    pub final_hop_city: String,
    pub final_hop_country: String,
    pub total_hops: u32,
    pub trace_duration_seconds: f64,
    /// Older rows predate this field
    #[serde(default)]
    pub distance_from_target_km: f64,
}

impl RaceRecord {
    /// Entry created when a participant joins an active challenge
    pub fn placeholder(participant: &Participant, challenge_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            row_id: None,
            player_id: participant.id.clone(),
            player_name: participant.display_name.clone(),
            challenge_id: challenge_id.to_string(),
            finish_time: now,
            rank: UNRANKED,
            points: 0,
            final_hop_lat: 0.0,
            final_hop_lon: 0.0,
            final_hop_city: String::new(),
            final_hop_country: String::new(),
            total_hops: 0,
            trace_duration_seconds: 0.0,
            distance_from_target_km: 0.0,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.rank != UNRANKED
    }

    pub fn is_placeholder_for(&self, player_id: &str, challenge_id: &str) -> bool {
        self.player_id == player_id && self.challenge_id == challenge_id && !self.is_finalized()
    }

    /// Overwrite the attempt metadata, leaving rank and points alone
    pub fn apply_attempt(&mut self, attempt: &ArrivalAttempt, now: DateTime<Utc>) {
        self.finish_time = now;
        self.final_hop_lat = attempt.location.lat;
        self.final_hop_lon = attempt.location.lon;
        self.final_hop_city = attempt.location.city.clone().unwrap_or_default();
        self.final_hop_country = attempt.location.country.clone().unwrap_or_default();
        self.total_hops = attempt.hop_count;
        self.trace_duration_seconds = attempt.duration_seconds;
        self.distance_from_target_km = attempt.distance_km;
    }

    pub fn status(&self) -> EntryStatus {
        if self.is_finalized() {
            EntryStatus::Completed
        } else {
            EntryStatus::Waiting
        }
    }
}

/// What a judged probe observed at its final geolocated hop
#[derive(Debug, Clone, PartialEq)]
pub struct ArrivalAttempt {
    pub location: HopLocation,
    pub hop_count: u32,
    pub duration_seconds: f64,
    pub distance_km: f64,
}

// =============================================================================
// LEADERBOARD ENTRY
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Completed,
    Waiting,
}

/// A record as shown on the scoreboard
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardEntry {
    #[serde(flatten)]
    pub record: RaceRecord,
    pub status: EntryStatus,
}

impl From<RaceRecord> for LeaderboardEntry {
    fn from(record: RaceRecord) -> Self {
        let status = record.status();
        Self { record, status }
    }
}
