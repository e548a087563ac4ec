//! Wire protocol types
//!
//! JSON events pushed to clients. `ProbeEvent` is the per-request progress
//! stream of one probe; `BroadcastEvent` goes to every connected observer.
//! Both are tagged by a `type` field.

use serde::{Deserialize, Serialize};

use super::model::{Challenge, Participant, RaceRecord};
use super::types::HopLocation;

// =============================================================================
// PROBE EVENTS (engine → requesting client)
// =============================================================================

/// Events streamed to the client that requested a probe, in arrival order.
/// `End` is always the last one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeEvent {
    Start {
        target: String,
        /// Unix timestamp in seconds
        ts: f64,
        is_race: bool,
        /// Snapshot of the challenge being raced
        #[serde(default, skip_serializing_if = "Option::is_none")]
        challenge: Option<Challenge>,
    },
    Hop {
        hop: u32,
        /// `null` for a hop that did not answer
        ip: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        geo: Option<HopLocation>,
    },
    RaceSuccess {
        rank: u32,
        points: u32,
        distance_km: f64,
        duration_seconds: f64,
        final_location: String,
    },
    RaceFailed {
        distance_km: f64,
        required_radius_km: f64,
        final_location: String,
    },
    /// Distance hint for a known participant whose probe was not judged
    DistanceFeedback {
        distance_km: f64,
        final_location: String,
    },
    End {
        target: String,
        ts: f64,
    },
}

impl ProbeEvent {
    /// Server-sent-events framing: `data: <json>\n\n`
    pub fn to_sse_frame(&self) -> Result<String, serde_json::Error> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }

    pub fn is_end(&self) -> bool {
        matches!(self, ProbeEvent::End { .. })
    }
}

// =============================================================================
// BROADCAST EVENTS (engine → all observers)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastEvent {
    ParticipantJoined {
        participant: Participant,
        record: RaceRecord,
    },
    ChallengeCreated {
        challenge: Challenge,
    },
    ChallengeModeChanged {
        enabled: bool,
    },
    RaceFinished {
        record: RaceRecord,
        distance_km: f64,
    },
}

impl BroadcastEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BroadcastEvent::ParticipantJoined { .. } => "participant_joined",
            BroadcastEvent::ChallengeCreated { .. } => "challenge_created",
            BroadcastEvent::ChallengeModeChanged { .. } => "challenge_mode_changed",
            BroadcastEvent::RaceFinished { .. } => "race_finished",
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
