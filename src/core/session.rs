//! Race sessions - ephemeral state of in-flight race probes
//!
//! One session per participant, created when a race probe starts and
//! removed when its stream ends. Nothing here is persisted.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use super::types::{Hop, HopLocation};

// =============================================================================
// SESSION
// =============================================================================

/// A hop observed during a race probe
#[derive(Debug, Clone, PartialEq)]
pub struct SessionHop {
    pub hop: Hop,
    pub location: Option<HopLocation>,
}

#[derive(Debug, Clone)]
pub struct RaceSession {
    pub challenge_id: String,
    /// Monotonic start, used for the race duration
    pub started: Instant,
    pub hops: Vec<SessionHop>,
}

impl RaceSession {
    fn new(challenge_id: &str) -> Self {
        Self {
            challenge_id: challenge_id.to_string(),
            started: Instant::now(),
            hops: Vec::new(),
        }
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Last hop that was geolocated
    pub fn last_located(&self) -> Option<&SessionHop> {
        self.hops.iter().rev().find(|h| h.location.is_some())
    }
}

// =============================================================================
// SESSION TRACKER
// =============================================================================

/// Participant id → in-flight race session
#[derive(Default)]
pub struct RaceSessionTracker {
    sessions: Mutex<HashMap<String, RaceSession>>,
}

impl RaceSessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session, replacing any session the participant already had
    pub fn begin(&self, participant_id: &str, challenge_id: &str) -> RaceSession {
        let session = RaceSession::new(challenge_id);
        let replaced = self
            .sessions
            .lock()
            .insert(participant_id.to_string(), session.clone());
        if replaced.is_some() {
            debug!(participant = %participant_id, "[RACE] Replaced in-flight session");
        }
        session
    }

    /// Append a hop; silently ignored once the session is gone
    pub fn record_hop(&self, participant_id: &str, hop: &Hop, location: Option<&HopLocation>) {
        if let Some(session) = self.sessions.lock().get_mut(participant_id) {
            session.hops.push(SessionHop {
                hop: hop.clone(),
                location: location.cloned(),
            });
        }
    }

    /// Detach and return the session; only one caller ever gets it
    pub fn end(&self, participant_id: &str) -> Option<RaceSession> {
        self.sessions.lock().remove(participant_id)
    }

    #[cfg(test)]
    pub fn contains(&self, participant_id: &str) -> bool {
        self.sessions.lock().contains_key(participant_id)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn tokyo() -> HopLocation {
        HopLocation::new(35.6895, 139.6917, "Tokyo", "Japan")
    }

    #[test]
    fn test_begin_and_end() {
        let tracker = RaceSessionTracker::new();
        tracker.begin("p1", "c1");
        assert!(tracker.contains("p1"));
        assert_eq!(tracker.active_count(), 1);

        let session = tracker.end("p1").unwrap();
        assert_eq!(session.challenge_id, "c1");
        assert!(!tracker.contains("p1"));
        assert!(tracker.end("p1").is_none());
    }

    #[test]
    fn test_record_hop_appends_in_order() {
        let tracker = RaceSessionTracker::new();
        tracker.begin("p1", "c1");
        tracker.record_hop("p1", &Hop::answered(1, "10.0.0.1"), None);
        tracker.record_hop("p1", &Hop::silent(2), None);
        tracker.record_hop("p1", &Hop::answered(3, "203.0.113.9"), Some(&tokyo()));

        let session = tracker.end("p1").unwrap();
        let indices: Vec<u32> = session.hops.iter().map(|h| h.hop.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(session.last_located().unwrap().hop.index, 3);
    }

    #[test]
    fn test_record_hop_after_end_is_noop() {
        let tracker = RaceSessionTracker::new();
        tracker.begin("p1", "c1");
        tracker.end("p1");
        tracker.record_hop("p1", &Hop::answered(1, "10.0.0.1"), None);
        assert!(!tracker.contains("p1"));
    }

    #[test]
    fn test_begin_overwrites_previous_session() {
        let tracker = RaceSessionTracker::new();
        tracker.begin("p1", "c1");
        tracker.record_hop("p1", &Hop::answered(1, "10.0.0.1"), None);
        tracker.begin("p1", "c2");

        let session = tracker.end("p1").unwrap();
        assert_eq!(session.challenge_id, "c2");
        assert!(session.hops.is_empty());
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn test_end_observed_by_exactly_one_caller() {
        let tracker = Arc::new(RaceSessionTracker::new());
        tracker.begin("p1", "c1");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || tracker.end("p1").is_some())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
