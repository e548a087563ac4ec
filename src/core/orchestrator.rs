//! Race orchestrator - drives one probe request from start to end
//!
//! `INIT → STREAMING → (RACE_SUCCESS | RACE_FAILURE | NO_RACE) → DONE`
//!
//! A request races when it carries a known participant and a challenge is
//! active. Hops are geolocated as they arrive and streamed to the requesting
//! client; when the stream is exhausted the last geolocated hop is judged
//! against the challenge geofence. The session is always released and the
//! client always gets a final `End` event, unless it went away first.
//!
//! Locks are never nested here: every component call takes and releases its
//! own lock before the next one is made.

use std::sync::Arc;
use std::thread;

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use super::broadcast::EventBroadcaster;
use super::format::{format_elapsed, round_km};
use super::leaderboard::LeaderboardStore;
use super::model::{ArrivalAttempt, Challenge, Participant, RaceRecord};
use super::protocol::{BroadcastEvent, ProbeEvent};
use super::session::{RaceSession, RaceSessionTracker};
use super::traits::{ChallengeDirectory, HopLocator, HopStream, PathProber, PlayerDirectory, ProbeError};
use super::types::HopLocation;

/// What the client asked for
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRequest {
    pub target: String,
    pub participant_id: Option<String>,
}

impl ProbeRequest {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            participant_id: None,
        }
    }

    pub fn for_participant(mut self, participant_id: impl Into<String>) -> Self {
        self.participant_id = Some(participant_id.into());
        self
    }
}

/// How a probe request ended
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Won(RaceRecord),
    Missed { distance_km: f64 },
    /// Known participant, not judged; distance hint only
    Feedback { distance_km: f64 },
    NoRace,
    /// Client disconnected mid-stream
    Cancelled,
}

/// Components a probe touches
pub struct RaceOrchestrator {
    prober: Arc<dyn PathProber>,
    locator: Arc<dyn HopLocator>,
    players: Arc<dyn PlayerDirectory>,
    challenges: Arc<dyn ChallengeDirectory>,
    sessions: Arc<RaceSessionTracker>,
    leaderboard: Arc<LeaderboardStore>,
    broadcaster: Arc<EventBroadcaster>,
}

/// Race context resolved at INIT
struct RaceContext {
    participant: Participant,
    challenge: Challenge,
}

/// Last geolocated hop seen while streaming
struct Observed {
    location: Option<HopLocation>,
    hop_count: u32,
}

/// The client went away
struct Disconnected;

impl RaceOrchestrator {
    pub fn new(
        prober: Arc<dyn PathProber>,
        locator: Arc<dyn HopLocator>,
        players: Arc<dyn PlayerDirectory>,
        challenges: Arc<dyn ChallengeDirectory>,
        sessions: Arc<RaceSessionTracker>,
        leaderboard: Arc<LeaderboardStore>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            prober,
            locator,
            players,
            challenges,
            sessions,
            leaderboard,
            broadcaster,
        }
    }

    /// Run a probe on the calling thread, sending events to `events`.
    ///
    /// Only fails when the probe cannot start; no session exists then.
    pub fn run(
        &self,
        request: &ProbeRequest,
        events: &Sender<ProbeEvent>,
    ) -> Result<ProbeOutcome, ProbeError> {
        let stream = self.prober.trace(&request.target)?;
        Ok(self.drive(request, stream, events))
    }

    /// Run a probe on its own thread; events arrive on the returned receiver.
    /// Dropping the receiver cancels the probe.
    pub fn start(
        self: &Arc<Self>,
        request: ProbeRequest,
        capacity: usize,
    ) -> Result<Receiver<ProbeEvent>, ProbeError> {
        let stream = self.prober.trace(&request.target)?;
        let (tx, rx) = bounded(capacity.max(1));
        let this = Arc::clone(self);
        thread::Builder::new()
            .name("probe".to_string())
            .spawn(move || {
                let outcome = this.drive(&request, stream, &tx);
                debug!(target_host = %request.target, ?outcome, "[PROBE] Finished");
            })?;
        Ok(rx)
    }

    fn drive(
        &self,
        request: &ProbeRequest,
        mut stream: HopStream,
        events: &Sender<ProbeEvent>,
    ) -> ProbeOutcome {
        // INIT
        let participant = request
            .participant_id
            .as_deref()
            .and_then(|id| self.players.participant(id));
        let snapshot = participant
            .as_ref()
            .and_then(|_| self.challenges.active_challenge());
        let context = match (participant, snapshot) {
            (Some(participant), Some(challenge)) => Some(RaceContext {
                participant,
                challenge,
            }),
            _ => None,
        };

        if let Some(ctx) = &context {
            self.sessions.begin(&ctx.participant.id, &ctx.challenge.id);
            info!(
                participant = %ctx.participant.display_name,
                challenge = %ctx.challenge.city_name,
                target_host = %request.target,
                "[RACE] Race probe started"
            );
        } else {
            info!(target_host = %request.target, "[PROBE] Probe started");
        }

        let start = ProbeEvent::Start {
            target: request.target.clone(),
            ts: unix_ts(),
            is_race: context.is_some(),
            challenge: context.as_ref().map(|ctx| ctx.challenge.clone()),
        };
        if events.send(start).is_err() {
            return self.cancel(context.as_ref(), stream);
        }

        // STREAMING
        let observed = match self.stream_hops(context.as_ref(), &mut stream, events) {
            Ok(observed) => observed,
            Err(Disconnected) => return self.cancel(context.as_ref(), stream),
        };
        drop(stream);

        // DONE releases the session before judging so no other caller can
        // observe it afterwards
        let session = context
            .as_ref()
            .and_then(|ctx| self.sessions.end(&ctx.participant.id));

        let outcome = match (&context, observed.location.as_ref()) {
            (Some(ctx), Some(location)) => {
                self.conclude(ctx, session, location, observed.hop_count, events)
            }
            _ => ProbeOutcome::NoRace,
        };

        let _ = events.send(ProbeEvent::End {
            target: request.target.clone(),
            ts: unix_ts(),
        });
        outcome
    }

    fn stream_hops(
        &self,
        context: Option<&RaceContext>,
        stream: &mut HopStream,
        events: &Sender<ProbeEvent>,
    ) -> Result<Observed, Disconnected> {
        let mut observed = Observed {
            location: None,
            hop_count: 0,
        };

        for hop in stream.by_ref() {
            let geo = hop
                .address
                .as_deref()
                .and_then(|addr| self.locator.locate(addr));

            if let Some(ctx) = context {
                self.sessions
                    .record_hop(&ctx.participant.id, &hop, geo.as_ref());
            }
            observed.hop_count += 1;
            if let Some(location) = &geo {
                observed.location = Some(location.clone());
            }

            let event = ProbeEvent::Hop {
                hop: hop.index,
                ip: hop.address,
                geo,
            };
            if events.send(event).is_err() {
                return Err(Disconnected);
            }
        }
        Ok(observed)
    }

    /// Judge the final hop, or fall back to a distance hint
    fn conclude(
        &self,
        ctx: &RaceContext,
        session: Option<RaceSession>,
        location: &HopLocation,
        hop_count: u32,
        events: &Sender<ProbeEvent>,
    ) -> ProbeOutcome {
        let judged = session.and_then(|s| {
            self.challenges
                .challenge(&s.challenge_id)
                .map(|challenge| (s, challenge))
        });

        let Some((session, challenge)) = judged else {
            let distance_km = challenge_distance(&ctx.challenge, location);
            debug!(
                participant = %ctx.participant.id,
                distance_km,
                "[RACE] Probe not judged, sending distance feedback"
            );
            let _ = events.send(ProbeEvent::DistanceFeedback {
                distance_km: round_km(distance_km),
                final_location: location.display_name(),
            });
            return ProbeOutcome::Feedback { distance_km };
        };

        // Judge the session's own record of the final located hop
        let location = session
            .last_located()
            .and_then(|h| h.location.as_ref())
            .unwrap_or(location);
        let fence = challenge.geofence();
        let distance_km = fence.distance_from_center(location.point());
        let attempt = ArrivalAttempt {
            location: location.clone(),
            hop_count,
            duration_seconds: session.elapsed_seconds(),
            distance_km,
        };

        if fence.contains_distance(distance_km) {
            self.arrive(ctx, &challenge, &attempt, events)
        } else {
            self.miss(ctx, &challenge, &attempt, events)
        }
    }

    fn arrive(
        &self,
        ctx: &RaceContext,
        challenge: &Challenge,
        attempt: &ArrivalAttempt,
        events: &Sender<ProbeEvent>,
    ) -> ProbeOutcome {
        let record = match self
            .leaderboard
            .finalize_success(&ctx.participant, &challenge.id, attempt)
        {
            Ok(record) => record,
            Err(e) => {
                error!(participant = %ctx.participant.id, error = %e, "[RACE] Failed to record arrival");
                return ProbeOutcome::NoRace;
            }
        };

        info!(
            participant = %ctx.participant.display_name,
            rank = record.rank,
            points = record.points,
            distance_km = attempt.distance_km,
            elapsed = %format_elapsed(attempt.duration_seconds),
            "[RACE] Arrived inside geofence"
        );

        self.broadcaster.publish(BroadcastEvent::RaceFinished {
            record: record.clone(),
            distance_km: round_km(attempt.distance_km),
        });
        let _ = events.send(ProbeEvent::RaceSuccess {
            rank: record.rank,
            points: record.points,
            distance_km: round_km(attempt.distance_km),
            duration_seconds: attempt.duration_seconds,
            final_location: attempt.location.display_name(),
        });
        ProbeOutcome::Won(record)
    }

    fn miss(
        &self,
        ctx: &RaceContext,
        challenge: &Challenge,
        attempt: &ArrivalAttempt,
        events: &Sender<ProbeEvent>,
    ) -> ProbeOutcome {
        if let Err(e) = self
            .leaderboard
            .finalize_failure(&ctx.participant, &challenge.id, attempt)
        {
            error!(participant = %ctx.participant.id, error = %e, "[RACE] Failed to record attempt");
            return ProbeOutcome::NoRace;
        }

        info!(
            participant = %ctx.participant.display_name,
            distance_km = attempt.distance_km,
            radius_km = challenge.radius_km,
            "[RACE] Finished outside geofence"
        );
        let _ = events.send(ProbeEvent::RaceFailed {
            distance_km: round_km(attempt.distance_km),
            required_radius_km: challenge.radius_km,
            final_location: attempt.location.display_name(),
        });
        ProbeOutcome::Missed {
            distance_km: attempt.distance_km,
        }
    }

    /// Client left: stop the probe and drop the session unjudged
    fn cancel(&self, context: Option<&RaceContext>, stream: HopStream) -> ProbeOutcome {
        drop(stream);
        if let Some(ctx) = context {
            self.sessions.end(&ctx.participant.id);
        }
        warn!("[PROBE] Client disconnected, probe cancelled");
        ProbeOutcome::Cancelled
    }
}

fn challenge_distance(challenge: &Challenge, location: &HopLocation) -> f64 {
    challenge.geofence().distance_from_center(location.point())
}

fn unix_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::leaderboard::mocks::MemoryPersistence;
    use crate::core::model::UNRANKED;
    use crate::core::traits::mocks::{MockDirectory, MockLocator, MockProber};
    use crate::core::types::Hop;
    use crossbeam_channel::unbounded;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    const TOKYO_HOP: &str = "203.0.113.9";
    const LONDON_HOP: &str = "198.51.100.7";

    struct Harness {
        orchestrator: Arc<RaceOrchestrator>,
        directory: Arc<MockDirectory>,
        sessions: Arc<RaceSessionTracker>,
        leaderboard: Arc<LeaderboardStore>,
        broadcaster: Arc<EventBroadcaster>,
        locator: Arc<MockLocator>,
        pulled: Arc<std::sync::atomic::AtomicUsize>,
    }

    fn harness(prober: MockProber) -> Harness {
        let locator = Arc::new(
            MockLocator::new()
                .with(TOKYO_HOP, HopLocation::new(35.6895, 139.6917, "Tokyo", "Japan"))
                .with(
                    LONDON_HOP,
                    HopLocation::new(51.5074, -0.1278, "London", "United Kingdom"),
                ),
        );
        let pulled = Arc::clone(&prober.pulled);
        let directory = Arc::new(MockDirectory::new());
        let sessions = Arc::new(RaceSessionTracker::new());
        let leaderboard = Arc::new(LeaderboardStore::new(Arc::new(MemoryPersistence::new())));
        let broadcaster = Arc::new(EventBroadcaster::new(16));
        let orchestrator = Arc::new(RaceOrchestrator::new(
            Arc::new(prober),
            locator.clone(),
            directory.clone(),
            directory.clone(),
            sessions.clone(),
            leaderboard.clone(),
            broadcaster.clone(),
        ));
        Harness {
            orchestrator,
            directory,
            sessions,
            leaderboard,
            broadcaster,
            locator,
            pulled,
        }
    }

    fn path_to(final_hop: &str) -> Vec<Hop> {
        vec![
            Hop::answered(1, "10.0.0.1"),
            Hop::silent(2),
            Hop::answered(3, final_hop),
        ]
    }

    fn collect(rx: &Receiver<ProbeEvent>) -> Vec<ProbeEvent> {
        rx.try_iter().collect()
    }

    // -------------------------------------------------------------------------
    // Race outcomes
    // -------------------------------------------------------------------------

    #[test]
    fn test_tokyo_arrival_wins_rank_one() {
        let h = harness(MockProber::new(path_to(TOKYO_HOP)));
        h.directory.add_player("p1", "Alice");
        h.directory.add_challenge("c1", 35.6762, 139.6503, 100.0);
        let observer = h.broadcaster.subscribe();

        let (tx, rx) = unbounded();
        let request = ProbeRequest::new("8.8.8.8").for_participant("p1");
        let outcome = h.orchestrator.run(&request, &tx).unwrap();

        let record = match outcome {
            ProbeOutcome::Won(record) => record,
            other => panic!("expected a win, got {other:?}"),
        };
        assert_eq!(record.rank, 1);
        assert_eq!(record.points, 10);
        assert_eq!(record.total_hops, 3);
        assert!(record.distance_from_target_km < 10.0);

        let events = collect(&rx);
        assert!(matches!(events[0], ProbeEvent::Start { is_race: true, .. }));
        assert!(matches!(
            events[events.len() - 2],
            ProbeEvent::RaceSuccess { rank: 1, points: 10, .. }
        ));
        assert!(events.last().unwrap().is_end());

        assert!(matches!(
            observer.try_recv().unwrap(),
            BroadcastEvent::RaceFinished { .. }
        ));
        assert!(!h.sessions.contains("p1"));
    }

    #[test]
    fn test_london_arrival_fails_and_updates_placeholder() {
        let h = harness(MockProber::new(path_to(LONDON_HOP)));
        let alice = h.directory.add_player("p1", "Alice");
        h.directory.add_challenge("c1", 35.6762, 139.6503, 100.0);
        h.leaderboard.ensure_placeholder(&alice, "c1").unwrap();
        let observer = h.broadcaster.subscribe();

        let (tx, rx) = unbounded();
        let request = ProbeRequest::new("8.8.8.8").for_participant("p1");
        let outcome = h.orchestrator.run(&request, &tx).unwrap();

        let distance_km = match outcome {
            ProbeOutcome::Missed { distance_km } => distance_km,
            other => panic!("expected a miss, got {other:?}"),
        };
        assert!(distance_km > 9000.0 && distance_km < 10000.0);

        let records = h.leaderboard.export_for("c1");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rank, UNRANKED);
        assert_eq!(records[0].points, 0);
        assert_eq!(records[0].final_hop_city, "London");
        assert_eq!(records[0].distance_from_target_km, distance_km);

        let events = collect(&rx);
        match &events[events.len() - 2] {
            ProbeEvent::RaceFailed {
                required_radius_km,
                final_location,
                ..
            } => {
                assert_eq!(*required_radius_km, 100.0);
                assert_eq!(final_location, "London, United Kingdom");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(observer.try_recv().is_err());
        assert!(!h.sessions.contains("p1"));
    }

    #[test]
    fn test_anonymous_probe_is_not_a_race() {
        let h = harness(MockProber::new(path_to(TOKYO_HOP)));
        h.directory.add_challenge("c1", 35.6762, 139.6503, 100.0);

        let (tx, rx) = unbounded();
        let outcome = h.orchestrator.run(&ProbeRequest::new("8.8.8.8"), &tx).unwrap();
        assert_eq!(outcome, ProbeOutcome::NoRace);

        let events = collect(&rx);
        assert_eq!(events.len(), 5);
        assert!(matches!(
            events[0],
            ProbeEvent::Start {
                is_race: false,
                challenge: None,
                ..
            }
        ));
        assert!(h.leaderboard.is_empty());
    }

    #[test]
    fn test_unknown_participant_is_not_a_race() {
        let h = harness(MockProber::new(path_to(TOKYO_HOP)));
        h.directory.add_challenge("c1", 35.6762, 139.6503, 100.0);

        let (tx, _rx) = unbounded();
        let request = ProbeRequest::new("8.8.8.8").for_participant("ghost");
        assert_eq!(h.orchestrator.run(&request, &tx).unwrap(), ProbeOutcome::NoRace);
        assert_eq!(h.sessions.active_count(), 0);
    }

    #[test]
    fn test_no_geolocated_hop_is_not_judged() {
        let h = harness(MockProber::new(vec![
            Hop::answered(1, "10.0.0.1"),
            Hop::silent(2),
        ]));
        h.directory.add_player("p1", "Alice");
        h.directory.add_challenge("c1", 35.6762, 139.6503, 100.0);

        let (tx, rx) = unbounded();
        let request = ProbeRequest::new("8.8.8.8").for_participant("p1");
        assert_eq!(h.orchestrator.run(&request, &tx).unwrap(), ProbeOutcome::NoRace);
        assert!(collect(&rx).last().unwrap().is_end());
        assert!(!h.sessions.contains("p1"));
    }

    #[test]
    fn test_vanished_challenge_gets_distance_feedback() {
        let h = harness(MockProber::new(path_to(TOKYO_HOP)));
        h.directory.add_player("p1", "Alice");
        h.directory.add_challenge("c1", 35.6762, 139.6503, 100.0);

        // Challenge disappears while the probe streams
        let (tx, rx) = unbounded();
        let request = ProbeRequest::new("8.8.8.8").for_participant("p1");
        let stream = h.orchestrator.prober.trace(&request.target).unwrap();
        let stream: HopStream = {
            let dir = Arc::clone(&h.directory);
            Box::new(stream.inspect(move |_| dir.clear_challenges()))
        };
        let outcome = h.orchestrator.drive(&request, stream, &tx);

        assert!(matches!(outcome, ProbeOutcome::Feedback { .. }));
        let events = collect(&rx);
        assert!(matches!(
            events[events.len() - 2],
            ProbeEvent::DistanceFeedback { .. }
        ));
        assert!(h.leaderboard.is_empty());
    }

    #[test]
    fn test_hop_events_forward_indices_and_geo() {
        let h = harness(MockProber::new(path_to(TOKYO_HOP)));
        let (tx, rx) = unbounded();
        h.orchestrator.run(&ProbeRequest::new("8.8.8.8"), &tx).unwrap();

        let hops: Vec<(u32, bool, bool)> = collect(&rx)
            .into_iter()
            .filter_map(|e| match e {
                ProbeEvent::Hop { hop, ip, geo } => Some((hop, ip.is_some(), geo.is_some())),
                _ => None,
            })
            .collect();
        assert_eq!(hops, vec![(1, true, false), (2, false, false), (3, true, true)]);
        // Silent hops are never looked up
        assert_eq!(h.locator.call_count(), 2);
    }

    #[test]
    fn test_ranks_across_sequential_racers() {
        let h = harness(MockProber::new(path_to(TOKYO_HOP)));
        h.directory.add_challenge("c1", 35.6762, 139.6503, 100.0);
        for i in 1..=3 {
            h.directory.add_player(&format!("p{i}"), &format!("Player {i}"));
        }

        for i in 1..=3u32 {
            let (tx, _rx) = unbounded();
            let request = ProbeRequest::new("8.8.8.8").for_participant(format!("p{i}"));
            match h.orchestrator.run(&request, &tx).unwrap() {
                ProbeOutcome::Won(record) => assert_eq!(record.rank, i),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Failure and cancellation
    // -------------------------------------------------------------------------

    #[test]
    fn test_spawn_failure_creates_no_session() {
        let h = harness(MockProber::failing());
        h.directory.add_player("p1", "Alice");
        h.directory.add_challenge("c1", 35.6762, 139.6503, 100.0);

        let (tx, rx) = unbounded();
        let request = ProbeRequest::new("8.8.8.8").for_participant("p1");
        assert!(matches!(
            h.orchestrator.run(&request, &tx),
            Err(ProbeError::Spawn { .. })
        ));
        assert!(collect(&rx).is_empty());
        assert_eq!(h.sessions.active_count(), 0);
        assert!(h.orchestrator.start(request, 4).is_err());
    }

    #[test]
    fn test_disconnected_client_cancels_without_finalizing() {
        let h = harness(MockProber::new(path_to(TOKYO_HOP)));
        h.directory.add_player("p1", "Alice");
        h.directory.add_challenge("c1", 35.6762, 139.6503, 100.0);

        let (tx, rx) = unbounded();
        drop(rx);
        let request = ProbeRequest::new("8.8.8.8").for_participant("p1");
        assert_eq!(h.orchestrator.run(&request, &tx).unwrap(), ProbeOutcome::Cancelled);

        assert!(!h.sessions.contains("p1"));
        assert!(h.leaderboard.is_empty());
        assert_eq!(h.pulled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_disconnect_mid_stream_releases_session() {
        let h = harness(MockProber::new(path_to(TOKYO_HOP)));
        h.directory.add_player("p1", "Alice");
        h.directory.add_challenge("c1", 35.6762, 139.6503, 100.0);

        let request = ProbeRequest::new("8.8.8.8").for_participant("p1");
        let rx = h.orchestrator.start(request, 1).unwrap();
        assert!(matches!(rx.recv().unwrap(), ProbeEvent::Start { .. }));
        drop(rx);

        let deadline = Instant::now() + Duration::from_secs(5);
        while h.sessions.contains("p1") && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!h.sessions.contains("p1"));
        assert!(h.leaderboard.is_empty());
    }

    #[test]
    fn test_threaded_probe_streams_to_end() {
        let h = harness(MockProber::new(path_to(TOKYO_HOP)));
        let rx = h
            .orchestrator
            .start(ProbeRequest::new("8.8.8.8"), 2)
            .unwrap();
        let events: Vec<ProbeEvent> = rx.iter().collect();
        assert_eq!(events.len(), 5);
        assert!(events.last().unwrap().is_end());
    }
}
