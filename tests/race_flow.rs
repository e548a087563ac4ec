//! End-to-end race flow over a real SQLite file with scripted hops

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tungstenite::stream::MaybeTlsStream;
use tungstenite::WebSocket;

use traceroute_race::core::model::{EntryStatus, UNRANKED};
use traceroute_race::core::orchestrator::ProbeRequest;
use traceroute_race::core::protocol::{BroadcastEvent, ProbeEvent};
use traceroute_race::core::traits::{HopLocator, HopStream, PathProber, ProbeError};
use traceroute_race::core::types::{Hop, HopLocation};
use traceroute_race::service::config::Config;
use traceroute_race::service::control::ControlClient;
use traceroute_race::service::directory::NewChallenge;
use traceroute_race::service::{RaceService, ServiceError};

const TOKYO_HOP: &str = "203.0.113.9";
const LONDON_HOP: &str = "198.51.100.7";

/// Path whose last hop is the probed target itself
struct ScriptedProber;

impl PathProber for ScriptedProber {
    fn trace(&self, target: &str) -> Result<HopStream, ProbeError> {
        let hops = vec![
            Hop::answered(1, "10.0.0.1"),
            Hop::silent(2),
            Hop::answered(3, target),
        ];
        Ok(Box::new(hops.into_iter()))
    }
}

struct TableLocator(HashMap<&'static str, HopLocation>);

impl TableLocator {
    fn new() -> Self {
        let mut table = HashMap::new();
        table.insert(TOKYO_HOP, HopLocation::new(35.6895, 139.6917, "Tokyo", "Japan"));
        table.insert(
            LONDON_HOP,
            HopLocation::new(51.5074, -0.1278, "London", "United Kingdom"),
        );
        Self(table)
    }
}

impl HopLocator for TableLocator {
    fn locate(&self, address: &str) -> Option<HopLocation> {
        self.0.get(address).cloned()
    }
}

fn config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.database.path = dir.path().join("race.db");
    config
}

fn open(config: Config) -> RaceService {
    RaceService::with_components(config, Arc::new(ScriptedProber), Arc::new(TableLocator::new()))
        .unwrap()
}

fn tokyo() -> NewChallenge {
    NewChallenge {
        city_name: "Tokyo, Japan".to_string(),
        city_lat: 35.6762,
        city_lon: 139.6503,
        radius_km: Some(100.0),
        target_host: "8.8.8.8".to_string(),
        duration_hours: Some(24),
    }
}

fn run_probe(service: &RaceService, target: &str, player: &str) -> Vec<ProbeEvent> {
    let rx = service
        .probe(ProbeRequest::new(target).for_participant(player))
        .unwrap();
    rx.iter().collect()
}

fn won_rank(events: &[ProbeEvent]) -> Option<u32> {
    events.iter().find_map(|e| match e {
        ProbeEvent::RaceSuccess { rank, .. } => Some(*rank),
        _ => None,
    })
}

/// Challenge plus two registered participants, written to disk
fn seed_race(dir: &tempfile::TempDir) -> (String, String) {
    let setup = open(config(dir));
    setup.create_challenge(tokyo()).unwrap();
    let alice = setup.register(None, "Alice").unwrap();
    let bob = setup.register(None, "Bob").unwrap();
    (alice.id, bob.id)
}

#[test]
fn test_full_race_and_restart() {
    let dir = tempfile::tempdir().unwrap();
    let service = open(config(&dir));
    let observer = service.subscribe();

    let challenge = service.create_challenge(tokyo()).unwrap();
    assert!(matches!(
        observer.recv_timeout(Duration::from_secs(1)).unwrap(),
        BroadcastEvent::ChallengeCreated { .. }
    ));

    let alice = service.register(None, "Alice").unwrap();
    let bob = service.register(None, "Bob").unwrap();
    for _ in 0..2 {
        assert!(matches!(
            observer.recv_timeout(Duration::from_secs(1)).unwrap(),
            BroadcastEvent::ParticipantJoined { .. }
        ));
    }

    // Both waiting
    let board = service.scoreboard().unwrap();
    assert_eq!(board.results.len(), 2);
    assert!(board.results.iter().all(|e| e.status == EntryStatus::Waiting));

    // Alice misses from London, then arrives in Tokyo
    let events = run_probe(&service, LONDON_HOP, &alice.id);
    assert!(matches!(events[0], ProbeEvent::Start { is_race: true, .. }));
    assert!(matches!(events[events.len() - 2], ProbeEvent::RaceFailed { .. }));
    assert!(events.last().unwrap().is_end());

    let events = run_probe(&service, TOKYO_HOP, &alice.id);
    assert!(matches!(
        events[events.len() - 2],
        ProbeEvent::RaceSuccess { rank: 1, points: 10, .. }
    ));
    match observer.recv_timeout(Duration::from_secs(1)).unwrap() {
        BroadcastEvent::RaceFinished { record, .. } => assert_eq!(record.player_id, alice.id),
        other => panic!("unexpected broadcast {other:?}"),
    }

    let events = run_probe(&service, TOKYO_HOP, &bob.id);
    assert!(matches!(
        events[events.len() - 2],
        ProbeEvent::RaceSuccess { rank: 2, points: 9, .. }
    ));

    let export = service.export().unwrap().unwrap();
    assert_eq!(export.challenge.id, challenge.id);
    assert_eq!(export.results.len(), 2);
    assert_eq!(export.results[0].player_name, "Alice");
    assert_eq!(export.results[1].rank, 2);

    let stats = service.stats().unwrap();
    assert_eq!(stats.players, 2);
    assert_eq!(stats.results, 2);
    assert_eq!(stats.active_races, 0);
    drop(service);

    // Everything survives a restart and ranking continues
    let service = open(config(&dir));
    let board = service.scoreboard().unwrap();
    let ranks: Vec<u32> = board.results.iter().map(|e| e.record.rank).collect();
    assert_eq!(ranks, vec![1, 2]);

    let carol = service.register(None, "Carol").unwrap();
    let events = run_probe(&service, TOKYO_HOP, &carol.id);
    assert!(matches!(
        events[events.len() - 2],
        ProbeEvent::RaceSuccess { rank: 3, points: 8, .. }
    ));
    assert_eq!(service.export().unwrap().unwrap().results.len(), 3);
}

#[test]
fn test_failed_attempt_keeps_placeholder() {
    let dir = tempfile::tempdir().unwrap();
    let service = open(config(&dir));
    service.create_challenge(tokyo()).unwrap();
    let alice = service.register(None, "Alice").unwrap();

    let events = run_probe(&service, LONDON_HOP, &alice.id);
    match &events[events.len() - 2] {
        ProbeEvent::RaceFailed {
            distance_km,
            required_radius_km,
            ..
        } => {
            assert!(*distance_km > 9000.0);
            assert_eq!(*required_radius_km, 100.0);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let board = service.scoreboard().unwrap();
    assert_eq!(board.results.len(), 1);
    let entry = &board.results[0];
    assert_eq!(entry.status, EntryStatus::Waiting);
    assert_eq!(entry.record.rank, UNRANKED);
    assert_eq!(entry.record.points, 0);
    assert_eq!(entry.record.final_hop_city, "London");
}

#[test]
fn test_probe_without_challenge_is_plain_trace() {
    let dir = tempfile::tempdir().unwrap();
    let service = open(config(&dir));
    let alice = service.register(None, "Alice").unwrap();

    let events = run_probe(&service, TOKYO_HOP, &alice.id);
    assert_eq!(events.len(), 5);
    assert!(matches!(
        events[0],
        ProbeEvent::Start {
            is_race: false,
            challenge: None,
            ..
        }
    ));
    assert!(service.scoreboard().is_none());
    assert!(service.export().unwrap().is_none());
}

#[test]
fn test_challenge_mode_toggle_and_export_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let service = open(config(&dir));
    let challenge = service.create_challenge(tokyo()).unwrap();
    let observer = service.subscribe();

    service.set_challenge_mode(false).unwrap();
    assert_eq!(
        observer.recv_timeout(Duration::from_secs(1)).unwrap(),
        BroadcastEvent::ChallengeModeChanged { enabled: false }
    );
    assert!(service.scoreboard().is_none());
    assert_eq!(service.export().unwrap().unwrap().challenge.id, challenge.id);

    service.set_challenge_mode(true).unwrap();
    assert_eq!(service.scoreboard().unwrap().challenge.id, challenge.id);
}

#[test]
fn test_seed_default_challenge_once() {
    let dir = tempfile::tempdir().unwrap();
    let service = open(config(&dir));
    let seeded = service.seed_default_challenge().unwrap().unwrap();
    assert_eq!(seeded.city_name, "Tokyo, Japan");
    assert_eq!(seeded.radius_km, 100.0);
    assert!(service.seed_default_challenge().unwrap().is_none());
}

#[test]
fn test_invalid_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let service = open(config(&dir));
    assert!(matches!(
        service.register(None, ""),
        Err(ServiceError::InvalidName(_))
    ));
    assert!(matches!(
        service.probe(ProbeRequest::new("  ")),
        Err(ServiceError::InvalidAddress(_))
    ));
    assert!(matches!(
        service.locate("not-an-ip"),
        Err(ServiceError::InvalidAddress(_))
    ));
    assert_eq!(
        service.locate(TOKYO_HOP).unwrap().unwrap().display_name(),
        "Tokyo, Japan"
    );
}

// ---------------------------------------------------------------------------
// Several processes
// ---------------------------------------------------------------------------

#[test]
fn test_services_sharing_a_database_assign_distinct_ranks() {
    let dir = tempfile::tempdir().unwrap();
    let (alice, bob) = seed_race(&dir);

    // Each service stands for a separate `probe` process with its own cache
    let first = open(config(&dir));
    let second = open(config(&dir));
    assert_eq!(won_rank(&run_probe(&first, TOKYO_HOP, &alice)), Some(1));
    assert_eq!(won_rank(&run_probe(&second, TOKYO_HOP, &bob)), Some(2));
    drop(first);
    drop(second);

    let reopened = open(config(&dir));
    let ranks: Vec<u32> = reopened
        .export()
        .unwrap()
        .unwrap()
        .results
        .iter()
        .map(|r| r.rank)
        .collect();
    assert_eq!(ranks, vec![1, 2]);
}

#[test]
fn test_concurrent_services_sharing_a_database() {
    let dir = tempfile::tempdir().unwrap();
    let (alice, bob) = seed_race(&dir);
    let first = open(config(&dir));
    let second = open(config(&dir));

    let mut ranks: Vec<Option<u32>> = thread::scope(|s| {
        let a = s.spawn(|| won_rank(&run_probe(&first, TOKYO_HOP, &alice)));
        let b = s.spawn(|| won_rank(&run_probe(&second, TOKYO_HOP, &bob)));
        vec![a.join().unwrap(), b.join().unwrap()]
    });
    ranks.sort_unstable();
    assert_eq!(ranks, vec![Some(1), Some(2)]);
}

// ---------------------------------------------------------------------------
// Running server
// ---------------------------------------------------------------------------

fn next_broadcast(ws: &mut WebSocket<MaybeTlsStream<TcpStream>>) -> BroadcastEvent {
    let text = ws.read().unwrap().into_text().unwrap();
    serde_json::from_str(&text).unwrap()
}

#[test]
fn test_requests_to_running_server_reach_observers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.observer.bind = "127.0.0.1:0".to_string();
    let service = Arc::new(open(config));
    let server = service.start_observer().unwrap();
    let addr = server.local_addr().to_string();

    let (mut observer, _) = tungstenite::connect(format!("ws://{addr}/")).unwrap();
    if let MaybeTlsStream::Plain(stream) = observer.get_ref() {
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while service.stats().unwrap().observers == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }

    // Another process talks to the server instead of opening the database
    let mut client = ControlClient::connect(&addr).unwrap();
    let challenge = client.create_challenge(tokyo()).unwrap();
    match next_broadcast(&mut observer) {
        BroadcastEvent::ChallengeCreated { challenge: created } => {
            assert_eq!(created.id, challenge.id)
        }
        other => panic!("unexpected broadcast {other:?}"),
    }

    let alice = client.register(None, "Alice").unwrap();
    assert!(matches!(
        next_broadcast(&mut observer),
        BroadcastEvent::ParticipantJoined { .. }
    ));

    let events: Vec<ProbeEvent> = client
        .probe(ProbeRequest::new(TOKYO_HOP).for_participant(&alice.id))
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(won_rank(&events), Some(1));
    assert!(events.last().unwrap().is_end());
    match next_broadcast(&mut observer) {
        BroadcastEvent::RaceFinished { record, .. } => assert_eq!(record.player_id, alice.id),
        other => panic!("unexpected broadcast {other:?}"),
    }

    client.set_challenge_mode(false).unwrap();
    assert_eq!(
        next_broadcast(&mut observer),
        BroadcastEvent::ChallengeModeChanged { enabled: false }
    );

    // The server's own view holds the result
    let export = service.export().unwrap().unwrap();
    assert_eq!(export.results.len(), 1);
    assert_eq!(export.results[0].rank, 1);
}

#[test]
fn test_server_reports_refused_request() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.observer.bind = "127.0.0.1:0".to_string();
    let service = Arc::new(open(config));
    let server = service.start_observer().unwrap();

    let mut client = ControlClient::connect(&server.local_addr().to_string()).unwrap();
    assert!(client.register(None, "   ").is_err());
    // The connection stays usable
    assert_eq!(client.register(None, "Alice").unwrap().display_name, "Alice");
}
