//! Core module - platform-independent race engine

pub mod broadcast;
pub mod format;
pub mod geofence;
pub mod leaderboard;
pub mod model;
pub mod orchestrator;
pub mod protocol;
pub mod session;
pub mod traceroute;
pub mod traits;
pub mod types;

pub use broadcast::EventBroadcaster;
pub use format::{format_location, round_km};
pub use geofence::{distance_km, Geofence};
pub use leaderboard::{LeaderboardStore, PersistError, RecordPersistence, StoreError};
pub use model::{Challenge, LeaderboardEntry, Participant, RaceRecord, UNRANKED};
pub use orchestrator::{ProbeOutcome, ProbeRequest, RaceOrchestrator};
pub use protocol::{BroadcastEvent, ProbeEvent};
pub use session::RaceSessionTracker;
pub use traits::{ChallengeDirectory, HopLocator, HopStream, PathProber, PlayerDirectory, ProbeError};
pub use types::{GeoPoint, Hop, HopLocation};
