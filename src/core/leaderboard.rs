//! Leaderboard store - single writer of race records
//!
//! Holds every race record in memory and writes each change through to a
//! `RecordPersistence` backend. All read-modify-write sequences run under one
//! lock. Ranks are assigned by the backend while it writes the finalized
//! record, so they stay unique even when several processes share one
//! database file: ranks follow finalization order and can never collide.
//!
//! The durable write happens first, inside the critical section; memory is
//! only touched once the write succeeded. A failed write is retried once and
//! then reported, leaving memory equal to what is on disk.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::model::{
    points_for_rank, ArrivalAttempt, LeaderboardEntry, Participant, RaceRecord, MAX_RANK,
};

// =============================================================================
// PERSISTENCE
// =============================================================================

#[derive(Debug, Error)]
#[error("{message}")]
pub struct PersistError {
    pub message: String,
}

impl PersistError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Durable backing for race records
pub trait RecordPersistence: Send + Sync {
    /// Store a new record, returning its row id
    fn insert_record(&self, record: &RaceRecord) -> Result<i64, PersistError>;

    /// Overwrite the row `row_id` with `record`
    fn update_record(&self, row_id: i64, record: &RaceRecord) -> Result<(), PersistError>;

    /// Write `record` as a finished arrival. In one atomic step against
    /// every other writer of the backend: count the finalized rows of the
    /// record's challenge, take the next rank, then overwrite the
    /// participant's placeholder row (or insert a new row) with that rank
    /// and its points. Writes nothing and returns `None` once no rank below
    /// `UNRANKED` is left.
    fn finalize_record(&self, record: &RaceRecord) -> Result<Option<RankedRow>, PersistError>;
}

/// Row written by `RecordPersistence::finalize_record`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankedRow {
    pub row_id: i64,
    pub rank: u32,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("durable write failed after retry: {0}")]
    Persist(#[from] PersistError),
    #[error("challenge {challenge_id} has no ranks left (limit {limit})")]
    RanksExhausted { challenge_id: String, limit: u32 },
}

// =============================================================================
// STORE
// =============================================================================

pub struct LeaderboardStore {
    records: Mutex<Vec<RaceRecord>>,
    persistence: Arc<dyn RecordPersistence>,
}

impl LeaderboardStore {
    pub fn new(persistence: Arc<dyn RecordPersistence>) -> Self {
        Self::with_records(persistence, Vec::new())
    }

    /// Start from records reloaded at startup (finish-time order)
    pub fn with_records(persistence: Arc<dyn RecordPersistence>, records: Vec<RaceRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            persistence,
        }
    }

    /// Create the participant's placeholder for `challenge_id` unless they
    /// already have a record there. Returns the new placeholder, if any.
    pub fn ensure_placeholder(
        &self,
        participant: &Participant,
        challenge_id: &str,
    ) -> Result<Option<RaceRecord>, StoreError> {
        let mut records = self.records.lock();
        let exists = records
            .iter()
            .any(|r| r.player_id == participant.id && r.challenge_id == challenge_id);
        if exists {
            return Ok(None);
        }

        let mut record = RaceRecord::placeholder(participant, challenge_id, Utc::now());
        let row_id = self.persist(|| self.persistence.insert_record(&record))?;
        record.row_id = Some(row_id);
        records.push(record.clone());

        info!(
            participant = %participant.display_name,
            challenge = %challenge_id,
            "[STORE] Placeholder created"
        );
        Ok(Some(record))
    }

    /// Record a successful arrival with the next free rank
    pub fn finalize_success(
        &self,
        participant: &Participant,
        challenge_id: &str,
        attempt: &ArrivalAttempt,
    ) -> Result<RaceRecord, StoreError> {
        let mut records = self.records.lock();

        let placeholder = records
            .iter()
            .position(|r| r.is_placeholder_for(&participant.id, challenge_id));

        let mut record = match placeholder {
            Some(i) => records[i].clone(),
            None => RaceRecord::placeholder(participant, challenge_id, Utc::now()),
        };
        record.player_name = participant.display_name.clone();
        record.apply_attempt(attempt, Utc::now());

        let ranked = self
            .persist(|| self.persistence.finalize_record(&record))?
            .ok_or_else(|| StoreError::RanksExhausted {
                challenge_id: challenge_id.to_string(),
                limit: MAX_RANK,
            })?;
        record.row_id = Some(ranked.row_id);
        record.rank = ranked.rank;
        record.points = points_for_rank(ranked.rank);

        match placeholder {
            Some(i) => records[i] = record.clone(),
            None => records.push(record.clone()),
        }

        info!(
            participant = %participant.display_name,
            challenge = %challenge_id,
            rank = record.rank,
            points = record.points,
            "[STORE] Arrival finalized"
        );
        Ok(record)
    }

    /// Record a failed attempt on the participant's placeholder; rank and
    /// points stay unset
    pub fn finalize_failure(
        &self,
        participant: &Participant,
        challenge_id: &str,
        attempt: &ArrivalAttempt,
    ) -> Result<RaceRecord, StoreError> {
        let mut records = self.records.lock();

        let placeholder = records
            .iter()
            .position(|r| r.is_placeholder_for(&participant.id, challenge_id));

        let record = match placeholder {
            Some(i) => {
                let mut record = records[i].clone();
                record.player_name = participant.display_name.clone();
                record.apply_attempt(attempt, Utc::now());
                match record.row_id {
                    Some(row_id) => {
                        self.persist(|| self.persistence.update_record(row_id, &record))?
                    }
                    None => {
                        let row_id = self.persist(|| self.persistence.insert_record(&record))?;
                        record.row_id = Some(row_id);
                    }
                }
                records[i] = record.clone();
                record
            }
            None => {
                warn!(
                    participant = %participant.id,
                    challenge = %challenge_id,
                    "[STORE] No placeholder for failed attempt, creating one"
                );
                let mut record = RaceRecord::placeholder(participant, challenge_id, Utc::now());
                record.apply_attempt(attempt, Utc::now());
                let row_id = self.persist(|| self.persistence.insert_record(&record))?;
                record.row_id = Some(row_id);
                records.push(record.clone());
                record
            }
        };

        debug!(
            participant = %participant.display_name,
            distance_km = attempt.distance_km,
            "[STORE] Failed attempt recorded"
        );
        Ok(record)
    }

    /// Finalized records by rank, then waiting participants by name
    pub fn leaderboard_for(&self, challenge_id: &str) -> Vec<LeaderboardEntry> {
        let snapshot: Vec<RaceRecord> = {
            let records = self.records.lock();
            records
                .iter()
                .filter(|r| r.challenge_id == challenge_id)
                .cloned()
                .collect()
        };

        let (mut completed, mut waiting): (Vec<_>, Vec<_>) =
            snapshot.into_iter().partition(RaceRecord::is_finalized);
        completed.sort_by_key(|r| r.rank);
        waiting.sort_by(|a, b| a.player_name.cmp(&b.player_name));

        completed
            .into_iter()
            .chain(waiting)
            .map(LeaderboardEntry::from)
            .collect()
    }

    /// Every record of the challenge, ascending rank (unranked last)
    pub fn export_for(&self, challenge_id: &str) -> Vec<RaceRecord> {
        let mut results: Vec<RaceRecord> = {
            let records = self.records.lock();
            records
                .iter()
                .filter(|r| r.challenge_id == challenge_id)
                .cloned()
                .collect()
        };
        results.sort_by_key(|r| r.rank);
        results
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run a durable write, retrying once
    fn persist<T>(&self, op: impl Fn() -> Result<T, PersistError>) -> Result<T, StoreError> {
        match op() {
            Ok(v) => Ok(v),
            Err(first) => {
                warn!(error = %first, "[STORE] Durable write failed, retrying");
                op().map_err(StoreError::from)
            }
        }
    }
}

// =============================================================================
// TEST MOCKS
// =============================================================================


// =============================================================================
// TESTS
// =============================================================================
