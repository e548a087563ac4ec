//! SQLite persistence
//!
//! One connection shared by every caller, serialized behind its own lock.
//! Other processes may open the same file; rank assignment runs inside an
//! immediate transaction so their arrivals are serialized with ours.
//! Timestamps are stored as RFC 3339 UTC text with microsecond precision so
//! that ordering by the text column is ordering by time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};

use crate::core::leaderboard::{PersistError, RankedRow, RecordPersistence};
use crate::core::model::{next_rank, points_for_rank, Challenge, Participant, RaceRecord, UNRANKED};

/// How long a writer waits for another process holding the file lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS players (
    id           TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS challenges (
    id          TEXT PRIMARY KEY,
    city_name   TEXT NOT NULL,
    city_lat    REAL NOT NULL,
    city_lon    REAL NOT NULL,
    radius_km   REAL NOT NULL,
    target_host TEXT NOT NULL,
    start_time  TEXT NOT NULL,
    end_time    TEXT,
    created_at  TEXT NOT NULL,
    is_active   INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS race_results (
    id                     INTEGER PRIMARY KEY AUTOINCREMENT,
    player_id              TEXT NOT NULL,
    player_name            TEXT NOT NULL,
    challenge_id           TEXT NOT NULL,
    finish_time            TEXT NOT NULL,
    rank                   INTEGER NOT NULL,
    points                 INTEGER NOT NULL,
    final_hop_lat          REAL NOT NULL,
    final_hop_lon          REAL NOT NULL,
    final_hop_city         TEXT NOT NULL,
    final_hop_country      TEXT NOT NULL,
    total_hops             INTEGER NOT NULL,
    trace_duration_seconds REAL NOT NULL
);
";

const RESULT_COLUMNS: &str = "id, player_id, player_name, challenge_id, finish_time, rank, points, \
     final_hop_lat, final_hop_lon, final_hop_city, final_hop_country, total_hops, \
     trace_duration_seconds, distance_from_target_km";

const CHALLENGE_COLUMNS: &str =
    "id, city_name, city_lat, city_lon, radius_km, target_host, start_time, end_time, created_at";

impl From<rusqlite::Error> for PersistError {
    fn from(e: rusqlite::Error) -> Self {
        PersistError::new(format!("sqlite: {e}"))
    }
}

pub struct Database {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Database {
    /// Open (or create) the database file and bring its schema up to date
    pub fn open(path: &Path) -> Result<Self, PersistError> {
        let conn = Connection::open(path)?;
        let db = Self::with_connection(conn, path.to_path_buf())?;
        info!(path = %path.display(), "[DB] Opened database");
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, PersistError> {
        Self::with_connection(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn with_connection(conn: Connection, path: PathBuf) -> Result<Self, PersistError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // -------------------------------------------------------------------------
    // Players
    // -------------------------------------------------------------------------

    pub fn save_player(&self, player: &Participant) -> Result<(), PersistError> {
        self.conn.lock().execute(
            "INSERT INTO players (id, display_name, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name",
            params![player.id, player.display_name, to_text(&player.created_at)],
        )?;
        Ok(())
    }

    pub fn load_players(&self) -> Result<Vec<Participant>, PersistError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, display_name, created_at FROM players")?;
        let players = stmt
            .query_map([], |row| {
                Ok(Participant {
                    id: row.get(0)?,
                    display_name: row.get(1)?,
                    created_at: timestamp(row, 2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(players)
    }

    // -------------------------------------------------------------------------
    // Challenges
    // -------------------------------------------------------------------------

    pub fn save_challenge(&self, challenge: &Challenge, active: bool) -> Result<(), PersistError> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO challenges
             (id, city_name, city_lat, city_lon, radius_km, target_host,
              start_time, end_time, created_at, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                challenge.id,
                challenge.city_name,
                challenge.city_lat,
                challenge.city_lon,
                challenge.radius_km,
                challenge.target_host,
                to_text(&challenge.start_time),
                challenge.end_time.as_ref().map(to_text),
                to_text(&challenge.created_at),
                active,
            ],
        )?;
        Ok(())
    }

    /// Challenges flagged active, in insertion order
    pub fn load_active_challenges(&self) -> Result<Vec<Challenge>, PersistError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHALLENGE_COLUMNS} FROM challenges WHERE is_active = 1 ORDER BY rowid"
        ))?;
        let challenges = stmt
            .query_map([], challenge_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(challenges)
    }

    /// Most recently created challenge, active or not
    pub fn latest_challenge(&self) -> Result<Option<Challenge>, PersistError> {
        let conn = self.conn.lock();
        let challenge = conn
            .query_row(
                &format!(
                    "SELECT {CHALLENGE_COLUMNS} FROM challenges ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                [],
                challenge_from_row,
            )
            .optional()?;
        Ok(challenge)
    }

    /// Flip the active flag on every challenge; returns rows touched
    pub fn set_all_challenges_active(&self, active: bool) -> Result<usize, PersistError> {
        let n = self
            .conn
            .lock()
            .execute("UPDATE challenges SET is_active = ?1", params![active])?;
        debug!(active, rows = n, "[DB] Challenge mode updated");
        Ok(n)
    }

    pub fn challenge_count(&self) -> Result<usize, PersistError> {
        let n: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM challenges", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    // -------------------------------------------------------------------------
    // Race results
    // -------------------------------------------------------------------------

    /// Every race record in finish-time order
    pub fn load_race_results(&self) -> Result<Vec<RaceRecord>, PersistError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RESULT_COLUMNS} FROM race_results ORDER BY finish_time, id"
        ))?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = records.len(), "[DB] Loaded race results");
        Ok(records)
    }
}

impl RecordPersistence for Database {
    fn insert_record(&self, r: &RaceRecord) -> Result<i64, PersistError> {
        Ok(insert_row(&self.conn.lock(), r)?)
    }

    fn update_record(&self, row_id: i64, r: &RaceRecord) -> Result<(), PersistError> {
        if update_row(&self.conn.lock(), row_id, r)? == 0 {
            return Err(PersistError::new(format!("race result {row_id} not found")));
        }
        Ok(())
    }

    fn finalize_record(&self, r: &RaceRecord) -> Result<Option<RankedRow>, PersistError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let finalized: u32 = tx.query_row(
            "SELECT COUNT(*) FROM race_results WHERE challenge_id = ?1 AND rank != ?2",
            params![r.challenge_id, UNRANKED],
            |row| row.get(0),
        )?;
        let Some(rank) = next_rank(finalized) else {
            return Ok(None);
        };

        let placeholder: Option<i64> = tx
            .query_row(
                "SELECT id FROM race_results
                 WHERE player_id = ?1 AND challenge_id = ?2 AND rank = ?3
                 ORDER BY id LIMIT 1",
                params![r.player_id, r.challenge_id, UNRANKED],
                |row| row.get(0),
            )
            .optional()?;

        let mut ranked = r.clone();
        ranked.rank = rank;
        ranked.points = points_for_rank(rank);
        let row_id = match placeholder {
            Some(id) => {
                update_row(&tx, id, &ranked)?;
                id
            }
            None => insert_row(&tx, &ranked)?,
        };
        tx.commit()?;

        debug!(row_id, rank, challenge = %r.challenge_id, "[DB] Arrival ranked");
        Ok(Some(RankedRow { row_id, rank }))
    }
}

fn insert_row(conn: &Connection, r: &RaceRecord) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO race_results
         (player_id, player_name, challenge_id, finish_time, rank, points,
          final_hop_lat, final_hop_lon, final_hop_city, final_hop_country,
          total_hops, trace_duration_seconds, distance_from_target_km)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            r.player_id,
            r.player_name,
            r.challenge_id,
            to_text(&r.finish_time),
            r.rank,
            r.points,
            r.final_hop_lat,
            r.final_hop_lon,
            r.final_hop_city,
            r.final_hop_country,
            r.total_hops,
            r.trace_duration_seconds,
            r.distance_from_target_km,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Returns rows touched
fn update_row(conn: &Connection, row_id: i64, r: &RaceRecord) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE race_results SET
         player_name = ?2, finish_time = ?3, rank = ?4, points = ?5,
         final_hop_lat = ?6, final_hop_lon = ?7, final_hop_city = ?8,
         final_hop_country = ?9, total_hops = ?10, trace_duration_seconds = ?11,
         distance_from_target_km = ?12
         WHERE id = ?1",
        params![
            row_id,
            r.player_name,
            to_text(&r.finish_time),
            r.rank,
            r.points,
            r.final_hop_lat,
            r.final_hop_lon,
            r.final_hop_city,
            r.final_hop_country,
            r.total_hops,
            r.trace_duration_seconds,
            r.distance_from_target_km,
        ],
    )
}

// =============================================================================
// SCHEMA MIGRATION
// =============================================================================

fn migrate(conn: &Connection) -> Result<(), PersistError> {
    let mut stmt = conn.prepare("PRAGMA table_info(race_results)")?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;

    if !columns.iter().any(|c| c == "distance_from_target_km") {
        conn.execute(
            "ALTER TABLE race_results ADD COLUMN distance_from_target_km REAL DEFAULT 0",
            [],
        )?;
        info!("[DB] Added distance_from_target_km to race_results");
    }
    Ok(())
}

// =============================================================================
// ROW DECODING
// =============================================================================

fn to_text(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_timestamp(idx, &text)
}

fn challenge_from_row(row: &Row<'_>) -> rusqlite::Result<Challenge> {
    let end_time = row
        .get::<_, Option<String>>(7)?
        .map(|text| parse_timestamp(7, &text))
        .transpose()?;
    Ok(Challenge {
        id: row.get(0)?,
        city_name: row.get(1)?,
        city_lat: row.get(2)?,
        city_lon: row.get(3)?,
        radius_km: row.get(4)?,
        target_host: row.get(5)?,
        start_time: timestamp(row, 6)?,
        end_time,
        created_at: timestamp(row, 8)?,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<RaceRecord> {
    Ok(RaceRecord {
        row_id: Some(row.get(0)?),
        player_id: row.get(1)?,
        player_name: row.get(2)?,
        challenge_id: row.get(3)?,
        finish_time: timestamp(row, 4)?,
        rank: row.get(5)?,
        points: row.get(6)?,
        final_hop_lat: row.get(7)?,
        final_hop_lon: row.get(8)?,
        final_hop_city: row.get(9)?,
        final_hop_country: row.get(10)?,
        total_hops: row.get(11)?,
        trace_duration_seconds: row.get(12)?,
        distance_from_target_km: row.get::<_, Option<f64>>(13)?.unwrap_or(0.0),
    })
}
