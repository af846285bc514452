use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use roadwatch_core::{AnomalyEvent, AnomalyKind, LocationStatus, Severity};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

pub const AGGREGATE_SCHEMA_VERSION: i64 = 2;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const LOCATION_COLUMNS: &str = "
    grid_id,
    latitude,
    longitude,
    total_potholes,
    total_patchy,
    highest_severity,
    report_count,
    first_reported_at,
    last_reported_at,
    status
";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("invalid anomaly event: {0}")]
    InvalidEvent(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("connection lock poisoned")]
    Poisoned,
}

/// One row of the aggregation table: everything reported inside one grid cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedLocation {
    pub grid_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub total_potholes: u64,
    pub total_patchy: u64,
    pub highest_severity: Severity,
    pub report_count: u64,
    pub first_reported_at: DateTime<Utc>,
    pub last_reported_at: DateTime<Utc>,
    pub status: LocationStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Inserted,
    Merged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub grid_id: String,
    pub action: UpsertAction,
    pub highest_severity: Severity,
    pub report_count: u64,
}

/// Version of a source record whose events are being aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceVersion<'a> {
    pub path: &'a str,
    pub fingerprint: &'a str,
}

/// Result of aggregating one source record version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceApply {
    /// False when this version was aggregated by an earlier call.
    pub applied: bool,
    pub outcomes: Vec<UpsertOutcome>,
}

pub struct AggregateStore {
    conn: Mutex<Connection>,
}

impl AggregateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.connection()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > AGGREGATE_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: AGGREGATE_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let conn = self.connection()?;
            let sql = include_str!("../migrations/0001_aggregated_locations.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        if current < 2 {
            let conn = self.connection()?;
            let sql = include_str!("../migrations/0002_processed_sources.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 2", []).map(|_| ())?;
        }

        Ok(())
    }

    /// Merges one event into its grid cell.
    pub fn upsert_event(&self, event: &AnomalyEvent) -> Result<UpsertOutcome, StorageError> {
        let mut outcomes = self.upsert_events(std::slice::from_ref(event))?;
        outcomes
            .pop()
            .ok_or_else(|| StorageError::InvalidEvent("no outcome for event".to_string()))
    }

    /// Merges all events derived from one source record inside a single
    /// immediate transaction. Any failure rolls back every event of the call.
    pub fn upsert_events(
        &self,
        events: &[AnomalyEvent],
    ) -> Result<Vec<UpsertOutcome>, StorageError> {
        let now = Utc::now();
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            outcomes.push(upsert_in_tx(&tx, event, now)?);
        }

        tx.commit()?;
        Ok(outcomes)
    }

    /// Like [`Self::upsert_events`], but records the source version in the same
    /// transaction. A version already recorded is not aggregated again, so a
    /// record whose outcome never reached the event store can be retried.
    pub fn apply_source_events(
        &self,
        source: SourceVersion<'_>,
        events: &[AnomalyEvent],
    ) -> Result<SourceApply, StorageError> {
        let now = Utc::now();
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let seen = tx
            .query_row(
                "SELECT 1 FROM processed_sources WHERE source_path = ?1 AND fingerprint = ?2",
                params![source.path, source.fingerprint],
                |_| Ok(()),
            )
            .optional()?;
        if seen.is_some() {
            return Ok(SourceApply {
                applied: false,
                outcomes: Vec::new(),
            });
        }

        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            outcomes.push(upsert_in_tx(&tx, event, now)?);
        }
        tx.execute(
            "
            INSERT INTO processed_sources (source_path, fingerprint, event_count, processed_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![
                source.path,
                source.fingerprint,
                events.len() as i64,
                format_timestamp(now),
            ],
        )?;

        tx.commit()?;
        Ok(SourceApply {
            applied: true,
            outcomes,
        })
    }

    pub fn location(&self, grid_id: &str) -> Result<Option<AggregatedLocation>, StorageError> {
        let conn = self.connection()?;
        let location = conn
            .query_row(
                &format!("SELECT {LOCATION_COLUMNS} FROM aggregated_locations WHERE grid_id = ?1"),
                [grid_id],
                map_location,
            )
            .optional()?;
        Ok(location)
    }

    /// Aggregates ordered worst first: severity, then report volume, then recency.
    pub fn ranked_locations(&self, limit: usize) -> Result<Vec<AggregatedLocation>, StorageError> {
        let conn = self.connection()?;
        let rank = severity_rank_sql();
        let mut statement = conn.prepare(&format!(
            "
            SELECT {LOCATION_COLUMNS}
            FROM aggregated_locations
            ORDER BY
                {rank} DESC,
                report_count DESC,
                last_reported_at DESC,
                grid_id ASC
            LIMIT ?1
            "
        ))?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = statement.query_map([limit], map_location)?;

        let mut locations = Vec::new();
        for row in rows {
            locations.push(row?);
        }
        Ok(locations)
    }

    pub fn location_count(&self) -> Result<i64, StorageError> {
        let conn = self.connection()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM aggregated_locations", [], |row| {
            row.get(0)
        })?)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let conn = self.connection()?;
        let exists = conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

fn upsert_in_tx(
    conn: &Connection,
    event: &AnomalyEvent,
    now: DateTime<Utc>,
) -> Result<UpsertOutcome, StorageError> {
    let grid_id = event.grid_id().ok_or_else(|| {
        StorageError::InvalidEvent(format!(
            "non-finite coordinates {},{}",
            event.latitude, event.longitude
        ))
    })?;
    let reported_at = format_timestamp(event_time(event.timestamp_ms, now));
    let (pothole_increment, patchy_increment) = match event.kind {
        AnomalyKind::Pothole => (1i64, 0i64),
        AnomalyKind::Patchy => (0i64, 1i64),
    };

    let existing = conn
        .query_row(
            "SELECT highest_severity, report_count FROM aggregated_locations WHERE grid_id = ?1",
            [&grid_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;

    match existing {
        Some((stored_severity, report_count)) => {
            let stored_severity = stored_severity
                .parse::<Severity>()
                .map_err(StorageError::Serialization)?;
            let highest_severity = stored_severity.max(event.severity);
            conn.execute(
                "
                UPDATE aggregated_locations SET
                    total_potholes = total_potholes + ?2,
                    total_patchy = total_patchy + ?3,
                    highest_severity = ?4,
                    report_count = report_count + 1,
                    last_reported_at = ?5
                WHERE grid_id = ?1
                ",
                params![
                    grid_id,
                    pothole_increment,
                    patchy_increment,
                    highest_severity.as_str(),
                    reported_at,
                ],
            )?;
            Ok(UpsertOutcome {
                grid_id,
                action: UpsertAction::Merged,
                highest_severity,
                report_count: report_count as u64 + 1,
            })
        }
        None => {
            conn.execute(
                "
                INSERT INTO aggregated_locations (
                    grid_id,
                    latitude,
                    longitude,
                    total_potholes,
                    total_patchy,
                    highest_severity,
                    report_count,
                    first_reported_at,
                    last_reported_at,
                    status
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7, ?8)
                ",
                params![
                    grid_id,
                    event.latitude,
                    event.longitude,
                    pothole_increment,
                    patchy_increment,
                    event.severity.as_str(),
                    reported_at,
                    LocationStatus::Pending.as_str(),
                ],
            )?;
            Ok(UpsertOutcome {
                grid_id,
                action: UpsertAction::Inserted,
                highest_severity: event.severity,
                report_count: 1,
            })
        }
    }
}

fn severity_rank_sql() -> String {
    let arms: String = [Severity::High, Severity::Medium, Severity::Low]
        .iter()
        .map(|severity| format!(" WHEN '{}' THEN {}", severity.as_str(), severity.rank()))
        .collect();
    format!("CASE highest_severity{arms} ELSE 0 END")
}

fn map_location(row: &Row<'_>) -> rusqlite::Result<AggregatedLocation> {
    let highest_severity = row
        .get::<_, String>(5)?
        .parse::<Severity>()
        .map_err(|err| conversion_error(5, err))?;
    let status = row
        .get::<_, String>(9)?
        .parse::<LocationStatus>()
        .map_err(|err| conversion_error(9, err))?;
    let first_reported_at = parse_timestamp(row.get::<_, String>(7)?)
        .map_err(|err| conversion_error(7, err.to_string()))?;
    let last_reported_at = parse_timestamp(row.get::<_, String>(8)?)
        .map_err(|err| conversion_error(8, err.to_string()))?;

    Ok(AggregatedLocation {
        grid_id: row.get(0)?,
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        total_potholes: row.get::<_, i64>(3)? as u64,
        total_patchy: row.get::<_, i64>(4)? as u64,
        highest_severity,
        report_count: row.get::<_, i64>(6)? as u64,
        first_reported_at,
        last_reported_at,
        status,
    })
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, message.into())
}

fn event_time(timestamp_ms: Option<i64>, now: DateTime<Utc>) -> DateTime<Utc> {
    timestamp_ms
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        .unwrap_or(now)
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}
