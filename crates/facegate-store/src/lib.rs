//! SQLite persistence for facegate.
//!
//! One connection behind a mutex, shared by every engine worker. Writes that
//! touch reference images and the registration flag run inside
//! `BEGIN IMMEDIATE` transactions so concurrent replaces of the same identity
//! serialize on the database write lock.

use chrono::{NaiveDateTime, NaiveTime, Timelike};
use facegate_core::store::{
    CheckinRecord, CheckinSink, IdentityStore, LocationHistory, ReferenceStore, StoreError,
};
use facegate_core::types::{
    CheckinEvent, GeoPoint, Identity, LocationPoint, ReferenceImage, Shift, ShiftWindow,
};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const TIME_FORMAT: &str = "%H:%M:%S";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("identity {0} already has a reference image")]
    Conflict(String),
    #[error("bad stored value in {column}: {value}")]
    BadValue { column: &'static str, value: String },
    #[error("connection mutex poisoned")]
    Poisoned,
    #[error("create database directory: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::UnknownIdentity(id) => StoreError::UnknownIdentity(id),
            DbError::Conflict(id) => StoreError::Conflict(id),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

type Result<T, E = DbError> = std::result::Result<T, E>;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self::from_connection(Connection::open(path)?)?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    /// Create or update an identity's anchor, radius and shift.
    ///
    /// The registration flag is owned by the reference-image operations and
    /// is left untouched on update.
    pub fn upsert_identity(&self, identity: &Identity) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO identities (id, anchor_lat, anchor_lon, radius_km, shift_id, face_registered)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)
             ON CONFLICT(id) DO UPDATE SET
                anchor_lat = excluded.anchor_lat,
                anchor_lon = excluded.anchor_lon,
                radius_km = excluded.radius_km,
                shift_id = excluded.shift_id",
            params![
                identity.id,
                identity.anchor.map(|a| a.latitude),
                identity.anchor.map(|a| a.longitude),
                identity.geofence_radius_km,
                identity.shift_id,
            ],
        )?;
        tracing::debug!(identity = %identity.id, "identity upserted");
        Ok(())
    }

    pub fn upsert_shift(&self, shift: &Shift) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO shifts (id, start_time, end_time, overnight) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                overnight = excluded.overnight",
            params![
                shift.id,
                shift.start.format(TIME_FORMAT).to_string(),
                shift.end.format(TIME_FORMAT).to_string(),
                shift.overnight,
            ],
        )?;
        Ok(())
    }

    pub fn list_identities(&self) -> Result<Vec<Identity>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, anchor_lat, anchor_lon, radius_km, shift_id, face_registered
             FROM identities ORDER BY id",
        )?;
        let rows = stmt.query_map([], identity_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Recorded check-ins of one identity, oldest first.
    pub fn checkins(&self, identity_id: &str) -> Result<Vec<CheckinEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT identity_id, timestamp, device_id, latitude, longitude, distance_km, confidence
             FROM checkins WHERE identity_id = ?1 ORDER BY timestamp, rowid",
        )?;
        let mut rows = stmt.query(params![identity_id])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            let timestamp: String = row.get(1)?;
            events.push(CheckinEvent {
                identity_id: row.get(0)?,
                timestamp: parse_timestamp(&timestamp)?,
                device_id: row.get(2)?,
                location: GeoPoint::new(row.get(3)?, row.get(4)?),
                distance_km: row.get(5)?,
                confidence: row.get(6)?,
            });
        }
        Ok(events)
    }

    fn identity_row(&self, id: &str) -> Result<Option<Identity>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT id, anchor_lat, anchor_lon, radius_km, shift_id, face_registered
                 FROM identities WHERE id = ?1",
                params![id],
                identity_from_row,
            )
            .optional()?)
    }

    fn shift_row(&self, id: &str) -> Result<Option<Shift>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT id, start_time, end_time, overnight FROM shifts WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, bool>(3)?,
                    ))
                },
            )
            .optional()?;
        raw.map(|(id, start, end, overnight)| -> Result<Shift> {
            Ok(Shift {
                id,
                start: parse_time("start_time", &start)?,
                end: parse_time("end_time", &end)?,
                overnight,
            })
        })
        .transpose()
    }

    fn attachment_rows(&self, identity_id: &str) -> Result<Vec<ReferenceImage>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, identity_id, content, digest, created_at FROM reference_images
             WHERE identity_id = ?1 ORDER BY created_at DESC, rowid DESC",
        )?;
        let mut rows = stmt.query(params![identity_id])?;
        let mut found = Vec::new();
        while let Some(row) = rows.next()? {
            let created_at: String = row.get(4)?;
            found.push(ReferenceImage {
                id: row.get(0)?,
                identity_id: row.get(1)?,
                content: row.get(2)?,
                digest: row.get(3)?,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(found)
    }

    /// Swap attachments and flag in one IMMEDIATE transaction.
    ///
    /// `exclusive` rejects the write when any attachment already exists.
    fn write_reference(
        &self,
        identity_id: &str,
        content: &[u8],
        at: NaiveDateTime,
        exclusive: bool,
    ) -> Result<ReferenceImage> {
        // Stored at whole seconds; return what a later read will see.
        let at = at.with_nanosecond(0).unwrap_or(at);
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        set_flag(&tx, identity_id, true)?;
        let existing: i64 = tx.query_row(
            "SELECT COUNT(*) FROM reference_images WHERE identity_id = ?1",
            params![identity_id],
            |row| row.get(0),
        )?;
        if exclusive && existing > 0 {
            return Err(DbError::Conflict(identity_id.to_string()));
        }
        tx.execute(
            "DELETE FROM reference_images WHERE identity_id = ?1",
            params![identity_id],
        )?;

        let reference = ReferenceImage {
            id: Uuid::new_v4().to_string(),
            identity_id: identity_id.to_string(),
            content: content.to_vec(),
            digest: format!("{:x}", Sha256::digest(content)),
            created_at: at,
        };
        tx.execute(
            "INSERT INTO reference_images (id, identity_id, content, digest, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                reference.id,
                reference.identity_id,
                reference.content,
                reference.digest,
                format_timestamp(at),
            ],
        )?;
        tx.commit()?;

        tracing::debug!(identity = identity_id, replaced = existing, "reference row written");
        Ok(reference)
    }

    fn clear_references(&self, identity_id: &str) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        set_flag(&tx, identity_id, false)?;
        let removed = tx.execute(
            "DELETE FROM reference_images WHERE identity_id = ?1",
            params![identity_id],
        )?;
        tx.commit()?;
        Ok(removed)
    }

    fn insert_checkin(&self, event: &CheckinEvent) -> Result<CheckinRecord> {
        let conn = self.lock()?;
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO checkins
                (id, identity_id, timestamp, device_id, latitude, longitude, distance_km, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                event.identity_id,
                format_timestamp(event.timestamp),
                event.device_id,
                event.location.latitude,
                event.location.longitude,
                event.distance_km,
                event.confidence,
            ],
        )?;
        Ok(CheckinRecord { id })
    }

    fn insert_point(&self, point: &LocationPoint) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO location_history (identity_id, latitude, longitude, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                point.identity_id,
                point.location.latitude,
                point.location.longitude,
                format_timestamp(point.recorded_at),
            ],
        )?;
        Ok(())
    }

    fn query_points(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<LocationPoint>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(args)?;
        let mut points = Vec::new();
        while let Some(row) = rows.next()? {
            let recorded_at: String = row.get(3)?;
            points.push(LocationPoint {
                identity_id: row.get(0)?,
                location: GeoPoint::new(row.get(1)?, row.get(2)?),
                recorded_at: parse_timestamp(&recorded_at)?,
            });
        }
        Ok(points)
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS shifts (
            id TEXT PRIMARY KEY,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            overnight INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS identities (
            id TEXT PRIMARY KEY,
            anchor_lat REAL,
            anchor_lon REAL,
            radius_km REAL,
            shift_id TEXT,
            face_registered INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS reference_images (
            id TEXT PRIMARY KEY,
            identity_id TEXT NOT NULL REFERENCES identities(id),
            content BLOB NOT NULL,
            digest TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_reference_identity ON reference_images(identity_id);

        CREATE TABLE IF NOT EXISTS checkins (
            id TEXT PRIMARY KEY,
            identity_id TEXT NOT NULL REFERENCES identities(id),
            timestamp TEXT NOT NULL,
            device_id TEXT,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            distance_km REAL NOT NULL,
            confidence REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_checkins_identity ON checkins(identity_id, timestamp);

        CREATE TABLE IF NOT EXISTS location_history (
            identity_id TEXT NOT NULL REFERENCES identities(id),
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            recorded_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_location_identity
            ON location_history(identity_id, recorded_at);
        "#,
    )
}

fn set_flag(conn: &Connection, identity_id: &str, value: bool) -> Result<()> {
    let changed = conn.execute(
        "UPDATE identities SET face_registered = ?2 WHERE id = ?1",
        params![identity_id, value],
    )?;
    if changed == 0 {
        return Err(DbError::UnknownIdentity(identity_id.to_string()));
    }
    Ok(())
}

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<Identity> {
    let lat: Option<f64> = row.get(1)?;
    let lon: Option<f64> = row.get(2)?;
    Ok(Identity {
        id: row.get(0)?,
        anchor: lat.zip(lon).map(|(lat, lon)| GeoPoint::new(lat, lon)),
        geofence_radius_km: row.get(3)?,
        shift_id: row.get(4)?,
        face_registered: row.get(5)?,
    })
}

fn format_timestamp(at: NaiveDateTime) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).map_err(|_| DbError::BadValue {
        column: "timestamp",
        value: raw.to_string(),
    })
}

fn parse_time(column: &'static str, raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw, TIME_FORMAT).map_err(|_| DbError::BadValue {
        column,
        value: raw.to_string(),
    })
}

impl IdentityStore for SqliteStore {
    fn identity(&self, id: &str) -> Result<Option<Identity>, StoreError> {
        Ok(self.identity_row(id)?)
    }

    fn shift(&self, id: &str) -> Result<Option<Shift>, StoreError> {
        Ok(self.shift_row(id)?)
    }
}

impl ReferenceStore for SqliteStore {
    fn attachments(&self, identity_id: &str) -> Result<Vec<ReferenceImage>, StoreError> {
        Ok(self.attachment_rows(identity_id)?)
    }

    fn install(
        &self,
        identity_id: &str,
        content: &[u8],
        at: NaiveDateTime,
    ) -> Result<ReferenceImage, StoreError> {
        Ok(self.write_reference(identity_id, content, at, true)?)
    }

    fn replace(
        &self,
        identity_id: &str,
        content: &[u8],
        at: NaiveDateTime,
    ) -> Result<ReferenceImage, StoreError> {
        Ok(self.write_reference(identity_id, content, at, false)?)
    }

    fn clear(&self, identity_id: &str) -> Result<usize, StoreError> {
        Ok(self.clear_references(identity_id)?)
    }
}

impl CheckinSink for SqliteStore {
    fn record(&self, event: &CheckinEvent) -> Result<CheckinRecord, StoreError> {
        Ok(self.insert_checkin(event)?)
    }
}

impl LocationHistory for SqliteStore {
    fn track(&self, point: &LocationPoint) -> Result<(), StoreError> {
        Ok(self.insert_point(point)?)
    }

    fn points_between(
        &self,
        identity_id: &str,
        window: &ShiftWindow,
    ) -> Result<Vec<LocationPoint>, StoreError> {
        Ok(self.query_points(
            "SELECT identity_id, latitude, longitude, recorded_at FROM location_history
             WHERE identity_id = ?1 AND recorded_at >= ?2 AND recorded_at < ?3
             ORDER BY recorded_at, rowid",
            params![
                identity_id,
                format_timestamp(window.start),
                format_timestamp(window.end)
            ],
        )?)
    }

    fn latest_per_identity(&self) -> Result<Vec<LocationPoint>, StoreError> {
        // SQLite returns the bare columns of the row that produced MAX().
        Ok(self.query_points(
            "SELECT identity_id, latitude, longitude, MAX(recorded_at) FROM location_history
             GROUP BY identity_id ORDER BY identity_id",
            params![],
        )?)
    }
}
