//! Durable store: embedded SQLite persistence.
//!
//! Tables: scans, pass_types, device_state, broadcast_queue, settings.
//! Batch appends are transactional; a crash mid-batch leaves all or none.
//! Schema evolution is additive and forward-only: missing columns are added
//! in place on open.
//!
//! The in-memory replica is the source of truth once loaded; callers treat
//! transient write failures by logging and continuing, and periodic
//! full-state sync heals divergence across restarts.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::core::{
    DayKey, DeviceId, IdSource, PassRule, PassType, PeerPhase, PeerRecord, ScanEvent, ScanId,
};
use crate::error::Transience;

const BUSY_TIMEOUT_MS: u64 = 5_000;
const SETTING_DEVICE_ID: &str = "device_id";
const SETTING_PASS_SNAPSHOT: &str = "pass_snapshot";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("row decode failed in {table}: {reason}")]
    Decode { table: &'static str, reason: String },
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        match self {
            // Locked/busy databases clear up; schema and decode problems do not.
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => match err.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    Transience::Retryable
                }
                _ => Transience::Unknown,
            },
            StoreError::Sqlite(_) => Transience::Unknown,
            StoreError::Io { .. } => Transience::Retryable,
            StoreError::Decode { .. } => Transience::Permanent,
        }
    }
}

/// A queued broadcast payload whose original send failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedBroadcast {
    pub id: i64,
    pub payload: Vec<u8>,
    pub attempts: u32,
}

/// Synchronous-semantics persistence surface. One writer: the engine's
/// state thread owns the connection.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at `path` and bring the schema current.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;

        let store = Self { conn };
        store.initialize_schema()?;
        store.migrate()?;
        Ok(store)
    }

    /// In-memory database, for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.initialize_schema()?;
        store.migrate()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS scans (
                 scan_id TEXT PRIMARY KEY,
                 code TEXT NOT NULL,
                 ts_ms INTEGER NOT NULL,
                 device_id TEXT NOT NULL,
                 day TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS scans_code_ts ON scans(code, ts_ms);
             CREATE INDEX IF NOT EXISTS scans_code_day ON scans(code, day);
             CREATE TABLE IF NOT EXISTS pass_types (
                 code TEXT PRIMARY KEY,
                 pass_type TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS device_state (
                 device_id TEXT PRIMARY KEY,
                 ip TEXT,
                 last_seen_ms INTEGER NOT NULL DEFAULT 0,
                 last_heartbeat_ms INTEGER NOT NULL DEFAULT 0,
                 state_hash TEXT
             );
             CREATE TABLE IF NOT EXISTS broadcast_queue (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 payload BLOB NOT NULL,
                 attempts INTEGER NOT NULL DEFAULT 0,
                 enqueued_ms INTEGER NOT NULL DEFAULT 0
             );
             CREATE TABLE IF NOT EXISTS settings (
                 key TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );",
        )?;
        Ok(())
    }

    /// Forward-only additive migrations: columns added after first release.
    fn migrate(&self) -> Result<(), StoreError> {
        self.ensure_column("pass_types", "days", "TEXT")?;
        self.ensure_column("pass_types", "uses", "INTEGER NOT NULL DEFAULT 0")?;
        self.ensure_column(
            "device_state",
            "phase",
            "TEXT NOT NULL DEFAULT 'discovering'",
        )?;
        Ok(())
    }

    fn ensure_column(
        &self,
        table: &'static str,
        column: &'static str,
        ddl: &'static str,
    ) -> Result<(), StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({table})"))?;
        let mut present = false;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            if name == column {
                present = true;
                break;
            }
        }
        drop(rows);
        drop(stmt);
        if !present {
            tracing::info!(table, column, "adding missing column");
            self.conn.execute_batch(&format!(
                "ALTER TABLE {table} ADD COLUMN {column} {ddl}"
            ))?;
        }
        Ok(())
    }

    // === Scans ===

    /// Idempotent on scan id: replaying an event is a no-op.
    pub fn append_scan(&mut self, event: &ScanEvent) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO scans (scan_id, code, ts_ms, device_id, day)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.scan_id.to_string(),
                event.code,
                event.ts_ms,
                event.device_id.to_string(),
                event.day.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Atomic batch append: all events land or none do.
    pub fn append_scans_batch(&mut self, events: &[ScanEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO scans (scan_id, code, ts_ms, device_id, day)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for event in events {
                stmt.execute(params![
                    event.scan_id.to_string(),
                    event.code,
                    event.ts_ms,
                    event.device_id.to_string(),
                    event.day.as_str(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_scans_for(&self, code: &str) -> Result<Vec<ScanEvent>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT scan_id, code, ts_ms, device_id, day FROM scans
             WHERE code = ?1 ORDER BY ts_ms ASC, device_id ASC",
        )?;
        let rows = stmt.query([code])?;
        collect_scans(rows)
    }

    pub fn load_scans_for_day(
        &self,
        code: &str,
        day: &DayKey,
    ) -> Result<Vec<ScanEvent>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT scan_id, code, ts_ms, device_id, day FROM scans
             WHERE code = ?1 AND day = ?2 ORDER BY ts_ms ASC, device_id ASC",
        )?;
        let rows = stmt.query(params![code, day.as_str()])?;
        collect_scans(rows)
    }

    /// The whole log, for replica rebuild at boot.
    pub fn load_all_scans(&self) -> Result<Vec<ScanEvent>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT scan_id, code, ts_ms, device_id, day FROM scans
             ORDER BY ts_ms ASC, device_id ASC",
        )?;
        let rows = stmt.query([])?;
        collect_scans(rows)
    }

    pub fn scan_count(&self) -> Result<u64, StoreError> {
        let count: u64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM scans", [], |row| row.get(0))?;
        Ok(count)
    }

    // === Pass types ===

    pub fn upsert_pass_type(&mut self, code: &str, rule: &PassRule) -> Result<(), StoreError> {
        let days_json = match &rule.days {
            Some(days) => Some(serde_json::to_string(days).map_err(|e| StoreError::Decode {
                table: "pass_types",
                reason: e.to_string(),
            })?),
            None => None,
        };
        self.conn.execute(
            "INSERT INTO pass_types (code, pass_type, days, uses) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(code) DO UPDATE SET pass_type = ?2, days = ?3, uses = ?4",
            params![code, rule.pass_type.as_str(), days_json, rule.uses],
        )?;
        Ok(())
    }

    pub fn load_pass_types(&self) -> Result<Vec<(String, PassType)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT code, pass_type FROM pass_types ORDER BY code ASC")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let code: String = row.get(0)?;
            let raw: String = row.get(1)?;
            let pass_type = PassType::parse(&raw).ok_or_else(|| StoreError::Decode {
                table: "pass_types",
                reason: format!("unknown pass type `{raw}`"),
            })?;
            out.push((code, pass_type));
        }
        Ok(out)
    }

    // === Peers ===

    pub fn upsert_peer(&mut self, record: &PeerRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO device_state (device_id, ip, last_seen_ms, last_heartbeat_ms, state_hash, phase)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(device_id) DO UPDATE SET
                 ip = ?2, last_seen_ms = ?3, last_heartbeat_ms = ?4, state_hash = ?5, phase = ?6",
            params![
                record.device_id.to_string(),
                record.ip.map(|ip| ip.to_string()),
                record.last_seen_ms,
                record.last_heartbeat_ms,
                record.state_hash,
                record.phase.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn load_peers(&self) -> Result<Vec<PeerRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, ip, last_seen_ms, last_heartbeat_ms, state_hash, phase
             FROM device_state ORDER BY device_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let raw_id: String = row.get(0)?;
            let device_id = DeviceId::parse(&raw_id).map_err(|e| StoreError::Decode {
                table: "device_state",
                reason: e.to_string(),
            })?;
            let ip: Option<String> = row.get(1)?;
            let ip = ip.and_then(|raw| raw.parse::<IpAddr>().ok());
            let raw_phase: String = row.get(5)?;
            out.push(PeerRecord {
                device_id,
                ip,
                last_seen_ms: row.get(2)?,
                last_heartbeat_ms: row.get(3)?,
                state_hash: row.get(4)?,
                phase: PeerPhase::parse(&raw_phase).unwrap_or(PeerPhase::Discovering),
            });
        }
        Ok(out)
    }

    // === Broadcast retry queue ===

    pub fn enqueue_broadcast(&mut self, payload: &[u8], now_ms: u64) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO broadcast_queue (payload, attempts, enqueued_ms) VALUES (?1, 0, ?2)",
            params![payload, now_ms],
        )?;
        Ok(())
    }

    /// Oldest-first entries still under the attempt cap.
    pub fn next_broadcasts(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<QueuedBroadcast>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, payload, attempts FROM broadcast_queue
             WHERE attempts < ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![max_attempts, limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(QueuedBroadcast {
                id: row.get(0)?,
                payload: row.get(1)?,
                attempts: row.get(2)?,
            });
        }
        Ok(out)
    }

    pub fn bump_broadcast_attempts(&mut self, id: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE broadcast_queue SET attempts = attempts + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn delete_broadcast(&mut self, id: i64) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM broadcast_queue WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn broadcast_queue_len(&self) -> Result<u64, StoreError> {
        let count: u64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM broadcast_queue", [], |row| row.get(0))?;
        Ok(count)
    }

    // === Settings ===

    /// Stable for the life of the install; generated through `ids` once.
    pub fn get_or_create_device_id(
        &mut self,
        ids: &dyn IdSource,
    ) -> Result<DeviceId, StoreError> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![SETTING_DEVICE_ID],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(raw) = existing {
            return DeviceId::parse(&raw).map_err(|e| StoreError::Decode {
                table: "settings",
                reason: e.to_string(),
            });
        }
        let fresh = ids.device_id();
        self.conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)",
            params![SETTING_DEVICE_ID, fresh.to_string()],
        )?;
        Ok(fresh)
    }

    pub fn save_pass_snapshot(&mut self, json: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![SETTING_PASS_SNAPSHOT, json],
        )?;
        Ok(())
    }

    pub fn load_pass_snapshot(&self) -> Result<Option<String>, StoreError> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![SETTING_PASS_SNAPSHOT],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }
}

fn collect_scans(mut rows: rusqlite::Rows<'_>) -> Result<Vec<ScanEvent>, StoreError> {
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(scan_from_row(row)?);
    }
    Ok(out)
}

fn scan_from_row(row: &rusqlite::Row<'_>) -> Result<ScanEvent, StoreError> {
    let decode = |reason: String| StoreError::Decode {
        table: "scans",
        reason,
    };
    let raw_scan: String = row.get(0)?;
    let raw_device: String = row.get(3)?;
    let raw_day: String = row.get(4)?;
    Ok(ScanEvent {
        scan_id: ScanId::parse(&raw_scan).map_err(|e| decode(e.to_string()))?,
        code: row.get(1)?,
        ts_ms: row.get(2)?,
        device_id: DeviceId::parse(&raw_device).map_err(|e| decode(e.to_string()))?,
        day: DayKey::parse(&raw_day).map_err(|e| decode(e.to_string()))?,
    })
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use crate::core::UuidIds;

    use super::*;

    fn event(id_seed: u8, code: &str, ts_ms: u64) -> ScanEvent {
        ScanEvent {
            scan_id: ScanId::new(Uuid::from_bytes([id_seed; 16])),
            code: code.into(),
            ts_ms,
            device_id: DeviceId::new(Uuid::from_bytes([9u8; 16])),
            day: DayKey::parse("14nov").unwrap(),
        }
    }

    #[test]
    fn scan_roundtrip_sorted() {
        let mut store = Store::open_in_memory().unwrap();
        store.append_scan(&event(2, "A", 200)).unwrap();
        store.append_scan(&event(1, "A", 100)).unwrap();
        store.append_scan(&event(3, "B", 50)).unwrap();

        let scans = store.load_scans_for("A").unwrap();
        assert_eq!(scans.len(), 2);
        assert_eq!(scans[0], event(1, "A", 100));
        assert_eq!(scans[1], event(2, "A", 200));
        assert_eq!(store.load_all_scans().unwrap().len(), 3);
    }

    #[test]
    fn append_is_idempotent_on_scan_id() {
        let mut store = Store::open_in_memory().unwrap();
        store.append_scan(&event(1, "A", 100)).unwrap();
        store.append_scan(&event(1, "A", 100)).unwrap();
        store
            .append_scans_batch(&[event(1, "A", 100), event(2, "A", 150)])
            .unwrap();
        assert_eq!(store.scan_count().unwrap(), 2);
    }

    #[test]
    fn day_filter() {
        let mut store = Store::open_in_memory().unwrap();
        let mut other_day = event(4, "A", 300);
        other_day.day = DayKey::parse("15nov").unwrap();
        store
            .append_scans_batch(&[event(1, "A", 100), other_day])
            .unwrap();

        let day = DayKey::parse("14nov").unwrap();
        let today = store.load_scans_for_day("A", &day).unwrap();
        assert_eq!(today.len(), 1);
        assert_eq!(today[0].ts_ms, 100);
    }

    #[test]
    fn peer_roundtrip() {
        let mut store = Store::open_in_memory().unwrap();
        let mut record = PeerRecord::new(DeviceId::new(Uuid::from_bytes([3u8; 16])));
        record.ip = Some("192.168.1.40".parse().unwrap());
        record.last_seen_ms = 123;
        record.state_hash = Some("3-aa-bb".into());
        record.phase = PeerPhase::Synced;
        store.upsert_peer(&record).unwrap();

        record.last_seen_ms = 456;
        store.upsert_peer(&record).unwrap();

        let peers = store.load_peers().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0], record);
    }

    #[test]
    fn broadcast_queue_lifecycle() {
        let mut store = Store::open_in_memory().unwrap();
        store.enqueue_broadcast(b"one", 1).unwrap();
        store.enqueue_broadcast(b"two", 2).unwrap();

        let pending = store.next_broadcasts(5, 10).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].payload, b"one");

        store.bump_broadcast_attempts(pending[0].id).unwrap();
        store.delete_broadcast(pending[1].id).unwrap();

        let pending = store.next_broadcasts(5, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);

        // Entries at the cap are no longer offered.
        for _ in 0..4 {
            store.bump_broadcast_attempts(pending[0].id).unwrap();
        }
        assert!(store.next_broadcasts(5, 10).unwrap().is_empty());
        assert_eq!(store.broadcast_queue_len().unwrap(), 1);
    }

    #[test]
    fn device_id_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.sqlite");
        let first = {
            let mut store = Store::open(&path).unwrap();
            store.get_or_create_device_id(&UuidIds).unwrap()
        };
        let second = {
            let mut store = Store::open(&path).unwrap();
            store.get_or_create_device_id(&UuidIds).unwrap()
        };
        assert_eq!(first, second);
    }

    #[test]
    fn pass_snapshot_blob_roundtrip() {
        let mut store = Store::open_in_memory().unwrap();
        assert!(store.load_pass_snapshot().unwrap().is_none());
        store.save_pass_snapshot("{\"passes\":{}}").unwrap();
        store.save_pass_snapshot("{\"passes\":{\"A\":{\"type\":\"infinite\"}}}").unwrap();
        let blob = store.load_pass_snapshot().unwrap().unwrap();
        assert!(blob.contains("\"A\""));
    }

    #[test]
    fn pass_type_rows_roundtrip() {
        let mut store = Store::open_in_memory().unwrap();
        let rule = PassRule {
            pass_type: PassType::OneUse,
            days: Some(vec![DayKey::parse("14nov").unwrap()]),
            uses: 3,
        };
        store.upsert_pass_type("GOLD", &rule).unwrap();
        let rows = store.load_pass_types().unwrap();
        assert_eq!(rows, vec![("GOLD".to_string(), PassType::OneUse)]);
    }

    #[test]
    fn additive_migration_upgrades_old_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.sqlite");
        {
            // First-release schema: no days/uses/phase columns.
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE pass_types (code TEXT PRIMARY KEY, pass_type TEXT NOT NULL);
                 CREATE TABLE device_state (
                     device_id TEXT PRIMARY KEY,
                     ip TEXT,
                     last_seen_ms INTEGER NOT NULL DEFAULT 0,
                     last_heartbeat_ms INTEGER NOT NULL DEFAULT 0,
                     state_hash TEXT
                 );
                 INSERT INTO pass_types (code, pass_type) VALUES ('X', 'infinite');",
            )
            .unwrap();
        }

        let mut store = Store::open(&path).unwrap();
        let rule = PassRule {
            pass_type: PassType::Infinite,
            days: None,
            uses: 7,
        };
        store.upsert_pass_type("X", &rule).unwrap();
        let mut record = PeerRecord::new(DeviceId::new(Uuid::from_bytes([5u8; 16])));
        record.phase = PeerPhase::Lost;
        store.upsert_peer(&record).unwrap();
        assert_eq!(store.load_peers().unwrap()[0].phase, PeerPhase::Lost);
    }
}
