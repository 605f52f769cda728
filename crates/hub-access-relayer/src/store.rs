use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use hub_access_protocol::AccessStatus;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::state_machine::Approver;

const INIT_MIGRATION_SQL: &str = include_str!("migrations/0001_init.sql");

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessRequestRecord {
    pub id: String,
    pub wallet_address: String,
    pub hub_id: String,
    pub status: AccessStatus,
    pub signature: Option<String>,
    pub signature_scheme: Option<String>,
    pub approved_by: Option<Approver>,
    pub verified_at_ms: Option<u64>,
    pub last_accessed_at_ms: Option<u64>,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: i64,
    pub access_request_id: String,
    pub event_type: String,
    pub detail_json: JsonValue,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessRequestSnapshot {
    pub access_request: AccessRequestRecord,
    pub events: Vec<EventRecord>,
}

/// Storage collaborator owning access-request records.
///
/// The relay never caches records across calls; every flow reads through
/// `find_by_id` and writes through `save`.
pub trait AccessRequestStore: Send + Sync {
    fn find_by_id(&self, id: &str) -> Result<Option<AccessRequestRecord>>;

    fn save(&self, record: &AccessRequestRecord) -> Result<()>;

    fn record_event(
        &self,
        _access_request_id: &str,
        _event_type: &str,
        _detail_json: &JsonValue,
        _created_at_ms: u64,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create database parent dir '{}'",
                    parent.display()
                )
            })?;
        }

        let conn = Connection::open(&db_path)
            .with_context(|| format!("failed to open sqlite database '{}'", db_path.display()))?;
        conn.execute_batch(INIT_MIGRATION_SQL)
            .context("failed to apply initial sqlite migration")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("failed to enable foreign keys")?;

        Ok(Self { db_path })
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path).with_context(|| {
            format!(
                "failed to open sqlite database '{}'",
                self.db_path.display()
            )
        })?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("failed to enable foreign keys")?;
        Ok(conn)
    }

    // Production rows come from the hub management system sharing this database.
    #[cfg(test)]
    pub fn insert_access_request(
        &self,
        record: &AccessRequestRecord,
    ) -> Result<AccessRequestRecord> {
        let conn = self.connection()?;

        conn.execute(
            "INSERT INTO access_requests (
                id, wallet_address, hub_id, status,
                signature, signature_scheme, approved_by,
                verified_at_ms, last_accessed_at_ms, created_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id,
                record.wallet_address,
                record.hub_id,
                record.status.as_str(),
                record.signature,
                record.signature_scheme,
                record.approved_by.map(Approver::as_str),
                opt_i64(record.verified_at_ms)?,
                opt_i64(record.last_accessed_at_ms)?,
                to_i64(record.created_at_ms)?
            ],
        )
        .with_context(|| format!("failed to insert access request '{}'", record.id))?;

        self.get_access_request(&record.id)?
            .context("inserted access request but failed to fetch it back")
    }

    pub fn get_access_request(&self, id: &str) -> Result<Option<AccessRequestRecord>> {
        let conn = self.connection()?;

        let mut stmt = conn.prepare(
            "SELECT
                id, wallet_address, hub_id, status,
                signature, signature_scheme, approved_by,
                verified_at_ms, last_accessed_at_ms, created_at_ms
             FROM access_requests
             WHERE id = ?1",
        )?;

        stmt.query_row(params![id], row_to_access_request)
            .optional()
            .context("failed to fetch access request")
    }

    pub fn update_access_request(&self, record: &AccessRequestRecord) -> Result<()> {
        let conn = self.connection()?;

        let updated = conn
            .execute(
                "UPDATE access_requests
                 SET status = ?2,
                     signature = ?3,
                     signature_scheme = ?4,
                     approved_by = ?5,
                     verified_at_ms = ?6,
                     last_accessed_at_ms = ?7
                 WHERE id = ?1",
                params![
                    record.id,
                    record.status.as_str(),
                    record.signature,
                    record.signature_scheme,
                    record.approved_by.map(Approver::as_str),
                    opt_i64(record.verified_at_ms)?,
                    opt_i64(record.last_accessed_at_ms)?
                ],
            )
            .with_context(|| format!("failed to update access request '{}'", record.id))?;

        if updated == 0 {
            bail!("access request '{}' does not exist", record.id);
        }

        Ok(())
    }

    pub fn add_event(
        &self,
        access_request_id: &str,
        event_type: &str,
        detail_json: &JsonValue,
        created_at_ms: u64,
    ) -> Result<()> {
        let conn = self.connection()?;

        conn.execute(
            "INSERT INTO relay_events (access_request_id, event_type, detail_json, created_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                access_request_id,
                event_type,
                serde_json::to_string(detail_json).context("failed to serialize event details")?,
                to_i64(created_at_ms)?
            ],
        )
        .with_context(|| format!("failed to insert event '{event_type}'"))?;

        Ok(())
    }

    pub fn access_request_snapshot(&self, id: &str) -> Result<Option<AccessRequestSnapshot>> {
        let Some(access_request) = self.get_access_request(id)? else {
            return Ok(None);
        };

        let conn = self.connection()?;

        let mut event_stmt = conn.prepare(
            "SELECT
                id, access_request_id, event_type, detail_json, created_at_ms
             FROM relay_events
             WHERE access_request_id = ?1
             ORDER BY id ASC",
        )?;

        let events = event_stmt
            .query_map(params![id], row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to read access request events")?;

        Ok(Some(AccessRequestSnapshot {
            access_request,
            events,
        }))
    }

    pub fn prune_events(&self, older_than_ms: u64) -> Result<usize> {
        let conn = self.connection()?;

        let deleted = conn
            .execute(
                "DELETE FROM relay_events WHERE created_at_ms < ?1",
                params![to_i64(older_than_ms)?],
            )
            .context("failed to prune old events")?;

        Ok(deleted)
    }
}

impl AccessRequestStore for SqliteStore {
    fn find_by_id(&self, id: &str) -> Result<Option<AccessRequestRecord>> {
        self.get_access_request(id)
    }

    fn save(&self, record: &AccessRequestRecord) -> Result<()> {
        self.update_access_request(record)
    }

    fn record_event(
        &self,
        access_request_id: &str,
        event_type: &str,
        detail_json: &JsonValue,
        created_at_ms: u64,
    ) -> Result<()> {
        self.add_event(access_request_id, event_type, detail_json, created_at_ms)
    }
}

fn row_to_access_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccessRequestRecord> {
    let status_raw: String = row.get(3)?;
    let approved_by_raw: Option<String> = row.get(6)?;

    Ok(AccessRequestRecord {
        id: row.get(0)?,
        wallet_address: row.get(1)?,
        hub_id: row.get(2)?,
        status: status_raw
            .parse::<AccessStatus>()
            .map_err(|error| conversion_error(3, error))?,
        signature: row.get(4)?,
        signature_scheme: row.get(5)?,
        approved_by: approved_by_raw
            .map(|raw| {
                Approver::parse(&raw).ok_or_else(|| {
                    conversion_error(
                        6,
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("invalid stored approver '{raw}'"),
                        ),
                    )
                })
            })
            .transpose()?,
        verified_at_ms: row.get(7)?,
        last_accessed_at_ms: row.get(8)?,
        created_at_ms: row.get::<_, u64>(9)?,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRecord> {
    let detail_json_text: String = row.get(3)?;
    let detail_json =
        serde_json::from_str(&detail_json_text).map_err(|error| conversion_error(3, error))?;

    Ok(EventRecord {
        id: row.get(0)?,
        access_request_id: row.get(1)?,
        event_type: row.get(2)?,
        detail_json,
        created_at_ms: row.get::<_, u64>(4)?,
    })
}

fn conversion_error(
    column: usize,
    error: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(error))
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).context("u64 timestamp does not fit into i64")
}

fn opt_i64(value: Option<u64>) -> Result<Option<i64>> {
    value.map(to_i64).transpose()
}

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    use super::*;

    pub(crate) fn pending_request(id: &str, wallet: &str, hub_id: &str) -> AccessRequestRecord {
        AccessRequestRecord {
            id: id.to_string(),
            wallet_address: wallet.to_string(),
            hub_id: hub_id.to_string(),
            status: AccessStatus::Pending,
            signature: None,
            signature_scheme: None,
            approved_by: None,
            verified_at_ms: None,
            last_accessed_at_ms: None,
            created_at_ms: 1_700_000_000_000,
        }
    }

    pub(crate) fn temp_store() -> (TempDir, SqliteStore) {
        let dir = tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("nested/relay.sqlite3")).expect("store");
        (dir, store)
    }

    #[test]
    fn inserts_and_reads_back_access_request() {
        let (_dir, store) = temp_store();
        let inserted = store
            .insert_access_request(&pending_request("r1", "0xAbC", "H1"))
            .expect("insert");

        assert_eq!(inserted, pending_request("r1", "0xAbC", "H1"));
        assert!(store.find_by_id("missing").expect("lookup").is_none());
    }

    #[test]
    fn save_persists_status_fields() {
        let (_dir, store) = temp_store();
        store
            .insert_access_request(&pending_request("r1", "0xabc", "H1"))
            .expect("insert");

        let mut record = pending_request("r1", "0xabc", "H1");
        record.status = AccessStatus::Accessed;
        record.signature = Some("a@b.c".to_string());
        record.signature_scheme = Some("LEGACY_TOKEN".to_string());
        record.approved_by = Some(Approver::Signature);
        record.verified_at_ms = Some(10);
        record.last_accessed_at_ms = Some(20);
        store.save(&record).expect("save");

        assert_eq!(store.find_by_id("r1").expect("lookup"), Some(record));
    }

    #[test]
    fn save_of_unknown_record_fails() {
        let (_dir, store) = temp_store();
        let err = store
            .save(&pending_request("ghost", "0xabc", "H1"))
            .expect_err("must fail");
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn snapshot_includes_events_and_prune_removes_old_ones() {
        let (_dir, store) = temp_store();
        store
            .insert_access_request(&pending_request("r1", "0xabc", "H1"))
            .expect("insert");
        store
            .record_event("r1", "signature_requested", &json!({ "hub_id": "H1" }), 100)
            .expect("event");
        store
            .record_event("r1", "access_granted", &json!({ "scheme": "ECDSA_HEX" }), 500)
            .expect("event");

        let snapshot = store
            .access_request_snapshot("r1")
            .expect("snapshot")
            .expect("exists");
        assert_eq!(snapshot.events.len(), 2);
        assert_eq!(snapshot.events[0].event_type, "signature_requested");
        assert_eq!(snapshot.events[1].detail_json["scheme"], "ECDSA_HEX");

        assert_eq!(store.prune_events(200).expect("prune"), 1);
        let snapshot = store
            .access_request_snapshot("r1")
            .expect("snapshot")
            .expect("exists");
        assert_eq!(snapshot.events.len(), 1);
        assert!(store.access_request_snapshot("missing").expect("snapshot").is_none());
    }
}
