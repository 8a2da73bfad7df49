//! SQLite-backed [`KeyRepository`].
//!
//! The one-active-identity and one-active-signed-prekey invariants are
//! enforced by partial unique indexes, so a buggy caller cannot violate them
//! even by bypassing the service layer. Every write runs in an `IMMEDIATE`
//! transaction, taking the write lock before the first read.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use zeroize::Zeroizing;

use crate::error::KeyStoreError;
use crate::record::{KeyKind, KeyRecord};
use crate::repository::{cursor_after, validate_batch, KeyRepository};

/// Key store schema version. Bump when the schema changes.
const KEYSTORE_SCHEMA_VERSION: i64 = 1;

const KEYSTORE_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS key_records (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    key_kind TEXT NOT NULL CHECK(key_kind IN ('identity','signed_prekey','prekey')),
    public_key BLOB NOT NULL,
    private_key BLOB,
    key_index INTEGER,
    signature BLOB,
    created_at INTEGER NOT NULL,
    expires_at INTEGER,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_key_records_prekey_index
    ON key_records(owner_id, key_index) WHERE key_kind = 'prekey';

CREATE UNIQUE INDEX IF NOT EXISTS idx_key_records_single_active
    ON key_records(owner_id, key_kind)
    WHERE is_active = 1 AND key_kind IN ('identity','signed_prekey');

CREATE INDEX IF NOT EXISTS idx_key_records_lookup
    ON key_records(owner_id, key_kind, is_active);

-- Highest prekey index ever issued, so deleted indexes are never reissued
CREATE TABLE IF NOT EXISTS prekey_cursors (
    owner_id TEXT PRIMARY KEY,
    next_index INTEGER NOT NULL
);
";

const COLUMNS: &str =
    "id, owner_id, key_kind, public_key, private_key, key_index, signature, created_at, expires_at, is_active";

pub struct SqliteKeyRepository {
    conn: Mutex<Connection>,
}

impl SqliteKeyRepository {
    /// Open (or create) a key store file and run migrations.
    pub fn open(path: &Path) -> Result<Self, KeyStoreError> {
        let conn = Connection::open(path).map_err(db_err("failed to open key store"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(db_err("failed to set WAL mode"))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, KeyStoreError> {
        let conn = Connection::open_in_memory().map_err(db_err("failed to open key store"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, KeyStoreError> {
        let current: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .map_err(db_err("failed to read schema version"))?;

        if current != KEYSTORE_SCHEMA_VERSION {
            // Key material is never dropped to recreate a schema.
            if current != 0 {
                return Err(KeyStoreError::Storage(format!(
                    "unsupported key store schema version {current} (expected {KEYSTORE_SCHEMA_VERSION})"
                )));
            }
            conn.execute_batch(KEYSTORE_SCHEMA)
                .map_err(db_err("failed to run key store schema"))?;
            conn.pragma_update(None, "user_version", KEYSTORE_SCHEMA_VERSION)
                .map_err(db_err("failed to set schema version"))?;
            tracing::info!(version = KEYSTORE_SCHEMA_VERSION, "key store schema created");
        }

        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| {
            tracing::error!("key store mutex poisoned — recovering");
            e.into_inner()
        })
    }
}

impl KeyRepository for SqliteKeyRepository {
    fn register_owner(&self, owner_id: &str, records: &[KeyRecord]) -> Result<(), KeyStoreError> {
        validate_batch(owner_id, records)?;
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("failed to begin registration"))?;

        if has_active_identity(&tx, owner_id)? {
            return Err(KeyStoreError::AlreadyRegistered(owner_id.to_string()));
        }
        for record in records {
            insert_record(&tx, record)?;
        }
        let cursor = read_cursor(&tx, owner_id)?;
        write_cursor(&tx, owner_id, cursor_after(cursor, records))?;

        tx.commit().map_err(db_err("failed to commit registration"))
    }

    fn find_active(&self, owner_id: &str, kind: KeyKind) -> Result<Option<KeyRecord>, KeyStoreError> {
        let conn = self.conn();
        select_one(
            &conn,
            &format!(
                "SELECT {COLUMNS} FROM key_records
                 WHERE owner_id = ?1 AND key_kind = ?2 AND is_active = 1
                 ORDER BY key_index LIMIT 1"
            ),
            params![owner_id, kind.as_str()],
        )
    }

    fn find_by_public(
        &self,
        owner_id: &str,
        kind: KeyKind,
        public_key: &[u8; 32],
    ) -> Result<Option<KeyRecord>, KeyStoreError> {
        let conn = self.conn();
        select_one(
            &conn,
            &format!(
                "SELECT {COLUMNS} FROM key_records
                 WHERE owner_id = ?1 AND key_kind = ?2 AND public_key = ?3
                 LIMIT 1"
            ),
            params![owner_id, kind.as_str(), &public_key[..]],
        )
    }

    fn take_prekey(&self, owner_id: &str) -> Result<Option<KeyRecord>, KeyStoreError> {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("failed to begin prekey reservation"))?;

        let Some(mut record) = select_one(
            &tx,
            &format!(
                "SELECT {COLUMNS} FROM key_records
                 WHERE owner_id = ?1 AND key_kind = 'prekey' AND is_active = 1
                 ORDER BY key_index LIMIT 1"
            ),
            params![owner_id],
        )?
        else {
            return Ok(None);
        };

        let changed = tx
            .execute(
                "UPDATE key_records SET is_active = 0 WHERE id = ?1 AND is_active = 1",
                params![record.id],
            )
            .map_err(db_err("failed to reserve prekey"))?;
        if changed != 1 {
            return Err(KeyStoreError::Storage(format!("prekey {} changed during reservation", record.id)));
        }
        tx.commit().map_err(db_err("failed to commit prekey reservation"))?;

        record.is_active = false;
        Ok(Some(record))
    }

    fn recent_signed_prekeys(&self, owner_id: &str, limit: usize) -> Result<Vec<KeyRecord>, KeyStoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn();
        // A new row always takes a rowid above every existing one.
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM key_records
                 WHERE owner_id = ?1 AND key_kind = 'signed_prekey'
                 ORDER BY rowid DESC LIMIT ?2"
            ))
            .map_err(db_err("failed to prepare signed prekey lookup"))?;
        let rows = stmt
            .query_map(params![owner_id, limit], raw_row)
            .map_err(db_err("failed to load signed prekeys"))?;

        rows.map(|row| row.map_err(db_err("failed to load signed prekeys")).and_then(KeyRecord::try_from))
            .collect()
    }

    fn remove_reserved_prekey(&self, owner_id: &str, index: u32) -> Result<Option<KeyRecord>, KeyStoreError> {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("failed to begin prekey removal"))?;

        let record = select_one(
            &tx,
            &format!(
                "SELECT {COLUMNS} FROM key_records
                 WHERE owner_id = ?1 AND key_kind = 'prekey' AND key_index = ?2 AND is_active = 0"
            ),
            params![owner_id, index],
        )?;
        if let Some(record) = &record {
            tx.execute("DELETE FROM key_records WHERE id = ?1", params![record.id])
                .map_err(db_err("failed to delete prekey"))?;
            tx.commit().map_err(db_err("failed to commit prekey removal"))?;
        }
        Ok(record)
    }

    fn rotate_signed_prekey(&self, owner_id: &str, record: &KeyRecord) -> Result<(), KeyStoreError> {
        validate_batch(owner_id, std::slice::from_ref(record))?;
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("failed to begin rotation"))?;

        if !has_active_identity(&tx, owner_id)? {
            return Err(KeyStoreError::not_found(owner_id, KeyKind::Identity));
        }
        tx.execute(
            "UPDATE key_records SET is_active = 0
             WHERE owner_id = ?1 AND key_kind = 'signed_prekey' AND is_active = 1",
            params![owner_id],
        )
        .map_err(db_err("failed to retire signed prekey"))?;
        insert_record(&tx, record)?;

        tx.commit().map_err(db_err("failed to commit rotation"))
    }

    fn insert_prekeys(&self, owner_id: &str, records: &[KeyRecord]) -> Result<(), KeyStoreError> {
        validate_batch(owner_id, records)?;
        if let Some(record) = records.iter().find(|r| r.key_kind != KeyKind::Prekey) {
            return Err(KeyStoreError::Storage(format!(
                "expected prekey records, got {}",
                record.key_kind
            )));
        }

        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("failed to begin prekey insert"))?;

        if !has_active_identity(&tx, owner_id)? {
            return Err(KeyStoreError::not_found(owner_id, KeyKind::Identity));
        }
        let cursor = read_cursor(&tx, owner_id)?;
        if let Some(index) = records.iter().filter_map(|r| r.key_index).find(|&i| i < cursor) {
            return Err(KeyStoreError::Storage(format!("prekey index {index} already issued")));
        }
        for record in records {
            insert_record(&tx, record)?;
        }
        write_cursor(&tx, owner_id, cursor_after(cursor, records))?;

        tx.commit().map_err(db_err("failed to commit prekey insert"))
    }

    fn count_active(&self, owner_id: &str, kind: KeyKind) -> Result<u32, KeyStoreError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT COUNT(*) FROM key_records WHERE owner_id = ?1 AND key_kind = ?2 AND is_active = 1",
            params![owner_id, kind.as_str()],
            |row| row.get(0),
        )
        .map_err(db_err("failed to count keys"))
    }

    fn next_prekey_index(&self, owner_id: &str) -> Result<u32, KeyStoreError> {
        let conn = self.conn();
        read_cursor(&conn, owner_id)
    }
}

fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> KeyStoreError {
    move |e| KeyStoreError::Storage(format!("{context}: {e}"))
}

fn has_active_identity(conn: &Connection, owner_id: &str) -> Result<bool, KeyStoreError> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM key_records
         WHERE owner_id = ?1 AND key_kind = 'identity' AND is_active = 1)",
        params![owner_id],
        |row| row.get(0),
    )
    .map_err(db_err("failed to look up identity"))
}

fn read_cursor(conn: &Connection, owner_id: &str) -> Result<u32, KeyStoreError> {
    let cursor: Option<u32> = conn
        .query_row(
            "SELECT next_index FROM prekey_cursors WHERE owner_id = ?1",
            params![owner_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err("failed to read prekey cursor"))?;
    Ok(cursor.unwrap_or(0))
}

fn write_cursor(conn: &Connection, owner_id: &str, next_index: u32) -> Result<(), KeyStoreError> {
    conn.execute(
        "INSERT INTO prekey_cursors (owner_id, next_index) VALUES (?1, ?2)
         ON CONFLICT(owner_id) DO UPDATE SET next_index = excluded.next_index",
        params![owner_id, next_index],
    )
    .map_err(db_err("failed to advance prekey cursor"))?;
    Ok(())
}

fn insert_record(conn: &Connection, record: &KeyRecord) -> Result<(), KeyStoreError> {
    conn.execute(
        &format!("INSERT INTO key_records ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
        params![
            record.id,
            record.owner_id,
            record.key_kind.as_str(),
            &record.public_key[..],
            record.private_key.as_deref().map(<[u8; 32]>::as_slice),
            record.key_index,
            record.signature,
            to_db_time(record.created_at)?,
            record.expires_at.map(to_db_time).transpose()?,
            record.is_active,
        ],
    )
    .map_err(db_err("failed to insert key record"))?;
    Ok(())
}

fn select_one(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Option<KeyRecord>, KeyStoreError> {
    conn.query_row(sql, params, raw_row)
        .optional()
        .map_err(db_err("failed to load key record"))?
        .map(KeyRecord::try_from)
        .transpose()
}

/// A `key_records` row before length and range checks.
struct RawKeyRow {
    id: String,
    owner_id: String,
    key_kind: String,
    public_key: Vec<u8>,
    private_key: Option<Zeroizing<Vec<u8>>>,
    key_index: Option<u32>,
    signature: Option<Vec<u8>>,
    created_at: i64,
    expires_at: Option<i64>,
    is_active: bool,
}

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawKeyRow> {
    Ok(RawKeyRow {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        key_kind: row.get(2)?,
        public_key: row.get(3)?,
        private_key: row.get::<_, Option<Vec<u8>>>(4)?.map(Zeroizing::new),
        key_index: row.get(5)?,
        signature: row.get(6)?,
        created_at: row.get(7)?,
        expires_at: row.get(8)?,
        is_active: row.get(9)?,
    })
}

impl TryFrom<RawKeyRow> for KeyRecord {
    type Error = KeyStoreError;

    fn try_from(raw: RawKeyRow) -> Result<Self, Self::Error> {
        Ok(Self {
            key_kind: raw.key_kind.parse()?,
            public_key: key_bytes(&raw.public_key, &raw.id)?,
            private_key: raw
                .private_key
                .map(|bytes| key_bytes(&bytes, &raw.id).map(Zeroizing::new))
                .transpose()?,
            key_index: raw.key_index,
            signature: raw.signature,
            created_at: from_db_time(raw.created_at)?,
            expires_at: raw.expires_at.map(from_db_time).transpose()?,
            is_active: raw.is_active,
            owner_id: raw.owner_id,
            id: raw.id,
        })
    }
}

fn key_bytes(bytes: &[u8], record_id: &str) -> Result<[u8; 32], KeyStoreError> {
    bytes.try_into().map_err(|_| {
        KeyStoreError::Storage(format!("record {record_id} holds a {}-byte key", bytes.len()))
    })
}

fn to_db_time(secs: u64) -> Result<i64, KeyStoreError> {
    i64::try_from(secs).map_err(|_| KeyStoreError::Storage(format!("timestamp {secs} out of range")))
}

fn from_db_time(secs: i64) -> Result<u64, KeyStoreError> {
    u64::try_from(secs).map_err(|_| KeyStoreError::Storage(format!("negative timestamp {secs}")))
}
