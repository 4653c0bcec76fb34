//! SQLite engine
//!
//! One table, one row per live key:
//! ```sql
//! kv(key BLOB PRIMARY KEY, value BLOB NOT NULL, expires_at INTEGER)
//! ```
//! `expires_at` is ns since epoch, `NULL` for persistent keys, and carries a
//! partial index the reaper scans. A plain `only_if_not_exists` set is a
//! single conditional upsert; every other write reads, plans and writes in
//! one immediate transaction.

use crate::common::{Clock, Error, Result};
use crate::engine::{
    plan_write, Engine, EngineOptions, IterateFn, Mutation, ReadOutput, Record, RecordFn,
    WriteInput, WriteOutput,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::sync::{Arc, Mutex, MutexGuard};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key BLOB PRIMARY KEY NOT NULL,
    value BLOB NOT NULL,
    expires_at INTEGER
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS kv_expires_at ON kv (expires_at) WHERE expires_at IS NOT NULL;
";

const UPSERT: &str = "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
    ON CONFLICT (key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at";

/// Upsert that only replaces an expired row
const INSERT_IF_ABSENT: &str = "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
    ON CONFLICT (key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
    WHERE kv.expires_at IS NOT NULL AND kv.expires_at <= ?4";

fn to_sql_time(nanos: u64) -> i64 {
    i64::try_from(nanos).unwrap_or(i64::MAX)
}

fn from_sql_time(nanos: i64) -> u64 {
    u64::try_from(nanos).unwrap_or(0)
}

fn get(conn: &Connection, key: &[u8]) -> Result<Option<Record>> {
    let row = conn
        .query_row(
            "SELECT value, expires_at FROM kv WHERE key = ?1",
            params![key],
            |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Option<i64>>(1)?)),
        )
        .optional()?;
    Ok(row.map(|(value, at)| Record::new(value, at.map(from_sql_time))))
}

fn put(conn: &Connection, key: &[u8], record: &Record) -> Result<()> {
    conn.execute(
        UPSERT,
        params![key, record.value, record.expires_at.map(to_sql_time)],
    )?;
    Ok(())
}

pub struct SqliteEngine {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteEngine {
    pub fn open(options: &EngineOptions) -> Result<Self> {
        std::fs::create_dir_all(&options.path)?;
        let conn = Connection::open(options.path.join("kv.sqlite3"))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        let synchronous = if options.sync_writes { "FULL" } else { "NORMAL" };
        conn.pragma_update(None, "synchronous", synchronous)?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(journal_mode = %mode, synchronous, "sqlite engine opened");

        Ok(Self {
            conn: Mutex::new(conn),
            clock: options.clock.clone(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("sqlite engine lock poisoned".into()))
    }

    fn insert_if_absent(conn: &Connection, input: &WriteInput, now: u64) -> Result<WriteOutput> {
        let record = match plan_write(None, input, now)? {
            Mutation::Put(record) => record,
            Mutation::Keep | Mutation::Remove => return Ok(WriteOutput::default()),
        };
        conn.execute(
            INSERT_IF_ABSENT,
            params![
                input.key,
                record.value,
                record.expires_at.map(to_sql_time),
                to_sql_time(now)
            ],
        )?;
        let stored = get(conn, &input.key)?;
        Ok(WriteOutput::from_record(stored.as_ref(), now))
    }

    /// Live rows under `prefix`, in key order
    fn live_under(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Record)>> {
        let now = to_sql_time(self.clock.now_nanos());
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT key, value, expires_at FROM kv
             WHERE key >= ?1 AND (expires_at IS NULL OR expires_at > ?2)
             ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix, now], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Option<i64>>(2)?,
            ))
        })?;

        let mut live = Vec::new();
        for row in rows {
            let (key, value, at) = row?;
            if !key.starts_with(prefix) {
                break;
            }
            live.push((key, Record::new(value, at.map(from_sql_time))));
        }
        Ok(live)
    }

    pub fn stored_len(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM kv", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

impl Engine for SqliteEngine {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn write(&self, input: &WriteInput) -> Result<WriteOutput> {
        let mut conn = self.lock()?;
        if input.is_flush() {
            conn.execute("DELETE FROM kv", [])?;
            return Ok(WriteOutput::default());
        }

        let now = self.clock.now_nanos();
        if input.only_if_not_exists && input.is_idempotent() && !input.is_delete() {
            return Self::insert_if_absent(&conn, input, now);
        }

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = get(&tx, &input.key)?.filter(|r| !r.is_expired(now));
        let output = match plan_write(current.as_ref(), input, now)? {
            Mutation::Keep => WriteOutput::from_record(current.as_ref(), now),
            Mutation::Remove => {
                tx.execute("DELETE FROM kv WHERE key = ?1", params![input.key])?;
                WriteOutput::default()
            }
            Mutation::Put(record) => {
                put(&tx, &input.key, &record)?;
                WriteOutput::from_record(Some(&record), now)
            }
        };
        tx.commit()?;
        Ok(output)
    }

    fn read(&self, key: &[u8]) -> Result<ReadOutput> {
        let now = self.clock.now_nanos();
        let conn = self.lock()?;
        match get(&conn, key)? {
            Some(record) if !record.is_expired(now) => Ok(ReadOutput::found(key, record, now)),
            Some(_) => {
                let deleted = conn.execute(
                    "DELETE FROM kv WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
                    params![key, to_sql_time(now)],
                );
                if let Err(e) = deleted {
                    tracing::debug!("lazy expiration failed: {}", e);
                }
                Ok(ReadOutput::absent(key))
            }
            None => Ok(ReadOutput::absent(key)),
        }
    }

    fn iterate(&self, prefix: &[u8], f: &mut IterateFn<'_>) -> Result<()> {
        for (key, record) in self.live_under(prefix)? {
            if !f(&key, &record.value) {
                break;
            }
        }
        Ok(())
    }

    fn scan_records(&self, f: &mut RecordFn<'_>) -> Result<()> {
        for (key, record) in self.live_under(&[])? {
            f(&key, &record)?;
        }
        Ok(())
    }

    fn restore(&self, key: &[u8], record: Record) -> Result<()> {
        let conn = self.lock()?;
        put(&conn, key, &record)
    }

    fn reap_expired(&self, limit: usize) -> Result<usize> {
        let now = self.clock.now_nanos();
        let conn = self.lock()?;
        let reaped = conn.execute(
            "DELETE FROM kv WHERE key IN (
                SELECT key FROM kv
                WHERE expires_at IS NOT NULL AND expires_at <= ?1
                LIMIT ?2
            )",
            params![to_sql_time(now), i64::try_from(limit).unwrap_or(i64::MAX)],
        )?;
        if reaped > 0 {
            tracing::debug!(reaped, "sqlite engine reaped expired records");
        }
        Ok(reaped)
    }

    fn sync(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.query_row("PRAGMA wal_checkpoint(FULL)", [], |_| Ok(()))?;
        Ok(())
    }
}
