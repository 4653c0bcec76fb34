//! Reference TTL-aware engine on sled
//!
//! Two trees:
//! - `data`: key -> encoded [`Record`] (value + absolute expiry)
//! - `expirations`: `[EXPIRES_AT:8 BE][KEY]` -> empty, scanned by the reaper
//!
//! Writes run in a transaction over both trees, so conditional writes,
//! increments and the index update are atomic with respect to other writers.

use crate::common::{Clock, Result};
use crate::engine::{
    plan_write, Engine, EngineOptions, IterateFn, Mutation, ReadOutput, Record, RecordFn,
    WriteInput, WriteOutput,
};
use sled::transaction::{ConflictableTransactionError, TransactionalTree};
use sled::{IVec, Transactional};
use std::sync::Arc;

pub struct SledEngine {
    db: sled::Db,
    data: sled::Tree,
    expirations: sled::Tree,
    clock: Arc<dyn Clock>,
    sync_writes: bool,
}

type TxResult<T> = std::result::Result<T, ConflictableTransactionError<crate::common::Error>>;

fn index_key(expires_at: u64, key: &[u8]) -> Vec<u8> {
    let mut ikey = Vec::with_capacity(8 + key.len());
    ikey.extend_from_slice(&expires_at.to_be_bytes());
    ikey.extend_from_slice(key);
    ikey
}

fn split_index_key(ikey: &[u8]) -> Option<(u64, &[u8])> {
    if ikey.len() < 8 {
        return None;
    }
    let (at, key) = ikey.split_at(8);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(at);
    Some((u64::from_be_bytes(buf), key))
}

fn decode_in_tx(raw: &[u8]) -> TxResult<Record> {
    Record::decode(raw).map_err(ConflictableTransactionError::Abort)
}

/// Replace whatever is stored under `key` with `record`, keeping the index in step.
fn put_in_tx(
    data: &TransactionalTree,
    exp: &TransactionalTree,
    key: &[u8],
    previous: Option<&Record>,
    record: &Record,
) -> TxResult<()> {
    if let Some(at) = previous.and_then(|r| r.expires_at) {
        if record.expires_at != Some(at) {
            exp.remove(index_key(at, key))?;
        }
    }
    data.insert(key, record.encode())?;
    if let Some(at) = record.expires_at {
        exp.insert(index_key(at, key), &[] as &[u8])?;
    }
    Ok(())
}

impl SledEngine {
    pub fn open(options: &EngineOptions) -> Result<Self> {
        std::fs::create_dir_all(&options.path)?;
        let db = sled::open(&options.path)?;
        let data = db.open_tree("data")?;
        let expirations = db.open_tree("expirations")?;

        Ok(Self {
            db,
            data,
            expirations,
            clock: options.clock.clone(),
            sync_writes: options.sync_writes,
        })
    }

    /// Number of records physically stored, expired ones included
    pub fn stored_len(&self) -> usize {
        self.data.len()
    }

    /// Number of pending expirations in the index
    pub fn indexed_expirations(&self) -> usize {
        self.expirations.len()
    }

    fn maybe_sync(&self) -> Result<()> {
        if self.sync_writes {
            self.db.flush()?;
        }
        Ok(())
    }
}

impl Engine for SledEngine {
    fn name(&self) -> &'static str {
        "sled"
    }

    fn write(&self, input: &WriteInput) -> Result<WriteOutput> {
        if input.is_flush() {
            self.data.clear()?;
            self.expirations.clear()?;
            self.maybe_sync()?;
            return Ok(WriteOutput::default());
        }

        let now = self.clock.now_nanos();
        let key = input.key.as_slice();

        let output = (&self.data, &self.expirations).transaction(|(data, exp)| -> TxResult<WriteOutput> {
            let current = match data.get(key)? {
                Some(raw) => Some(decode_in_tx(&raw)?),
                None => None,
            };
            let live = current.as_ref().filter(|r| !r.is_expired(now));

            match plan_write(live, input, now).map_err(ConflictableTransactionError::Abort)? {
                Mutation::Keep => Ok(WriteOutput::from_record(live, now)),
                Mutation::Remove => {
                    if let Some(at) = current.as_ref().and_then(|r| r.expires_at) {
                        exp.remove(index_key(at, key))?;
                    }
                    data.remove(key)?;
                    Ok(WriteOutput::default())
                }
                Mutation::Put(record) => {
                    put_in_tx(data, exp, key, current.as_ref(), &record)?;
                    Ok(WriteOutput::from_record(Some(&record), now))
                }
            }
        })?;

        self.maybe_sync()?;
        Ok(output)
    }

    fn read(&self, key: &[u8]) -> Result<ReadOutput> {
        let now = self.clock.now_nanos();
        let raw = match self.data.get(key)? {
            Some(raw) => raw,
            None => return Ok(ReadOutput::absent(key)),
        };

        let record = Record::decode(&raw)?;
        if !record.is_expired(now) {
            return Ok(ReadOutput::found(key, record, now));
        }

        // Lazy delete, only if no writer replaced the record in the meantime.
        match self.data.compare_and_swap(key, Some(&raw), None::<IVec>) {
            Ok(Ok(())) => {
                if let Some(at) = record.expires_at {
                    if let Err(e) = self.expirations.remove(index_key(at, key)) {
                        tracing::debug!("failed to drop expiration index entry: {}", e);
                    }
                }
            }
            Ok(Err(_)) => {}
            Err(e) => tracing::debug!("lazy expiration failed: {}", e),
        }
        Ok(ReadOutput::absent(key))
    }

    fn iterate(&self, prefix: &[u8], f: &mut IterateFn<'_>) -> Result<()> {
        let now = self.clock.now_nanos();
        for item in self.data.scan_prefix(prefix) {
            let (key, raw) = item?;
            let record = Record::decode(&raw)?;
            if record.is_expired(now) {
                continue;
            }
            if !f(&key, &record.value) {
                break;
            }
        }
        Ok(())
    }

    fn scan_records(&self, f: &mut RecordFn<'_>) -> Result<()> {
        let now = self.clock.now_nanos();
        for item in self.data.iter() {
            let (key, raw) = item?;
            let record = Record::decode(&raw)?;
            if !record.is_expired(now) {
                f(&key, &record)?;
            }
        }
        Ok(())
    }

    fn restore(&self, key: &[u8], record: Record) -> Result<()> {
        (&self.data, &self.expirations).transaction(|(data, exp)| -> TxResult<()> {
            let previous = match data.get(key)? {
                Some(raw) => Some(decode_in_tx(&raw)?),
                None => None,
            };
            put_in_tx(data, exp, key, previous.as_ref(), &record)
        })?;
        self.maybe_sync()
    }

    fn reap_expired(&self, limit: usize) -> Result<usize> {
        let now = self.clock.now_nanos();
        let upper = now.saturating_add(1).to_be_bytes();

        let mut candidates = Vec::new();
        for item in self.expirations.range(..&upper[..]).take(limit) {
            let (ikey, _) = item?;
            candidates.push(ikey);
        }
        if candidates.is_empty() {
            return Ok(0);
        }

        let reaped = (&self.data, &self.expirations).transaction(|(data, exp)| -> TxResult<usize> {
            let mut reaped = 0;
            for ikey in &candidates {
                exp.remove(&ikey[..])?;
                let (at, key) = match split_index_key(ikey) {
                    Some(parts) => parts,
                    None => continue,
                };
                // the index entry may be stale if the key was rewritten
                if let Some(raw) = data.get(key)? {
                    let record = decode_in_tx(&raw)?;
                    if record.expires_at == Some(at) && record.is_expired(now) {
                        data.remove(key)?;
                        reaped += 1;
                    }
                }
            }
            Ok(reaped)
        })?;

        if reaped > 0 {
            tracing::debug!(reaped, "sled engine reaped expired records");
        }
        Ok(reaped)
    }

    fn sync(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
