//! Node state store (RocksDB)
//!
//! Column families:
//! - `state`: `current_offset` (last applied position), `pending` (the
//!   resolved mutation of an entry being applied) and `trimmed_through`
//!   (master only: newest WAL offset retention may have removed)
//! - `replicas`: master-side view of each replica's confirmed position
//!
//! A missing `current_offset` means the node was never bootstrapped; an empty
//! one means it is positioned at the start of the log.

use crate::common::{Error, Result};
use crate::engine::{Engine, Record, WriteInput};
use crate::replication::offset::{Offset, Position};
use rocksdb::{IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;

const CF_STATE: &str = "state";
const CF_REPLICAS: &str = "replicas";

const KEY_CURRENT_OFFSET: &[u8] = b"current_offset";
const KEY_PENDING: &[u8] = b"pending";
const KEY_TRIMMED_THROUGH: &[u8] = b"trimmed_through";

/// A WAL entry resolved against local state into a mutation that can be
/// replayed any number of times with the same result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolvedWrite {
    /// Conditional write lost or the input could not apply
    Keep,
    Remove { key: Vec<u8> },
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        expires_at: Option<u64>,
    },
}

impl ResolvedWrite {
    pub fn apply(&self, engine: &dyn Engine) -> Result<()> {
        match self {
            ResolvedWrite::Keep => Ok(()),
            ResolvedWrite::Remove { key } => {
                engine.write(&WriteInput::delete(key.clone()))?;
                Ok(())
            }
            ResolvedWrite::Put {
                key,
                value,
                expires_at,
            } => engine.restore(key, Record::new(value.clone(), *expires_at)),
        }
    }
}

/// Journal record for an apply in progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApply {
    pub offset: Offset,
    pub write: ResolvedWrite,
}

/// Confirmed progress of one replica, as reported to the master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaProgress {
    pub replica_id: String,
    pub position: Position,
    /// Clock time of the last report, ns since epoch
    pub last_seen: u64,
}

pub struct StateStore {
    db: DB,
}

fn sync_write_options() -> WriteOptions {
    let mut opts = WriteOptions::default();
    opts.set_sync(true);
    opts
}

impl StateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(path.as_ref())?;
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_STATE, CF_REPLICAS])?;
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Internal(format!("missing column family {}", name)))
    }

    /// Last applied position, `None` if the node has never been positioned
    pub fn position(&self) -> Result<Option<Position>> {
        match self.db.get_cf(self.cf(CF_STATE)?, KEY_CURRENT_OFFSET)? {
            Some(raw) => {
                let s = std::str::from_utf8(&raw)
                    .map_err(|_| Error::Corrupted("current_offset is not UTF-8".into()))?;
                Ok(Some(s.parse()?))
            }
            None => Ok(None),
        }
    }

    pub fn set_position(&self, position: Position) -> Result<()> {
        self.db.put_cf_opt(
            self.cf(CF_STATE)?,
            KEY_CURRENT_OFFSET,
            position.to_string(),
            &sync_write_options(),
        )?;
        Ok(())
    }

    /// Durably record the mutation about to be applied for `pending.offset`
    pub fn stage(&self, pending: &PendingApply) -> Result<()> {
        self.db.put_cf_opt(
            self.cf(CF_STATE)?,
            KEY_PENDING,
            bincode::serialize(pending)?,
            &sync_write_options(),
        )?;
        Ok(())
    }

    pub fn pending(&self) -> Result<Option<PendingApply>> {
        match self.db.get_cf(self.cf(CF_STATE)?, KEY_PENDING)? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// Advance `current_offset` and drop the journal in one batch
    pub fn commit(&self, offset: Offset) -> Result<()> {
        let cf = self.cf(CF_STATE)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, KEY_CURRENT_OFFSET, offset.to_string());
        batch.delete_cf(cf, KEY_PENDING);
        self.db.write_opt(batch, &sync_write_options())?;
        Ok(())
    }

    pub fn clear_pending(&self) -> Result<()> {
        self.db
            .delete_cf_opt(self.cf(CF_STATE)?, KEY_PENDING, &sync_write_options())?;
        Ok(())
    }

    /// Newest WAL offset that may no longer be retained, if any trim ran
    pub fn trimmed_through(&self) -> Result<Option<Offset>> {
        match self.db.get_cf(self.cf(CF_STATE)?, KEY_TRIMMED_THROUGH)? {
            Some(raw) => {
                let s = std::str::from_utf8(&raw)
                    .map_err(|_| Error::Corrupted("trimmed_through is not UTF-8".into()))?;
                Ok(Some(s.parse()?))
            }
            None => Ok(None),
        }
    }

    /// Must be durable before the matching WAL entries are deleted
    pub fn set_trimmed_through(&self, offset: Offset) -> Result<()> {
        self.db.put_cf_opt(
            self.cf(CF_STATE)?,
            KEY_TRIMMED_THROUGH,
            offset.to_string(),
            &sync_write_options(),
        )?;
        Ok(())
    }

    // === Replica progress (master only) ===

    pub fn put_replica(&self, progress: &ReplicaProgress) -> Result<()> {
        self.db.put_cf(
            self.cf(CF_REPLICAS)?,
            progress.replica_id.as_bytes(),
            bincode::serialize(progress)?,
        )?;
        Ok(())
    }

    pub fn replica(&self, replica_id: &str) -> Result<Option<ReplicaProgress>> {
        match self.db.get_cf(self.cf(CF_REPLICAS)?, replica_id.as_bytes())? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn replicas(&self) -> Result<Vec<ReplicaProgress>> {
        let mut out = Vec::new();
        for item in self
            .db
            .iterator_cf(self.cf(CF_REPLICAS)?, IteratorMode::Start)
        {
            let (_, raw) = item?;
            out.push(bincode::deserialize(&raw)?);
        }
        Ok(out)
    }

    pub fn remove_replica(&self, replica_id: &str) -> Result<()> {
        self.db
            .delete_cf(self.cf(CF_REPLICAS)?, replica_id.as_bytes())?;
        Ok(())
    }
}
