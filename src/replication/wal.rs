//! Write-Ahead Log on RocksDB
//!
//! Append-only, strictly ordered log of encoded [`WriteInput`]s keyed by
//! [`Offset`]. Offsets are the ordering key itself, so reading from a cursor
//! is a plain forward scan. Appends are synced before they return.
//!
//! [`WriteInput`]: crate::engine::WriteInput

use crate::common::{Clock, Error, Result};
use crate::replication::offset::{Offset, Position};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    pub offset: Offset,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

/// Payloads travel as hex strings in JSON
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

pub struct Wal {
    db: DB,
    path: PathBuf,
    clock: Arc<dyn Clock>,
    /// Last assigned offset; held across the durable put so entries become
    /// visible in offset order.
    last: Mutex<Option<Offset>>,
}

fn sync_write_options() -> WriteOptions {
    let mut opts = WriteOptions::default();
    opts.set_sync(true);
    opts
}

impl Wal {
    /// Open or create the WAL, resuming the counter from the last stored entry.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, &path)?;

        let last = match db.iterator(IteratorMode::End).next() {
            Some(item) => Some(Offset::from_key(&item?.0)?),
            None => None,
        };
        if let Some(last) = last {
            tracing::info!(last_offset = %last, "WAL reopened at {:?}", path);
        }

        Ok(Self {
            db,
            path,
            clock,
            last: Mutex::new(last),
        })
    }

    /// Durably append `payload` and return its offset.
    pub fn append(&self, payload: &[u8]) -> Result<Offset> {
        let mut last = self
            .last
            .lock()
            .map_err(|_| Error::Internal("WAL append lock poisoned".into()))?;

        let now = self.clock.now_nanos();
        let offset = match *last {
            Some(prev) => Offset::new(now.max(prev.nanos), prev.seq + 1),
            None => Offset::new(now, 1),
        };

        self.db
            .put_opt(offset.to_key(), payload, &sync_write_options())?;
        *last = Some(offset);
        Ok(offset)
    }

    /// Forward scan from `position`.
    ///
    /// With [`Position::Start`] every retained entry is produced. Otherwise the
    /// scan starts at the first entry >= the offset; an entry exactly at the
    /// offset is produced only if `include_offset` is set.
    pub fn iter_from(
        &self,
        position: Position,
        include_offset: bool,
    ) -> impl Iterator<Item = Result<WalEntry>> + '_ {
        let (iter, skip) = match position {
            Position::Start => (self.db.iterator(IteratorMode::Start), None),
            Position::At(offset) => {
                let key = offset.to_key();
                let iter = self
                    .db
                    .iterator(IteratorMode::From(&key, Direction::Forward));
                (iter, (!include_offset).then_some(offset))
            }
        };

        iter.map(|item| -> Result<WalEntry> {
            let (key, value) = item?;
            Ok(WalEntry {
                offset: Offset::from_key(&key)?,
                payload: value.into_vec(),
            })
        })
        .filter(move |entry| match (entry, skip) {
            (Ok(entry), Some(skip)) => entry.offset != skip,
            _ => true,
        })
    }

    /// Collect up to `limit` entries from `position` (`0` means unbounded).
    pub fn range_from(
        &self,
        position: Position,
        include_offset: bool,
        limit: usize,
    ) -> Result<Vec<WalEntry>> {
        let limit = if limit == 0 { usize::MAX } else { limit };
        self.iter_from(position, include_offset).take(limit).collect()
    }

    /// Delete every entry strictly before `offset`. Returns how many were removed.
    ///
    /// The caller decides how far trimming may go.
    pub fn trim_before(&self, offset: Offset) -> Result<usize> {
        let bound = offset.to_key();
        let mut batch = WriteBatch::default();
        let mut removed = 0;
        for item in self.db.iterator(IteratorMode::Start) {
            let (key, _) = item?;
            if key[..] >= bound[..] {
                break;
            }
            batch.delete(key);
            removed += 1;
        }
        if removed == 0 {
            return Ok(0);
        }

        self.db.write_opt(batch, &sync_write_options())?;
        self.db.compact_range(None::<&[u8]>, Some(&bound[..]));
        tracing::info!(removed, before = %offset, "WAL trimmed");
        Ok(removed)
    }

    /// Newest retained entry strictly before `offset`
    pub fn last_before(&self, offset: Offset) -> Result<Option<Offset>> {
        let bound = offset.to_key();
        for item in self
            .db
            .iterator(IteratorMode::From(&bound, Direction::Reverse))
        {
            let (key, _) = item?;
            if key[..] < bound[..] {
                return Ok(Some(Offset::from_key(&key)?));
            }
        }
        Ok(None)
    }

    pub fn first_offset(&self) -> Result<Option<Offset>> {
        match self.db.iterator(IteratorMode::Start).next() {
            Some(item) => Ok(Some(Offset::from_key(&item?.0)?)),
            None => Ok(None),
        }
    }

    /// Last offset ever assigned (it may since have been trimmed)
    pub fn last_offset(&self) -> Result<Option<Offset>> {
        let last = self
            .last
            .lock()
            .map_err(|_| Error::Internal("WAL append lock poisoned".into()))?;
        Ok(*last)
    }

    pub fn contains(&self, offset: Offset) -> Result<bool> {
        Ok(self.db.get_pinned(offset.to_key())?.is_some())
    }

    /// Number of retained entries (full scan)
    pub fn len(&self) -> Result<usize> {
        let mut n = 0;
        for item in self.db.iterator(IteratorMode::Start) {
            item?;
            n += 1;
        }
        Ok(n)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.first_offset()?.is_none())
    }

    /// Total on-disk footprint in bytes
    pub fn size(&self) -> Result<u64> {
        let mut total = 0;
        for entry in std::fs::read_dir(&self.path)? {
            let meta = entry?.metadata()?;
            if meta.is_file() {
                total += meta.len();
            }
        }
        Ok(total)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
