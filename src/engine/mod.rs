//! Storage engine contract
//!
//! Every backend implements [`Engine`] with identical semantics:
//! - per-key TTL with lazy expiration on read and a background reaper
//! - conditional writes (`only_if_not_exists`) resolved atomically by the backend
//! - numeric increment and byte append
//! - a flush sentinel (empty key, no value) that clears the whole namespace
//! - whole-database export/import used to bootstrap replicas
//!
//! Backends are selected by name through an [`EngineRegistry`].

pub mod dump;
pub mod fs_engine;
pub mod memory;
pub mod record;
pub mod registry;
pub mod sled_engine;
pub mod sqlite_engine;

pub use fs_engine::FsEngine;
pub use memory::MemoryEngine;
pub use record::{plan_write, Mutation, Record};
pub use registry::{EngineFactory, EngineOptions, EngineRegistry};
pub use sled_engine::SledEngine;
pub use sqlite_engine::SqliteEngine;

use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::time::Duration;

/// A single mutation. Also the payload of every WAL entry and the unit of replication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteInput {
    pub key: Vec<u8>,
    /// `None` deletes the key (or everything, for the flush sentinel)
    pub value: Option<Vec<u8>>,
    pub only_if_not_exists: bool,
    /// Relative expiry; `None` or zero means no expiration
    pub ttl: Option<Duration>,
    /// Preserve the current expiry of an existing key
    pub keep_ttl: bool,
    /// `value` is a numeric delta added to the current value
    pub increment: bool,
    /// `value` is appended to the current value
    pub append: bool,
}

impl WriteInput {
    pub fn set(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    /// The flush sentinel: empty key, no value
    pub fn flush_all() -> Self {
        Self::default()
    }

    pub fn increment(key: impl Into<Vec<u8>>, delta: impl std::fmt::Display) -> Self {
        Self {
            key: key.into(),
            value: Some(delta.to_string().into_bytes()),
            increment: true,
            ..Default::default()
        }
    }

    pub fn append(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            append: true,
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_keep_ttl(mut self) -> Self {
        self.keep_ttl = true;
        self
    }

    pub fn with_only_if_not_exists(mut self) -> Self {
        self.only_if_not_exists = true;
        self
    }

    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }

    pub fn is_flush(&self) -> bool {
        self.key.is_empty() && self.value.is_none()
    }

    /// Effective TTL (zero is treated as none)
    pub fn effective_ttl(&self) -> Option<Duration> {
        self.ttl.filter(|d| !d.is_zero())
    }

    /// True when applying the input twice yields the same state as applying it once.
    /// Increments and appends depend on the value they find.
    pub fn is_idempotent(&self) -> bool {
        !(self.increment || self.append)
    }

    /// Serialize for the WAL
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutput {
    /// Value stored under the key after the write
    pub value: Option<Vec<u8>>,
    /// Remaining time to live, if the key expires
    pub ttl: Option<Duration>,
}

impl WriteOutput {
    pub fn from_record(record: Option<&Record>, now_nanos: u64) -> Self {
        match record {
            Some(r) => Self {
                value: Some(r.value.clone()),
                ttl: r.ttl(now_nanos),
            },
            None => Self::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOutput {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub exists: bool,
    /// Remaining time to live; `None` for keys without expiry
    pub ttl: Option<Duration>,
}

impl ReadOutput {
    pub fn absent(key: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            ..Default::default()
        }
    }

    pub fn found(key: &[u8], record: Record, now_nanos: u64) -> Self {
        let ttl = record.ttl(now_nanos);
        Self {
            key: key.to_vec(),
            value: Some(record.value),
            exists: true,
            ttl,
        }
    }
}

/// Iteration callback; return `false` to stop
pub type IterateFn<'a> = dyn FnMut(&[u8], &[u8]) -> bool + 'a;

/// Record visitor used by export
pub type RecordFn<'a> = dyn FnMut(&[u8], &Record) -> Result<()> + 'a;

/// Uniform contract over a durable local key-value store
pub trait Engine: Send + Sync {
    /// Registry name of the backend
    fn name(&self) -> &'static str;

    fn write(&self, input: &WriteInput) -> Result<WriteOutput>;

    /// Expired records read as absent and are reclaimed opportunistically.
    fn read(&self, key: &[u8]) -> Result<ReadOutput>;

    /// Walk live keys under `prefix` in key order.
    fn iterate(&self, prefix: &[u8], f: &mut IterateFn<'_>) -> Result<()>;

    /// Visit every live record together with its absolute expiry.
    fn scan_records(&self, f: &mut RecordFn<'_>) -> Result<()>;

    /// Store a record verbatim (used by import).
    fn restore(&self, key: &[u8], record: Record) -> Result<()>;

    /// Physically delete up to `limit` expired records, returning how many were removed.
    fn reap_expired(&self, limit: usize) -> Result<usize>;

    /// Make every acknowledged write durable.
    fn sync(&self) -> Result<()>;

    fn close(&self) -> Result<()> {
        self.sync()
    }

    /// Serialize all live records; returns bytes written.
    fn export(&self, writer: &mut dyn Write) -> Result<u64> {
        dump::export(self, writer)
    }

    /// Load a stream produced by [`Engine::export`]; returns bytes consumed.
    fn import(&self, reader: &mut dyn Read) -> Result<u64> {
        dump::import(self, reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_input_flags() {
        assert!(WriteInput::flush_all().is_flush());
        assert!(WriteInput::delete("a").is_delete());
        assert!(!WriteInput::delete("a").is_flush());
        assert!(WriteInput::set("a", "1").is_idempotent());
        assert!(WriteInput::set("a", "1").with_only_if_not_exists().is_idempotent());
        assert!(!WriteInput::increment("a", 1).is_idempotent());
        assert!(!WriteInput::append("a", "x").is_idempotent());
        assert_eq!(
            WriteInput::set("a", "1")
                .with_ttl(Duration::ZERO)
                .effective_ttl(),
            None
        );
    }

    #[test]
    fn test_write_input_encoding() {
        let input = WriteInput::set("k", "v")
            .with_ttl(Duration::from_secs(10))
            .with_only_if_not_exists();
        let decoded = WriteInput::decode(&input.encode().unwrap()).unwrap();
        assert_eq!(decoded, input);

        assert!(WriteInput::decode(b"\xff").is_err());
    }
}
