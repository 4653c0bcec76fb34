//! Hashes stored as one key per field: `<key>/{HASH}/<field>`

use crate::common::Result;
use crate::engine::WriteInput;
use crate::replication::{Manager, Offset};
use std::sync::Arc;

const HASH_MARKER: &[u8] = b"/{HASH}/";

#[derive(Clone)]
pub struct HashAdapter {
    manager: Arc<Manager>,
}

impl HashAdapter {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }

    /// Prefix shared by every field of `key`
    pub fn prefix(key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(key.len() + HASH_MARKER.len());
        out.extend_from_slice(key);
        out.extend_from_slice(HASH_MARKER);
        out
    }

    pub fn field_key(key: &[u8], field: &[u8]) -> Vec<u8> {
        let mut out = Self::prefix(key);
        out.extend_from_slice(field);
        out
    }

    /// Set one field. Visible once the returned offset is applied.
    pub fn hset(&self, key: &[u8], field: &[u8], value: &[u8]) -> Result<Offset> {
        self.manager
            .write(&WriteInput::set(Self::field_key(key, field), value))
    }

    pub fn hget(&self, key: &[u8], field: &[u8]) -> Result<Option<Vec<u8>>> {
        let out = self.manager.read(&Self::field_key(key, field))?;
        Ok(if out.exists { out.value } else { None })
    }

    pub fn hdel(&self, key: &[u8], field: &[u8]) -> Result<Offset> {
        self.manager
            .write(&WriteInput::delete(Self::field_key(key, field)))
    }

    /// All live fields of `key`, ordered by field name
    pub fn hgetall(&self, key: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let prefix = Self::prefix(key);
        let mut fields = Vec::new();
        self.manager
            .iterate(&prefix, &mut |k: &[u8], v: &[u8]| {
                fields.push((k[prefix.len()..].to_vec(), v.to_vec()));
                true
            })?;
        Ok(fields)
    }

    pub fn hlen(&self, key: &[u8]) -> Result<usize> {
        let mut count = 0;
        self.manager
            .iterate(&Self::prefix(key), &mut |_: &[u8], _: &[u8]| {
                count += 1;
                true
            })?;
        Ok(count)
    }
}
