//! In-memory engine backed by an ordered map
//!
//! Nothing survives a restart. Used by tests and ephemeral nodes.

use crate::common::{Clock, Error, Result, SystemClock};
use crate::engine::{
    plan_write, Engine, IterateFn, Mutation, ReadOutput, Record, RecordFn, WriteInput, WriteOutput,
};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

type Map = BTreeMap<Vec<u8>, Record>;

pub struct MemoryEngine {
    data: RwLock<Map>,
    clock: Arc<dyn Clock>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            clock,
        }
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read_lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn read_lock(&self) -> Result<RwLockReadGuard<'_, Map>> {
        self.data
            .read()
            .map_err(|_| Error::Internal("memory engine lock poisoned".into()))
    }

    fn write_lock(&self) -> Result<RwLockWriteGuard<'_, Map>> {
        self.data
            .write()
            .map_err(|_| Error::Internal("memory engine lock poisoned".into()))
    }

    fn live_under(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Record)>> {
        let now = self.clock.now_nanos();
        let data = self.read_lock()?;
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, r)| !r.is_expired(now))
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect())
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn write(&self, input: &WriteInput) -> Result<WriteOutput> {
        let mut data = self.write_lock()?;
        if input.is_flush() {
            data.clear();
            return Ok(WriteOutput::default());
        }

        let now = self.clock.now_nanos();
        let current = data.get(&input.key).filter(|r| !r.is_expired(now)).cloned();

        match plan_write(current.as_ref(), input, now)? {
            Mutation::Keep => Ok(WriteOutput::from_record(current.as_ref(), now)),
            Mutation::Remove => {
                data.remove(&input.key);
                Ok(WriteOutput::default())
            }
            Mutation::Put(record) => {
                let output = WriteOutput::from_record(Some(&record), now);
                data.insert(input.key.clone(), record);
                Ok(output)
            }
        }
    }

    fn read(&self, key: &[u8]) -> Result<ReadOutput> {
        let now = self.clock.now_nanos();
        let found = self.read_lock()?.get(key).cloned();
        match found {
            Some(record) if !record.is_expired(now) => Ok(ReadOutput::found(key, record, now)),
            Some(_) => {
                // lazy delete, skipped if a writer holds the lock
                if let Ok(mut data) = self.data.try_write() {
                    if data.get(key).map_or(false, |r| r.is_expired(now)) {
                        data.remove(key);
                    }
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
        self.write_lock()?.insert(key.to_vec(), record);
        Ok(())
    }

    fn reap_expired(&self, limit: usize) -> Result<usize> {
        let now = self.clock.now_nanos();
        let mut data = self.write_lock()?;
        let expired: Vec<Vec<u8>> = data
            .iter()
            .filter(|(_, r)| r.is_expired(now))
            .map(|(k, _)| k.clone())
            .take(limit)
            .collect();
        for key in &expired {
            data.remove(key);
        }
        Ok(expired.len())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ManualClock;
    use std::time::Duration;

    #[test]
    fn test_lazy_expiration_reclaims() {
        let clock = Arc::new(ManualClock::at_nanos(1_000));
        let engine = MemoryEngine::with_clock(clock.clone());
        engine
            .write(&WriteInput::set("k", "v").with_ttl(Duration::from_nanos(100)))
            .unwrap();
        assert_eq!(engine.len().unwrap(), 1);

        clock.advance(Duration::from_nanos(100));
        assert!(!engine.read(b"k").unwrap().exists);
        assert!(engine.is_empty().unwrap());
    }

    #[test]
    fn test_reap_respects_limit() {
        let clock = Arc::new(ManualClock::at_nanos(1_000));
        let engine = MemoryEngine::with_clock(clock.clone());
        for i in 0..5 {
            engine
                .write(&WriteInput::set(format!("k{}", i), "v").with_ttl(Duration::from_nanos(1)))
                .unwrap();
        }
        engine.write(&WriteInput::set("stay", "v")).unwrap();
        clock.advance(Duration::from_nanos(1));

        assert_eq!(engine.reap_expired(3).unwrap(), 3);
        assert_eq!(engine.reap_expired(10).unwrap(), 2);
        assert_eq!(engine.reap_expired(10).unwrap(), 0);
        assert_eq!(engine.len().unwrap(), 1);
    }

    #[test]
    fn test_flush_sentinel() {
        let engine = MemoryEngine::new();
        engine.write(&WriteInput::set("a", "1")).unwrap();
        engine.write(&WriteInput::set("b", "2")).unwrap();
        engine.write(&WriteInput::flush_all()).unwrap();
        assert!(engine.is_empty().unwrap());
    }
}
