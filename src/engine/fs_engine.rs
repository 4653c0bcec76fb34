//! Flat-file-per-key engine
//!
//! Layout under the engine directory:
//! ```text
//! kv/<hex(key)>       encoded Record
//! kv/~<blake3(key)>   u32 LE key length, key, encoded Record
//! tmp/<uuid>          staging area for atomic replace
//! ```
//! Keys whose hex form would not fit in a file name are stored under their
//! digest and carry the full key in the file.
//!
//! Writes go to `tmp/` and are renamed into place. `only_if_not_exists`
//! publishes with `hard_link`, which fails if the target already exists.

use crate::common::{Clock, Error, Result};
use crate::engine::{
    plan_write, Engine, EngineOptions, IterateFn, Mutation, ReadOutput, Record, RecordFn,
    WriteInput, WriteOutput,
};
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Longest file name most filesystems accept
const MAX_FILE_NAME: usize = 255;

/// Marks files named by key digest
const DIGEST_PREFIX: &str = "~";

fn file_name(key: &[u8]) -> String {
    if hex_fits(key) {
        hex::encode(key)
    } else {
        format!("{}{}", DIGEST_PREFIX, blake3::hash(key).to_hex())
    }
}

fn encode_file(key: &[u8], record: &Record) -> Vec<u8> {
    let encoded = record.encode();
    if hex_fits(key) {
        return encoded;
    }
    let mut buf = Vec::with_capacity(4 + key.len() + encoded.len());
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(&encoded);
    buf
}

fn hex_fits(key: &[u8]) -> bool {
    key.len() * 2 <= MAX_FILE_NAME
}

/// Key and record stored in the file called `name`
fn decode_file(name: &str, raw: &[u8]) -> Result<(Vec<u8>, Record)> {
    if !name.starts_with(DIGEST_PREFIX) {
        let key = hex::decode(name)
            .map_err(|_| Error::Corrupted(format!("unexpected file name {}", name)))?;
        return Ok((key, Record::decode(raw)?));
    }

    let truncated = || Error::Corrupted(format!("truncated record file {}", name));
    let (len, rest) = raw.split_at_checked(4).ok_or_else(truncated)?;
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(len);
    let (key, record) = rest
        .split_at_checked(u32::from_le_bytes(len_bytes) as usize)
        .ok_or_else(truncated)?;
    Ok((key.to_vec(), Record::decode(record)?))
}

pub struct FsEngine {
    kv_dir: PathBuf,
    tmp_dir: PathBuf,
    write_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
    sync_writes: bool,
}

impl FsEngine {
    pub fn open(options: &EngineOptions) -> Result<Self> {
        let kv_dir = options.path.join("kv");
        let tmp_dir = options.path.join("tmp");
        fs::create_dir_all(&kv_dir)?;
        fs::create_dir_all(&tmp_dir)?;

        // leftovers from an interrupted write
        for entry in fs::read_dir(&tmp_dir)? {
            let entry = entry?;
            if let Err(e) = fs::remove_file(entry.path()) {
                tracing::warn!("failed to remove stale temp file {:?}: {}", entry.path(), e);
            }
        }

        Ok(Self {
            kv_dir,
            tmp_dir,
            write_lock: Mutex::new(()),
            clock: options.clock.clone(),
            sync_writes: options.sync_writes,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| Error::Internal("filesystem engine lock poisoned".into()))
    }

    fn key_path(&self, key: &[u8]) -> PathBuf {
        self.kv_dir.join(file_name(key))
    }

    /// Read a record file, `None` if it does not exist
    fn load_file(path: &Path) -> Result<Option<(Vec<u8>, Record)>> {
        let name = path
            .file_name()
            .and_then(OsStr::to_str)
            .ok_or_else(|| Error::Corrupted(format!("unexpected file {:?}", path)))?;
        match fs::read(path) {
            Ok(raw) => Ok(Some(decode_file(name, &raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn load(&self, key: &[u8]) -> Result<Option<Record>> {
        match Self::load_file(&self.key_path(key))? {
            Some((stored, record)) if stored == key => Ok(Some(record)),
            Some(_) => Err(Error::Corrupted(format!(
                "digest collision on {}",
                file_name(key)
            ))),
            None => Ok(None),
        }
    }

    /// Write `record` to a fresh temp file and return its path
    fn stage(&self, key: &[u8], record: &Record) -> Result<PathBuf> {
        let tmp = self.tmp_dir.join(uuid::Uuid::new_v4().simple().to_string());
        let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        file.write_all(&encode_file(key, record))?;
        if self.sync_writes {
            file.sync_all()?;
        }
        Ok(tmp)
    }

    fn sync_dir(&self) -> Result<()> {
        if self.sync_writes {
            File::open(&self.kv_dir)?.sync_all()?;
        }
        Ok(())
    }

    fn remove(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Live records whose key starts with `prefix`, in key order
    fn collect_live(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Record)>> {
        let now = self.clock.now_nanos();
        let mut live = Vec::new();
        for entry in fs::read_dir(&self.kv_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                tracing::warn!("ignoring unexpected file {:?} in engine directory", name);
                continue;
            };
            if !name.starts_with(DIGEST_PREFIX) {
                match hex::decode(name) {
                    Ok(key) if !key.starts_with(prefix) => continue,
                    Ok(_) => {}
                    Err(_) => {
                        tracing::warn!("ignoring unexpected file {:?} in engine directory", name);
                        continue;
                    }
                }
            }

            // may have been deleted since the directory listing
            if let Some((key, record)) = Self::load_file(&entry.path())? {
                if key.starts_with(prefix) && !record.is_expired(now) {
                    live.push((key, record));
                }
            }
        }
        live.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(live)
    }

    fn flush_all(&self) -> Result<()> {
        for entry in fs::read_dir(&self.kv_dir)? {
            Self::remove(&entry?.path())?;
        }
        self.sync_dir()
    }
}

impl Engine for FsEngine {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn write(&self, input: &WriteInput) -> Result<WriteOutput> {
        let _guard = self.lock()?;
        if input.is_flush() {
            self.flush_all()?;
            return Ok(WriteOutput::default());
        }

        let now = self.clock.now_nanos();
        let path = self.key_path(&input.key);
        let current = self.load(&input.key)?;
        let live = current.as_ref().filter(|r| !r.is_expired(now));

        match plan_write(live, input, now)? {
            Mutation::Keep => Ok(WriteOutput::from_record(live, now)),
            Mutation::Remove => {
                Self::remove(&path)?;
                self.sync_dir()?;
                Ok(WriteOutput::default())
            }
            Mutation::Put(record) => {
                let tmp = self.stage(&input.key, &record)?;
                if input.only_if_not_exists && current.is_none() {
                    let linked = fs::hard_link(&tmp, &path);
                    Self::remove(&tmp)?;
                    match linked {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                            let existing = self.load(&input.key)?;
                            return Ok(WriteOutput::from_record(existing.as_ref(), now));
                        }
                        Err(e) => return Err(e.into()),
                    }
                } else {
                    fs::rename(&tmp, &path)?;
                }
                self.sync_dir()?;
                Ok(WriteOutput::from_record(Some(&record), now))
            }
        }
    }

    fn read(&self, key: &[u8]) -> Result<ReadOutput> {
        let now = self.clock.now_nanos();
        let path = self.key_path(key);
        let record = match self.load(key)? {
            Some(record) => record,
            None => return Ok(ReadOutput::absent(key)),
        };
        if !record.is_expired(now) {
            return Ok(ReadOutput::found(key, record, now));
        }

        // Lazy delete. Skipped when a writer is busy; the reaper catches it later.
        if let Ok(_guard) = self.write_lock.try_lock() {
            if let Ok(Some(r)) = self.load(key) {
                if r.is_expired(now) {
                    if let Err(e) = Self::remove(&path) {
                        tracing::debug!("lazy expiration failed: {}", e);
                    }
                }
            }
        }
        Ok(ReadOutput::absent(key))
    }

    fn iterate(&self, prefix: &[u8], f: &mut IterateFn<'_>) -> Result<()> {
        for (key, record) in self.collect_live(prefix)? {
            if !f(&key, &record.value) {
                break;
            }
        }
        Ok(())
    }

    fn scan_records(&self, f: &mut RecordFn<'_>) -> Result<()> {
        for (key, record) in self.collect_live(&[])? {
            f(&key, &record)?;
        }
        Ok(())
    }

    fn restore(&self, key: &[u8], record: Record) -> Result<()> {
        let _guard = self.lock()?;
        let path = self.key_path(key);
        let tmp = self.stage(key, &record)?;
        fs::rename(&tmp, &path)?;
        self.sync_dir()
    }

    fn reap_expired(&self, limit: usize) -> Result<usize> {
        let _guard = self.lock()?;
        let now = self.clock.now_nanos();
        let mut reaped = 0;
        for entry in fs::read_dir(&self.kv_dir)? {
            if reaped >= limit {
                break;
            }
            let path = entry?.path();
            let expired = match Self::load_file(&path) {
                Ok(Some((_, record))) => record.is_expired(now),
                Ok(None) => false,
                Err(e) => {
                    tracing::warn!("skipping unreadable record {:?}: {}", path, e);
                    false
                }
            };
            if expired {
                Self::remove(&path)?;
                reaped += 1;
            }
        }
        if reaped > 0 {
            self.sync_dir()?;
            tracing::debug!(reaped, "filesystem engine reaped expired records");
        }
        Ok(reaped)
    }

    fn sync(&self) -> Result<()> {
        File::open(&self.kv_dir)?.sync_all()?;
        Ok(())
    }
}
