//! Replication manager
//!
//! Single entry point for client writes and reads on a node, and owner of
//! the apply path shared by both roles:
//!
//! - master: `write` appends to the WAL; the apply loop drains it into the engine
//! - replica: `write` is rejected; the replication loop feeds master entries
//!   into `apply_batch`
//!
//! Applying an entry never runs twice for the same offset. Entries at or
//! before the committed position are skipped. Increments and appends are
//! resolved into a plain put/remove first, journaled in the state store,
//! then written and synced before the offset is committed; a journaled entry
//! left behind by a crash is re-applied on open.

use crate::common::{
    validate_key, Clock, Error, NodeConfig, NodeRole, Result, SystemClock,
};
use crate::engine::record::add_numeric;
use crate::engine::{
    plan_write, Engine, EngineOptions, EngineRegistry, IterateFn, Mutation, ReadOutput, Record,
    WriteInput,
};
use crate::replication::offset::{Offset, Position};
use crate::replication::state::{PendingApply, ReplicaProgress, ResolvedWrite, StateStore};
use crate::replication::wal::{Wal, WalEntry};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub node_id: String,
    pub role: NodeRole,
    /// Entries applied per `apply_pending` call
    pub apply_batch_size: usize,
    /// WAL size above which retention trims
    pub max_wal_size: u64,
    /// Replicas silent for longer than this stop holding back trimming
    pub replica_ttl: Duration,
}

impl ManagerOptions {
    pub fn new(node_id: impl Into<String>, role: NodeRole) -> Self {
        Self {
            node_id: node_id.into(),
            role,
            apply_batch_size: 128,
            max_wal_size: 1 << 30,
            replica_ttl: Duration::from_secs(600),
        }
    }

    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        Ok(Self {
            node_id: config.node_id.clone(),
            role: config.role,
            apply_batch_size: config.apply_batch_size,
            max_wal_size: config.max_wal_size_bytes()?,
            replica_ttl: config.replica_ttl(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub replica_id: String,
    pub offset: Position,
    /// Milliseconds since the last report
    pub last_seen_ms: u64,
    pub live: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalStatus {
    pub first_offset: Option<Offset>,
    pub last_offset: Option<Offset>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub role: NodeRole,
    pub engine: String,
    pub offset: Position,
    pub bootstrapped: bool,
    pub wal: Option<WalStatus>,
    pub replicas: Vec<ReplicaStatus>,
}

pub struct Manager {
    options: ManagerOptions,
    engine: Arc<dyn Engine>,
    wal: Option<Wal>,
    state: StateStore,
    clock: Arc<dyn Clock>,
    /// Serializes apply, bootstrap, dump capture and trimming
    apply_lock: Mutex<()>,
    applied: watch::Sender<Position>,
    wal_signal: Notify,
}

impl Manager {
    /// Open every store a node needs from its configuration.
    pub fn open(config: &NodeConfig, registry: &EngineRegistry) -> Result<Self> {
        config.validate(&registry.names())?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        std::fs::create_dir_all(&config.data_dir)?;
        let engine = registry.open(
            &config.engine,
            &EngineOptions::new(config.engine_path())
                .with_clock(clock.clone())
                .with_sync_writes(config.sync_writes),
        )?;
        let state = StateStore::open(config.state_path())?;
        let wal = match config.role {
            NodeRole::Master => Some(Wal::open(config.wal_path(), clock.clone())?),
            NodeRole::Replica => None,
        };

        Self::new(ManagerOptions::from_config(config)?, engine, wal, state, clock)
    }

    /// Assemble a manager from already opened parts and recover any
    /// interrupted apply. Masters must be given a WAL, replicas must not.
    pub fn new(
        options: ManagerOptions,
        engine: Arc<dyn Engine>,
        wal: Option<Wal>,
        state: StateStore,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        match (options.role, wal.is_some()) {
            (NodeRole::Master, false) => {
                return Err(Error::InvalidConfig("a master requires a WAL".into()))
            }
            (NodeRole::Replica, true) => {
                return Err(Error::InvalidConfig("a replica does not keep a WAL".into()))
            }
            _ => {}
        }

        let (applied, _) = watch::channel(Position::Start);
        let manager = Self {
            options,
            engine,
            wal,
            state,
            clock,
            apply_lock: Mutex::new(()),
            applied,
            wal_signal: Notify::new(),
        };
        manager.recover()?;
        Ok(manager)
    }

    fn recover(&self) -> Result<()> {
        let committed = self.state.position()?;

        if let Some(pending) = self.state.pending()? {
            if committed.map_or(false, |p| p.covers(pending.offset)) {
                self.state.clear_pending()?;
            } else {
                tracing::warn!(offset = %pending.offset, "re-applying journaled write after restart");
                pending.write.apply(self.engine.as_ref())?;
                self.engine.sync()?;
                self.state.commit(pending.offset)?;
            }
        }

        let position = match self.state.position()? {
            Some(position) => position,
            None if self.is_master() => {
                self.state.set_position(Position::Start)?;
                Position::Start
            }
            None => Position::Start,
        };
        self.applied.send_replace(position);

        tracing::info!(
            node_id = %self.options.node_id,
            role = %self.options.role,
            engine = self.engine.name(),
            offset = %position,
            "replication manager ready"
        );
        Ok(())
    }

    pub fn node_id(&self) -> &str {
        &self.options.node_id
    }

    pub fn role(&self) -> NodeRole {
        self.options.role
    }

    pub fn is_master(&self) -> bool {
        self.options.role == NodeRole::Master
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub(crate) fn wal_signal(&self) -> &Notify {
        &self.wal_signal
    }

    fn wal(&self) -> Result<&Wal> {
        self.wal.as_ref().ok_or(Error::NotMaster)
    }

    fn lock_apply(&self) -> Result<MutexGuard<'_, ()>> {
        self.apply_lock
            .lock()
            .map_err(|_| Error::Internal("apply lock poisoned".into()))
    }

    // === Client operations ===

    /// Accept a write on the master: append it to the WAL and wake the apply loop.
    ///
    /// The returned offset can be passed to [`Manager::wait_for`] to observe
    /// the write locally.
    pub fn write(&self, input: &WriteInput) -> Result<Offset> {
        if !self.is_master() {
            return Err(Error::ReadOnly);
        }
        if !input.is_flush() {
            validate_key(&input.key)?;
        }
        if input.increment {
            // reject obvious type errors before they reach the log
            let delta = input.value.as_deref().unwrap_or_default();
            let current = self.engine.read(&input.key)?;
            add_numeric(current.value.as_deref(), delta)?;
        }

        let payload = input.encode()?;
        let offset = self.wal()?.append(&payload)?;
        self.wal_signal.notify_one();
        tracing::debug!(%offset, key_len = input.key.len(), "write appended");
        Ok(offset)
    }

    pub fn read(&self, key: &[u8]) -> Result<ReadOutput> {
        self.engine.read(key)
    }

    pub fn iterate(&self, prefix: &[u8], f: &mut IterateFn<'_>) -> Result<()> {
        self.engine.iterate(prefix, f)
    }

    /// Wait until the entry at `offset` has been applied locally.
    pub async fn wait_for(&self, offset: Offset, timeout: Duration) -> Result<()> {
        let mut rx = self.applied.subscribe();
        let applied = async move { rx.wait_for(|p| p.covers(offset)).await.map(|_| ()) };
        match tokio::time::timeout(timeout, applied).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Internal("apply watcher closed".into())),
            Err(_) => Err(Error::Timeout(format!("offset {} not applied", offset))),
        }
    }

    // === Apply path ===

    /// Last committed position (Start if never positioned)
    pub fn current_position(&self) -> Result<Position> {
        Ok(self.state.position()?.unwrap_or_default())
    }

    /// True for a replica that has never imported a dump
    pub fn needs_bootstrap(&self) -> Result<bool> {
        Ok(!self.is_master() && self.state.position()?.is_none())
    }

    /// Master: apply the next batch of WAL entries. Returns how many were applied.
    pub fn apply_pending(&self) -> Result<usize> {
        let wal = self.wal()?;
        let _guard = self.lock_apply()?;
        let position = self.current_position()?;
        let entries = wal.range_from(position, false, self.options.apply_batch_size)?;

        let mut applied = 0;
        for entry in &entries {
            if self.apply_locked(entry)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Apply entries received from the master, in order. Already applied
    /// entries are skipped.
    pub fn apply_batch(&self, entries: &[WalEntry]) -> Result<usize> {
        let _guard = self.lock_apply()?;
        let mut applied = 0;
        for entry in entries {
            if self.apply_locked(entry)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    fn apply_locked(&self, entry: &WalEntry) -> Result<bool> {
        let position = self.current_position()?;
        if position.covers(entry.offset) {
            tracing::debug!(offset = %entry.offset, "skipping applied entry");
            return Ok(false);
        }

        let input = WriteInput::decode(&entry.payload)?;
        if input.is_idempotent() {
            self.engine.write(&input)?;
        } else {
            let write = self.resolve(&input)?;
            self.state.stage(&PendingApply {
                offset: entry.offset,
                write: write.clone(),
            })?;
            write.apply(self.engine.as_ref())?;
            if write != ResolvedWrite::Keep {
                // the journal is dropped by the commit below
                self.engine.sync()?;
            }
        }

        self.state.commit(entry.offset)?;
        self.applied.send_replace(Position::At(entry.offset));
        Ok(true)
    }

    /// Turn an increment/append into the put it produces against current state
    fn resolve(&self, input: &WriteInput) -> Result<ResolvedWrite> {
        let now = self.clock.now_nanos();
        let current = self.engine.read(&input.key)?;
        let record = match current.value {
            Some(value) if current.exists => Some(Record::new(
                value,
                current
                    .ttl
                    .map(|ttl| now.saturating_add(ttl.as_nanos() as u64)),
            )),
            _ => None,
        };

        match plan_write(record.as_ref(), input, now) {
            Ok(Mutation::Keep) => Ok(ResolvedWrite::Keep),
            Ok(Mutation::Remove) => Ok(ResolvedWrite::Remove {
                key: input.key.clone(),
            }),
            Ok(Mutation::Put(record)) => Ok(ResolvedWrite::Put {
                key: input.key.clone(),
                value: record.value,
                expires_at: record.expires_at,
            }),
            Err(Error::NotANumber(reason)) => {
                // same outcome on every node: the entry leaves the key untouched
                tracing::warn!(key_len = input.key.len(), %reason, "increment skipped");
                Ok(ResolvedWrite::Keep)
            }
            Err(e) => Err(e),
        }
    }

    // === Master-facing replication API ===

    /// Entries after `position`, up to `limit` (`0` = unbounded).
    ///
    /// Fails with [`Error::OffsetTrimmed`] when entries after the cursor may
    /// already have been trimmed, including a `Start` cursor once anything
    /// has been trimmed.
    pub fn range_since(&self, position: Position, limit: usize) -> Result<Vec<WalEntry>> {
        let wal = self.wal()?;
        if let Some(trimmed) = self.state.trimmed_through()? {
            match position {
                Position::Start => {
                    return Err(Error::OffsetTrimmed(format!(
                        "start (trimmed through {})",
                        trimmed
                    )))
                }
                Position::At(offset) if offset < trimmed => {
                    return Err(Error::OffsetTrimmed(offset.to_string()))
                }
                Position::At(_) => {}
            }
        }
        wal.range_from(position, false, limit)
    }

    /// Record a replica's confirmed position.
    pub fn report_offset(&self, replica_id: &str, position: Position) -> Result<()> {
        if !self.is_master() {
            return Err(Error::NotMaster);
        }
        if replica_id.trim().is_empty() {
            return Err(Error::InvalidConfig("empty replica id".into()));
        }

        let previous = self.state.replica(replica_id)?;
        if previous.is_none() {
            tracing::info!(replica_id, offset = %position, "new replica reported");
        }
        self.state.put_replica(&ReplicaProgress {
            replica_id: replica_id.to_string(),
            position,
            last_seen: self.clock.now_nanos(),
        })?;
        tracing::debug!(replica_id, offset = %position, "replica offset updated");
        Ok(())
    }

    pub fn replicas(&self) -> Result<Vec<ReplicaStatus>> {
        let now = self.clock.now_nanos();
        let ttl = self.options.replica_ttl.as_nanos() as u64;
        Ok(self
            .state
            .replicas()?
            .into_iter()
            .map(|r| {
                let age = now.saturating_sub(r.last_seen);
                ReplicaStatus {
                    replica_id: r.replica_id,
                    offset: r.position,
                    last_seen_ms: age / 1_000_000,
                    live: age <= ttl,
                }
            })
            .collect())
    }

    /// Highest offset the WAL may be trimmed up to (exclusive): the minimum of
    /// the local applied position and every live replica's confirmed position.
    pub fn trim_bound(&self) -> Result<Option<Offset>> {
        let mut bound = match self.current_position()? {
            Position::Start => return Ok(None),
            Position::At(offset) => offset,
        };
        for replica in self.replicas()?.into_iter().filter(|r| r.live) {
            match replica.offset {
                Position::Start => return Ok(None),
                Position::At(offset) => bound = bound.min(offset),
            }
        }
        Ok(Some(bound))
    }

    /// Forget replicas that have not reported within the replica TTL.
    /// Returns how many were removed.
    pub fn evict_stale_replicas(&self) -> Result<usize> {
        let stale: Vec<ReplicaStatus> = self
            .replicas()?
            .into_iter()
            .filter(|r| !r.live)
            .collect();
        for replica in &stale {
            self.state.remove_replica(&replica.replica_id)?;
            tracing::info!(
                replica_id = %replica.replica_id,
                last_seen_ms = replica.last_seen_ms,
                "evicted stale replica"
            );
        }
        Ok(stale.len())
    }

    /// Evict stale replicas, then trim the WAL if it has outgrown its
    /// ceiling. Returns entries removed.
    pub fn enforce_retention(&self) -> Result<usize> {
        let wal = self.wal()?;
        let _guard = self.lock_apply()?;
        self.evict_stale_replicas()?;

        let size = wal.size()?;
        if size <= self.options.max_wal_size {
            return Ok(0);
        }
        match self.trim_bound()? {
            Some(bound) => {
                let Some(last) = wal.last_before(bound)? else {
                    return Ok(0);
                };
                tracing::info!(size, bound = %bound, "WAL over size limit, trimming");
                self.state.set_trimmed_through(last)?;
                wal.trim_before(bound)
            }
            None => {
                tracing::warn!(size, "WAL over size limit but no safe trim bound");
                Ok(0)
            }
        }
    }

    /// Snapshot the engine together with the position it reflects.
    ///
    /// When `replica_id` is given the replica is registered at that position
    /// before the lock is released, so trimming cannot pass it while the dump
    /// is in flight.
    pub fn capture_dump(&self, replica_id: Option<&str>) -> Result<(Position, Vec<u8>)> {
        let _guard = self.lock_apply()?;
        let position = self.current_position()?;
        if let Some(replica_id) = replica_id {
            self.report_offset(replica_id, position)?;
        }
        let mut buf = Vec::new();
        self.engine.export(&mut buf)?;
        tracing::info!(offset = %position, bytes = buf.len(), "dump captured");
        Ok((position, buf))
    }

    /// Replica: replace local data with a master dump and adopt its position.
    pub fn bootstrap(&self, position: Position, reader: &mut dyn Read, declared_len: u64) -> Result<()> {
        if self.is_master() {
            return Err(Error::Bootstrap("a master does not bootstrap".into()));
        }
        let _guard = self.lock_apply()?;

        self.engine.write(&WriteInput::flush_all())?;
        let imported = self.engine.import(reader)?;
        if imported != declared_len {
            return Err(Error::DumpLengthMismatch {
                declared: declared_len,
                imported,
            });
        }
        self.engine.sync()?;
        self.state.set_position(position)?;
        self.applied.send_replace(position);

        tracing::info!(offset = %position, bytes = imported, "bootstrap complete");
        Ok(())
    }

    /// Physically remove up to `limit` expired records
    pub fn reap_expired(&self, limit: usize) -> Result<usize> {
        self.engine.reap_expired(limit)
    }

    pub fn status(&self) -> Result<NodeStatus> {
        let wal = match &self.wal {
            Some(wal) => Some(WalStatus {
                first_offset: wal.first_offset()?,
                last_offset: wal.last_offset()?,
                size_bytes: wal.size()?,
            }),
            None => None,
        };
        let replicas = if self.is_master() {
            self.replicas()?
        } else {
            Vec::new()
        };
        let position = self.state.position()?;

        Ok(NodeStatus {
            node_id: self.options.node_id.clone(),
            role: self.options.role,
            engine: self.engine.name().to_string(),
            offset: position.unwrap_or_default(),
            bootstrapped: position.is_some(),
            wal,
            replicas,
        })
    }

    pub fn close(&self) -> Result<()> {
        self.engine.close()
    }
}
