//! Replicated write path
//!
//! - [`wal`]: durable, offset-ordered log of write intents (master only)
//! - [`state`]: last applied position, apply journal, replica progress
//! - [`manager`]: write/read entry point, apply path, bootstrap, retention
//! - [`tasks`]: background loops (apply, replicate, report, retention, reaper)
//! - [`client`]: replica-side HTTP client for the master API

pub mod client;
pub mod manager;
pub mod offset;
pub mod state;
pub mod tasks;
pub mod wal;

pub use client::{Dump, MasterClient};
pub use manager::{Manager, ManagerOptions, NodeStatus, ReplicaStatus, WalStatus};
pub use offset::{Offset, Position};
pub use state::{PendingApply, ReplicaProgress, ResolvedWrite, StateStore};
pub use tasks::{BackgroundTasks, TaskOptions};
pub use wal::{Wal, WalEntry};

use serde::{Deserialize, Serialize};

/// Response header carrying the position a dump was taken at
pub const CURRENT_OFFSET_HEADER: &str = "x-current-offset";

/// `GET /replication/wal`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalBatch {
    pub entries: Vec<WalEntry>,
}

/// `GET /replication/offset`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetInfo {
    pub offset: Position,
}

/// `POST /replication/offset`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetReport {
    pub replica_id: String,
    pub offset: Position,
}
