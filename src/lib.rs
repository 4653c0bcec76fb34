//! # relaykv
//!
//! An embeddable key-value store with:
//! - Pluggable storage engines (sled, SQLite, flat files, memory) with TTL support
//! - A durable write-ahead log addressed by `<nanos>-<seq>` offsets
//! - Asynchronous master/replica replication over HTTP
//! - Replica bootstrap from a checksummed dump
//! - WAL trimming bounded by the slowest live replica
//!
//! ## Architecture
//!
//! ```text
//!   clients ──HTTP──▶ ┌──────────────────────────┐
//!                     │ Master                   │
//!                     │  write ─▶ WAL ─▶ apply ─▶ engine
//!                     │  /replication/wal, /dump │
//!                     └────────────┬─────────────┘
//!                                  │ poll + report offset
//!                  ┌───────────────┴───────────────┐
//!                ┌─▼──────────┐               ┌────▼───────┐
//!                │ Replica 1  │               │ Replica 2  │
//!                │ (read-only)│               │ (read-only)│
//!                └────────────┘               └────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a master
//! ```bash
//! relaykv-node --role master --http-addr 127.0.0.1:6380 --data-dir ./master
//! ```
//!
//! ### Start a replica
//! ```bash
//! relaykv-node --role replica --http-addr 127.0.0.1:6381 \
//!   --data-dir ./replica --master-url http://127.0.0.1:6380
//! ```
//!
//! ### Use the CLI
//! ```bash
//! relaykv set greeting hello --ttl-ms 60000
//! relaykv get greeting --node http://127.0.0.1:6381
//! relaykv incr visits
//! ```

#![allow(clippy::result_large_err)]

pub mod adapter;
pub mod common;
pub mod engine;
pub mod replication;
pub mod server;

// Re-export commonly used types
pub use common::{Error, NodeConfig, NodeRole, Result};
pub use engine::{Engine, EngineRegistry, WriteInput};
pub use replication::{Manager, Offset, Position};
pub use server::Node;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
