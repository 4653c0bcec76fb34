//! Node process: HTTP API plus the runtime tying it to replication

pub mod http;
pub mod node;

pub use http::{create_router, HttpState, WriteAck};
pub use node::{Node, RunningNode};
