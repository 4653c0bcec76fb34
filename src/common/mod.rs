//! Common utilities and types shared across relaykv

pub mod clock;
pub mod config;
pub mod error;
pub mod utils;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{NodeConfig, NodeRole};
pub use error::{Error, Result};
pub use utils::{backoff_delay, encode_key, format_bytes, parse_size, validate_key};
