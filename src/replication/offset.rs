//! WAL offsets and replication cursors
//!
//! An offset is `"<wall_clock_nanos>-<counter>"`. The counter never repeats
//! within a WAL, so offsets stay strictly increasing even when the clock
//! stalls or steps back. Ordering is numeric on `(nanos, seq)`; the physical
//! key is the 16-byte big-endian pair so byte order agrees with it.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const OFFSET_KEY_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Offset {
    pub nanos: u64,
    pub seq: u64,
}

impl Offset {
    pub fn new(nanos: u64, seq: u64) -> Self {
        Self { nanos, seq }
    }

    /// Physical WAL key
    pub fn to_key(&self) -> [u8; OFFSET_KEY_LEN] {
        let mut key = [0u8; OFFSET_KEY_LEN];
        key[..8].copy_from_slice(&self.nanos.to_be_bytes());
        key[8..].copy_from_slice(&self.seq.to_be_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> Result<Self> {
        if key.len() != OFFSET_KEY_LEN {
            return Err(Error::Corrupted(format!(
                "WAL key has {} bytes, expected {}",
                key.len(),
                OFFSET_KEY_LEN
            )));
        }
        let mut nanos = [0u8; 8];
        let mut seq = [0u8; 8];
        nanos.copy_from_slice(&key[..8]);
        seq.copy_from_slice(&key[8..]);
        Ok(Self::new(u64::from_be_bytes(nanos), u64::from_be_bytes(seq)))
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.nanos, self.seq)
    }
}

impl FromStr for Offset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidOffset(s.to_string());
        let (nanos, seq) = s.trim().split_once('-').ok_or_else(invalid)?;
        Ok(Self::new(
            nanos.parse().map_err(|_| invalid())?,
            seq.parse().map_err(|_| invalid())?,
        ))
    }
}

impl TryFrom<String> for Offset {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Offset> for String {
    fn from(offset: Offset) -> Self {
        offset.to_string()
    }
}

/// Replication cursor: either the beginning of the log or the last applied entry.
///
/// Serialized as the offset string, with `""` for [`Position::Start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Position {
    #[default]
    Start,
    At(Offset),
}

impl Position {
    pub fn offset(&self) -> Option<Offset> {
        match self {
            Position::Start => None,
            Position::At(offset) => Some(*offset),
        }
    }

    /// True if the entry at `offset` has already been applied at this position
    pub fn covers(&self, offset: Offset) -> bool {
        match self {
            Position::Start => false,
            Position::At(at) => offset <= *at,
        }
    }
}

impl From<Offset> for Position {
    fn from(offset: Offset) -> Self {
        Position::At(offset)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Start => Ok(()),
            Position::At(offset) => write!(f, "{}", offset),
        }
    }
}

impl FromStr for Position {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            Ok(Position::Start)
        } else {
            Ok(Position::At(s.parse()?))
        }
    }
}

impl TryFrom<String> for Position {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Position> for String {
    fn from(position: Position) -> Self {
        position.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let offset: Offset = "100-1".parse().unwrap();
        assert_eq!(offset, Offset::new(100, 1));
        assert_eq!(offset.to_string(), "100-1");
        assert!("100".parse::<Offset>().is_err());
        assert!("a-1".parse::<Offset>().is_err());
        assert!("1-".parse::<Offset>().is_err());
        assert!("-1-2".parse::<Offset>().is_err());
    }

    #[test]
    fn test_ordering_ignores_decimal_width() {
        let a: Offset = "99-9".parse().unwrap();
        let b: Offset = "100-1".parse().unwrap();
        let c: Offset = "100-10".parse().unwrap();
        assert!(a < b && b < c);
        assert!(a.to_key() < b.to_key() && b.to_key() < c.to_key());
        assert_eq!(Offset::from_key(&c.to_key()).unwrap(), c);
        assert!(Offset::from_key(b"short").is_err());
    }

    #[test]
    fn test_position() {
        assert_eq!("".parse::<Position>().unwrap(), Position::Start);
        let at: Position = "105-2".parse().unwrap();
        assert_eq!(at.to_string(), "105-2");
        assert!(Position::Start < at);
        assert!(at.covers(Offset::new(100, 1)));
        assert!(at.covers(Offset::new(105, 2)));
        assert!(!at.covers(Offset::new(110, 3)));
        assert!(!Position::Start.covers(Offset::new(0, 0)));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&Offset::new(5, 7)).unwrap();
        assert_eq!(json, "\"5-7\"");
        let back: Offset = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Offset::new(5, 7));
        let start: Position = serde_json::from_str("\"\"").unwrap();
        assert_eq!(start, Position::Start);
    }
}
