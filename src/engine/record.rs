//! Stored record layout and the write matrix shared by every backend
//!
//! Record encoding: `[FLAG:1][EXPIRES_AT:8 if FLAG=1][VALUE]`, expiry in
//! nanoseconds since the Unix epoch, big-endian. Liveness is decided from
//! a single read of the record.

use crate::common::{Error, Result};
use crate::engine::WriteInput;
use std::time::Duration;

const FLAG_PERSISTENT: u8 = 0;
const FLAG_EXPIRES: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub value: Vec<u8>,
    /// Absolute expiry (ns since epoch); `None` never expires
    pub expires_at: Option<u64>,
}

impl Record {
    pub fn new(value: Vec<u8>, expires_at: Option<u64>) -> Self {
        Self { value, expires_at }
    }

    pub fn is_expired(&self, now_nanos: u64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now_nanos)
    }

    /// Remaining time to live
    pub fn ttl(&self, now_nanos: u64) -> Option<Duration> {
        self.expires_at
            .map(|at| Duration::from_nanos(at.saturating_sub(now_nanos)))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9 + self.value.len());
        match self.expires_at {
            Some(at) => {
                buf.push(FLAG_EXPIRES);
                buf.extend_from_slice(&at.to_be_bytes());
            }
            None => buf.push(FLAG_PERSISTENT),
        }
        buf.extend_from_slice(&self.value);
        buf
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        match raw.split_first() {
            Some((&FLAG_PERSISTENT, value)) => Ok(Self::new(value.to_vec(), None)),
            Some((&FLAG_EXPIRES, rest)) if rest.len() >= 8 => {
                let (at, value) = rest.split_at(8);
                let mut at_bytes = [0u8; 8];
                at_bytes.copy_from_slice(at);
                Ok(Self::new(value.to_vec(), Some(u64::from_be_bytes(at_bytes))))
            }
            Some((flag, _)) => Err(Error::Corrupted(format!(
                "invalid record header (flag {})",
                flag
            ))),
            None => Err(Error::Corrupted("empty record".into())),
        }
    }
}

/// What a backend has to do to honour a [`WriteInput`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Conditional write lost: leave the current record untouched
    Keep,
    Remove,
    Put(Record),
}

/// Resolve `input` against the live record currently stored under its key.
///
/// `current` must already have expired records filtered out. Flushes are
/// handled by the backend before calling this.
pub fn plan_write(current: Option<&Record>, input: &WriteInput, now_nanos: u64) -> Result<Mutation> {
    let value = match &input.value {
        None => return Ok(Mutation::Remove),
        Some(v) => v,
    };

    if input.only_if_not_exists && current.is_some() {
        return Ok(Mutation::Keep);
    }

    let new_value = if input.increment {
        add_numeric(current.map(|r| r.value.as_slice()), value)?
    } else if input.append {
        let mut joined = current.map(|r| r.value.clone()).unwrap_or_default();
        joined.extend_from_slice(value);
        joined
    } else {
        value.clone()
    };

    let expires_at = match input.effective_ttl() {
        Some(ttl) => Some(now_nanos.saturating_add(ttl.as_nanos() as u64)),
        None if input.keep_ttl => current.and_then(|r| r.expires_at),
        None => None,
    };

    Ok(Mutation::Put(Record::new(new_value, expires_at)))
}

/// Add `delta` to `current` (absent counts as zero). Integer arithmetic when
/// both operands are integers, floating point otherwise.
pub fn add_numeric(current: Option<&[u8]>, delta: &[u8]) -> Result<Vec<u8>> {
    let current = std::str::from_utf8(current.unwrap_or(b"0"))
        .map_err(|_| Error::NotANumber("current value is not valid UTF-8".into()))?
        .trim();
    let delta = std::str::from_utf8(delta)
        .map_err(|_| Error::NotANumber("delta is not valid UTF-8".into()))?
        .trim();

    if let (Ok(a), Ok(b)) = (current.parse::<i64>(), delta.parse::<i64>()) {
        let sum = a
            .checked_add(b)
            .ok_or_else(|| Error::NotANumber("increment would overflow".into()))?;
        return Ok(sum.to_string().into_bytes());
    }

    match (current.parse::<f64>(), delta.parse::<f64>()) {
        (Ok(a), Ok(b)) if (a + b).is_finite() => Ok((a + b).to_string().into_bytes()),
        (Ok(_), Ok(_)) => Err(Error::NotANumber("increment would overflow".into())),
        (Err(_), _) => Err(Error::NotANumber(current.to_string())),
        (_, Err(_)) => Err(Error::NotANumber(delta.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_000_000_000;

    #[test]
    fn test_record_encoding() {
        let persistent = Record::new(b"hello".to_vec(), None);
        assert_eq!(Record::decode(&persistent.encode()).unwrap(), persistent);

        let expiring = Record::new(b"bye".to_vec(), Some(NOW + 5));
        assert_eq!(Record::decode(&expiring.encode()).unwrap(), expiring);

        let empty = Record::new(Vec::new(), None);
        assert_eq!(Record::decode(&empty.encode()).unwrap(), empty);

        assert!(Record::decode(&[]).is_err());
        assert!(Record::decode(&[7, 1, 2]).is_err());
        assert!(Record::decode(&[FLAG_EXPIRES, 1, 2]).is_err());
    }

    #[test]
    fn test_record_expiry() {
        let r = Record::new(b"v".to_vec(), Some(NOW));
        assert!(r.is_expired(NOW));
        assert!(!r.is_expired(NOW - 1));
        assert_eq!(r.ttl(NOW - 10), Some(Duration::from_nanos(10)));
        assert!(!Record::new(b"v".to_vec(), None).is_expired(u64::MAX));
    }

    #[test]
    fn test_plan_conditional() {
        let current = Record::new(b"v1".to_vec(), None);
        let input = WriteInput::set("k", "v2").with_only_if_not_exists();
        assert_eq!(
            plan_write(Some(&current), &input, NOW).unwrap(),
            Mutation::Keep
        );
        assert_eq!(
            plan_write(None, &input, NOW).unwrap(),
            Mutation::Put(Record::new(b"v2".to_vec(), None))
        );
    }

    #[test]
    fn test_plan_ttl_rules() {
        let current = Record::new(b"v1".to_vec(), Some(NOW + 10));

        // plain write clears the expiry
        let plain = plan_write(Some(&current), &WriteInput::set("k", "v2"), NOW).unwrap();
        assert_eq!(plain, Mutation::Put(Record::new(b"v2".to_vec(), None)));

        // keep_ttl preserves it
        let keep = WriteInput::set("k", "v2").with_keep_ttl();
        assert_eq!(
            plan_write(Some(&current), &keep, NOW).unwrap(),
            Mutation::Put(Record::new(b"v2".to_vec(), Some(NOW + 10)))
        );

        // keep_ttl on a new key stores no expiry
        assert_eq!(
            plan_write(None, &keep, NOW).unwrap(),
            Mutation::Put(Record::new(b"v2".to_vec(), None))
        );

        // explicit ttl sets a fresh absolute expiry
        let ttl = WriteInput::set("k", "v2").with_ttl(Duration::from_nanos(100));
        assert_eq!(
            plan_write(Some(&current), &ttl, NOW).unwrap(),
            Mutation::Put(Record::new(b"v2".to_vec(), Some(NOW + 100)))
        );
    }

    #[test]
    fn test_plan_delete() {
        assert_eq!(
            plan_write(None, &WriteInput::delete("k"), NOW).unwrap(),
            Mutation::Remove
        );
    }

    #[test]
    fn test_plan_increment_and_append() {
        let current = Record::new(b"41".to_vec(), None);
        assert_eq!(
            plan_write(Some(&current), &WriteInput::increment("k", 1), NOW).unwrap(),
            Mutation::Put(Record::new(b"42".to_vec(), None))
        );
        assert_eq!(
            plan_write(None, &WriteInput::increment("k", -3), NOW).unwrap(),
            Mutation::Put(Record::new(b"-3".to_vec(), None))
        );
        assert_eq!(
            plan_write(Some(&current), &WriteInput::append("k", "!"), NOW).unwrap(),
            Mutation::Put(Record::new(b"41!".to_vec(), None))
        );
    }

    #[test]
    fn test_add_numeric() {
        assert_eq!(add_numeric(Some(&b"10"[..]), b"5").unwrap(), b"15");
        assert_eq!(add_numeric(Some(&b"1.5"[..]), b"1").unwrap(), b"2.5");
        assert_eq!(add_numeric(Some(&b" 2 "[..]), b"0.5").unwrap(), b"2.5");
        assert!(matches!(
            add_numeric(Some(&b"abc"[..]), b"1"),
            Err(Error::NotANumber(_))
        ));
        assert!(add_numeric(Some(&b"1"[..]), b"x").is_err());
        assert!(add_numeric(Some(i64::MAX.to_string().as_bytes()), b"1").is_err());
    }
}
