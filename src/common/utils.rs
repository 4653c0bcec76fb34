//! Utility functions for relaykv

use crate::common::{Error, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::time::Duration;

/// Percent-encoding set for keys used in URL paths (`/` is kept, keys may be hierarchical)
const KEY_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b'%')
    .add(b' ')
    .add(b'?')
    .add(b'#')
    .add(b'&')
    .add(b'+');

/// Longest key accepted by the write path
pub const MAX_KEY_LEN: usize = 64 * 1024;

/// Encode a key for URL usage
pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_ENCODE_SET).to_string()
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Parse a human size string ("512", "64KB", "1.5GB", "2gib") into bytes
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (num_str, unit) = s.split_at(split);
    if num_str.is_empty() {
        return Err(Error::InvalidConfig(format!("invalid size: {:?}", s)));
    }

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid size: {:?}", s)))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        "t" | "tb" | "tib" => 1 << 40,
        other => {
            return Err(Error::InvalidConfig(format!(
                "unknown size unit: {}",
                other
            )))
        }
    };

    Ok((num * multiplier as f64) as u64)
}

/// Validate a key for the write path (must be non-empty, reasonable length)
pub fn validate_key(key: &[u8]) -> Result<()> {
    if key.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(Error::InvalidKey("empty key specified".into()));
    }

    if key.len() > MAX_KEY_LEN {
        return Err(Error::InvalidKey(format!(
            "key too long (max {} bytes)",
            MAX_KEY_LEN
        )));
    }

    Ok(())
}

/// Delay before the next attempt after `failures` consecutive failures,
/// doubled each time with up to 10% jitter, capped at `max`.
pub fn backoff_delay(initial: Duration, failures: u32, max: Duration) -> Duration {
    let exp = initial.saturating_mul(1u32 << failures.min(16));
    let base = exp.min(max);
    let jitter = rand::random::<f64>() * 0.1;
    base + base.mul_f64(jitter)
}
