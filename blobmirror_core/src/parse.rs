//! Parsers for the size and duration grammars used by the environment
//! configuration. Sizes accept the suffixes b/k/m/g/t/p as powers of 1024,
//! durations accept s/m/h/d/w; a bare number means bytes or seconds.

use std::time::Duration;

use crate::BoxError;

/// Parses a byte size such as `"10k"` or `"512"` into a byte count.
pub fn parse_size(s: &str) -> Result<u64, BoxError> {
    let s = s.trim().to_ascii_lowercase();
    if s.is_empty() {
        return Err("empty size".into());
    }
    let (num, shift) = match s.as_bytes()[s.len() - 1] {
        b'b' => (&s[..s.len() - 1], 0u32),
        b'k' => (&s[..s.len() - 1], 10),
        b'm' => (&s[..s.len() - 1], 20),
        b'g' => (&s[..s.len() - 1], 30),
        b't' => (&s[..s.len() - 1], 40),
        b'p' => (&s[..s.len() - 1], 50),
        _ => (s.as_str(), 0),
    };
    let num: u64 = num.trim().parse()?;
    num.checked_mul(1u64 << shift)
        .ok_or_else(|| format!("size {s:?} overflows").into())
}

/// Parses a duration such as `"1d"` or `"30"` into a [`Duration`].
pub fn parse_duration(s: &str) -> Result<Duration, BoxError> {
    let s = s.trim().to_ascii_lowercase();
    if s.is_empty() {
        return Err("empty duration".into());
    }
    let (num, unit) = match s.as_bytes()[s.len() - 1] {
        b's' => (&s[..s.len() - 1], 1u64),
        b'm' => (&s[..s.len() - 1], 60),
        b'h' => (&s[..s.len() - 1], 60 * 60),
        b'd' => (&s[..s.len() - 1], 24 * 60 * 60),
        b'w' => (&s[..s.len() - 1], 7 * 24 * 60 * 60),
        _ => (s.as_str(), 1),
    };
    let num: u64 = num.trim().parse()?;
    let secs = num
        .checked_mul(unit)
        .ok_or_else(|| format!("duration {s:?} overflows"))?;
    Ok(Duration::from_secs(secs))
}
