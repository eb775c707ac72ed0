//! Human-readable size tokens (`512K`, `64M`, `1G`) and exact byte counts.
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

static SIZE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)([BKMG])$").expect("size regex is valid"));

const UNITS: [(char, u64); 4] = [
    ('G', 1024 * 1024 * 1024),
    ('M', 1024 * 1024),
    ('K', 1024),
    ('B', 1),
];

/// An exact, non-negative byte count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(u64);

impl ByteSize {
    pub const ZERO: ByteSize = ByteSize(0);

    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn kib(n: u64) -> Self {
        Self(n * 1024)
    }

    pub const fn mib(n: u64) -> Self {
        Self(n * 1024 * 1024)
    }

    pub const fn gib(n: u64) -> Self {
        Self(n * 1024 * 1024 * 1024)
    }

    pub const fn bytes(self) -> u64 {
        self.0
    }

    pub fn checked_add(self, other: ByteSize) -> Option<ByteSize> {
        self.0.checked_add(other.0).map(ByteSize)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_size(self.0))
    }
}

impl FromStr for ByteSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_size(s)
    }
}

/// Parses a `<digits><unit>` token, where the unit is one of `B`, `K`, `M`
/// or `G` (powers of 1024).
///
/// Unlike a lenient parser this never maps garbage to zero: anything that is
/// not exactly one size token, or that overflows `u64`, is `MalformedSize`.
pub fn parse_size(token: &str) -> Result<ByteSize> {
    let malformed = || Error::MalformedSize {
        token: token.to_string(),
    };

    let caps = SIZE_TOKEN.captures(token.trim()).ok_or_else(malformed)?;
    let count: u64 = caps[1].parse().map_err(|_| malformed())?;
    let unit = caps[2].chars().next().ok_or_else(malformed)?;
    let multiplier = UNITS
        .iter()
        .find(|(u, _)| *u == unit)
        .map(|(_, m)| *m)
        .ok_or_else(malformed)?;

    count
        .checked_mul(multiplier)
        .map(ByteSize)
        .ok_or_else(malformed)
}

/// Formats a byte count using the largest unit that divides it evenly.
///
/// Zero and counts with no exact K/M/G representation are shown in bytes.
pub fn format_size(bytes: u64) -> String {
    for (unit, multiplier) in UNITS {
        if bytes >= multiplier && bytes % multiplier == 0 {
            return format!("{}{}", bytes / multiplier, unit);
        }
    }
    format!("{bytes}B")
}
