use std::fmt::Display;

use chrono::{DateTime, FixedOffset, TimeZone};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub DateTime<FixedOffset>);

impl Timestamp {
    pub fn now() -> Self {
        Self(chrono::offset::Local::now().into())
    }

    pub fn from_unix(unix: i64, offset_seconds: i32) -> Option<Self> {
        let offset = FixedOffset::east_opt(offset_seconds)?;
        offset.timestamp_opt(unix, 0).single().map(Self)
    }

    /// Parse a timestamp from unix seconds and a `+HHMM` offset, e.g. `1658312219 +0100`.
    pub fn parse(s: &str) -> Option<Self> {
        let (unix, offset) = s.split_once(' ')?;
        let unix = unix.parse::<i64>().ok()?;

        let (sign, digits) = match offset.as_bytes().first()? {
            b'+' => (1, &offset[1..]),
            b'-' => (-1, &offset[1..]),
            _ => return None,
        };
        if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let hours = digits[..2].parse::<i32>().ok()?;
        let minutes = digits[2..].parse::<i32>().ok()?;

        Self::from_unix(unix, sign * (hours * 3600 + minutes * 60))
    }

    pub fn unix(&self) -> i64 {
        self.0.timestamp()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%s %z"))
    }
}
