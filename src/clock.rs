// SPDX-License-Identifier: MIT
//! UTC clock abstraction.
//!
//! The ledger stores every timestamp as `YYYY-MM-DD HH:MM:SS` in UTC. Going
//! through a single [`Clock`] seam — rather than calling `chrono::Utc::now()`
//! directly from engine code — lets tests inject a fixed or stepped clock
//! instead of sleeping real wall-clock minutes to exercise stuck-transfer
//! detection.

use chrono::{DateTime, Timelike, Utc};

/// Format used for every timestamp persisted to the ledger.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Source of the current UTC instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Real wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Render a UTC timestamp in the ledger's canonical string form.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a ledger timestamp string back into a `DateTime<Utc>`.
pub fn parse_timestamp(s: &str) -> anyhow::Result<DateTime<Utc>> {
    let naive = chrono::NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)?;
    Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_string_form() {
        let now = Utc::now().with_nanosecond(0).unwrap();
        let formatted = format_timestamp(now);
        let parsed = parse_timestamp(&formatted).unwrap();
        assert_eq!(now, parsed);
    }

    #[test]
    fn system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
