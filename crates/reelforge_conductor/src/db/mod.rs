//! Domain queries over the shared store.
//!
//! Split by entity, in the shape of the persistence contract: short,
//! single-purpose functions that take the pool (or a transaction handle)
//! and never outlive it.

pub mod audit;
pub mod channels;
pub mod costs;
pub mod ledger;
pub mod models;
pub mod observations;
pub mod queue;
pub mod reviews;
pub mod tasks;

use chrono::{DateTime, Utc};

/// Current time as the RFC 3339 text every table stores.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Parse a stored timestamp; malformed values fall back to the epoch so a
/// corrupt row sorts first instead of crashing a projection.
pub fn parse_ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// UTC calendar date (YYYY-MM-DD) for ledger keys.
pub fn today_utc() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

/// Start of the next UTC day, for quota parking.
pub fn next_utc_midnight() -> DateTime<Utc> {
    let tomorrow = Utc::now().date_naive() + chrono::Days::new(1);
    DateTime::from_naive_utc_and_offset(
        tomorrow.and_hms_opt(0, 0, 0).unwrap_or_default(),
        Utc,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ts_round_trips() {
        let now = Utc::now();
        let parsed = parse_ts(&now.to_rfc3339());
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn malformed_timestamps_sort_first() {
        assert_eq!(parse_ts("garbage"), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn next_midnight_is_midnight() {
        let midnight = next_utc_midnight();
        assert_eq!(midnight.format("%H:%M:%S").to_string(), "00:00:00");
        assert!(midnight > Utc::now());
    }
}
