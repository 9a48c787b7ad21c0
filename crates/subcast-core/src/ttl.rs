//! TTL computation and lazy-expiry checks.
//!
//! Records carry an optional expiry as a UNIX timestamp in seconds. Expiry is
//! enforced at read time: an expired record is treated as absent even while it
//! still physically exists. Nothing in this module deletes anything.

use chrono::Utc;

/// Compute an absolute TTL from a relative lifetime in seconds.
///
/// Returns `None` when TTL is disabled (`None`) or nonsensical (< 2 s), which
/// stores interpret as "never expires".
pub fn compute_ttl(ttl_seconds: Option<i64>) -> Option<i64> {
    match ttl_seconds {
        Some(secs) if secs >= 2 => Some(Utc::now().timestamp() + secs),
        _ => None,
    }
}

/// Whether an absolute TTL has passed. A missing TTL never expires.
pub fn is_ttl_expired(ttl: Option<i64>) -> bool {
    match ttl {
        Some(ttl) => ttl < Utc::now().timestamp(),
        None => false,
    }
}

/// Current UNIX time in seconds, for read-time expiry filters.
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}
