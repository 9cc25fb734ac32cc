//! Observability surface: counter pull interface and log-directory
//! resolution.
//!
//! The core emits structured `tracing` events (one record per transaction
//! boundary, one per recovery decision); the embedding application owns
//! the subscriber. [`log_dir`] resolves where a file-based subscriber
//! should write, honoring the single optional environment variable the
//! core recognizes.

use std::path::PathBuf;

use strata_txn::CounterSnapshot;

/// Environment variable selecting an alternate log directory.
pub const LOG_DIR_ENV: &str = "STRATA_LOG_DIR";

/// Directory for log output: `$STRATA_LOG_DIR` if set and non-empty,
/// otherwise `stratadb` under the system temp directory.
#[must_use]
pub fn log_dir() -> PathBuf {
    match std::env::var_os(LOG_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir().join("stratadb"),
    }
}

/// Render a counter snapshot as a JSON object, for scrape endpoints.
#[must_use]
pub fn counters_to_json(snapshot: &CounterSnapshot) -> String {
    serde_json::to_string(snapshot).expect("counter snapshot serializes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_txn::Counters;

    #[test]
    fn default_log_dir_is_under_temp() {
        // Leave the environment untouched; just check the fallback shape.
        if std::env::var_os(LOG_DIR_ENV).is_none() {
            assert!(log_dir().starts_with(std::env::temp_dir()));
        }
    }

    #[test]
    fn counters_serialize_to_json() {
        let counters = Counters::new();
        let json = counters_to_json(&counters.snapshot());
        assert!(json.contains("\"commits\":0"));
        assert!(json.contains("\"frames_written\":0"));
        assert!(json.contains("\"deadlocks\":0"));
    }
}
