//! Environment-driven limits and intervals.

use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

/// Largest manifest stream accepted by the decoder.
pub fn max_manifest_bytes() -> usize {
    env_parse("BERTH_MAX_MANIFEST_BYTES").unwrap_or(4 * 1024 * 1024)
}

/// Upper bound on JSON nodes per decoded document.
pub fn max_manifest_nodes() -> usize {
    env_parse("BERTH_MAX_MANIFEST_NODES").unwrap_or(100_000)
}

/// Interval between readiness polls, never below one second.
pub fn wait_poll_interval() -> Duration {
    poll_interval(env_parse("BERTH_WAIT_POLL_SECS"))
}

fn poll_interval(secs: Option<u64>) -> Duration {
    Duration::from_secs(secs.unwrap_or(2).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_interval_is_clamped() {
        assert_eq!(poll_interval(None), Duration::from_secs(2));
        assert_eq!(poll_interval(Some(0)), Duration::from_secs(1));
        assert_eq!(poll_interval(Some(5)), Duration::from_secs(5));
    }
}
