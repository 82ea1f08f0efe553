//! Time utilities

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in seconds
///
/// A clock set before the epoch yields 0.
pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_now_is_recent() {
        // 2020-01-01
        assert!(unix_now_secs() > 1_577_836_800);
    }
}
