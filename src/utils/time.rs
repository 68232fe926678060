//! Wall-clock helpers.

use crate::error::{constants, ProtocolError, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
///
/// # Errors
/// Returns `ProtocolError::Custom` if the system clock is set before the epoch
pub fn current_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .map_err(|_| ProtocolError::Custom(constants::ERR_SYSTEM_TIME.into()))
}

/// Signed millisecond timestamp used in packet metadata; a broken clock yields 0.
pub fn send_timestamp() -> i64 {
    current_timestamp().map(|ms| ms as i64).unwrap_or(0)
}

/// Verify that a timestamp is recent enough.
///
/// Accepts at most two seconds of clock skew into the future.
pub fn verify_timestamp(timestamp: u64, max_age_seconds: u64) -> bool {
    let current = match current_timestamp() {
        Ok(time) => time,
        Err(_) => return false,
    };

    let max_age_ms = max_age_seconds * 1000;
    const FUTURE_TOLERANCE_MS: u64 = 2000;

    if timestamp > current + FUTURE_TOLERANCE_MS {
        return false;
    }

    if current > timestamp && current - timestamp > max_age_ms {
        return false;
    }

    true
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_validation() {
        let now = current_timestamp().unwrap();
        assert!(verify_timestamp(now, 30));
        assert!(verify_timestamp(now - 10_000, 30));
        assert!(!verify_timestamp(now - 31_000, 30));
        assert!(verify_timestamp(now + 1000, 30));
        assert!(!verify_timestamp(now + 3000, 30));
    }

    #[test]
    fn test_send_timestamp_is_positive() {
        assert!(send_timestamp() > 0);
    }
}
