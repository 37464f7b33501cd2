//! Access-token expiry bookkeeping.

use std::time::{Duration, SystemTime};

/// Default margin before expiry at which a token should be refreshed.
pub const DEFAULT_REFRESH_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// A bearer token with its expiry instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: SystemTime,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_at: SystemTime) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// True once the remaining lifetime drops to `threshold` or below.
    pub fn is_near_expiry_at(&self, now: SystemTime, threshold: Duration) -> bool {
        match self.expires_at.duration_since(now) {
            Ok(remaining) => remaining <= threshold,
            Err(_) => true,
        }
    }

    /// True once the remaining lifetime drops to five minutes or below.
    pub fn is_near_expiry(&self) -> bool {
        self.is_near_expiry_at(SystemTime::now(), DEFAULT_REFRESH_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn near_expiry_threshold_is_inclusive() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let token = AccessToken::new("t", now + Duration::from_secs(300));
        assert!(token.is_near_expiry_at(now, DEFAULT_REFRESH_THRESHOLD));

        let fresh = AccessToken::new("t", now + Duration::from_secs(301));
        assert!(!fresh.is_near_expiry_at(now, DEFAULT_REFRESH_THRESHOLD));

        let expired = AccessToken::new("t", now - Duration::from_secs(1));
        assert!(expired.is_near_expiry_at(now, DEFAULT_REFRESH_THRESHOLD));
    }
}
