//! Token pair held by an authenticated session.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Access/refresh token pair.
///
/// Created on login or refresh, mutated only by refresh, destroyed on
/// logout or refresh failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    /// Server-reported access-token expiry, when known.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Whether the access token is expired or will expire within `skew`.
    ///
    /// Unknown expiry reads as fresh; the backend's 401 is the fallback
    /// signal in that case.
    pub fn needs_refresh(&self, skew: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                let skew = chrono::Duration::from_std(skew).unwrap_or_default();
                Utc::now() + skew >= expires_at
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(expires_at: Option<DateTime<Utc>>) -> Credential {
        Credential {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            expires_at,
        }
    }

    #[test]
    fn unknown_expiry_reads_fresh() {
        assert!(!credential(None).needs_refresh(Duration::from_secs(60)));
    }

    #[test]
    fn expiry_inside_skew_needs_refresh() {
        let soon = Utc::now() + chrono::Duration::seconds(30);
        assert!(credential(Some(soon)).needs_refresh(Duration::from_secs(60)));
    }

    #[test]
    fn distant_expiry_is_fresh() {
        let later = Utc::now() + chrono::Duration::hours(2);
        assert!(!credential(Some(later)).needs_refresh(Duration::from_secs(60)));
    }
}
