//! Error types for Lanewire.

use thiserror::Error;

/// Primary error type for all Lanewire operations.
///
/// Every payload is a plain value so the enum is `Clone`; results of the
/// shared refresh future are handed to every waiter.
#[derive(Debug, Clone, Error)]
pub enum LanewireError {
    /// Credential store read or write failed. Fatal for the operation in
    /// progress, never for the session: the caller decides what to do.
    #[error("storage error: {0}")]
    Storage(String),

    /// No valid credential is available, or the 401 → refresh → retry cycle
    /// has been exhausted.
    #[error("not authenticated")]
    Unauthenticated,

    /// The refresh endpoint rejected the refresh token, failed, or timed
    /// out. Always accompanied by a transition to the expired session state.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// Generic HTTP connectivity failure. Never triggers a token refresh.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed inbound realtime frame; logged and dropped by the channel.
    #[error("malformed realtime frame: {0}")]
    ChannelDecode(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl From<reqwest::Error> for LanewireError {
    fn from(error: reqwest::Error) -> Self {
        Self::Network(error.to_string())
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, LanewireError>;
