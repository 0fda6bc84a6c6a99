//! Session states and transition notifications.

use strum::Display;

use super::identity::Identity;

/// The session state machine:
///
/// ```text
/// Anonymous --login--> Authenticated
/// Authenticated --401 / expiry--> Refreshing
/// Refreshing --refresh ok--> Authenticated
/// Refreshing --refresh failed--> Expired
/// Authenticated|Refreshing|Expired --logout--> Anonymous
/// ```
///
/// `Expired` is terminal until an explicit `login` or `logout`; the session
/// never retries a failed refresh on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Anonymous,
    Authenticated,
    Refreshing,
    Expired,
}

/// Snapshot of one session transition, delivered synchronously to
/// observers in registration order.
#[derive(Debug, Clone)]
pub struct SessionChange {
    pub from: SessionState,
    pub to: SessionState,
    /// Present when `to` is [`SessionState::Authenticated`].
    pub identity: Option<Identity>,
    /// Present when `to` is [`SessionState::Expired`].
    pub reason: Option<String>,
}
