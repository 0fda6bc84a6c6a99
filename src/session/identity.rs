//! Authenticated user identity.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Marketplace role attached to every authenticated request as
/// `X-User-Type`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UserRole {
    Shipper,
    Driver,
    FleetOperator,
    Dispatcher,
    Admin,
}

/// Cached identity of the logged-in user.
///
/// Present exactly while the session holds credentials; cleared on logout
/// and on session expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub role: UserRole,
    #[serde(default)]
    pub email_verified: bool,
}
