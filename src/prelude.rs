//! Commonly used types, importable with `use lanewire::prelude::*`.

pub use crate::client::LanewireClient;
pub use crate::config::ClientConfig;
pub use crate::error::{LanewireError, Result};
pub use crate::pipeline::{RequestConfig, RequestPipeline};
pub use crate::realtime::{
    ChannelState, Fanout, MessageType, RealtimeChannel, RealtimeMessage, Subscription,
};
pub use crate::session::{
    Credential, Identity, SessionChange, SessionManager, SessionState, SessionSubscription,
    UserRole,
};
pub use crate::store::{CredentialStore, EncryptedFileStore};
