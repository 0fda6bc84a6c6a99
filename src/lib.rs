//! Lanewire — session & realtime connection core for the Lanewire
//! freight-marketplace client.
//!
//! The crate owns the authentication credentials, attaches them to every
//! outbound call, renews them transparently when the backend rejects them
//! (single-flight), and keeps one live notification/chat channel whose
//! connection state is derived from the session state. UI layers consume
//! this crate; they never talk to the socket or the token store directly.
//!
//! # Quick Start
//!
//! ```no_run
//! use lanewire::prelude::*;
//!
//! # async fn example() -> lanewire::error::Result<()> {
//! let client = LanewireClient::new(ClientConfig::from_env())?;
//! client.session().login(
//!     Identity {
//!         user_id: "u-100".into(),
//!         role: UserRole::Shipper,
//!         email_verified: true,
//!     },
//!     "access-token",
//!     "refresh-token",
//! )?;
//! let jobs = client.pipeline().send(RequestConfig::get("/jobs")).await?;
//! println!("{}", jobs.status());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod prelude;
pub mod realtime;
pub mod session;
pub mod store;
