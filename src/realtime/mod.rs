//! Realtime WebSocket channel, typed wire messages, and subscriber fanout.

pub mod channel;
pub mod fanout;
pub mod message;

pub use channel::{ChannelState, RealtimeChannel};
pub use fanout::{Fanout, Subscription};
pub use message::{
    BidPayload, BidStatus, ChatPayload, JobPhase, JobStatusPayload, MessageType,
    NotificationPayload, RealtimeMessage,
};
