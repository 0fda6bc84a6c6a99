//! Typed realtime envelope.
//!
//! Wire frames are JSON text with envelope `{"type": ..., "payload": ...}`.
//! Decoding validates at the boundary: subscribers only ever see one of the
//! variants below, never a raw JSON value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumDiscriminants, EnumString};

use crate::error::{LanewireError, Result};

/// Inbound/outbound realtime messages, keyed by the envelope `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumDiscriminants)]
#[strum_discriminants(name(MessageType))]
#[strum_discriminants(derive(Hash, Display, EnumString))]
#[strum_discriminants(strum(serialize_all = "snake_case"))]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RealtimeMessage {
    Notification(NotificationPayload),
    ChatMessage(ChatPayload),
    BidUpdate(BidPayload),
    JobStatus(JobStatusPayload),
}

impl RealtimeMessage {
    /// Decode one wire frame. An unknown `type` or a payload that does not
    /// match its schema is a decode error; the channel logs and drops it.
    pub fn decode(frame: &str) -> Result<Self> {
        serde_json::from_str(frame).map_err(|err| LanewireError::ChannelDecode(err.to_string()))
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|err| LanewireError::ChannelDecode(err.to_string()))
    }

    pub fn message_type(&self) -> MessageType {
        MessageType::from(self)
    }
}

/// In-app notification (badge, toast).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub id: String,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

/// One chat message within a job conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BidStatus {
    Placed,
    Countered,
    Accepted,
    Rejected,
    Withdrawn,
}

/// Carrier bid movement on a posted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidPayload {
    pub job_id: String,
    pub bid_id: String,
    pub carrier_id: String,
    pub amount_cents: i64,
    pub status: BidStatus,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobPhase {
    Posted,
    Assigned,
    PickedUp,
    InTransit,
    Delivered,
    Cancelled,
}

/// Shipment lifecycle update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusPayload {
    pub job_id: String,
    pub status: JobPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,
}
