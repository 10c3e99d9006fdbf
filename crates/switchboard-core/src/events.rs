use serde::{Deserialize, Serialize};

use crate::ids::{ContactId, InstanceId, MessageId};
use crate::status::InstanceStatus;

/// Events broadcast to fan-out subscribers.
///
/// Every variant is scoped to one instance and carries identifiers and
/// display fields only. Credentials never appear here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayEvent {
    #[serde(rename = "pairing")]
    Pairing {
        instance_id: InstanceId,
        code: String,
        cycle: u32,
    },

    #[serde(rename = "status")]
    Status {
        instance_id: InstanceId,
        status: InstanceStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        linked_phone_number: Option<String>,
        /// Why the transition happened, for terminal or forced transitions.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename = "message_received")]
    MessageReceived {
        instance_id: InstanceId,
        contact_id: ContactId,
        message_id: MessageId,
    },
}

impl RelayEvent {
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Self::Pairing { instance_id, .. }
            | Self::Status { instance_id, .. }
            | Self::MessageReceived { instance_id, .. } => instance_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Pairing { .. } => "pairing",
            Self::Status { .. } => "status",
            Self::MessageReceived { .. } => "message_received",
        }
    }
}
