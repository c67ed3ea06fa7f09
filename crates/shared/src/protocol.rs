use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{ConversationId, MessageId, PresenceStatus, Role, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactSummary {
    pub user_id: UserId,
    pub display_name: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub counterpart: ContactSummary,
    #[serde(default)]
    pub unread_count: u32,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub url: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub user_id: UserId,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentPayload>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<ReactionPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_from_id: Option<MessageId>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub saved_by: Vec<UserId>,
    /// Server-side revision, bumped on every change to the message.
    #[serde(default)]
    pub version: u64,
}

/// Where a new message goes: an existing conversation, or a recipient with no
/// conversation yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SendTarget {
    Conversation(ConversationId),
    Recipient(UserId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub target: SendTarget,
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    /// Reused on manual retry so the server can drop duplicates.
    pub client_nonce: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub body: String,
    pub base_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteMessageQuery {
    pub base_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetReactionRequest {
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetFlagRequest {
    pub value: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardMessageRequest {
    pub recipient_id: UserId,
}

/// One presence row as fetched or pushed. Omitted fields leave the stored
/// value untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecordPayload {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible_status: Option<PresenceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PresenceEvent {
    Snapshot {
        records: Vec<PresenceRecordPayload>,
    },
    Online {
        user_id: UserId,
        #[serde(default)]
        hidden: Option<bool>,
    },
    Offline {
        user_id: UserId,
        #[serde(default)]
        last_seen_at: Option<DateTime<Utc>>,
        #[serde(default)]
        hidden: Option<bool>,
    },
    Visibility {
        user_id: UserId,
        visible_status: PresenceStatus,
        #[serde(default)]
        hidden: Option<bool>,
    },
    LastSeen {
        user_id: UserId,
        last_seen_at: DateTime<Utc>,
        #[serde(default)]
        hidden: Option<bool>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageReceived {
        message: MessagePayload,
    },
    MessageUpdated {
        message: MessagePayload,
    },
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
        deleted_at: DateTime<Utc>,
        version: u64,
    },
    Presence(PresenceEvent),
    Error(ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_event_uses_tagged_wire_shape() {
        let event = PresenceEvent::Online {
            user_id: UserId(4),
            hidden: None,
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "online");
        assert_eq!(json["payload"]["user_id"], 4);
    }

    #[test]
    fn snapshot_record_tolerates_missing_fields() {
        let raw = r#"{"type":"snapshot","payload":{"records":[{"user_id":9}]}}"#;
        let event: PresenceEvent = serde_json::from_str(raw).expect("deserialize");
        let PresenceEvent::Snapshot { records } = event else {
            panic!("expected snapshot");
        };
        assert_eq!(records[0].user_id, UserId(9));
        assert_eq!(records[0].visible_status, None);
        assert_eq!(records[0].hidden, None);
    }

    #[test]
    fn message_payload_defaults_optional_collections() {
        let raw = r#"{
            "message_id": 1,
            "conversation_id": 2,
            "sender_id": 3,
            "recipient_id": 4,
            "body": "hi",
            "created_at": "2024-01-01T00:00:00Z"
        }"#;
        let message: MessagePayload = serde_json::from_str(raw).expect("deserialize");
        assert!(message.reactions.is_empty());
        assert!(message.saved_by.is_empty());
        assert!(!message.pinned);
        assert_eq!(message.version, 0);
    }

    #[test]
    fn send_target_serializes_with_kind_tag() {
        let json = serde_json::to_value(SendTarget::Recipient(UserId(12))).expect("serialize");
        assert_eq!(json["kind"], "recipient");
        assert_eq!(json["id"], 12);
    }
}
