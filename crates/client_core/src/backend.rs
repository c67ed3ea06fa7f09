use async_trait::async_trait;
use shared::{
    domain::{ConversationId, MessageId, Role, UserId},
    error::ErrorCode,
    protocol::{
        AttachmentPayload, ContactSummary, ConversationSummary, MessagePayload,
        PresenceRecordPayload, SendMessageRequest, ServerEvent,
    },
};
use tokio::sync::mpsc;

use crate::error::BackendError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl AttachmentUpload {
    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// REST-style operations the messaging core consumes.
#[async_trait]
pub trait MessagingBackend: Send + Sync {
    async fn list_recipients(
        &self,
        role_filter: Option<Role>,
    ) -> Result<Vec<ContactSummary>, BackendError>;
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, BackendError>;
    async fn load_thread(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<MessagePayload>, BackendError>;
    async fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> Result<MessagePayload, BackendError>;
    async fn edit_message(
        &self,
        message_id: MessageId,
        body: &str,
        base_version: u64,
    ) -> Result<MessagePayload, BackendError>;
    async fn delete_message(
        &self,
        message_id: MessageId,
        base_version: u64,
    ) -> Result<(), BackendError>;
    async fn set_reaction(
        &self,
        message_id: MessageId,
        value: Option<&str>,
    ) -> Result<MessagePayload, BackendError>;
    async fn set_pinned(
        &self,
        message_id: MessageId,
        pinned: bool,
    ) -> Result<MessagePayload, BackendError>;
    async fn set_saved(&self, message_id: MessageId, saved: bool) -> Result<(), BackendError>;
    async fn forward_message(
        &self,
        message_id: MessageId,
        recipient_id: UserId,
    ) -> Result<MessagePayload, BackendError>;
    async fn mark_read(&self, conversation_id: ConversationId) -> Result<(), BackendError>;
    async fn upload_attachment(
        &self,
        upload: AttachmentUpload,
    ) -> Result<AttachmentPayload, BackendError>;
}

/// Push channel plus the snapshot used to seed presence on (re)connect.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn fetch_presence_snapshot(&self) -> Result<Vec<PresenceRecordPayload>, BackendError>;
    async fn subscribe(&self) -> Result<mpsc::Receiver<ServerEvent>, BackendError>;
}

pub struct MissingEventTransport;

#[async_trait]
impl EventTransport for MissingEventTransport {
    async fn fetch_presence_snapshot(&self) -> Result<Vec<PresenceRecordPayload>, BackendError> {
        Err(BackendError::rejected(
            ErrorCode::Internal,
            "event transport is unavailable",
        ))
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ServerEvent>, BackendError> {
        Err(BackendError::rejected(
            ErrorCode::Internal,
            "event transport is unavailable",
        ))
    }
}
