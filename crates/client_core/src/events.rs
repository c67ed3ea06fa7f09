use shared::domain::{ConversationId, MessageId, UserId};

use crate::{
    call::CallSession,
    conversations::ConversationKey,
    error::MutationError,
    thread::{LocalId, MessageRef},
};

/// Everything the UI layer may want to re-render for. Delivered over a
/// broadcast channel; lagging receivers should re-read state.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ThreadChanged(ConversationKey),
    ContactsChanged,
    ConversationMaterialized {
        recipient_id: UserId,
        conversation_id: ConversationId,
    },
    MutationFailed {
        local_id: LocalId,
        error: MutationError,
    },
    /// A local change lost to a concurrent one and was rolled back.
    ConflictNotice {
        message_id: MessageId,
        reason: String,
    },
    PresenceChanged,
    RecipientsUpdated,
    ReplyTargetChanged(Option<MessageRef>),
    ForwardRequested {
        conversation: ConversationKey,
        messages: Vec<MessageRef>,
    },
    ForwardCancelled,
    CallChanged {
        counterpart_id: UserId,
        session: Option<CallSession>,
    },
    FeedDisconnected(String),
    ServerError(String),
}
