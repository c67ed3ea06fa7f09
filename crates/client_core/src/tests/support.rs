//! Shared fixtures: an in-memory messaging server with failure injection and
//! response gates, plus a scripted push transport.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, Role, UserId},
    error::ErrorCode,
    protocol::{
        AttachmentPayload, ContactSummary, ConversationSummary, MessagePayload,
        PresenceRecordPayload, ReactionPayload, SendMessageRequest, SendTarget, ServerEvent,
    },
};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::{
    backend::{AttachmentUpload, EventTransport, MessagingBackend},
    error::BackendError,
};

pub(crate) const ME: UserId = UserId(1);

pub(crate) fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).expect("valid timestamp")
}

pub(crate) fn payload(
    id: i64,
    conversation: i64,
    sender: i64,
    recipient: i64,
    body: &str,
    at_secs: i64,
) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        conversation_id: ConversationId(conversation),
        sender_id: UserId(sender),
        recipient_id: UserId(recipient),
        body: body.to_string(),
        attachments: Vec::new(),
        created_at: ts(at_secs),
        edited_at: None,
        deleted_at: None,
        reactions: Vec::new(),
        reply_to_id: None,
        forwarded_from_id: None,
        pinned: false,
        saved_by: Vec::new(),
        version: 0,
    }
}

pub(crate) fn contact(id: i64, name: &str, role: Role) -> ContactSummary {
    ContactSummary {
        user_id: UserId(id),
        display_name: name.to_string(),
        role,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Op {
    ListRecipients,
    ListConversations,
    LoadThread,
    Send,
    Edit,
    Delete,
    React,
    Pin,
    Save,
    Forward,
    MarkRead,
    Upload,
}

fn not_found(what: impl std::fmt::Display) -> BackendError {
    BackendError::rejected(ErrorCode::NotFound, format!("{what} not found"))
}

struct Server {
    recipients: Vec<ContactSummary>,
    conversations: BTreeMap<ConversationId, UserId>,
    messages: BTreeMap<MessageId, MessagePayload>,
    last_writer: HashMap<MessageId, UserId>,
    nonces: HashMap<Uuid, MessageId>,
    next_message: i64,
    next_conversation: i64,
}

impl Server {
    fn conversation_with(&mut self, counterpart: UserId) -> ConversationId {
        if let Some((id, _)) = self
            .conversations
            .iter()
            .find(|(_, other)| **other == counterpart)
        {
            return *id;
        }
        self.next_conversation += 1;
        let id = ConversationId(self.next_conversation);
        self.conversations.insert(id, counterpart);
        id
    }

    fn permitted(&self, user_id: UserId) -> bool {
        self.recipients.iter().any(|contact| contact.user_id == user_id)
    }

    fn live_mut(&mut self, message_id: MessageId) -> Result<&mut MessagePayload, BackendError> {
        self.messages
            .get_mut(&message_id)
            .filter(|message| message.deleted_at.is_none())
            .ok_or_else(|| not_found(format!("message {message_id}")))
    }

    fn check_base(&self, message_id: MessageId, base_version: u64) -> Result<(), BackendError> {
        let current = self
            .messages
            .get(&message_id)
            .map(|message| message.version)
            .unwrap_or(0);
        let foreign_write = self
            .last_writer
            .get(&message_id)
            .is_some_and(|writer| *writer != ME);
        if base_version < current && foreign_write {
            return Err(BackendError::rejected(
                ErrorCode::Conflict,
                format!("message {message_id} changed since version {base_version}"),
            ));
        }
        Ok(())
    }

    fn create(
        &mut self,
        conversation_id: ConversationId,
        recipient_id: UserId,
        body: String,
        attachments: Vec<AttachmentPayload>,
        reply_to_id: Option<MessageId>,
        forwarded_from_id: Option<MessageId>,
    ) -> MessagePayload {
        self.next_message += 1;
        let id = self.next_message;
        let mut message = payload(id, conversation_id.0, ME.0, recipient_id.0, &body, 1_000 + id);
        message.attachments = attachments;
        message.reply_to_id = reply_to_id;
        message.forwarded_from_id = forwarded_from_id;
        self.messages.insert(message.message_id, message.clone());
        self.last_writer.insert(message.message_id, ME);
        message
    }

    fn touch(&mut self, message_id: MessageId, writer: UserId) {
        if let Some(message) = self.messages.get_mut(&message_id) {
            message.version += 1;
        }
        self.last_writer.insert(message_id, writer);
    }
}

/// In-memory stand-in for the messaging API. Requests are applied to the
/// server state in arrival order; a gate only holds back the response.
pub(crate) struct FakeBackend {
    server: Mutex<Server>,
    failures: Mutex<HashMap<Op, VecDeque<BackendError>>>,
    gates: Mutex<HashMap<Op, VecDeque<oneshot::Receiver<()>>>>,
    calls: Mutex<Vec<Op>>,
    arrivals: mpsc::UnboundedSender<Op>,
    arrivals_rx: Mutex<Option<mpsc::UnboundedReceiver<Op>>>,
}

impl FakeBackend {
    pub(crate) fn new() -> Arc<Self> {
        let (arrivals, arrivals_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            server: Mutex::new(Server {
                recipients: vec![
                    contact(2, "Ms. Achebe", Role::Teacher),
                    contact(3, "Dana Okafor", Role::Student),
                    contact(4, "Principal Ito", Role::Head),
                ],
                conversations: BTreeMap::new(),
                messages: BTreeMap::new(),
                last_writer: HashMap::new(),
                nonces: HashMap::new(),
                next_message: 500,
                next_conversation: 800,
            }),
            failures: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            arrivals,
            arrivals_rx: Mutex::new(Some(arrivals_rx)),
        })
    }

    pub(crate) fn set_recipients(&self, recipients: Vec<ContactSummary>) {
        self.server.lock().expect("server").recipients = recipients;
    }

    pub(crate) fn seed_conversation(&self, conversation_id: i64, counterpart: i64) {
        self.server
            .lock()
            .expect("server")
            .conversations
            .insert(ConversationId(conversation_id), UserId(counterpart));
    }

    pub(crate) fn seed_message(&self, message: MessagePayload) {
        let mut server = self.server.lock().expect("server");
        server
            .last_writer
            .insert(message.message_id, message.sender_id);
        server.messages.insert(message.message_id, message);
    }

    pub(crate) fn message(&self, message_id: i64) -> Option<MessagePayload> {
        self.server
            .lock()
            .expect("server")
            .messages
            .get(&MessageId(message_id))
            .cloned()
    }

    pub(crate) fn messages_in(&self, conversation_id: ConversationId) -> Vec<MessagePayload> {
        self.server
            .lock()
            .expect("server")
            .messages
            .values()
            .filter(|message| message.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    /// Another actor edits the message behind the client's back.
    pub(crate) fn remote_edit(&self, message_id: i64, by: i64, body: &str) -> MessagePayload {
        let mut server = self.server.lock().expect("server");
        let id = MessageId(message_id);
        server.touch(id, UserId(by));
        let message = server.messages.get_mut(&id).expect("seeded message");
        message.body = body.to_string();
        message.edited_at = Some(ts(2_000));
        message.clone()
    }

    /// The message is deleted elsewhere, e.g. from another session.
    pub(crate) fn remote_delete(&self, message_id: i64, by: i64) {
        let mut server = self.server.lock().expect("server");
        let id = MessageId(message_id);
        server.touch(id, UserId(by));
        let message = server.messages.get_mut(&id).expect("seeded message");
        message.body.clear();
        message.deleted_at = Some(ts(2_000));
    }

    pub(crate) fn fail_next(&self, op: Op, err: BackendError) {
        self.failures
            .lock()
            .expect("failures")
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Holds back the response of the next `op` call until the returned
    /// sender fires or is dropped.
    pub(crate) fn gate(&self, op: Op) -> oneshot::Sender<()> {
        let (release, gate) = oneshot::channel();
        self.gates
            .lock()
            .expect("gates")
            .entry(op)
            .or_default()
            .push_back(gate);
        release
    }

    /// Reports each call once the server has applied it.
    pub(crate) fn arrivals(&self) -> mpsc::UnboundedReceiver<Op> {
        self.arrivals_rx
            .lock()
            .expect("arrivals")
            .take()
            .expect("arrivals already taken")
    }

    pub(crate) fn calls(&self, op: Op) -> usize {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .filter(|call| **call == op)
            .count()
    }

    fn enter(&self, op: Op) -> Result<(), BackendError> {
        self.calls.lock().expect("calls").push(op);
        let failure = self
            .failures
            .lock()
            .expect("failures")
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn leave<T>(&self, op: Op, result: Result<T, BackendError>) -> Result<T, BackendError> {
        let _ = self.arrivals.send(op);
        let gate = self
            .gates
            .lock()
            .expect("gates")
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        result
    }
}

#[async_trait]
impl MessagingBackend for FakeBackend {
    async fn list_recipients(
        &self,
        role_filter: Option<Role>,
    ) -> Result<Vec<ContactSummary>, BackendError> {
        self.enter(Op::ListRecipients)?;
        let result = Ok(self
            .server
            .lock()
            .expect("server")
            .recipients
            .iter()
            .filter(|contact| role_filter.map_or(true, |role| contact.role == role))
            .cloned()
            .collect());
        self.leave(Op::ListRecipients, result).await
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, BackendError> {
        self.enter(Op::ListConversations)?;
        let result = {
            let server = self.server.lock().expect("server");
            Ok(server
                .conversations
                .iter()
                .map(|(conversation_id, counterpart)| {
                    let messages = server
                        .messages
                        .values()
                        .filter(|message| message.conversation_id == *conversation_id);
                    let last_activity_at = messages
                        .clone()
                        .map(|message| message.created_at)
                        .max()
                        .unwrap_or_else(|| ts(0));
                    let unread_count = messages
                        .filter(|message| message.sender_id != ME && message.deleted_at.is_none())
                        .count() as u32;
                    let counterpart = server
                        .recipients
                        .iter()
                        .find(|contact| contact.user_id == *counterpart)
                        .cloned()
                        .unwrap_or_else(|| contact(counterpart.0, "Unlisted", Role::Student));
                    ConversationSummary {
                        conversation_id: *conversation_id,
                        counterpart,
                        unread_count,
                        last_activity_at,
                    }
                })
                .collect())
        };
        self.leave(Op::ListConversations, result).await
    }

    async fn load_thread(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<MessagePayload>, BackendError> {
        self.enter(Op::LoadThread)?;
        let result = {
            let server = self.server.lock().expect("server");
            if server.conversations.contains_key(&conversation_id) {
                Ok(server
                    .messages
                    .values()
                    .filter(|message| {
                        message.conversation_id == conversation_id && message.deleted_at.is_none()
                    })
                    .cloned()
                    .collect())
            } else {
                Err(not_found(format!("conversation {conversation_id}")))
            }
        };
        self.leave(Op::LoadThread, result).await
    }

    async fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> Result<MessagePayload, BackendError> {
        self.enter(Op::Send)?;
        let result = {
            let mut server = self.server.lock().expect("server");
            let existing = server
                .nonces
                .get(&request.client_nonce)
                .and_then(|id| server.messages.get(id))
                .cloned();
            if let Some(existing) = existing {
                Ok(existing)
            } else {
                let target = match request.target {
                    SendTarget::Conversation(id) => server
                        .conversations
                        .get(&id)
                        .map(|counterpart| (id, *counterpart))
                        .ok_or_else(|| not_found(format!("conversation {id}"))),
                    SendTarget::Recipient(user_id) if server.permitted(user_id) => {
                        Ok((server.conversation_with(user_id), user_id))
                    }
                    SendTarget::Recipient(user_id) => Err(BackendError::rejected(
                        ErrorCode::Forbidden,
                        format!("cannot message user {user_id}"),
                    )),
                };
                let reply_ok = request.reply_to_id.map_or(true, |id| {
                    server
                        .messages
                        .get(&id)
                        .is_some_and(|message| message.deleted_at.is_none())
                });
                match target {
                    Ok(_) if !reply_ok => Err(not_found("reply target")),
                    Ok((conversation_id, recipient_id)) => {
                        let message = server.create(
                            conversation_id,
                            recipient_id,
                            request.body,
                            request.attachments,
                            request.reply_to_id,
                            None,
                        );
                        server.nonces.insert(request.client_nonce, message.message_id);
                        Ok(message)
                    }
                    Err(err) => Err(err),
                }
            }
        };
        self.leave(Op::Send, result).await
    }

    async fn edit_message(
        &self,
        message_id: MessageId,
        body: &str,
        base_version: u64,
    ) -> Result<MessagePayload, BackendError> {
        self.enter(Op::Edit)?;
        let result = (|| {
            let mut server = self.server.lock().expect("server");
            if server.live_mut(message_id)?.sender_id != ME {
                return Err(BackendError::rejected(ErrorCode::Forbidden, "not the sender"));
            }
            server.check_base(message_id, base_version)?;
            server.touch(message_id, ME);
            let message = server.live_mut(message_id)?;
            message.body = body.to_string();
            message.edited_at = Some(ts(3_000));
            Ok(message.clone())
        })();
        self.leave(Op::Edit, result).await
    }

    async fn delete_message(
        &self,
        message_id: MessageId,
        base_version: u64,
    ) -> Result<(), BackendError> {
        self.enter(Op::Delete)?;
        let result = (|| {
            let mut server = self.server.lock().expect("server");
            server.live_mut(message_id)?;
            server.check_base(message_id, base_version)?;
            server.touch(message_id, ME);
            let message = server.live_mut(message_id)?;
            message.body.clear();
            message.reactions.clear();
            message.deleted_at = Some(ts(3_000));
            Ok(())
        })();
        self.leave(Op::Delete, result).await
    }

    async fn set_reaction(
        &self,
        message_id: MessageId,
        value: Option<&str>,
    ) -> Result<MessagePayload, BackendError> {
        self.enter(Op::React)?;
        let result = (|| {
            let mut server = self.server.lock().expect("server");
            server.live_mut(message_id)?;
            server.touch(message_id, ME);
            let message = server.live_mut(message_id)?;
            message.reactions.retain(|reaction| reaction.user_id != ME);
            if let Some(value) = value {
                message.reactions.push(ReactionPayload {
                    user_id: ME,
                    value: value.to_string(),
                });
            }
            Ok(message.clone())
        })();
        self.leave(Op::React, result).await
    }

    async fn set_pinned(
        &self,
        message_id: MessageId,
        pinned: bool,
    ) -> Result<MessagePayload, BackendError> {
        self.enter(Op::Pin)?;
        let result = (|| {
            let mut server = self.server.lock().expect("server");
            server.live_mut(message_id)?;
            server.touch(message_id, ME);
            let message = server.live_mut(message_id)?;
            message.pinned = pinned;
            Ok(message.clone())
        })();
        self.leave(Op::Pin, result).await
    }

    async fn set_saved(&self, message_id: MessageId, saved: bool) -> Result<(), BackendError> {
        self.enter(Op::Save)?;
        let result = (|| {
            let mut server = self.server.lock().expect("server");
            server.live_mut(message_id)?;
            server.touch(message_id, ME);
            let message = server.live_mut(message_id)?;
            message.saved_by.retain(|user_id| *user_id != ME);
            if saved {
                message.saved_by.push(ME);
            }
            Ok(())
        })();
        self.leave(Op::Save, result).await
    }

    async fn forward_message(
        &self,
        message_id: MessageId,
        recipient_id: UserId,
    ) -> Result<MessagePayload, BackendError> {
        self.enter(Op::Forward)?;
        let result = (|| {
            let mut server = self.server.lock().expect("server");
            let source = server.live_mut(message_id)?.clone();
            if !server.permitted(recipient_id) {
                return Err(BackendError::rejected(
                    ErrorCode::Forbidden,
                    format!("cannot message user {recipient_id}"),
                ));
            }
            let conversation_id = server.conversation_with(recipient_id);
            Ok(server.create(
                conversation_id,
                recipient_id,
                source.body,
                source.attachments,
                None,
                Some(message_id),
            ))
        })();
        self.leave(Op::Forward, result).await
    }

    async fn mark_read(&self, _conversation_id: ConversationId) -> Result<(), BackendError> {
        self.enter(Op::MarkRead)?;
        self.leave(Op::MarkRead, Ok(())).await
    }

    async fn upload_attachment(
        &self,
        upload: AttachmentUpload,
    ) -> Result<AttachmentPayload, BackendError> {
        self.enter(Op::Upload)?;
        let result = Ok(AttachmentPayload {
            url: format!("https://files.test/{}", upload.filename),
            filename: upload.filename,
        });
        self.leave(Op::Upload, result).await
    }
}

/// Push transport whose feeds are handed out one per `subscribe`.
#[derive(Default)]
pub(crate) struct FakeTransport {
    snapshot: Mutex<Vec<PresenceRecordPayload>>,
    feeds: Mutex<VecDeque<mpsc::Receiver<ServerEvent>>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_snapshot(&self, records: Vec<PresenceRecordPayload>) {
        *self.snapshot.lock().expect("snapshot") = records;
    }

    pub(crate) fn open_feed(&self) -> mpsc::Sender<ServerEvent> {
        let (tx, rx) = mpsc::channel(32);
        self.feeds.lock().expect("feeds").push_back(rx);
        tx
    }
}

#[async_trait]
impl EventTransport for FakeTransport {
    async fn fetch_presence_snapshot(&self) -> Result<Vec<PresenceRecordPayload>, BackendError> {
        Ok(self.snapshot.lock().expect("snapshot").clone())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ServerEvent>, BackendError> {
        self.feeds
            .lock()
            .expect("feeds")
            .pop_front()
            .ok_or_else(|| BackendError::Connection("no feed available".into()))
    }
}
