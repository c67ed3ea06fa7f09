//! Two-phase message mutations.
//!
//! Every mutation is applied to the cache immediately, tagged with a local
//! sequence number, and reconciled against the server response later. A
//! response only writes the fields its own mutation touched, and only when no
//! newer mutation of the same field has been issued since.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{
        AttachmentPayload, ConversationSummary, MessagePayload, SendMessageRequest, SendTarget,
    },
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::{AttachmentUpload, MessagingBackend},
    config::ClientSettings,
    conversations::{ConversationIndex, ConversationKey},
    drafts::DraftStore,
    error::{BackendError, LoadError, MutationError, ValidationError},
    events::ClientEvent,
    recipients::RecipientDirectory,
    retry::RetryPolicy,
    thread::{
        AbsorbMode, AppendOutcome, Delivery, Field, LocalId, Message, MessageRef,
        MessageThreadCache,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Send,
    Forward,
    Edit,
    Delete,
    React,
    Pin,
    Save,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationState {
    /// In flight, or waiting for the send it targets to be confirmed.
    Pending,
    Failed(MutationError),
}

#[derive(Debug, Clone)]
enum Change {
    Send {
        body: String,
        uploads: Vec<AttachmentUpload>,
        uploaded: Vec<AttachmentPayload>,
        reply_to_id: Option<MessageId>,
        client_nonce: Uuid,
    },
    Forward {
        source_id: MessageId,
        recipient_id: UserId,
    },
    Edit {
        body: String,
        previous_body: String,
        previous_edited_at: Option<DateTime<Utc>>,
    },
    Delete {
        previous: Box<Message>,
    },
    React {
        value: Option<String>,
        previous: Option<String>,
    },
    Pin {
        pinned: bool,
    },
    Save {
        saved: bool,
    },
}

impl Change {
    fn kind(&self) -> MutationKind {
        match self {
            Self::Send { .. } => MutationKind::Send,
            Self::Forward { .. } => MutationKind::Forward,
            Self::Edit { .. } => MutationKind::Edit,
            Self::Delete { .. } => MutationKind::Delete,
            Self::React { .. } => MutationKind::React,
            Self::Pin { .. } => MutationKind::Pin,
            Self::Save { .. } => MutationKind::Save,
        }
    }

    fn fields(&self) -> &'static [Field] {
        match self {
            Self::Send { .. } | Self::Forward { .. } | Self::Edit { .. } => &[Field::Body],
            Self::Delete { .. } => &Field::ALL,
            Self::React { .. } => &[Field::Reactions],
            Self::Pin { .. } => &[Field::Pinned],
            Self::Save { .. } => &[Field::Saved],
        }
    }

    fn creates_message(&self) -> bool {
        matches!(self, Self::Send { .. } | Self::Forward { .. })
    }
}

/// A mutation whose server response has not been folded in yet.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub local_id: LocalId,
    pub conversation: ConversationKey,
    /// The message being changed; for sends and forwards, the new message.
    pub target: MessageRef,
    pub state: MutationState,
    change: Change,
}

impl PendingMutation {
    pub fn kind(&self) -> MutationKind {
        self.change.kind()
    }

    fn seq(&self) -> u64 {
        self.local_id.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Confirmed {
        local_id: LocalId,
        message_id: MessageId,
    },
    /// Applied locally; the server call is in flight or waits on a send.
    Pending { local_id: LocalId },
    /// The requested state was already in place; nothing was sent.
    Unchanged,
    /// A send was dropped locally before the server stored it.
    Discarded { local_id: LocalId },
    /// The server had already deleted the message.
    AlreadyDeleted { message_id: MessageId },
}

/// Cache state shared by the pipeline and the client facade.
pub struct MessagingState {
    pub threads: MessageThreadCache,
    pub index: ConversationIndex,
    pub drafts: DraftStore,
    mutations: BTreeMap<LocalId, PendingMutation>,
    confirmed_sends: HashMap<LocalId, (ConversationKey, MessageId)>,
    next_seq: u64,
}

impl MessagingState {
    pub fn new(me: UserId) -> Self {
        Self {
            threads: MessageThreadCache::new(),
            index: ConversationIndex::new(me),
            drafts: DraftStore::new(),
            mutations: BTreeMap::new(),
            confirmed_sends: HashMap::new(),
            next_seq: 0,
        }
    }

    fn next_local_id(&mut self) -> LocalId {
        self.next_seq += 1;
        LocalId(self.next_seq)
    }

    pub fn mutation(&self, local_id: LocalId) -> Option<&PendingMutation> {
        self.mutations.get(&local_id)
    }

    pub fn pending_mutations(&self) -> impl Iterator<Item = &PendingMutation> {
        self.mutations.values()
    }

    /// Removes a finished mutation. A confirmed send stays resolvable only
    /// while some mutation still targets its local id.
    fn forget(&mut self, local_id: LocalId) -> Option<PendingMutation> {
        let removed = self.mutations.remove(&local_id);
        let mutations = &self.mutations;
        self.confirmed_sends.retain(|send_id, _| {
            mutations
                .values()
                .any(|mutation| mutation.target == MessageRef::Local(*send_id))
        });
        removed
    }

    /// Follows a virtual key that has since materialized and a local id
    /// whose send has since been confirmed.
    pub fn current_ref(
        &self,
        key: ConversationKey,
        target: MessageRef,
    ) -> (ConversationKey, MessageRef) {
        if let MessageRef::Local(local_id) = target {
            if let Some((key, message_id)) = self.confirmed_sends.get(&local_id) {
                return (*key, MessageRef::Server(*message_id));
            }
        }
        (self.current_key(key), target)
    }

    pub fn current_key(&self, key: ConversationKey) -> ConversationKey {
        match key {
            ConversationKey::Virtual(user_id) => self.index.key_for(user_id),
            key => key,
        }
    }

    fn resolve(&self, mutation: &PendingMutation) -> Option<(ConversationKey, MessageId)> {
        let (key, target) = self.current_ref(mutation.conversation, mutation.target);
        target.server_id().map(|message_id| (key, message_id))
    }

    /// Records a server-side conversation, moving any virtual thread for
    /// its counterpart onto it.
    pub fn register_conversation(&mut self, summary: ConversationSummary) -> bool {
        let recipient_id = summary.counterpart.user_id;
        let conversation_id = summary.conversation_id;
        self.index.register(summary);
        self.materialize(recipient_id, conversation_id)
    }

    /// Moves everything filed under `Virtual(recipient_id)` to the real
    /// conversation. Returns whether there was anything to move.
    fn materialize(&mut self, recipient_id: UserId, conversation_id: ConversationId) -> bool {
        let from = ConversationKey::Virtual(recipient_id);
        let to = ConversationKey::Conversation(conversation_id);
        let had_state = !self.threads.messages(from).is_empty()
            || self.threads.view() == Some(from)
            || !self.drafts.get(from).is_empty();
        self.threads.rekey(from, to);
        self.drafts.migrate(from, to);
        for mutation in self.mutations.values_mut() {
            if mutation.conversation == from {
                mutation.conversation = to;
            }
        }
        had_state
    }
}

pub struct MutationPipeline {
    me: UserId,
    backend: Arc<dyn MessagingBackend>,
    recipients: Arc<RecipientDirectory>,
    state: Arc<Mutex<MessagingState>>,
    events: broadcast::Sender<ClientEvent>,
    reload: RetryPolicy,
    max_attachment_bytes: u64,
}

impl MutationPipeline {
    pub fn new(
        me: UserId,
        backend: Arc<dyn MessagingBackend>,
        recipients: Arc<RecipientDirectory>,
        state: Arc<Mutex<MessagingState>>,
        events: broadcast::Sender<ClientEvent>,
        settings: &ClientSettings,
    ) -> Self {
        Self {
            me,
            backend,
            recipients,
            state,
            events,
            reload: settings.retry_policy(),
            max_attachment_bytes: settings.max_attachment_bytes,
        }
    }

    pub fn state(&self) -> &Arc<Mutex<MessagingState>> {
        &self.state
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub async fn send(
        &self,
        key: ConversationKey,
        body: &str,
        uploads: Vec<AttachmentUpload>,
        reply_to_id: Option<MessageId>,
    ) -> Result<MutationOutcome, MutationError> {
        let local_id = self.stage_send(key, body, uploads, reply_to_id).await?;
        self.dispatch_new_message(local_id).await
    }

    /// Validates a send and applies it locally. Nothing reaches the server
    /// until [`Self::dispatch_new_message`] runs for the returned id.
    pub(crate) async fn stage_send(
        &self,
        key: ConversationKey,
        body: &str,
        uploads: Vec<AttachmentUpload>,
        reply_to_id: Option<MessageId>,
    ) -> Result<LocalId, MutationError> {
        if body.trim().is_empty() && uploads.is_empty() {
            return Err(ValidationError::EmptyBody.into());
        }
        if let Some(upload) = uploads
            .iter()
            .find(|upload| upload.size_bytes() > self.max_attachment_bytes)
        {
            return Err(ValidationError::AttachmentTooLarge {
                filename: upload.filename.clone(),
                size_bytes: upload.size_bytes(),
                limit_bytes: self.max_attachment_bytes,
            }
            .into());
        }

        let (key, recipient_id) = {
            let state = self.state.lock().await;
            let key = state.current_key(key);
            let recipient_id = state
                .index
                .counterpart_for_key(key)
                .ok_or(ValidationError::MissingRecipient)?;
            if let Some(reply_to_id) = reply_to_id {
                let entry = state
                    .threads
                    .entry(key, MessageRef::Server(reply_to_id))
                    .ok_or_else(|| MutationError::NotFound(format!("message {reply_to_id}")))?;
                if entry.message.is_deleted() {
                    return Err(ValidationError::TargetDeleted(reply_to_id.to_string()).into());
                }
            }
            (key, recipient_id)
        };

        if let ConversationKey::Virtual(recipient_id) = key {
            self.ensure_permitted(recipient_id).await?;
        }

        let (key, local_id) = {
            let mut state = self.state.lock().await;
            // Selection may have materialized while the recipient was checked.
            let key = state.current_key(key);
            let local_id = state.next_local_id();
            let now = Utc::now();
            let uploading = !uploads.is_empty();
            let message = Message {
                id: MessageRef::Local(local_id),
                conversation: key,
                sender_id: self.me,
                recipient_id,
                body: body.to_string(),
                attachments: uploads
                    .iter()
                    .map(|upload| AttachmentPayload {
                        url: String::new(),
                        filename: upload.filename.clone(),
                    })
                    .collect(),
                created_at: now,
                edited_at: None,
                deleted_at: None,
                reactions: BTreeMap::new(),
                reply_to_id,
                forwarded_from_id: None,
                pinned: false,
                saved_by: BTreeSet::new(),
                version: 0,
            };
            let change = Change::Send {
                body: body.to_string(),
                uploads,
                uploaded: Vec::new(),
                reply_to_id,
                client_nonce: Uuid::new_v4(),
            };
            insert_pending(&mut state, key, message, local_id, change);
            state
                .threads
                .set_uploading(key, MessageRef::Local(local_id), uploading);
            if let Some(conversation_id) = key.conversation_id() {
                state.index.touch(conversation_id, now);
            }
            (key, local_id)
        };
        debug!(%local_id, %key, "pipeline: send applied locally");
        self.emit(ClientEvent::ThreadChanged(key));
        Ok(local_id)
    }

    pub async fn forward(
        &self,
        source_key: ConversationKey,
        source: MessageRef,
        recipient_id: UserId,
    ) -> Result<MutationOutcome, MutationError> {
        let original = {
            let state = self.state.lock().await;
            let (key, source) = state.current_ref(source_key, source);
            let entry = state
                .threads
                .entry(key, source)
                .ok_or_else(|| MutationError::NotFound(format!("message {source}")))?;
            if entry.message.is_deleted() {
                return Err(ValidationError::TargetDeleted(source.to_string()).into());
            }
            entry.message.clone()
        };
        let Some(source_id) = original.id.server_id() else {
            return Err(ValidationError::TargetNotDelivered(original.id.to_string()).into());
        };

        self.ensure_permitted(recipient_id).await?;

        let (key, local_id) = {
            let mut state = self.state.lock().await;
            let key = state.index.key_for(recipient_id);
            let local_id = state.next_local_id();
            let now = Utc::now();
            let message = Message {
                id: MessageRef::Local(local_id),
                conversation: key,
                sender_id: self.me,
                recipient_id,
                body: original.body,
                attachments: original.attachments,
                created_at: now,
                edited_at: None,
                deleted_at: None,
                reactions: BTreeMap::new(),
                reply_to_id: None,
                forwarded_from_id: Some(source_id),
                pinned: false,
                saved_by: BTreeSet::new(),
                version: 0,
            };
            let change = Change::Forward {
                source_id,
                recipient_id,
            };
            insert_pending(&mut state, key, message, local_id, change);
            if let Some(conversation_id) = key.conversation_id() {
                state.index.touch(conversation_id, now);
            }
            (key, local_id)
        };
        debug!(%local_id, %key, %source_id, "pipeline: forward applied locally");
        self.emit(ClientEvent::ThreadChanged(key));
        self.dispatch_new_message(local_id).await
    }

    pub async fn edit(
        &self,
        key: ConversationKey,
        target: MessageRef,
        body: &str,
    ) -> Result<MutationOutcome, MutationError> {
        if body.trim().is_empty() {
            return Err(ValidationError::EmptyBody.into());
        }
        let (key, local_id) = {
            let mut state = self.state.lock().await;
            let (key, target, message) = locate_live(&state, key, target)?;
            if message.sender_id != self.me {
                return Err(MutationError::Permission(
                    "only the sender can edit a message".into(),
                ));
            }
            if message.body == body {
                return Ok(MutationOutcome::Unchanged);
            }
            let change = Change::Edit {
                body: body.to_string(),
                previous_body: message.body,
                previous_edited_at: message.edited_at,
            };
            let now = Utc::now();
            let local_id = issue(&mut state, key, target, change, |message| {
                message.body = body.to_string();
                message.edited_at = Some(now);
            });
            (key, local_id)
        };
        self.emit(ClientEvent::ThreadChanged(key));
        self.dispatch_targeted(local_id).await
    }

    pub async fn delete(
        &self,
        key: ConversationKey,
        target: MessageRef,
    ) -> Result<MutationOutcome, MutationError> {
        let (key, local_id) = {
            let mut state = self.state.lock().await;
            let (key, target) = state.current_ref(key, target);
            let message = state
                .threads
                .entry(key, target)
                .map(|entry| entry.message.clone())
                .ok_or_else(|| MutationError::NotFound(format!("message {target}")))?;
            if message.sender_id != self.me {
                return Err(MutationError::Permission(
                    "only the sender can delete a message".into(),
                ));
            }
            if message.is_deleted() {
                return Ok(MutationOutcome::Unchanged);
            }
            if let MessageRef::Local(send_id) = target {
                let send_failed = matches!(
                    state.mutations.get(&send_id).map(|mutation| &mutation.state),
                    Some(MutationState::Failed(_))
                );
                if send_failed {
                    if let Some(send) = state.mutations.get(&send_id).cloned() {
                        self.rollback_locked(&mut state, &send);
                    }
                    drop(state);
                    info!(%send_id, "pipeline: dropped failed send instead of deleting");
                    self.emit(ClientEvent::ThreadChanged(key));
                    return Ok(MutationOutcome::Discarded { local_id: send_id });
                }
            }
            let change = Change::Delete {
                previous: Box::new(message),
            };
            let now = Utc::now();
            let local_id = issue(&mut state, key, target, change, |message| {
                message.tombstone(now)
            });
            (key, local_id)
        };
        self.emit(ClientEvent::ThreadChanged(key));
        self.dispatch_targeted(local_id).await
    }

    /// Toggles the current user's reaction: the same value again removes
    /// it, a different value replaces it.
    pub async fn react(
        &self,
        key: ConversationKey,
        target: MessageRef,
        value: &str,
    ) -> Result<MutationOutcome, MutationError> {
        if value.trim().is_empty() {
            return Err(ValidationError::EmptyReaction.into());
        }
        let me = self.me;
        let (key, local_id) = {
            let mut state = self.state.lock().await;
            let (key, target, message) = locate_live(&state, key, target)?;
            let previous = message.reaction_of(me).map(str::to_owned);
            let next = match previous.as_deref() {
                Some(current) if current == value => None,
                _ => Some(value.to_string()),
            };
            let change = Change::React {
                value: next.clone(),
                previous,
            };
            let local_id = issue(&mut state, key, target, change, |message| match next {
                Some(value) => {
                    message.reactions.insert(me, value);
                }
                None => {
                    message.reactions.remove(&me);
                }
            });
            (key, local_id)
        };
        self.emit(ClientEvent::ThreadChanged(key));
        self.dispatch_targeted(local_id).await
    }

    pub async fn pin(
        &self,
        key: ConversationKey,
        target: MessageRef,
        pinned: bool,
    ) -> Result<MutationOutcome, MutationError> {
        let (key, local_id) = {
            let mut state = self.state.lock().await;
            let (key, target, message) = locate_live(&state, key, target)?;
            if message.pinned == pinned {
                return Ok(MutationOutcome::Unchanged);
            }
            let local_id = issue(&mut state, key, target, Change::Pin { pinned }, |message| {
                message.pinned = pinned
            });
            (key, local_id)
        };
        self.emit(ClientEvent::ThreadChanged(key));
        self.dispatch_targeted(local_id).await
    }

    pub async fn save(
        &self,
        key: ConversationKey,
        target: MessageRef,
        saved: bool,
    ) -> Result<MutationOutcome, MutationError> {
        let me = self.me;
        let (key, local_id) = {
            let mut state = self.state.lock().await;
            let (key, target, message) = locate_live(&state, key, target)?;
            if message.is_saved_by(me) == saved {
                return Ok(MutationOutcome::Unchanged);
            }
            let local_id = issue(&mut state, key, target, Change::Save { saved }, |message| {
                if saved {
                    message.saved_by.insert(me);
                } else {
                    message.saved_by.remove(&me);
                }
            });
            (key, local_id)
        };
        self.emit(ClientEvent::ThreadChanged(key));
        self.dispatch_targeted(local_id).await
    }

    /// Saved, live messages whose body contains `query` (case-insensitive),
    /// newest first.
    pub async fn search_saved(&self, query: &str) -> Vec<Message> {
        let needle = query.trim().to_lowercase();
        let state = self.state.lock().await;
        let mut found: Vec<Message> = state
            .threads
            .all_messages()
            .filter(|message| message.is_saved_by(self.me) && !message.is_deleted())
            .filter(|message| needle.is_empty() || message.body.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found
    }

    /// Zeroes the unread count and tells the server, once. Returns whether
    /// anything changed.
    pub async fn mark_read(&self, conversation_id: ConversationId) -> Result<bool, MutationError> {
        let changed = self.state.lock().await.index.mark_read(conversation_id);
        if !changed {
            return Ok(false);
        }
        self.emit(ClientEvent::ContactsChanged);
        if let Err(err) = self.backend.mark_read(conversation_id).await {
            warn!(%conversation_id, "pipeline: mark read was not acknowledged: {err}");
            return Err(MutationError::from_backend(err, None, None));
        }
        Ok(true)
    }

    pub async fn retry(&self, local_id: LocalId) -> Result<MutationOutcome, MutationError> {
        let (key, creates_message) = {
            let mut state = self.state.lock().await;
            let mutation = state
                .mutations
                .get_mut(&local_id)
                .ok_or(MutationError::UnknownMutation(local_id))?;
            if mutation.state == MutationState::Pending {
                return Ok(MutationOutcome::Pending { local_id });
            }
            mutation.state = MutationState::Pending;
            let key = mutation.conversation;
            let target = mutation.target;
            let creates_message = mutation.change.creates_message();
            let uploading = matches!(
                &mutation.change,
                Change::Send { uploads, uploaded, .. } if uploaded.len() < uploads.len()
            );
            if creates_message {
                state.threads.set_delivery(key, target, Delivery::Pending);
                state.threads.set_uploading(key, target, uploading);
            }
            (key, creates_message)
        };
        info!(%local_id, "pipeline: retrying mutation");
        self.emit(ClientEvent::ThreadChanged(key));
        if creates_message {
            self.dispatch_new_message(local_id).await
        } else {
            self.dispatch_targeted(local_id).await
        }
    }

    /// Drops a failed mutation, one still waiting on an unconfirmed send, or
    /// a send whose attachments are still uploading, and undoes its local
    /// effect. Returns `false` once the request has reached the server.
    pub async fn discard(&self, local_id: LocalId) -> Result<bool, MutationError> {
        let key = {
            let mut state = self.state.lock().await;
            let mutation = state
                .mutations
                .get(&local_id)
                .cloned()
                .ok_or(MutationError::UnknownMutation(local_id))?;
            let waiting = !mutation.change.creates_message() && state.resolve(&mutation).is_none();
            let uploading = matches!(
                &mutation.change,
                Change::Send { uploads, uploaded, .. } if uploaded.len() < uploads.len()
            );
            if mutation.state == MutationState::Pending && !waiting && !uploading {
                return Ok(false);
            }
            self.rollback_locked(&mut state, &mutation);
            state.current_ref(mutation.conversation, mutation.target).0
        };
        info!(%local_id, "pipeline: discarded mutation");
        self.emit(ClientEvent::ThreadChanged(key));
        Ok(true)
    }

    /// Folds a pushed message into the cache. Returns the thread it landed in
    /// and whether it was new.
    pub async fn apply_push(&self, payload: &MessagePayload) -> (ConversationKey, AppendOutcome) {
        let key = ConversationKey::Conversation(payload.conversation_id);
        let counterpart = if payload.sender_id == self.me {
            payload.recipient_id
        } else {
            payload.sender_id
        };
        let (outcome, materialized) = {
            let mut state = self.state.lock().await;
            let known = state.index.resolve(counterpart) == Some(payload.conversation_id);
            let materialized =
                !known && state.materialize(counterpart, payload.conversation_id);
            state.index.upsert_from_message(payload);
            (state.threads.append(key, payload), materialized)
        };
        if materialized {
            self.emit(ClientEvent::ConversationMaterialized {
                recipient_id: counterpart,
                conversation_id: payload.conversation_id,
            });
        }
        if outcome != AppendOutcome::Stale {
            self.emit(ClientEvent::ThreadChanged(key));
            self.emit(ClientEvent::ContactsChanged);
        }
        (key, outcome)
    }

    /// Applies a pushed deletion unless the cache already holds a newer copy.
    pub async fn apply_push_delete(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        deleted_at: DateTime<Utc>,
        version: u64,
    ) -> bool {
        let key = ConversationKey::Conversation(conversation_id);
        {
            let mut state = self.state.lock().await;
            let Some(entry) = state
                .threads
                .entry_mut(key, MessageRef::Server(message_id))
            else {
                return false;
            };
            if version < entry.message.version {
                debug!(%message_id, version, "pipeline: ignoring stale delete");
                return false;
            }
            entry.message.version = version;
            if !entry.message.is_deleted() {
                entry.message.tombstone(deleted_at);
            }
        }
        self.emit(ClientEvent::ThreadChanged(key));
        true
    }

    /// Reloads one thread from the server. Local pending entries survive.
    pub async fn refresh_thread(&self, key: ConversationKey) -> Result<bool, LoadError> {
        let Some(conversation_id) = key.conversation_id() else {
            return Ok(false);
        };
        let ticket = self.state.lock().await.threads.begin_refresh(key);
        let payloads = self
            .reload
            .run("pipeline: refresh thread", || {
                self.backend.load_thread(conversation_id)
            })
            .await?;
        let applied = self
            .state
            .lock()
            .await
            .threads
            .complete_load(ticket, payloads);
        if applied {
            self.emit(ClientEvent::ThreadChanged(key));
        }
        Ok(applied)
    }

    async fn ensure_permitted(&self, recipient_id: UserId) -> Result<(), MutationError> {
        match self.recipients.validate(recipient_id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(MutationError::Permission(format!(
                "user {recipient_id} is not an allowed recipient"
            ))),
            Err(err) => Err(MutationError::transient(err)),
        }
    }

    async fn snapshot(&self, local_id: LocalId) -> Result<PendingMutation, MutationError> {
        self.state
            .lock()
            .await
            .mutations
            .get(&local_id)
            .cloned()
            .ok_or(MutationError::UnknownMutation(local_id))
    }

    pub(crate) async fn dispatch_new_message(
        &self,
        local_id: LocalId,
    ) -> Result<MutationOutcome, MutationError> {
        let mutation = self.snapshot(local_id).await?;
        let result = match &mutation.change {
            Change::Send {
                body,
                uploads,
                uploaded,
                reply_to_id,
                client_nonce,
            } => {
                self.deliver_send(
                    local_id,
                    body,
                    uploads,
                    uploaded.clone(),
                    *reply_to_id,
                    *client_nonce,
                )
                .await
            }
            Change::Forward {
                source_id,
                recipient_id,
            } => self
                .backend
                .forward_message(*source_id, *recipient_id)
                .await
                .map(Some),
            _ => return Err(MutationError::UnknownMutation(local_id)),
        };
        match result {
            Ok(None) => {
                info!(%local_id, "pipeline: send discarded before delivery");
                Ok(MutationOutcome::Discarded { local_id })
            }
            Ok(Some(payload)) => {
                self.confirm_new_message(&mutation, &payload).await;
                self.flush_deferred(local_id).await;
                Ok(MutationOutcome::Confirmed {
                    local_id,
                    message_id: payload.message_id,
                })
            }
            Err(err) => self.handle_failure(&mutation, err, None).await,
        }
    }

    async fn deliver_send(
        &self,
        local_id: LocalId,
        body: &str,
        uploads: &[AttachmentUpload],
        uploaded: Vec<AttachmentPayload>,
        reply_to_id: Option<MessageId>,
        client_nonce: Uuid,
    ) -> Result<Option<MessagePayload>, BackendError> {
        let mut attachments = uploaded;
        for upload in uploads.iter().skip(attachments.len()) {
            let attachment = self.backend.upload_attachment(upload.clone()).await?;
            debug!(%local_id, filename = %attachment.filename, "pipeline: attachment uploaded");
            attachments.push(attachment.clone());
            let mut state = self.state.lock().await;
            match state.mutations.get_mut(&local_id) {
                Some(PendingMutation {
                    change: Change::Send { uploaded, .. },
                    ..
                }) => uploaded.push(attachment),
                _ => return Ok(None),
            }
        }

        let target = {
            let mut state = self.state.lock().await;
            let Some(key) = state
                .mutations
                .get(&local_id)
                .map(|mutation| mutation.conversation)
            else {
                return Ok(None);
            };
            let id = MessageRef::Local(local_id);
            if !uploads.is_empty() {
                if let Some(entry) = state.threads.entry_mut(key, id) {
                    entry.message.attachments = attachments.clone();
                    entry.uploading = false;
                }
            }
            match key {
                ConversationKey::Conversation(conversation_id) => {
                    SendTarget::Conversation(conversation_id)
                }
                ConversationKey::Virtual(recipient_id) => SendTarget::Recipient(recipient_id),
            }
        };

        self.backend
            .send_message(SendMessageRequest {
                target,
                body: body.to_string(),
                attachments,
                reply_to_id,
                client_nonce,
            })
            .await
            .map(Some)
    }

    async fn confirm_new_message(&self, mutation: &PendingMutation, payload: &MessagePayload) {
        let local_id = mutation.local_id;
        let seq = mutation.seq();
        let to = ConversationKey::Conversation(payload.conversation_id);
        let materialized = {
            let mut state = self.state.lock().await;
            let from = state
                .mutations
                .get(&local_id)
                .map(|pending| pending.conversation)
                .unwrap_or(mutation.conversation);
            let materialized = match from {
                ConversationKey::Virtual(recipient_id) => {
                    state.materialize(recipient_id, payload.conversation_id);
                    Some(recipient_id)
                }
                ConversationKey::Conversation(_) => None,
            };
            if !state.threads.confirm_local(to, local_id, payload) {
                state.threads.append(to, payload);
            }
            if let Some(entry) = state
                .threads
                .entry_mut(to, MessageRef::Server(payload.message_id))
            {
                entry.absorb(
                    payload,
                    AbsorbMode::Response {
                        seq,
                        fields: &Field::ALL,
                    },
                );
                entry.clocks.settle(Field::Body, seq);
            }
            state.index.upsert_from_message(payload);
            state
                .confirmed_sends
                .insert(local_id, (to, payload.message_id));
            state.forget(local_id);
            materialized
        };
        info!(
            %local_id,
            message_id = %payload.message_id,
            conversation_id = %payload.conversation_id,
            "pipeline: message confirmed"
        );
        if let Some(recipient_id) = materialized {
            self.emit(ClientEvent::ConversationMaterialized {
                recipient_id,
                conversation_id: payload.conversation_id,
            });
        }
        self.emit(ClientEvent::ThreadChanged(to));
        self.emit(ClientEvent::ContactsChanged);
    }

    /// Sends the follow-up mutations that were waiting on `local_id`, in
    /// the order they were issued.
    async fn flush_deferred(&self, local_id: LocalId) {
        let waiting: Vec<LocalId> = {
            let state = self.state.lock().await;
            state
                .mutations
                .values()
                .filter(|mutation| {
                    mutation.target == MessageRef::Local(local_id)
                        && !mutation.change.creates_message()
                        && mutation.state == MutationState::Pending
                })
                .map(|mutation| mutation.local_id)
                .collect()
        };
        for deferred in waiting {
            if let Err(err) = self.dispatch_targeted(deferred).await {
                debug!(%deferred, "pipeline: deferred mutation failed: {err}");
            }
        }
    }

    async fn dispatch_targeted(&self, local_id: LocalId) -> Result<MutationOutcome, MutationError> {
        let (mutation, resolved, base_version) = {
            let state = self.state.lock().await;
            let mutation = state
                .mutations
                .get(&local_id)
                .cloned()
                .ok_or(MutationError::UnknownMutation(local_id))?;
            let resolved = state.resolve(&mutation);
            let base_version = resolved
                .and_then(|(key, message_id)| {
                    state.threads.entry(key, MessageRef::Server(message_id))
                })
                .map(|entry| entry.message.version)
                .unwrap_or(0);
            (mutation, resolved, base_version)
        };
        let Some((key, message_id)) = resolved else {
            debug!(%local_id, "pipeline: waiting for the target send to be confirmed");
            return Ok(MutationOutcome::Pending { local_id });
        };

        let backend = &self.backend;
        let result = match &mutation.change {
            Change::Edit { body, .. } => backend
                .edit_message(message_id, body, base_version)
                .await
                .map(Some),
            Change::Delete { .. } => backend
                .delete_message(message_id, base_version)
                .await
                .map(|()| None),
            Change::React { value, .. } => backend
                .set_reaction(message_id, value.as_deref())
                .await
                .map(Some),
            Change::Pin { pinned } => backend.set_pinned(message_id, *pinned).await.map(Some),
            Change::Save { saved } => backend.set_saved(message_id, *saved).await.map(|()| None),
            Change::Send { .. } | Change::Forward { .. } => {
                return Err(MutationError::UnknownMutation(local_id))
            }
        };

        match result {
            Ok(payload) => {
                {
                    let mut state = self.state.lock().await;
                    if let Some(entry) = state
                        .threads
                        .entry_mut(key, MessageRef::Server(message_id))
                    {
                        if let Some(payload) = &payload {
                            entry.absorb(
                                payload,
                                AbsorbMode::Response {
                                    seq: mutation.seq(),
                                    fields: mutation.change.fields(),
                                },
                            );
                        }
                        for field in mutation.change.fields() {
                            entry.clocks.settle(*field, mutation.seq());
                        }
                    }
                    state.forget(local_id);
                }
                debug!(%local_id, %message_id, kind = ?mutation.kind(), "pipeline: mutation confirmed");
                self.emit(ClientEvent::ThreadChanged(key));
                Ok(MutationOutcome::Confirmed {
                    local_id,
                    message_id,
                })
            }
            Err(err) => {
                self.handle_failure(&mutation, err, Some((key, message_id)))
                    .await
            }
        }
    }

    async fn handle_failure(
        &self,
        mutation: &PendingMutation,
        err: BackendError,
        target: Option<(ConversationKey, MessageId)>,
    ) -> Result<MutationOutcome, MutationError> {
        let local_id = mutation.local_id;
        let error =
            MutationError::from_backend(err, Some(local_id), target.map(|(_, message_id)| message_id));

        if error.is_retryable() {
            warn!(%local_id, kind = ?mutation.kind(), "pipeline: mutation failed, kept for retry: {error}");
            let key = {
                let mut state = self.state.lock().await;
                let key = match state.mutations.get_mut(&local_id) {
                    Some(pending) => {
                        pending.state = MutationState::Failed(error.clone());
                        pending.conversation
                    }
                    None => mutation.conversation,
                };
                if mutation.change.creates_message() {
                    let id = MessageRef::Local(local_id);
                    state.threads.set_delivery(
                        key,
                        id,
                        Delivery::Failed {
                            reason: error.to_string(),
                        },
                    );
                    state.threads.set_uploading(key, id, false);
                }
                key
            };
            self.emit(ClientEvent::ThreadChanged(key));
            self.emit(ClientEvent::MutationFailed {
                local_id,
                error: error.clone(),
            });
            return Err(error);
        }

        match (&error, target) {
            (MutationError::Conflict { .. } | MutationError::NotFound(_), Some((key, message_id))) => {
                self.resolve_conflict(mutation, key, message_id, error).await
            }
            _ => {
                warn!(%local_id, kind = ?mutation.kind(), "pipeline: mutation rejected: {error}");
                let key = {
                    let mut state = self.state.lock().await;
                    self.rollback_locked(&mut state, mutation);
                    state.current_ref(mutation.conversation, mutation.target).0
                };
                self.emit(ClientEvent::ThreadChanged(key));
                self.emit(ClientEvent::MutationFailed {
                    local_id,
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// The server copy moved on underneath a mutation. Local state is rolled
    /// back and the thread re-read. A delete that finds the message already
    /// gone has converged and counts as success.
    async fn resolve_conflict(
        &self,
        mutation: &PendingMutation,
        key: ConversationKey,
        message_id: MessageId,
        error: MutationError,
    ) -> Result<MutationOutcome, MutationError> {
        let local_id = mutation.local_id;
        let is_delete = mutation.kind() == MutationKind::Delete;
        {
            let mut state = self.state.lock().await;
            if is_delete {
                if let Some(entry) = state
                    .threads
                    .entry_mut(key, MessageRef::Server(message_id))
                {
                    for field in Field::ALL {
                        entry.clocks.settle(field, mutation.seq());
                    }
                }
            } else {
                self.rollback_locked(&mut state, mutation);
            }
        }

        let refreshed = self.refresh_thread(key).await;
        if let Err(load_err) = &refreshed {
            warn!(%message_id, "pipeline: could not reload thread after conflict: {load_err}");
        }

        if is_delete {
            let mut state = self.state.lock().await;
            let deleted = state
                .threads
                .entry(key, MessageRef::Server(message_id))
                .map_or(true, |entry| entry.message.is_deleted());
            let converged = match (&refreshed, &error) {
                (Ok(_), _) => deleted,
                (Err(_), MutationError::NotFound(_)) => true,
                (Err(_), _) => false,
            };
            if converged {
                state.forget(local_id);
                drop(state);
                info!(%message_id, "pipeline: message was already deleted on the server");
                self.emit(ClientEvent::ThreadChanged(key));
                return Ok(MutationOutcome::AlreadyDeleted { message_id });
            }
            if refreshed.is_err() {
                self.rollback_locked(&mut state, mutation);
            } else {
                state.forget(local_id);
            }
        }

        warn!(%local_id, %message_id, kind = ?mutation.kind(), "pipeline: local change lost to a concurrent one: {error}");
        self.emit(ClientEvent::ThreadChanged(key));
        self.emit(ClientEvent::ConflictNotice {
            message_id,
            reason: error.to_string(),
        });
        Err(error)
    }

    /// Undoes a mutation's optimistic effect unless a newer mutation of the
    /// same field has overwritten it, and forgets the mutation.
    fn rollback_locked(&self, state: &mut MessagingState, mutation: &PendingMutation) {
        let me = self.me;
        let seq = mutation.seq();
        let conversation = state
            .mutations
            .get(&mutation.local_id)
            .map(|pending| pending.conversation)
            .unwrap_or(mutation.conversation);
        let (key, target) = state.current_ref(conversation, mutation.target);
        state.forget(mutation.local_id);

        if mutation.change.creates_message() {
            state.threads.remove(key, target);
            state
                .mutations
                .retain(|_, dependent| dependent.target != MessageRef::Local(mutation.local_id));
            return;
        }

        let Some(entry) = state.threads.entry_mut(key, target) else {
            return;
        };
        let fields = mutation.change.fields();
        let superseded = fields
            .iter()
            .any(|field| entry.clocks.latest_issued(*field) > seq);
        for field in fields {
            entry.clocks.settle(*field, seq);
        }
        let is_delete = mutation.kind() == MutationKind::Delete;
        if superseded || (entry.message.is_deleted() && !is_delete) {
            return;
        }

        let message = &mut entry.message;
        match &mutation.change {
            Change::Edit {
                previous_body,
                previous_edited_at,
                ..
            } => {
                message.body = previous_body.clone();
                message.edited_at = *previous_edited_at;
            }
            Change::Delete { previous } => {
                let id = message.id;
                let conversation = message.conversation;
                let version = message.version;
                *message = (**previous).clone();
                message.id = id;
                message.conversation = conversation;
                message.version = version;
            }
            Change::React { previous, .. } => match previous {
                Some(value) => {
                    message.reactions.insert(me, value.clone());
                }
                None => {
                    message.reactions.remove(&me);
                }
            },
            Change::Pin { pinned } => message.pinned = !pinned,
            Change::Save { saved } => {
                if *saved {
                    message.saved_by.remove(&me);
                } else {
                    message.saved_by.insert(me);
                }
            }
            Change::Send { .. } | Change::Forward { .. } => {}
        }
    }
}

fn insert_pending(
    state: &mut MessagingState,
    key: ConversationKey,
    message: Message,
    local_id: LocalId,
    change: Change,
) {
    let id = message.id;
    state.threads.insert_local(key, message, local_id);
    if let Some(entry) = state.threads.entry_mut(key, id) {
        entry.clocks.issue(Field::Body, local_id.0);
    }
    state.mutations.insert(
        local_id,
        PendingMutation {
            local_id,
            conversation: key,
            target: id,
            state: MutationState::Pending,
            change,
        },
    );
}

/// Applies `apply` optimistically and records the mutation.
fn issue(
    state: &mut MessagingState,
    key: ConversationKey,
    target: MessageRef,
    change: Change,
    apply: impl FnOnce(&mut Message),
) -> LocalId {
    let local_id = state.next_local_id();
    if let Some(entry) = state.threads.entry_mut(key, target) {
        apply(&mut entry.message);
        for field in change.fields() {
            entry.clocks.issue(*field, local_id.0);
        }
    }
    state.mutations.insert(
        local_id,
        PendingMutation {
            local_id,
            conversation: key,
            target,
            state: MutationState::Pending,
            change,
        },
    );
    local_id
}

/// Finds a message that follow-up mutations may act on.
fn locate_live(
    state: &MessagingState,
    key: ConversationKey,
    target: MessageRef,
) -> Result<(ConversationKey, MessageRef, Message), MutationError> {
    let (key, target) = state.current_ref(key, target);
    let entry = state
        .threads
        .entry(key, target)
        .ok_or_else(|| MutationError::NotFound(format!("message {target}")))?;
    if entry.message.is_deleted() {
        return Err(ValidationError::TargetDeleted(target.to_string()).into());
    }
    Ok((key, target, entry.message.clone()))
}

#[cfg(test)]
#[path = "tests/pipeline_tests.rs"]
mod tests;
