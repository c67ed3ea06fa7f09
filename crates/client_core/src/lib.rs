use std::sync::Arc;

use anyhow::Result;
use call_signaling::{CallSignaling, MissingCallSignaling};
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, Role, UserId},
    protocol::{ContactSummary, ServerEvent},
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod backend;
pub mod call;
pub mod config;
pub mod conversations;
pub mod drafts;
pub mod error;
pub mod events;
pub mod http;
pub mod pipeline;
pub mod presence;
pub mod recipients;
pub mod retry;
pub mod thread;

pub use backend::{AttachmentUpload, EventTransport, MessagingBackend, MissingEventTransport};
pub use call::{CallBridge, CallError, CallPhase, CallSession};
pub use config::{load_settings, ClientSettings};
pub use conversations::{Contact, ConversationKey};
pub use error::{BackendError, LoadError, MutationError, ValidationError};
pub use events::ClientEvent;
pub use http::HttpBackend;
pub use pipeline::{MessagingState, MutationOutcome, MutationPipeline};
pub use presence::{PresenceRecord, PresenceStore};
pub use recipients::RecipientDirectory;
pub use retry::RetryPolicy;
pub use thread::{Delivery, LocalId, Message, MessageRef, ThreadEntry};

use crate::presence::PresenceAction;

#[derive(Default)]
struct PortalClientState {
    reply_target: Option<MessageRef>,
    selected: Vec<MessageRef>,
    forwarding: Option<(ConversationKey, Vec<MessageRef>)>,
    feed_task: Option<JoinHandle<()>>,
    signal_task: Option<JoinHandle<()>>,
}

/// Session-scoped messaging core. Owns every cache and exposes the entry
/// points a UI binds to; all changes are announced on `subscribe_events`.
pub struct PortalClient {
    me: UserId,
    backend: Arc<dyn MessagingBackend>,
    transport: Arc<dyn EventTransport>,
    recipients: Arc<RecipientDirectory>,
    pipeline: Arc<MutationPipeline>,
    presence: Arc<RwLock<PresenceStore>>,
    calls: Arc<CallBridge>,
    retry: RetryPolicy,
    inner: Mutex<PortalClientState>,
    events: broadcast::Sender<ClientEvent>,
}

impl PortalClient {
    pub fn new(
        me: UserId,
        settings: &ClientSettings,
        backend: Arc<dyn MessagingBackend>,
        transport: Arc<dyn EventTransport>,
        signaling: Arc<dyn CallSignaling>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let recipients = RecipientDirectory::new(
            Arc::clone(&backend),
            settings.retry_policy(),
            settings.recipient_cache_ttl(),
        );
        let state = Arc::new(Mutex::new(MessagingState::new(me)));
        let pipeline = Arc::new(MutationPipeline::new(
            me,
            Arc::clone(&backend),
            Arc::clone(&recipients),
            state,
            events.clone(),
            settings,
        ));
        let presence = Arc::new(RwLock::new(PresenceStore::new()));
        let calls = Arc::new(CallBridge::new(
            me,
            signaling,
            Arc::clone(&presence),
            events.clone(),
        ));
        Arc::new(Self {
            me,
            backend,
            transport,
            recipients,
            pipeline,
            presence,
            calls,
            retry: settings.retry_policy(),
            inner: Mutex::new(PortalClientState::default()),
            events,
        })
    }

    /// HTTP/WebSocket client for `settings.server_url` without call support.
    pub fn connect(me: UserId, settings: &ClientSettings) -> Result<Arc<Self>> {
        let http = Arc::new(HttpBackend::new(
            &settings.server_url,
            me,
            settings.retry_policy().timeout,
        )?);
        Ok(Self::new(
            me,
            settings,
            http.clone(),
            http,
            Arc::new(MissingCallSignaling::default()),
        ))
    }

    pub fn me(&self) -> UserId {
        self.me
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn pipeline(&self) -> &Arc<MutationPipeline> {
        &self.pipeline
    }

    pub fn calls(&self) -> &Arc<CallBridge> {
        &self.calls
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub async fn contacts(&self) -> Vec<Contact> {
        self.pipeline.state().lock().await.index.contacts()
    }

    pub async fn total_unread(&self) -> u32 {
        self.pipeline.state().lock().await.index.total_unread()
    }

    /// Pulls the server's conversation list into the index. Returns how many
    /// conversations it holds.
    pub async fn refresh_conversations(&self) -> Result<usize, LoadError> {
        let summaries = self
            .retry
            .run("client: list conversations", || {
                self.backend.list_conversations()
            })
            .await?;
        let count = summaries.len();
        let materialized: Vec<(UserId, ConversationId)> = {
            let mut state = self.pipeline.state().lock().await;
            summaries
                .into_iter()
                .filter_map(|summary| {
                    let pair = (summary.counterpart.user_id, summary.conversation_id);
                    state.register_conversation(summary).then_some(pair)
                })
                .collect()
        };
        for (recipient_id, conversation_id) in materialized {
            self.emit(ClientEvent::ConversationMaterialized {
                recipient_id,
                conversation_id,
            });
        }
        self.emit(ClientEvent::ContactsChanged);
        info!(count, "client: conversations refreshed");
        Ok(count)
    }

    pub async fn active_conversation(&self) -> Option<ConversationKey> {
        self.pipeline.state().lock().await.threads.view()
    }

    /// The displayed thread in order, pending and failed entries included.
    pub async fn active_messages(&self) -> Vec<ThreadEntry> {
        let state = self.pipeline.state().lock().await;
        match state.threads.view() {
            Some(key) => state.threads.messages(key).to_vec(),
            None => Vec::new(),
        }
    }

    pub async fn draft(&self, key: ConversationKey) -> String {
        let state = self.pipeline.state().lock().await;
        let key = state.current_key(key);
        state.drafts.get(key).to_string()
    }

    pub async fn set_draft(&self, key: ConversationKey, text: impl Into<String>) {
        let mut state = self.pipeline.state().lock().await;
        let key = state.current_key(key);
        state.drafts.set(key, text);
    }

    /// Users the caller may message. Served from cache after the first load.
    pub async fn recipients(&self, role_filter: Option<Role>) -> Result<Vec<ContactSummary>, LoadError> {
        let contacts = self.recipients.load(role_filter).await?;
        {
            let mut state = self.pipeline.state().lock().await;
            for contact in &contacts {
                state.index.remember_contact(contact.clone());
            }
        }
        self.emit(ClientEvent::RecipientsUpdated);
        Ok(contacts)
    }

    pub async fn recipients_loading(&self) -> bool {
        self.recipients.is_loading().await
    }

    /// Switches the view to `contact_id`, loads its thread and marks it read.
    /// A contact with no conversation yet opens an empty virtual thread.
    pub async fn on_select_conversation(
        &self,
        contact_id: UserId,
    ) -> Result<ConversationKey, LoadError> {
        let (key, ticket) = {
            let mut state = self.pipeline.state().lock().await;
            let key = state.index.key_for(contact_id);
            state.threads.set_view(Some(key));
            (key, state.threads.begin_view_load(key))
        };
        self.reset_selection().await;
        self.emit(ClientEvent::ThreadChanged(key));

        let Some(conversation_id) = key.conversation_id() else {
            return Ok(key);
        };
        let payloads = self
            .retry
            .run("client: load thread", || {
                self.backend.load_thread(conversation_id)
            })
            .await?;
        let applied = self
            .pipeline
            .state()
            .lock()
            .await
            .threads
            .complete_load(ticket, payloads);
        if !applied {
            return Err(LoadError::Cancelled);
        }
        self.emit(ClientEvent::ThreadChanged(key));

        if let Err(err) = self.pipeline.mark_read(conversation_id).await {
            warn!(%conversation_id, "client: mark read failed: {err}");
        }
        Ok(key)
    }

    async fn reset_selection(&self) {
        let mut inner = self.inner.lock().await;
        let had_reply = inner.reply_target.take().is_some();
        inner.selected.clear();
        let was_forwarding = inner.forwarding.take().is_some();
        drop(inner);
        if had_reply {
            self.emit(ClientEvent::ReplyTargetChanged(None));
        }
        if was_forwarding {
            self.emit(ClientEvent::ForwardCancelled);
        }
    }

    async fn active_key(&self) -> Result<ConversationKey, MutationError> {
        self.active_conversation()
            .await
            .ok_or(MutationError::Validation(ValidationError::MissingRecipient))
    }

    /// Sends the composed text into the active conversation, replying to the
    /// current reply target if there is one.
    ///
    /// The composer is cleared as soon as the message is shown locally. If
    /// the server then rejects it outright, the text and reply target come
    /// back unless the user has started something new.
    pub async fn on_send(
        &self,
        body: &str,
        uploads: Vec<AttachmentUpload>,
    ) -> Result<MutationOutcome, MutationError> {
        let key = self.active_key().await?;
        let reply_target = self.inner.lock().await.reply_target;
        let composed = {
            let state = self.pipeline.state().lock().await;
            state.drafts.get(state.current_key(key)).to_string()
        };

        let local_id = self
            .pipeline
            .stage_send(key, body, uploads, reply_target.and_then(MessageRef::server_id))
            .await?;
        {
            let mut state = self.pipeline.state().lock().await;
            let key = state.current_key(key);
            // Text typed while the recipient was being checked is kept.
            if state.drafts.get(key) == composed {
                state.drafts.set(key, String::new());
            }
        }
        let cleared_reply = {
            let mut inner = self.inner.lock().await;
            let same_target = reply_target.is_some() && inner.reply_target == reply_target;
            if same_target {
                inner.reply_target = None;
            }
            same_target
        };
        if cleared_reply {
            self.emit(ClientEvent::ReplyTargetChanged(None));
        }

        let result = self.pipeline.dispatch_new_message(local_id).await;
        let kept = matches!(
            &result,
            Ok(_) | Err(MutationError::Transient { local_id: Some(_), .. })
        );
        if !kept {
            self.restore_composer(key, body, reply_target).await;
        }
        result
    }

    async fn restore_composer(
        &self,
        key: ConversationKey,
        body: &str,
        reply_target: Option<MessageRef>,
    ) {
        {
            let mut state = self.pipeline.state().lock().await;
            let key = state.current_key(key);
            if state.drafts.get(key).is_empty() {
                state.drafts.set(key, body);
            }
        }
        let restored = {
            let mut inner = self.inner.lock().await;
            let restore = reply_target.is_some() && inner.reply_target.is_none();
            if restore {
                inner.reply_target = reply_target;
            }
            restore
        };
        if restored {
            self.emit(ClientEvent::ReplyTargetChanged(reply_target));
        }
    }

    pub async fn on_edit(
        &self,
        target: MessageRef,
        body: &str,
    ) -> Result<MutationOutcome, MutationError> {
        let key = self.active_key().await?;
        self.pipeline.edit(key, target, body).await
    }

    pub async fn on_delete(&self, target: MessageRef) -> Result<MutationOutcome, MutationError> {
        let key = self.active_key().await?;
        let outcome = self.pipeline.delete(key, target).await;
        let mut inner = self.inner.lock().await;
        inner.selected.retain(|selected| *selected != target);
        if inner.reply_target == Some(target) {
            inner.reply_target = None;
            drop(inner);
            self.emit(ClientEvent::ReplyTargetChanged(None));
        }
        outcome
    }

    pub async fn on_react(
        &self,
        target: MessageRef,
        value: &str,
    ) -> Result<MutationOutcome, MutationError> {
        let key = self.active_key().await?;
        self.pipeline.react(key, target, value).await
    }

    pub async fn on_pin(
        &self,
        target: MessageRef,
        pinned: bool,
    ) -> Result<MutationOutcome, MutationError> {
        let key = self.active_key().await?;
        self.pipeline.pin(key, target, pinned).await
    }

    pub async fn on_save(
        &self,
        target: MessageRef,
        saved: bool,
    ) -> Result<MutationOutcome, MutationError> {
        let key = self.active_key().await?;
        self.pipeline.save(key, target, saved).await
    }

    pub async fn search_saved(&self, query: &str) -> Vec<Message> {
        self.pipeline.search_saved(query).await
    }

    /// Only confirmed, live messages of the active thread can be replied to.
    pub async fn on_reply_message(&self, target: MessageRef) -> Result<(), MutationError> {
        let key = self.active_key().await?;
        let target = {
            let state = self.pipeline.state().lock().await;
            let (key, target) = state.current_ref(key, target);
            let entry = state
                .threads
                .entry(key, target)
                .ok_or_else(|| MutationError::NotFound(format!("message {target}")))?;
            if entry.message.is_deleted() {
                return Err(ValidationError::TargetDeleted(target.to_string()).into());
            }
            if target.server_id().is_none() {
                return Err(ValidationError::TargetNotDelivered(target.to_string()).into());
            }
            target
        };
        self.inner.lock().await.reply_target = Some(target);
        self.emit(ClientEvent::ReplyTargetChanged(Some(target)));
        Ok(())
    }

    pub async fn on_cancel_reply(&self) {
        if self.inner.lock().await.reply_target.take().is_some() {
            self.emit(ClientEvent::ReplyTargetChanged(None));
        }
    }

    pub async fn reply_target(&self) -> Option<MessageRef> {
        self.inner.lock().await.reply_target
    }

    /// Toggles `target` in the multi-select set. Returns whether it is now
    /// selected. Only confirmed, live messages can be selected.
    pub async fn on_select_message(&self, target: MessageRef) -> Result<bool, MutationError> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(index) = inner.selected.iter().position(|selected| *selected == target) {
                inner.selected.remove(index);
                return Ok(false);
            }
        }
        let key = self.active_key().await?;
        let target = {
            let state = self.pipeline.state().lock().await;
            let (key, target) = state.current_ref(key, target);
            let entry = state
                .threads
                .entry(key, target)
                .ok_or_else(|| MutationError::NotFound(format!("message {target}")))?;
            if entry.message.is_deleted() {
                return Err(ValidationError::TargetDeleted(target.to_string()).into());
            }
            if target.server_id().is_none() {
                return Err(ValidationError::TargetNotDelivered(target.to_string()).into());
            }
            target
        };
        let mut inner = self.inner.lock().await;
        if !inner.selected.contains(&target) {
            inner.selected.push(target);
        }
        Ok(true)
    }

    pub async fn selected_messages(&self) -> Vec<MessageRef> {
        self.inner.lock().await.selected.clone()
    }

    /// Asks the UI to pick a forward recipient for `target`, or for the
    /// current selection when `target` is `None`.
    pub async fn on_forward_message(
        &self,
        target: Option<MessageRef>,
    ) -> Result<Vec<MessageRef>, MutationError> {
        let key = self.active_key().await?;
        let target = match target {
            Some(target) => Some(self.pipeline.state().lock().await.current_ref(key, target).1),
            None => None,
        };
        let messages = {
            let mut inner = self.inner.lock().await;
            let messages = match target {
                Some(target) => vec![target],
                None => inner.selected.clone(),
            };
            if messages.is_empty() {
                return Err(MutationError::NotFound("no message selected".into()));
            }
            inner.forwarding = Some((key, messages.clone()));
            messages
        };
        self.emit(ClientEvent::ForwardRequested {
            conversation: key,
            messages: messages.clone(),
        });
        Ok(messages)
    }

    /// Forwards everything requested by `on_forward_message` to
    /// `recipient_id`, one result per message.
    pub async fn on_confirm_forward(
        &self,
        recipient_id: UserId,
    ) -> Result<Vec<Result<MutationOutcome, MutationError>>, MutationError> {
        let (key, messages) = {
            let mut inner = self.inner.lock().await;
            let request = inner
                .forwarding
                .take()
                .ok_or_else(|| MutationError::NotFound("no forward in progress".into()))?;
            inner.selected.clear();
            request
        };
        let mut results = Vec::with_capacity(messages.len());
        for source in messages {
            results.push(self.pipeline.forward(key, source, recipient_id).await);
        }
        Ok(results)
    }

    pub async fn on_cancel_forward(&self) {
        if self.inner.lock().await.forwarding.take().is_some() {
            self.emit(ClientEvent::ForwardCancelled);
        }
    }

    /// Text to put on the clipboard. Deleted messages have none.
    pub async fn on_copy_message(&self, target: MessageRef) -> Option<String> {
        let key = self.active_conversation().await?;
        let state = self.pipeline.state().lock().await;
        let (key, target) = state.current_ref(key, target);
        state
            .threads
            .entry(key, target)
            .filter(|entry| !entry.message.is_deleted())
            .map(|entry| entry.message.body.clone())
    }

    pub async fn retry(&self, local_id: LocalId) -> Result<MutationOutcome, MutationError> {
        self.pipeline.retry(local_id).await
    }

    pub async fn discard(&self, local_id: LocalId) -> Result<bool, MutationError> {
        self.pipeline.discard(local_id).await
    }

    pub async fn presence_of(&self, user_id: UserId) -> Option<PresenceRecord> {
        self.presence.read().await.get(user_id).cloned()
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.presence.read().await.is_online(user_id)
    }

    pub async fn last_seen_for_display(&self, user_id: UserId) -> Option<DateTime<Utc>> {
        self.presence.read().await.last_seen_for_display(user_id)
    }

    /// Seeds presence from a snapshot, then follows the push feed,
    /// reconnecting with backoff. Also starts listening for call signals.
    pub async fn start_event_feed(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.feed_task.is_some() {
            return;
        }
        inner.signal_task = Some(self.calls.spawn_signal_listener());
        let client = Arc::clone(self);
        inner.feed_task = Some(tokio::spawn(async move {
            client.run_event_feed().await;
        }));
    }

    pub async fn stop_event_feed(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.feed_task.take() {
            task.abort();
        }
        if let Some(task) = inner.signal_task.take() {
            task.abort();
        }
    }

    async fn run_event_feed(&self) {
        let mut failures = 0usize;
        let mut connected_before = false;
        loop {
            if let Err(err) = self.sync_presence().await {
                warn!("events: presence snapshot failed: {err}");
            }
            match self.transport.subscribe().await {
                Ok(mut feed) => {
                    failures = 0;
                    if connected_before {
                        self.resync().await;
                    }
                    connected_before = true;
                    info!("events: feed connected");
                    while let Some(event) = feed.recv().await {
                        self.handle_server_event(event).await;
                    }
                    warn!("events: feed closed");
                    self.emit(ClientEvent::FeedDisconnected("feed closed".into()));
                }
                Err(err) => {
                    warn!(attempt = failures + 1, "events: subscribe failed: {err}");
                    self.emit(ClientEvent::FeedDisconnected(err.to_string()));
                    failures += 1;
                }
            }
            tokio::time::sleep(self.retry.delay_for(failures)).await;
        }
    }

    async fn sync_presence(&self) -> Result<(), LoadError> {
        let records = self
            .retry
            .run("events: presence snapshot", || {
                self.transport.fetch_presence_snapshot()
            })
            .await?;
        self.presence
            .write()
            .await
            .dispatch(PresenceAction::Snapshot(records));
        self.emit(ClientEvent::PresenceChanged);
        Ok(())
    }

    /// Catches up on whatever the feed missed while it was down.
    async fn resync(&self) {
        if let Err(err) = self.refresh_conversations().await {
            warn!("events: conversation resync failed: {err}");
        }
        if let Some(key) = self.active_conversation().await {
            if let Err(err) = self.pipeline.refresh_thread(key).await {
                warn!(%key, "events: thread resync failed: {err}");
            }
        }
    }

    pub async fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::MessageReceived { message } | ServerEvent::MessageUpdated { message } => {
                let (key, outcome) = self.pipeline.apply_push(&message).await;
                let inbound = message.sender_id != self.me && message.deleted_at.is_none();
                if outcome == thread::AppendOutcome::Inserted
                    && inbound
                    && self.active_conversation().await == Some(key)
                {
                    if let Err(err) = self.pipeline.mark_read(message.conversation_id).await {
                        warn!(conversation_id = %message.conversation_id, "events: mark read failed: {err}");
                    }
                }
            }
            ServerEvent::MessageDeleted {
                conversation_id,
                message_id,
                deleted_at,
                version,
            } => {
                self.pipeline
                    .apply_push_delete(conversation_id, message_id, deleted_at, version)
                    .await;
            }
            ServerEvent::Presence(event) => {
                self.presence.write().await.ingest(event);
                self.emit(ClientEvent::PresenceChanged);
            }
            ServerEvent::Error(api_error) => {
                debug!(code = ?api_error.code, "events: server error");
                warn!("events: server reported error: {}", api_error.message);
                self.emit(ClientEvent::ServerError(api_error.message));
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
