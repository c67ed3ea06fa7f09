//! Per-conversation message sequences.
//!
//! Entries keep the position they were first given. Confirmed messages are
//! keyed by server id, unconfirmed sends by a [`LocalId`]; an id never
//! appears twice in a thread.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, UserId},
    protocol::{AttachmentPayload, MessagePayload},
};
use tracing::debug;

use crate::conversations::ConversationKey;

/// Monotonic local sequence number. Doubles as the id of a pending send and
/// as the ordering tag of every mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalId(pub u64);

impl std::fmt::Display for LocalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRef {
    Server(MessageId),
    Local(LocalId),
}

impl MessageRef {
    pub fn server_id(self) -> Option<MessageId> {
        match self {
            Self::Server(id) => Some(id),
            Self::Local(_) => None,
        }
    }
}

impl std::fmt::Display for MessageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server(id) => write!(f, "{id}"),
            Self::Local(local_id) => write!(f, "{local_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageRef,
    pub conversation: ConversationKey,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub body: String,
    pub attachments: Vec<AttachmentPayload>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// At most one active reaction per user.
    pub reactions: BTreeMap<UserId, String>,
    pub reply_to_id: Option<MessageId>,
    pub forwarded_from_id: Option<MessageId>,
    pub pinned: bool,
    pub saved_by: BTreeSet<UserId>,
    pub version: u64,
}

impl Message {
    pub fn from_payload(payload: &MessagePayload, conversation: ConversationKey) -> Self {
        let mut message = Self {
            id: MessageRef::Server(payload.message_id),
            conversation,
            sender_id: payload.sender_id,
            recipient_id: payload.recipient_id,
            body: payload.body.clone(),
            attachments: payload.attachments.clone(),
            created_at: payload.created_at,
            edited_at: payload.edited_at,
            deleted_at: None,
            reactions: reactions_from(payload),
            reply_to_id: payload.reply_to_id,
            forwarded_from_id: payload.forwarded_from_id,
            pinned: payload.pinned,
            saved_by: payload.saved_by.iter().copied().collect(),
            version: payload.version,
        };
        if let Some(deleted_at) = payload.deleted_at {
            message.tombstone(deleted_at);
        }
        message
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn reaction_of(&self, user_id: UserId) -> Option<&str> {
        self.reactions.get(&user_id).map(String::as_str)
    }

    pub fn is_saved_by(&self, user_id: UserId) -> bool {
        self.saved_by.contains(&user_id)
    }

    pub(crate) fn tombstone(&mut self, deleted_at: DateTime<Utc>) {
        self.body.clear();
        self.attachments.clear();
        self.reactions.clear();
        self.pinned = false;
        self.saved_by.clear();
        self.deleted_at = Some(deleted_at);
    }
}

fn reactions_from(payload: &MessagePayload) -> BTreeMap<UserId, String> {
    payload
        .reactions
        .iter()
        .map(|reaction| (reaction.user_id, reaction.value.clone()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Pending,
    Confirmed,
    Failed { reason: String },
}

/// Independently reconciled parts of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// Body, attachments, edit and delete timestamps.
    Body,
    Reactions,
    Pinned,
    Saved,
}

impl Field {
    pub const ALL: [Field; 4] = [Field::Body, Field::Reactions, Field::Pinned, Field::Saved];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FieldClock {
    issued: u64,
    settled: u64,
}

/// Tracks, per field, the newest local mutation issued and the newest one
/// whose response has come back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldClocks {
    body: FieldClock,
    reactions: FieldClock,
    pinned: FieldClock,
    saved: FieldClock,
}

impl FieldClocks {
    fn clock(&self, field: Field) -> &FieldClock {
        match field {
            Field::Body => &self.body,
            Field::Reactions => &self.reactions,
            Field::Pinned => &self.pinned,
            Field::Saved => &self.saved,
        }
    }

    fn clock_mut(&mut self, field: Field) -> &mut FieldClock {
        match field {
            Field::Body => &mut self.body,
            Field::Reactions => &mut self.reactions,
            Field::Pinned => &mut self.pinned,
            Field::Saved => &mut self.saved,
        }
    }

    pub fn issue(&mut self, field: Field, seq: u64) {
        let clock = self.clock_mut(field);
        clock.issued = clock.issued.max(seq);
    }

    pub fn settle(&mut self, field: Field, seq: u64) {
        let clock = self.clock_mut(field);
        clock.settled = clock.settled.max(seq);
    }

    pub fn latest_issued(&self, field: Field) -> u64 {
        self.clock(field).issued
    }

    pub fn has_outstanding(&self, field: Field) -> bool {
        let clock = self.clock(field);
        clock.issued > clock.settled
    }

    /// A response for mutation `seq` may write `field` only if no later
    /// mutation of that field has been issued.
    pub fn accepts(&self, field: Field, seq: u64) -> bool {
        seq >= self.clock(field).issued
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey(DateTime<Utc>, u8, i64);

impl OrderKey {
    fn server(created_at: DateTime<Utc>, message_id: MessageId) -> Self {
        Self(created_at, 0, message_id.0)
    }

    fn local(created_at: DateTime<Utc>, local_id: LocalId) -> Self {
        Self(created_at, 1, local_id.0 as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadEntry {
    pub message: Message,
    pub delivery: Delivery,
    /// Attachments of a pending send are still uploading.
    pub uploading: bool,
    pub(crate) clocks: FieldClocks,
    order: OrderKey,
}

/// Which field clocks gate a server copy of the message.
#[derive(Debug, Clone, Copy)]
pub(crate) enum AbsorbMode<'a> {
    /// Unsolicited copy (push or reload): skip fields with outstanding
    /// local mutations.
    Push,
    /// Response to local mutation `seq`, which wrote only `fields`.
    Response { seq: u64, fields: &'a [Field] },
}

impl ThreadEntry {
    fn from_payload(payload: &MessagePayload, conversation: ConversationKey) -> Self {
        Self {
            message: Message::from_payload(payload, conversation),
            delivery: Delivery::Confirmed,
            uploading: false,
            clocks: FieldClocks::default(),
            order: OrderKey::server(payload.created_at, payload.message_id),
        }
    }

    pub fn id(&self) -> MessageRef {
        self.message.id
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.delivery, Delivery::Pending)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.delivery, Delivery::Failed { .. })
    }

    fn accepts(&self, field: Field, mode: AbsorbMode<'_>) -> bool {
        match mode {
            AbsorbMode::Push => !self.clocks.has_outstanding(field),
            AbsorbMode::Response { seq, fields } => {
                fields.contains(&field) && self.clocks.accepts(field, seq)
            }
        }
    }

    /// Merges a server copy of this message, field by field. A response
    /// older than the cached version writes nothing.
    pub(crate) fn absorb(&mut self, payload: &MessagePayload, mode: AbsorbMode<'_>) {
        if matches!(mode, AbsorbMode::Response { .. }) && payload.version < self.message.version {
            debug!(
                message_id = %payload.message_id,
                version = payload.version,
                cached = self.message.version,
                "thread: ignoring response older than cached copy"
            );
            return;
        }
        let message = &mut self.message;
        message.version = message.version.max(payload.version);
        message.reply_to_id = payload.reply_to_id.or(message.reply_to_id);
        message.forwarded_from_id = payload.forwarded_from_id.or(message.forwarded_from_id);

        if self.accepts(Field::Body, mode) {
            let message = &mut self.message;
            message.body = payload.body.clone();
            message.attachments = payload.attachments.clone();
            message.edited_at = payload.edited_at;
            message.deleted_at = None;
            if let Some(deleted_at) = payload.deleted_at {
                message.tombstone(deleted_at);
                return;
            }
        }
        if self.message.is_deleted() {
            return;
        }
        if self.accepts(Field::Reactions, mode) {
            self.message.reactions = reactions_from(payload);
        }
        if self.accepts(Field::Pinned, mode) {
            self.message.pinned = payload.pinned;
        }
        if self.accepts(Field::Saved, mode) {
            self.message.saved_by = payload.saved_by.iter().copied().collect();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    Updated,
    /// Older than the cached copy; ignored.
    Stale,
}

/// Identifies one fetch. View loads are dropped once another conversation is
/// selected; refreshes only lose to newer fetches of the same thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket {
    pub key: ConversationKey,
    fetch: u64,
    view_generation: Option<u64>,
}

#[derive(Debug, Default, Clone)]
struct Thread {
    entries: Vec<ThreadEntry>,
    applied_fetch: u64,
}

impl Thread {
    fn position(&self, id: MessageRef) -> Option<usize> {
        self.entries.iter().position(|entry| entry.message.id == id)
    }

    fn insert_ordered(&mut self, entry: ThreadEntry) -> usize {
        let index = self
            .entries
            .iter()
            .rposition(|existing| existing.order <= entry.order)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.entries.insert(index, entry);
        index
    }
}

#[derive(Debug, Default)]
pub struct MessageThreadCache {
    threads: HashMap<ConversationKey, Thread>,
    view: Option<ConversationKey>,
    view_generation: u64,
    fetch_counter: u64,
}

impl MessageThreadCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, key: ConversationKey) -> &[ThreadEntry] {
        self.threads
            .get(&key)
            .map(|thread| thread.entries.as_slice())
            .unwrap_or_default()
    }

    pub fn entry(&self, key: ConversationKey, id: MessageRef) -> Option<&ThreadEntry> {
        let thread = self.threads.get(&key)?;
        thread.position(id).map(|index| &thread.entries[index])
    }

    pub(crate) fn entry_mut(
        &mut self,
        key: ConversationKey,
        id: MessageRef,
    ) -> Option<&mut ThreadEntry> {
        let thread = self.threads.get_mut(&key)?;
        let index = thread.position(id)?;
        thread.entries.get_mut(index)
    }

    pub fn position(&self, key: ConversationKey, id: MessageRef) -> Option<usize> {
        self.threads.get(&key)?.position(id)
    }

    /// Every cached, live message, across threads.
    pub fn all_messages(&self) -> impl Iterator<Item = &Message> {
        self.threads
            .values()
            .flat_map(|thread| thread.entries.iter())
            .map(|entry| &entry.message)
    }

    pub fn view(&self) -> Option<ConversationKey> {
        self.view
    }

    /// Switches the displayed conversation; outstanding view loads for the
    /// previous one become stale.
    pub fn set_view(&mut self, key: Option<ConversationKey>) {
        self.view = key;
        self.view_generation += 1;
    }

    pub fn begin_view_load(&mut self, key: ConversationKey) -> LoadTicket {
        self.fetch_counter += 1;
        LoadTicket {
            key,
            fetch: self.fetch_counter,
            view_generation: Some(self.view_generation),
        }
    }

    pub fn begin_refresh(&mut self, key: ConversationKey) -> LoadTicket {
        self.fetch_counter += 1;
        LoadTicket {
            key,
            fetch: self.fetch_counter,
            view_generation: None,
        }
    }

    pub fn is_current(&self, ticket: &LoadTicket) -> bool {
        match ticket.view_generation {
            Some(generation) => generation == self.view_generation && self.view == Some(ticket.key),
            None => true,
        }
    }

    /// Replaces the confirmed part of a thread with a fetched sequence.
    /// Returns `false` when the ticket was superseded and nothing changed.
    pub fn complete_load(&mut self, ticket: LoadTicket, payloads: Vec<MessagePayload>) -> bool {
        if !self.is_current(&ticket) {
            debug!(key = %ticket.key, "thread: discarding superseded view load");
            return false;
        }
        let thread = self.threads.entry(ticket.key).or_default();
        if ticket.fetch < thread.applied_fetch {
            debug!(key = %ticket.key, "thread: discarding out-of-date refresh");
            return false;
        }
        thread.applied_fetch = ticket.fetch;

        let mut previous: HashMap<MessageRef, ThreadEntry> = thread
            .entries
            .drain(..)
            .map(|entry| (entry.message.id, entry))
            .collect();
        let mut previous_order: Vec<MessageRef> = previous.keys().copied().collect();
        previous_order.sort_by_key(|id| previous.get(id).map(|entry| entry.order));

        let mut payloads = payloads;
        payloads.sort_by_key(|payload| OrderKey::server(payload.created_at, payload.message_id));
        let mut seen = HashSet::new();
        for payload in payloads {
            if !seen.insert(payload.message_id) {
                continue;
            }
            let id = MessageRef::Server(payload.message_id);
            let entry = match previous.remove(&id) {
                Some(mut entry) => {
                    entry.absorb(&payload, AbsorbMode::Push);
                    entry
                }
                None => ThreadEntry::from_payload(&payload, ticket.key),
            };
            thread.entries.push(entry);
        }

        // Unconfirmed sends stay at the tail; tombstones the server no longer
        // lists keep their place.
        let mut locals = Vec::new();
        for id in previous_order {
            let Some(entry) = previous.remove(&id) else {
                continue;
            };
            match id {
                MessageRef::Local(_) => locals.push(entry),
                MessageRef::Server(_) if entry.message.is_deleted() => {
                    thread.insert_ordered(entry);
                }
                MessageRef::Server(_) => {}
            }
        }
        thread.entries.extend(locals);
        true
    }

    pub fn insert_local(&mut self, key: ConversationKey, message: Message, local_id: LocalId) {
        let order = OrderKey::local(message.created_at, local_id);
        let thread = self.threads.entry(key).or_default();
        thread.entries.push(ThreadEntry {
            message,
            delivery: Delivery::Pending,
            uploading: false,
            clocks: FieldClocks::default(),
            order,
        });
    }

    /// Inserts a server message in order, or merges it into the cached copy.
    pub fn append(&mut self, key: ConversationKey, payload: &MessagePayload) -> AppendOutcome {
        let thread = self.threads.entry(key).or_default();
        let id = MessageRef::Server(payload.message_id);
        if let Some(index) = thread.position(id) {
            let entry = &mut thread.entries[index];
            if payload.version < entry.message.version {
                return AppendOutcome::Stale;
            }
            entry.absorb(payload, AbsorbMode::Push);
            return AppendOutcome::Updated;
        }
        thread.insert_ordered(ThreadEntry::from_payload(payload, key));
        AppendOutcome::Inserted
    }

    /// Turns a message into a tombstone in place. Id and position are kept.
    pub fn apply_tombstone(
        &mut self,
        key: ConversationKey,
        id: MessageRef,
        deleted_at: DateTime<Utc>,
    ) -> bool {
        let Some(entry) = self.entry_mut(key, id) else {
            return false;
        };
        entry.message.tombstone(deleted_at);
        true
    }

    pub fn remove(&mut self, key: ConversationKey, id: MessageRef) -> Option<ThreadEntry> {
        let thread = self.threads.get_mut(&key)?;
        let index = thread.position(id)?;
        Some(thread.entries.remove(index))
    }

    /// Gives a pending send its server identity without moving it. A copy of
    /// the same message that arrived by push first is folded in and dropped.
    pub(crate) fn confirm_local(
        &mut self,
        key: ConversationKey,
        local_id: LocalId,
        payload: &MessagePayload,
    ) -> bool {
        let Some(thread) = self.threads.get_mut(&key) else {
            return false;
        };
        let server_ref = MessageRef::Server(payload.message_id);
        if let Some(echo_index) = thread.position(server_ref) {
            let echo = thread.entries.remove(echo_index);
            if let Some(index) = thread.position(MessageRef::Local(local_id)) {
                let entry = &mut thread.entries[index];
                entry.message.version = entry.message.version.max(echo.message.version);
            }
        }
        let Some(index) = thread.position(MessageRef::Local(local_id)) else {
            return false;
        };
        let entry = &mut thread.entries[index];
        entry.message.id = server_ref;
        entry.delivery = Delivery::Confirmed;
        entry.uploading = false;
        entry.order = OrderKey::server(payload.created_at, payload.message_id);
        entry.message.created_at = payload.created_at;
        true
    }

    /// Moves a virtual thread under its real conversation id.
    pub fn rekey(&mut self, from: ConversationKey, to: ConversationKey) {
        if from == to {
            return;
        }
        if self.view == Some(from) {
            self.view = Some(to);
        }
        let Some(source) = self.threads.remove(&from) else {
            return;
        };
        let destination = self.threads.entry(to).or_default();
        for mut entry in source.entries {
            entry.message.conversation = to;
            if destination.position(entry.message.id).is_some() {
                continue;
            }
            destination.entries.push(entry);
        }
    }

    pub fn set_delivery(&mut self, key: ConversationKey, id: MessageRef, delivery: Delivery) {
        if let Some(entry) = self.entry_mut(key, id) {
            entry.delivery = delivery;
        }
    }

    pub fn set_uploading(&mut self, key: ConversationKey, id: MessageRef, uploading: bool) {
        if let Some(entry) = self.entry_mut(key, id) {
            entry.uploading = uploading;
        }
    }
}

#[cfg(test)]
#[path = "tests/thread_tests.rs"]
mod tests;
