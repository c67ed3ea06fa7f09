use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, Role, UserId},
    protocol::{ContactSummary, ConversationSummary, MessagePayload},
};

/// A conversation as the UI addresses it. Until the first message is
/// confirmed, a direct conversation only exists as the prospective recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    Conversation(ConversationId),
    Virtual(UserId),
}

impl ConversationKey {
    pub fn conversation_id(self) -> Option<ConversationId> {
        match self {
            Self::Conversation(id) => Some(id),
            Self::Virtual(_) => None,
        }
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conversation(id) => write!(f, "conversation:{id}"),
            Self::Virtual(user_id) => write!(f, "recipient:{user_id}"),
        }
    }
}

/// Contact-list row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: UserId,
    pub display_name: String,
    pub role: Option<Role>,
    pub unread_count: u32,
    pub conversation_id: ConversationId,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct ConversationEntry {
    counterpart_id: UserId,
    unread_count: u32,
    last_activity_at: DateTime<Utc>,
    latest_inbound_at: Option<DateTime<Utc>>,
    read_through: Option<DateTime<Utc>>,
    /// Inbound messages newer than `read_through` already counted as unread.
    counted: HashMap<MessageId, DateTime<Utc>>,
}

impl ConversationEntry {
    fn new(counterpart_id: UserId, last_activity_at: DateTime<Utc>) -> Self {
        Self {
            counterpart_id,
            unread_count: 0,
            last_activity_at,
            latest_inbound_at: None,
            read_through: None,
            counted: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationIndex {
    me: UserId,
    by_contact: HashMap<UserId, ConversationId>,
    entries: HashMap<ConversationId, ConversationEntry>,
    directory: HashMap<UserId, ContactSummary>,
}

impl ConversationIndex {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            by_contact: HashMap::new(),
            entries: HashMap::new(),
            directory: HashMap::new(),
        }
    }

    pub fn resolve(&self, contact_id: UserId) -> Option<ConversationId> {
        self.by_contact.get(&contact_id).copied()
    }

    pub fn key_for(&self, contact_id: UserId) -> ConversationKey {
        self.resolve(contact_id)
            .map(ConversationKey::Conversation)
            .unwrap_or(ConversationKey::Virtual(contact_id))
    }

    pub fn counterpart(&self, conversation_id: ConversationId) -> Option<UserId> {
        self.entries
            .get(&conversation_id)
            .map(|entry| entry.counterpart_id)
    }

    pub fn counterpart_for_key(&self, key: ConversationKey) -> Option<UserId> {
        match key {
            ConversationKey::Conversation(id) => self.counterpart(id),
            ConversationKey::Virtual(user_id) => Some(user_id),
        }
    }

    pub fn remember_contact(&mut self, contact: ContactSummary) {
        self.directory.insert(contact.user_id, contact);
    }

    /// Seeds or refreshes an entry from an authoritative server summary.
    pub fn register(&mut self, summary: ConversationSummary) {
        let counterpart_id = summary.counterpart.user_id;
        self.remember_contact(summary.counterpart);
        self.by_contact
            .insert(counterpart_id, summary.conversation_id);
        let entry = self
            .entries
            .entry(summary.conversation_id)
            .or_insert_with(|| ConversationEntry::new(counterpart_id, summary.last_activity_at));
        entry.counterpart_id = counterpart_id;
        entry.unread_count = summary.unread_count;
        entry.last_activity_at = entry.last_activity_at.max(summary.last_activity_at);
    }

    fn ensure(
        &mut self,
        conversation_id: ConversationId,
        counterpart_id: UserId,
        at: DateTime<Utc>,
    ) -> &mut ConversationEntry {
        self.by_contact.insert(counterpart_id, conversation_id);
        self.entries
            .entry(conversation_id)
            .or_insert_with(|| ConversationEntry::new(counterpart_id, at))
    }

    /// Bumps activity for a message and counts it as unread when it is
    /// inbound, live and not already read or counted. Returns whether the
    /// unread count changed.
    pub fn upsert_from_message(&mut self, message: &MessagePayload) -> bool {
        let me = self.me;
        let counterpart_id = if message.sender_id == me {
            message.recipient_id
        } else {
            message.sender_id
        };
        let entry = self.ensure(message.conversation_id, counterpart_id, message.created_at);
        entry.last_activity_at = entry.last_activity_at.max(message.created_at);

        if message.sender_id == me || message.deleted_at.is_some() {
            return false;
        }
        entry.latest_inbound_at = entry.latest_inbound_at.max(Some(message.created_at));
        let already_read = entry
            .read_through
            .is_some_and(|read_through| message.created_at <= read_through);
        if already_read
            || entry
                .counted
                .insert(message.message_id, message.created_at)
                .is_some()
        {
            return false;
        }
        entry.unread_count += 1;
        true
    }

    /// Records local activity (e.g. an optimistic send) for ordering.
    pub fn touch(&mut self, conversation_id: ConversationId, at: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(&conversation_id) {
            entry.last_activity_at = entry.last_activity_at.max(at);
        }
    }

    /// Zeroes the unread count. Returns `false` when there was nothing to
    /// clear, so repeated calls have no further effect.
    pub fn mark_read(&mut self, conversation_id: ConversationId) -> bool {
        let Some(entry) = self.entries.get_mut(&conversation_id) else {
            return false;
        };
        entry.read_through = entry.read_through.max(entry.latest_inbound_at);
        if let Some(read_through) = entry.read_through {
            entry.counted.retain(|_, at| *at > read_through);
        }
        if entry.unread_count == 0 {
            return false;
        }
        entry.unread_count = 0;
        true
    }

    pub fn unread_count(&self, conversation_id: ConversationId) -> u32 {
        self.entries
            .get(&conversation_id)
            .map(|entry| entry.unread_count)
            .unwrap_or(0)
    }

    pub fn total_unread(&self) -> u32 {
        self.entries.values().map(|entry| entry.unread_count).sum()
    }

    /// Most recent activity first; ties broken by conversation id.
    pub fn contacts(&self) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self
            .entries
            .iter()
            .map(|(conversation_id, entry)| {
                let known = self.directory.get(&entry.counterpart_id);
                Contact {
                    id: entry.counterpart_id,
                    display_name: known
                        .map(|contact| contact.display_name.clone())
                        .unwrap_or_else(|| format!("User {}", entry.counterpart_id)),
                    role: known.map(|contact| contact.role),
                    unread_count: entry.unread_count,
                    conversation_id: *conversation_id,
                    last_activity_at: entry.last_activity_at,
                }
            })
            .collect();
        contacts.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });
        contacts
    }
}

#[cfg(test)]
#[path = "tests/conversations_tests.rs"]
mod tests;
