use std::collections::HashMap;

use crate::conversations::ConversationKey;

/// Compose text per conversation, kept apart from delivery state so a failed
/// send never loses what the user typed.
#[derive(Debug, Default, Clone)]
pub struct DraftStore {
    drafts: HashMap<ConversationKey, String>,
}

impl DraftStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: ConversationKey) -> &str {
        self.drafts.get(&key).map(String::as_str).unwrap_or_default()
    }

    /// Empty text clears the entry.
    pub fn set(&mut self, key: ConversationKey, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            self.drafts.remove(&key);
        } else {
            self.drafts.insert(key, text);
        }
    }

    /// Moves the draft for a virtual conversation onto its real id. A
    /// non-empty draft already stored under `to` wins.
    pub fn migrate(&mut self, from: ConversationKey, to: ConversationKey) {
        if from == to {
            return;
        }
        let Some(text) = self.drafts.remove(&from) else {
            return;
        };
        self.drafts.entry(to).or_insert(text);
    }
}
