//! Client-side presence view.
//!
//! Presence is a pure reducer over `UserId -> PresenceRecord`. Every action
//! merges field-by-field into the existing record, so events that only carry
//! some fields never erase the others, and no action removes a user.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{PresenceStatus, UserId},
    protocol::{PresenceEvent, PresenceRecordPayload},
};
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub visible_status: PresenceStatus,
    /// Only ever set while `visible_status` is offline.
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Suppresses last-seen display; does not change `visible_status`.
    pub hidden: bool,
}

impl PresenceRecord {
    fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            visible_status: PresenceStatus::Offline,
            last_seen_at: None,
            hidden: false,
        }
    }

    fn clear_last_seen_while_online(&mut self) {
        if self.visible_status.is_online() {
            self.last_seen_at = None;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceAction {
    Snapshot(Vec<PresenceRecordPayload>),
    Online {
        user_id: UserId,
        hidden: Option<bool>,
    },
    Offline {
        user_id: UserId,
        last_seen_at: Option<DateTime<Utc>>,
        hidden: Option<bool>,
    },
    Visibility {
        user_id: UserId,
        visible_status: PresenceStatus,
        hidden: Option<bool>,
    },
    LastSeen {
        user_id: UserId,
        last_seen_at: DateTime<Utc>,
        hidden: Option<bool>,
    },
}

impl From<PresenceEvent> for PresenceAction {
    fn from(value: PresenceEvent) -> Self {
        match value {
            PresenceEvent::Snapshot { records } => Self::Snapshot(records),
            PresenceEvent::Online { user_id, hidden } => Self::Online { user_id, hidden },
            PresenceEvent::Offline {
                user_id,
                last_seen_at,
                hidden,
            } => Self::Offline {
                user_id,
                last_seen_at,
                hidden,
            },
            PresenceEvent::Visibility {
                user_id,
                visible_status,
                hidden,
            } => Self::Visibility {
                user_id,
                visible_status,
                hidden,
            },
            PresenceEvent::LastSeen {
                user_id,
                last_seen_at,
                hidden,
            } => Self::LastSeen {
                user_id,
                last_seen_at,
                hidden,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceState {
    records: BTreeMap<UserId, PresenceRecord>,
}

/// Pure transition: `state' = apply(state, action)`.
pub fn apply(mut state: PresenceState, action: PresenceAction) -> PresenceState {
    state.reduce(action);
    state
}

impl PresenceState {
    pub fn get(&self, user_id: UserId) -> Option<&PresenceRecord> {
        self.records.get(&user_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &PresenceRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn record_mut(&mut self, user_id: UserId) -> &mut PresenceRecord {
        self.records
            .entry(user_id)
            .or_insert_with(|| PresenceRecord::new(user_id))
    }

    pub fn reduce(&mut self, action: PresenceAction) {
        match action {
            PresenceAction::Snapshot(records) => {
                for incoming in records {
                    let record = self.record_mut(incoming.user_id);
                    if let Some(status) = incoming.visible_status {
                        record.visible_status = status;
                    }
                    if let Some(last_seen_at) = incoming.last_seen_at {
                        record.last_seen_at = Some(last_seen_at);
                    }
                    if let Some(hidden) = incoming.hidden {
                        record.hidden = hidden;
                    }
                    record.clear_last_seen_while_online();
                }
            }
            PresenceAction::Online { user_id, hidden } => {
                let record = self.record_mut(user_id);
                record.visible_status = PresenceStatus::Online;
                record.last_seen_at = None;
                record.hidden = hidden.unwrap_or(false);
            }
            PresenceAction::Offline {
                user_id,
                last_seen_at,
                hidden,
            } => {
                let record = self.record_mut(user_id);
                record.visible_status = PresenceStatus::Offline;
                if let Some(last_seen_at) = last_seen_at {
                    record.last_seen_at = Some(last_seen_at);
                }
                if let Some(hidden) = hidden {
                    record.hidden = hidden;
                }
            }
            PresenceAction::Visibility {
                user_id,
                visible_status,
                hidden,
            } => {
                let record = self.record_mut(user_id);
                record.visible_status = visible_status;
                if let Some(hidden) = hidden {
                    record.hidden = hidden;
                }
                record.clear_last_seen_while_online();
            }
            PresenceAction::LastSeen {
                user_id,
                last_seen_at,
                hidden,
            } => {
                let record = self.record_mut(user_id);
                if !record.visible_status.is_online() {
                    record.last_seen_at = Some(last_seen_at);
                }
                if let Some(hidden) = hidden {
                    record.hidden = hidden;
                }
            }
        }
    }
}

/// Owned presence cache fed by the snapshot fetch and push events.
#[derive(Debug, Default)]
pub struct PresenceStore {
    state: PresenceState,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch(&mut self, action: PresenceAction) {
        trace!(?action, "presence: dispatch");
        self.state.reduce(action);
    }

    pub fn ingest(&mut self, event: PresenceEvent) {
        self.dispatch(event.into());
    }

    pub fn state(&self) -> &PresenceState {
        &self.state
    }

    pub fn get(&self, user_id: UserId) -> Option<&PresenceRecord> {
        self.state.get(user_id)
    }

    /// Unknown users count as offline.
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.state
            .get(user_id)
            .is_some_and(|record| record.visible_status.is_online())
    }

    pub fn last_seen_for_display(&self, user_id: UserId) -> Option<DateTime<Utc>> {
        let record = self.state.get(user_id)?;
        if record.hidden {
            return None;
        }
        record.last_seen_at
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
