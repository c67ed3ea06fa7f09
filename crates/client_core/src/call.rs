use std::{collections::HashMap, sync::Arc};

use call_signaling::{CallId, CallMedia, CallSignal, CallSignaling};
use chrono::{DateTime, Utc};
use shared::domain::UserId;
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{events::ClientEvent, presence::PresenceStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Outgoing,
    Incoming,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub call_id: CallId,
    pub counterpart_id: UserId,
    pub media: CallMedia,
    pub phase: CallPhase,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    pub fn is_active(&self) -> bool {
        self.phase == CallPhase::Active
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("user {0} is not available for a call")]
    Unavailable(UserId),
    #[error("a call with user {0} is already in progress")]
    AlreadyActive(UserId),
    #[error("no incoming call from user {0}")]
    NoIncomingCall(UserId),
    #[error("no call with user {0}")]
    NoSession(UserId),
    #[error("call signaling failed: {0}")]
    Signaling(String),
}

/// Live call sessions keyed by counterpart. Presence is only read here, never
/// written; the presence feed stays the single source of online state.
pub struct CallBridge {
    me: UserId,
    signaling: Arc<dyn CallSignaling>,
    presence: Arc<RwLock<PresenceStore>>,
    sessions: Mutex<HashMap<UserId, CallSession>>,
    events: broadcast::Sender<ClientEvent>,
}

impl CallBridge {
    pub fn new(
        me: UserId,
        signaling: Arc<dyn CallSignaling>,
        presence: Arc<RwLock<PresenceStore>>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            me,
            signaling,
            presence,
            sessions: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub async fn session_for(&self, user_id: UserId) -> Option<CallSession> {
        self.sessions.lock().await.get(&user_id).cloned()
    }

    pub async fn sessions(&self) -> Vec<CallSession> {
        let mut sessions: Vec<_> = self.sessions.lock().await.values().cloned().collect();
        sessions.sort_by_key(|session| session.started_at);
        sessions
    }

    /// "Start call" is offered only for online counterparts we are not
    /// already ringing or talking to.
    pub async fn can_offer_call(&self, user_id: UserId) -> bool {
        if user_id == self.me || self.sessions.lock().await.contains_key(&user_id) {
            return false;
        }
        self.presence.read().await.is_online(user_id)
    }

    pub async fn start(&self, user_id: UserId, media: CallMedia) -> Result<CallSession, CallError> {
        if user_id == self.me || !self.presence.read().await.is_online(user_id) {
            return Err(CallError::Unavailable(user_id));
        }

        let session = CallSession {
            call_id: CallId::new_random(),
            counterpart_id: user_id,
            media,
            phase: CallPhase::Outgoing,
            started_at: Utc::now(),
            connected_at: None,
        };
        {
            let mut sessions = self.sessions.lock().await;
            if sessions.contains_key(&user_id) {
                return Err(CallError::AlreadyActive(user_id));
            }
            sessions.insert(user_id, session.clone());
        }
        self.emit(user_id, Some(session.clone()));

        if let Err(err) = self.signaling.offer(session.call_id, user_id, media).await {
            warn!(counterpart_id = user_id.0, "call: offer failed: {err:#}");
            self.remove_if(user_id, session.call_id).await;
            return Err(CallError::Signaling(err.to_string()));
        }
        info!(counterpart_id = user_id.0, call_id = %session.call_id.0, "call: offered");
        Ok(session)
    }

    pub async fn accept(&self, user_id: UserId) -> Result<CallSession, CallError> {
        let call_id = match self.session_for(user_id).await {
            Some(session) if session.phase == CallPhase::Incoming => session.call_id,
            _ => return Err(CallError::NoIncomingCall(user_id)),
        };

        self.signaling
            .accept(call_id)
            .await
            .map_err(|err| CallError::Signaling(err.to_string()))?;

        let connected = self
            .transition(user_id, call_id, CallPhase::Active)
            .await
            .ok_or(CallError::NoIncomingCall(user_id))?;
        info!(counterpart_id = user_id.0, "call: accepted");
        Ok(connected)
    }

    /// Ends or declines the call locally. Hanging up on the signaling side is
    /// best-effort; the local session is gone either way.
    pub async fn end(&self, user_id: UserId) -> Result<CallSession, CallError> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(&user_id)
            .ok_or(CallError::NoSession(user_id))?;
        self.emit(user_id, None);

        if let Err(err) = self.signaling.hang_up(session.call_id).await {
            warn!(counterpart_id = user_id.0, "call: hang up not delivered: {err:#}");
        }
        info!(counterpart_id = user_id.0, "call: ended");
        Ok(session)
    }

    pub async fn handle_signal(&self, signal: CallSignal) {
        match signal {
            CallSignal::Offered {
                call_id,
                caller_id,
                media,
                offered_at,
            } => {
                if caller_id == self.me {
                    return;
                }
                let session = CallSession {
                    call_id,
                    counterpart_id: caller_id,
                    media,
                    phase: CallPhase::Incoming,
                    started_at: offered_at,
                    connected_at: None,
                };
                {
                    let mut sessions = self.sessions.lock().await;
                    if sessions.contains_key(&caller_id) {
                        debug!(caller_id = caller_id.0, "call: ignoring offer, session exists");
                        return;
                    }
                    sessions.insert(caller_id, session.clone());
                }
                info!(caller_id = caller_id.0, "call: incoming");
                self.emit(caller_id, Some(session));
            }
            CallSignal::Accepted { call_id, by } => {
                if by == self.me {
                    return;
                }
                let outgoing = self
                    .session_for(by)
                    .await
                    .is_some_and(|s| s.call_id == call_id && s.phase == CallPhase::Outgoing);
                if outgoing {
                    self.transition(by, call_id, CallPhase::Active).await;
                }
            }
            CallSignal::Ended { call_id, by } => {
                let counterpart = {
                    let sessions = self.sessions.lock().await;
                    sessions
                        .values()
                        .find(|session| session.call_id == call_id)
                        .map(|session| session.counterpart_id)
                };
                if let Some(counterpart) = counterpart {
                    self.remove_if(counterpart, call_id).await;
                    debug!(counterpart_id = counterpart.0, by = by.0, "call: ended remotely");
                }
            }
        }
    }

    pub fn spawn_signal_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut signals = self.signaling.subscribe_signals();
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(signal) => bridge.handle_signal(signal).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "call: signal listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn transition(
        &self,
        user_id: UserId,
        call_id: CallId,
        phase: CallPhase,
    ) -> Option<CallSession> {
        let updated = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(&user_id)
                .filter(|session| session.call_id == call_id)?;
            session.phase = phase;
            if phase == CallPhase::Active {
                session.connected_at.get_or_insert_with(Utc::now);
            }
            session.clone()
        };
        self.emit(user_id, Some(updated.clone()));
        Some(updated)
    }

    async fn remove_if(&self, user_id: UserId, call_id: CallId) {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&user_id) {
                Some(session) if session.call_id == call_id => sessions.remove(&user_id),
                _ => None,
            }
        };
        if removed.is_some() {
            self.emit(user_id, None);
        }
    }

    fn emit(&self, counterpart_id: UserId, session: Option<CallSession>) {
        let _ = self.events.send(ClientEvent::CallChanged {
            counterpart_id,
            session,
        });
    }
}

#[cfg(test)]
#[path = "tests/call_tests.rs"]
mod tests;
