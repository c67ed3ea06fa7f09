use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::domain::UserId;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMedia {
    Voice,
    Video,
}

/// Signaling traffic for one-to-one calls. Media is negotiated elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum CallSignal {
    Offered {
        call_id: CallId,
        caller_id: UserId,
        media: CallMedia,
        offered_at: DateTime<Utc>,
    },
    Accepted {
        call_id: CallId,
        by: UserId,
    },
    Ended {
        call_id: CallId,
        by: UserId,
    },
}

impl CallSignal {
    pub fn call_id(&self) -> CallId {
        match self {
            Self::Offered { call_id, .. }
            | Self::Accepted { call_id, .. }
            | Self::Ended { call_id, .. } => *call_id,
        }
    }
}

#[async_trait]
pub trait CallSignaling: Send + Sync {
    async fn offer(&self, call_id: CallId, callee_id: UserId, media: CallMedia)
        -> anyhow::Result<()>;
    async fn accept(&self, call_id: CallId) -> anyhow::Result<()>;
    async fn hang_up(&self, call_id: CallId) -> anyhow::Result<()>;
    fn subscribe_signals(&self) -> broadcast::Receiver<CallSignal>;
}

pub struct MissingCallSignaling {
    signals: broadcast::Sender<CallSignal>,
}

impl Default for MissingCallSignaling {
    fn default() -> Self {
        let (signals, _) = broadcast::channel(1);
        Self { signals }
    }
}

#[async_trait]
impl CallSignaling for MissingCallSignaling {
    async fn offer(
        &self,
        _call_id: CallId,
        callee_id: UserId,
        _media: CallMedia,
    ) -> anyhow::Result<()> {
        Err(anyhow!(
            "call signaling is unavailable; cannot call user {}",
            callee_id.0
        ))
    }

    async fn accept(&self, _call_id: CallId) -> anyhow::Result<()> {
        Err(anyhow!("call signaling is unavailable"))
    }

    async fn hang_up(&self, _call_id: CallId) -> anyhow::Result<()> {
        Err(anyhow!("call signaling is unavailable"))
    }

    fn subscribe_signals(&self) -> broadcast::Receiver<CallSignal> {
        self.signals.subscribe()
    }
}
