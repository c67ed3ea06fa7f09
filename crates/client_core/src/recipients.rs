use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use shared::{
    domain::{Role, UserId},
    protocol::ContactSummary,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{backend::MessagingBackend, error::LoadError, retry::RetryPolicy};

struct CachedList {
    contacts: Vec<ContactSummary>,
    fetched_at: Instant,
}

#[derive(Default)]
struct DirectoryState {
    lists: HashMap<Option<Role>, CachedList>,
    inflight: usize,
    refreshing: HashSet<Option<Role>>,
}

/// Users the current user may start a conversation with, cached per role
/// filter for the session.
pub struct RecipientDirectory {
    backend: Arc<dyn MessagingBackend>,
    retry: RetryPolicy,
    ttl: Duration,
    inner: Mutex<DirectoryState>,
}

impl RecipientDirectory {
    pub fn new(backend: Arc<dyn MessagingBackend>, retry: RetryPolicy, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            backend,
            retry,
            ttl,
            inner: Mutex::new(DirectoryState::default()),
        })
    }

    /// Serves the cached list when there is one, kicking off a background
    /// refresh if it is older than the TTL. Only the first load blocks.
    pub async fn load(
        self: &Arc<Self>,
        role_filter: Option<Role>,
    ) -> Result<Vec<ContactSummary>, LoadError> {
        let cached = {
            let mut guard = self.inner.lock().await;
            let Some(list) = guard.lists.get(&role_filter) else {
                drop(guard);
                return self.fetch(role_filter).await;
            };
            let contacts = list.contacts.clone();
            let stale = list.fetched_at.elapsed() >= self.ttl;
            let spawn_refresh = stale && guard.refreshing.insert(role_filter);
            (contacts, spawn_refresh)
        };

        let (contacts, spawn_refresh) = cached;
        if spawn_refresh {
            debug!(?role_filter, "recipients: serving stale list, refreshing");
            let directory = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = directory.fetch(role_filter).await {
                    warn!(?role_filter, "recipients: background refresh failed: {err}");
                }
                directory.inner.lock().await.refreshing.remove(&role_filter);
            });
        }
        Ok(contacts)
    }

    /// Re-checks a candidate against a fresh list; permissions can change
    /// between load and send.
    pub async fn validate(&self, candidate: UserId) -> Result<bool, LoadError> {
        let contacts = self.fetch(None).await?;
        let permitted = contacts.iter().any(|contact| contact.user_id == candidate);
        if !permitted {
            info!(candidate = candidate.0, "recipients: candidate no longer permitted");
        }
        Ok(permitted)
    }

    pub async fn is_loading(&self) -> bool {
        self.inner.lock().await.inflight > 0
    }

    pub async fn cached(&self, role_filter: Option<Role>) -> Option<Vec<ContactSummary>> {
        self.inner
            .lock()
            .await
            .lists
            .get(&role_filter)
            .map(|list| list.contacts.clone())
    }

    async fn fetch(&self, role_filter: Option<Role>) -> Result<Vec<ContactSummary>, LoadError> {
        self.inner.lock().await.inflight += 1;
        let result = self
            .retry
            .run("recipients: load", || self.backend.list_recipients(role_filter))
            .await;

        let mut guard = self.inner.lock().await;
        guard.inflight = guard.inflight.saturating_sub(1);
        let contacts = result?;
        guard.lists.insert(
            role_filter,
            CachedList {
                contacts: contacts.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(contacts)
    }
}

#[cfg(test)]
#[path = "tests/recipients_tests.rs"]
mod tests;
