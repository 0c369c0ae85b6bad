//! User context manager.
//!
//! Holds the active identity behind a `watch` channel. Mutations run under an
//! exclusive lock and always bump the version; work that must finish before
//! the new version is visible (dropping tiers, opening the next store) runs
//! between [`UserContextManager::begin`] and [`ContextTransition::commit`].

use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::info;

use papr_types::{Settings, UserContext};

/// Explicit arguments win; missing ones fall back to settings (`PAPR_*`).
pub fn resolve_context(
    settings: &Settings,
    user_id: Option<String>,
    external_user_id: Option<String>,
    workspace_id: Option<String>,
) -> UserContext {
    UserContext::new(
        user_id.or_else(|| settings.user_id.clone()),
        external_user_id.or_else(|| settings.external_user_id.clone()),
        workspace_id.or_else(|| settings.workspace_id.clone()),
    )
}

pub struct UserContextManager {
    tx: watch::Sender<UserContext>,
    lock: Mutex<()>,
}

impl UserContextManager {
    pub fn new(initial: UserContext) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            tx,
            lock: Mutex::new(()),
        }
    }

    /// Read-only snapshot.
    pub fn current(&self) -> UserContext {
        self.tx.borrow().clone()
    }

    pub fn version(&self) -> u64 {
        self.tx.borrow().version
    }

    pub fn subscribe(&self) -> watch::Receiver<UserContext> {
        self.tx.subscribe()
    }

    /// Take the exclusive lock for one mutation.
    pub async fn begin(&self) -> ContextTransition<'_> {
        let guard = self.lock.lock().await;
        ContextTransition {
            _guard: guard,
            tx: &self.tx,
            previous: self.current(),
        }
    }
}

/// An in-progress mutation. Nothing is visible until `commit`.
pub struct ContextTransition<'a> {
    _guard: MutexGuard<'a, ()>,
    tx: &'a watch::Sender<UserContext>,
    previous: UserContext,
}

impl ContextTransition<'_> {
    pub fn previous(&self) -> &UserContext {
        &self.previous
    }

    /// The context that `commit` will publish, version bumped.
    pub fn propose(
        &self,
        user_id: Option<String>,
        external_user_id: Option<String>,
        workspace_id: Option<String>,
    ) -> UserContext {
        UserContext {
            version: self.previous.version + 1,
            ..UserContext::new(user_id, external_user_id, workspace_id)
        }
    }

    pub fn commit(self, next: UserContext) {
        info!(
            user_id = ?next.user_id,
            external_user_id = ?next.external_user_id,
            workspace_id = ?next.workspace_id,
            version = next.version,
            "User context changed"
        );
        self.tx.send_replace(next);
    }
}
