//! Per-user directory of agent sessions, the stream-cancellation registry
//! and the idle-eviction sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::session::AgentSession;
use crate::util::lock_ignoring_poison;

struct UserSessions {
    /// Serializes get-or-create per user so two racing requests cannot both
    /// construct a session for the same model.
    create_lock: tokio::sync::Mutex<()>,
    sessions: Mutex<HashMap<String, Arc<AgentSession>>>,
}

impl UserSessions {
    fn new() -> Self {
        Self {
            create_lock: tokio::sync::Mutex::new(()),
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

pub struct SessionManager {
    users: Mutex<HashMap<String, Arc<UserSessions>>>,
    /// `stream_id → token` for every stream ever issued and not yet
    /// finished. Stopping an id that is absent is a successful no-op.
    streams: Mutex<HashMap<String, CancellationToken>>,
    idle_horizon: Duration,
}

impl SessionManager {
    pub fn new(idle_horizon: Duration) -> Arc<Self> {
        Arc::new(Self {
            users: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            idle_horizon,
        })
    }

    fn user_entry(&self, user_id: &str) -> Arc<UserSessions> {
        let mut users = lock_ignoring_poison(&self.users);
        Arc::clone(
            users
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(UserSessions::new())),
        )
    }

    /// Return the session for `(user_id, model_id)`, constructing it with
    /// `build` under the per-user lock if absent. An existing session gets
    /// its last-activity touched.
    pub async fn get_or_create<F, Fut>(
        &self,
        user_id: &str,
        model_id: &str,
        build: F,
    ) -> Result<Arc<AgentSession>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<AgentSession>>>,
    {
        let entry = self.user_entry(user_id);
        let _guard = entry.create_lock.lock().await;

        if let Some(existing) = lock_ignoring_poison(&entry.sessions).get(model_id) {
            existing.touch();
            return Ok(Arc::clone(existing));
        }

        let session = build().await?;
        lock_ignoring_poison(&entry.sessions).insert(model_id.to_string(), Arc::clone(&session));
        info!(user_id, model_id, "session created");
        Ok(session)
    }

    /// Issue a process-unique stream id and its cancellation token.
    pub fn open_stream(&self) -> (String, CancellationToken) {
        let stream_id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        lock_ignoring_poison(&self.streams).insert(stream_id.clone(), token.clone());
        (stream_id, token)
    }

    /// Drop a finished stream from the registry. Its terminal state is
    /// already sticky; late stops on the id remain successful no-ops.
    pub fn close_stream(&self, stream_id: &str) {
        lock_ignoring_poison(&self.streams).remove(stream_id);
    }

    /// Cooperative cancel. Returns whether the id was live; callers report
    /// success either way.
    pub fn cancel_stream(&self, stream_id: &str) -> bool {
        match lock_ignoring_poison(&self.streams).get(stream_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// One sweep pass: evict sessions idle past the horizon. Takes one user
    /// lock at a time; eviction cancels the active stream and drops the
    /// history, but never tears down the underlying MCP clients.
    pub async fn evict_idle(&self) {
        let entries: Vec<(String, Arc<UserSessions>)> = {
            let users = lock_ignoring_poison(&self.users);
            users
                .iter()
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect()
        };

        for (user_id, entry) in entries {
            let _guard = entry.create_lock.lock().await;
            let mut sessions = lock_ignoring_poison(&entry.sessions);
            sessions.retain(|model_id, session| {
                let idle = session.idle_for();
                if idle > self.idle_horizon {
                    info!(user_id, model_id, ?idle, "evicting idle session");
                    session.cancel_active();
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Periodic sweep task; cancelling the returned token stops it.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> CancellationToken {
        let stop = CancellationToken::new();
        let manager = self;
        let token = stop.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => manager.evict_idle().await,
                }
            }
            debug!("eviction sweeper stopped");
        });
        stop
    }

    /// Drop every session of one user (the `/remove/history` path). Active
    /// streams are cancelled.
    pub async fn remove_user_sessions(&self, user_id: &str) {
        let entry = {
            let users = lock_ignoring_poison(&self.users);
            users.get(user_id).cloned()
        };
        let Some(entry) = entry else { return };
        let _guard = entry.create_lock.lock().await;
        let mut sessions = lock_ignoring_poison(&entry.sessions);
        for (_, session) in sessions.drain() {
            session.cancel_active();
        }
        info!(user_id, "sessions dropped");
    }

    /// Process shutdown: cancel every stream, drop every session.
    pub fn shutdown(&self) {
        for (_, token) in lock_ignoring_poison(&self.streams).drain() {
            token.cancel();
        }
        let users: Vec<Arc<UserSessions>> = {
            let mut map = lock_ignoring_poison(&self.users);
            map.drain().map(|(_, v)| v).collect()
        };
        for entry in users {
            for (_, session) in lock_ignoring_poison(&entry.sessions).drain() {
                session.cancel_active();
            }
        }
        info!("session manager shut down");
    }

    pub fn idle_horizon(&self) -> Duration {
        self.idle_horizon
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_ne;

    use super::*;

    #[tokio::test]
    async fn stop_is_idempotent_success() {
        let manager = SessionManager::new(Duration::from_secs(60));
        let (stream_id, token) = manager.open_stream();

        assert!(manager.cancel_stream(&stream_id));
        assert!(token.is_cancelled());
        // Second stop on a live id: still fine.
        assert!(manager.cancel_stream(&stream_id));

        manager.close_stream(&stream_id);
        // Stop after completion: reported as not-found, surfaced to clients
        // as success for idempotency.
        assert!(!manager.cancel_stream(&stream_id));
    }

    #[tokio::test]
    async fn stream_ids_are_unique() {
        let manager = SessionManager::new(Duration::from_secs(60));
        let (a, _) = manager.open_stream();
        let (b, _) = manager.open_stream();
        assert_ne!(a, b);
    }
}
