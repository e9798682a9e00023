use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Mutex;

use aegis_core::ErrorKind;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// Authenticated caller state. An empty `accessible_resources` set means
/// an unrestricted (admin) session with access to every resource.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub permissions: HashSet<String>,
    pub accessible_resources: HashSet<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn has_access(&self, resource_id: &str) -> bool {
        self.accessible_resources.is_empty() || self.accessible_resources.contains(resource_id)
    }

    pub fn has_permission(&self, scope: &str) -> bool {
        self.permissions.contains("server.admin") || self.permissions.contains(scope)
    }
}

/// Sharded in-memory session map. Mutations to a given session are
/// serialized by its shard lock; sessions on different shards never
/// block each other. Session internals are only reachable through
/// clones handed out by `validate`.
pub struct SessionStore {
    shards: Vec<Mutex<HashMap<String, Session>>>,
    sliding_window: Duration,
}

impl SessionStore {
    pub fn new(shard_count: usize, sliding_window: Duration) -> Self {
        let shard_count = shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            shards,
            sliding_window,
        }
    }

    pub fn create_session(
        &self,
        user_id: impl Into<String>,
        permissions: impl IntoIterator<Item = String>,
        accessible_resources: impl IntoIterator<Item = String>,
    ) -> Session {
        let now = Utc::now();
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            permissions: permissions.into_iter().collect(),
            accessible_resources: accessible_resources.into_iter().collect(),
            created_at: now,
            expires_at: now + self.sliding_window,
        };
        let mut shard = self.shard_for(&session.session_id);
        shard.insert(session.session_id.clone(), session.clone());
        session
    }

    /// Looks up the session, re-checks expiry independently of the sweep,
    /// and refreshes `expires_at` by the sliding window. The refresh is
    /// monotonic: expiry only ever advances.
    pub fn validate(&self, session_id: &str) -> Result<Session, ErrorKind> {
        self.validate_at(session_id, Utc::now())
    }

    fn validate_at(&self, session_id: &str, now: DateTime<Utc>) -> Result<Session, ErrorKind> {
        let mut shard = self.shard_for(session_id);
        let Some(session) = shard.get_mut(session_id) else {
            return Err(ErrorKind::SessionNotFound);
        };
        if now > session.expires_at {
            shard.remove(session_id);
            return Err(ErrorKind::SessionExpired);
        }
        let refreshed = now + self.sliding_window;
        if refreshed > session.expires_at {
            session.expires_at = refreshed;
        }
        Ok(session.clone())
    }

    pub fn logout(&self, session_id: &str) -> bool {
        self.shard_for(session_id).remove(session_id).is_some()
    }

    /// Advisory eviction pass. Correctness never depends on it running:
    /// `validate` re-checks expiry on every call.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let before = shard.len();
            shard.retain(|_, session| now <= session.expires_at);
            removed += before - shard.len();
        }
        removed
    }

    fn shard_for(&self, key: &str) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        self.shards[index]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(4, Duration::hours(2))
    }

    #[test]
    fn validate_refreshes_expiry_forward_only() {
        let store = store();
        let session = store.create_session("u1", vec![], vec![]);
        let first = store.validate(&session.session_id).expect("validate");
        let second = store.validate(&session.session_id).expect("revalidate");
        assert!(second.expires_at >= first.expires_at);
    }

    #[test]
    fn expired_session_is_rejected_and_removed() {
        let store = SessionStore::new(4, Duration::zero());
        let session = store.create_session("u1", vec![], vec![]);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let err = store.validate(&session.session_id).unwrap_err();
        assert_eq!(err, ErrorKind::SessionExpired);
        // Second lookup no longer finds the session at all.
        let err = store.validate(&session.session_id).unwrap_err();
        assert_eq!(err, ErrorKind::SessionNotFound);
    }

    #[test]
    fn unknown_session_is_not_found() {
        let err = store().validate("nope").unwrap_err();
        assert_eq!(err, ErrorKind::SessionNotFound);
    }

    #[test]
    fn empty_resource_set_grants_access_everywhere() {
        let store = store();
        let admin = store.create_session("admin", vec![], vec![]);
        assert!(admin.has_access("srv1"));
        assert!(admin.has_access("srv2"));

        let scoped = store.create_session("u1", vec![], vec!["srv1".to_string()]);
        assert!(scoped.has_access("srv1"));
        assert!(!scoped.has_access("srv2"));
    }

    #[test]
    fn admin_scope_implies_all_permissions() {
        let store = store();
        let admin = store.create_session("root", vec!["server.admin".to_string()], vec![]);
        assert!(admin.has_permission("server.files"));
        assert!(admin.has_permission("server.database"));

        let limited = store.create_session("u1", vec!["server.control".to_string()], vec![]);
        assert!(limited.has_permission("server.control"));
        assert!(!limited.has_permission("server.files"));
    }

    #[test]
    fn logout_destroys_the_session() {
        let store = store();
        let session = store.create_session("u1", vec![], vec![]);
        assert!(store.logout(&session.session_id));
        assert_eq!(
            store.validate(&session.session_id).unwrap_err(),
            ErrorKind::SessionNotFound
        );
    }

    #[test]
    fn sweep_removes_only_expired_sessions() {
        let expiring = SessionStore::new(2, Duration::zero());
        let dead = expiring.create_session("u1", vec![], vec![]);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(expiring.sweep_expired(), 1);
        assert_eq!(
            expiring.validate(&dead.session_id).unwrap_err(),
            ErrorKind::SessionNotFound
        );

        let healthy = store();
        let live = healthy.create_session("u2", vec![], vec![]);
        assert_eq!(healthy.sweep_expired(), 0);
        assert!(healthy.validate(&live.session_id).is_ok());
    }
}
