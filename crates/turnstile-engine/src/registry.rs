use chrono::{DateTime, Utc};
use dashmap::DashMap;
use turnstile_core::{Identity, SchedulerError, SessionId};

/// What the registry knows about a live session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionEntry {
    pub remote_addr: String,
    pub identity: Identity,
    pub registered_at: DateTime<Utc>,
}

/// Concurrent map of live sessions.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Upsert. A later insert for the same session replaces the earlier one.
    pub fn insert(
        &self,
        session_id: SessionId,
        remote_addr: impl Into<String>,
        identity: Identity,
        now: DateTime<Utc>,
    ) {
        self.sessions.insert(
            session_id,
            SessionEntry {
                remote_addr: remote_addr.into(),
                identity,
                registered_at: now,
            },
        );
    }

    pub fn lookup(&self, session_id: &SessionId) -> Result<Identity, SchedulerError> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.identity.clone())
            .ok_or_else(|| SchedulerError::NotFound(format!("session {session_id}")))
    }

    pub fn entry(&self, session_id: &SessionId) -> Option<SessionEntry> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn delete(&self, session_id: &SessionId) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Drop every session. Returns how many were removed.
    pub fn delete_all(&self) -> usize {
        let removed = self.sessions.len();
        self.sessions.clear();
        removed
    }

    /// Snapshot of current session ids, sorted.
    pub fn enumerate(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use turnstile_core::Right;

    fn alex() -> Identity {
        Identity::new("alex", "Alex", Right::User)
    }

    #[test]
    fn insert_lookup_delete() {
        let registry = SessionRegistry::new();
        let sid = SessionId::from_raw("s1");
        registry.insert(sid.clone(), "10.0.0.1", alex(), Utc::now());

        assert_eq!(registry.lookup(&sid).unwrap(), alex());
        assert_eq!(registry.entry(&sid).unwrap().remote_addr, "10.0.0.1");
        assert!(registry.delete(&sid));
        assert!(matches!(registry.lookup(&sid), Err(SchedulerError::NotFound(_))));
        assert!(!registry.delete(&sid));
    }

    #[test]
    fn insert_overwrites() {
        let registry = SessionRegistry::new();
        let sid = SessionId::from_raw("s1");
        registry.insert(sid.clone(), "10.0.0.1", Identity::guest(Utc::now()), Utc::now());
        registry.insert(sid.clone(), "10.0.0.2", alex(), Utc::now());

        assert_eq!(registry.len(), 1);
        let entry = registry.entry(&sid).unwrap();
        assert_eq!(entry.identity, alex());
        assert_eq!(entry.remote_addr, "10.0.0.2");
    }

    #[test]
    fn enumerate_and_delete_all() {
        let registry = SessionRegistry::new();
        for s in ["b", "a", "c"] {
            registry.insert(SessionId::from_raw(s), "ip", alex(), Utc::now());
        }
        let ids: Vec<_> = registry.enumerate().iter().map(|s| s.to_string()).collect();
        assert_eq!(ids, ["a", "b", "c"]);

        assert_eq!(registry.delete_all(), 3);
        assert!(registry.is_empty());
        assert!(registry.enumerate().is_empty());
    }

    #[test]
    fn concurrent_writers_and_readers() {
        let registry = Arc::new(SessionRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let sid = SessionId::from_raw(format!("t{t}-{i}"));
                        registry.insert(sid.clone(), "ip", alex(), Utc::now());
                        assert!(registry.lookup(&sid).is_ok());
                        if i % 2 == 0 {
                            registry.delete(&sid);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.len(), 200);
    }
}
