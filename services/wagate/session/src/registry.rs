//! Session registry: the single owner of every live session record.
//!
//! Holds a primary index by session id and a secondary index from external
//! user ids to session ids. Calls are synchronous and safe from any task.

use crate::session::{SessionSummary, SharedSession};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// In-memory index of live sessions
#[derive(Debug, Default)]
pub struct SessionRegistry {
    /// Sessions by id
    sessions: DashMap<String, SharedSession>,
    /// Session id by external user id
    users: DashMap<String, String>,
}

impl SessionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a session record
    pub fn put(&self, session: SharedSession) {
        let id = session.id().to_string();
        if let Some(previous) = self.sessions.insert(id.clone(), session) {
            previous.lifetime().cancel();
            debug!("Replaced session record {}", id);
        }
    }

    /// Return the record registered under the session's id, inserting it if absent
    pub fn insert_if_absent(&self, session: SharedSession) -> SharedSession {
        match self.sessions.entry(session.id().to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                info!("Registered session {}", session.id());
                entry.insert(session.clone());
                session
            }
        }
    }

    /// Look up a session
    pub fn get(&self, session_id: &str) -> Option<SharedSession> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    /// Whether a session is registered
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Remove a session, every user binding pointing at it, and its pending reconnect
    pub fn remove(&self, session_id: &str) -> Option<SharedSession> {
        let (_, session) = self.sessions.remove(session_id)?;
        self.users.retain(|_, bound| bound != session_id);
        session.lifetime().cancel();
        info!("Removed session {}", session_id);
        Some(session)
    }

    /// Remove `session` only if it is still the record registered under its id
    pub fn remove_if_same(&self, session: &SharedSession) -> bool {
        let removed = self
            .sessions
            .remove_if(session.id(), |_, current| Arc::ptr_eq(current, session));
        if removed.is_none() {
            return false;
        }
        self.users.retain(|_, bound| bound != session.id());
        session.lifetime().cancel();
        debug!("Released session record {}", session.id());
        true
    }

    /// Bind `user_id` to `session` unless the user is already bound to another
    /// registered session, which is returned instead.
    ///
    /// The check and the binding happen under one map entry lock.
    pub fn claim_user(&self, user_id: &str, session: &SharedSession) -> Result<(), SharedSession> {
        match self.users.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get() != session.id() {
                    if let Some(owner) = self.get(entry.get()) {
                        return Err(owner);
                    }
                    entry.insert(session.id().to_string());
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(session.id().to_string());
            }
        }

        if let Some(previous_user) = session.set_user(Some(user_id.to_string())) {
            if previous_user != user_id {
                self.users
                    .remove_if(&previous_user, |_, bound| bound == session.id());
            }
        }
        Ok(())
    }

    /// Bind `user_id` to `session_id`. Returns false when the session is unknown.
    ///
    /// A user already bound elsewhere is moved, and a session already bound
    /// to another user loses that binding.
    pub fn bind_user(&self, user_id: &str, session_id: &str) -> bool {
        let Some(session) = self.get(session_id) else {
            return false;
        };

        if let Some(previous_id) = self.users.insert(user_id.to_string(), session_id.to_string()) {
            if previous_id != session_id {
                if let Some(previous) = self.get(&previous_id) {
                    previous.clear_user_if(user_id);
                }
                debug!(
                    "Moved user {} from session {} to {}",
                    user_id, previous_id, session_id
                );
            }
        }

        if let Some(previous_user) = session.set_user(Some(user_id.to_string())) {
            if previous_user != user_id {
                self.users
                    .remove_if(&previous_user, |_, bound| bound == session_id);
            }
        }
        true
    }

    /// Drop a user binding, returning the session id it pointed at
    pub fn unbind_user(&self, user_id: &str) -> Option<String> {
        let (_, session_id) = self.users.remove(user_id)?;
        if let Some(session) = self.get(&session_id) {
            session.clear_user_if(user_id);
        }
        Some(session_id)
    }

    /// Session bound to a user
    pub fn session_for_user(&self, user_id: &str) -> Option<SharedSession> {
        let session_id = self.users.get(user_id).map(|id| id.value().clone())?;
        self.get(&session_id)
    }

    /// Summaries of all sessions, or only those bound to `user_id`, sorted by id
    pub fn list_by_user(&self, user_id: Option<&str>) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = match user_id {
            None => self.sessions.iter().map(|s| s.value().summary()).collect(),
            Some(user_id) => self
                .session_for_user(user_id)
                .map(|s| s.summary())
                .into_iter()
                .filter(|summary| summary.user_id.as_deref() == Some(user_id))
                .collect(),
        };
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Snapshot of all records
    pub fn sessions(&self) -> Vec<SharedSession> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of user bindings
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use std::sync::Arc;
    use wagate_storage::MemoryCredentialStore;

    fn session(id: &str) -> SharedSession {
        Session::new(id, Arc::new(MemoryCredentialStore::new()))
    }

    #[test]
    fn test_insert_if_absent_keeps_first() {
        let registry = SessionRegistry::new();
        let first = session("s1");
        let stored = registry.insert_if_absent(first.clone());
        assert!(Arc::ptr_eq(&stored, &first));

        let stored = registry.insert_if_absent(session("s1"));
        assert!(Arc::ptr_eq(&stored, &first));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_double_binding_yields_one_entry() {
        let registry = SessionRegistry::new();
        registry.put(session("s3"));

        assert!(registry.bind_user("u1", "s3"));
        assert!(registry.bind_user("u1", "s3"));
        assert_eq!(registry.user_count(), 1);
        assert_eq!(registry.session_for_user("u1").unwrap().id(), "s3");
        assert!(!registry.bind_user("u2", "missing"));
    }

    #[test]
    fn test_rebinding_moves_user() {
        let registry = SessionRegistry::new();
        registry.put(session("a"));
        registry.put(session("b"));

        registry.bind_user("u1", "a");
        registry.bind_user("u1", "b");
        assert_eq!(registry.get("a").unwrap().user_id(), None);
        assert_eq!(registry.get("b").unwrap().user_id().as_deref(), Some("u1"));

        // a second user on the same session replaces the first
        registry.bind_user("u2", "b");
        assert!(registry.session_for_user("u1").is_none());
        assert_eq!(registry.session_for_user("u2").unwrap().id(), "b");
        assert_eq!(registry.user_count(), 1);
    }

    #[test]
    fn test_remove_clears_bindings_and_cancels() {
        let registry = SessionRegistry::new();
        let s = session("s1");
        registry.put(s.clone());
        registry.bind_user("u1", "s1");

        assert!(registry.remove("s1").is_some());
        assert!(registry.get("s1").is_none());
        assert!(registry.session_for_user("u1").is_none());
        assert_eq!(registry.user_count(), 0);
        assert!(s.is_removed());
        assert!(registry.remove("s1").is_none());
    }

    #[test]
    fn test_unbind_user() {
        let registry = SessionRegistry::new();
        registry.put(session("s1"));
        registry.bind_user("u1", "s1");

        assert_eq!(registry.unbind_user("u1").as_deref(), Some("s1"));
        assert_eq!(registry.get("s1").unwrap().user_id(), None);
        assert!(registry.unbind_user("u1").is_none());
    }

    #[test]
    fn test_list_by_user() {
        let registry = SessionRegistry::new();
        for id in ["c", "a", "b"] {
            registry.put(session(id));
        }
        registry.bind_user("u1", "b");

        let all: Vec<String> = registry
            .list_by_user(None)
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(all, vec!["a", "b", "c"]);

        let mine = registry.list_by_user(Some("u1"));
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, "b");
        assert_eq!(mine[0].user_id.as_deref(), Some("u1"));
        assert!(registry.list_by_user(Some("nobody")).is_empty());
    }

    #[test]
    fn test_claim_user_keeps_first_owner() {
        let registry = SessionRegistry::new();
        let a = registry.insert_if_absent(session("a"));
        let b = registry.insert_if_absent(session("b"));

        assert!(registry.claim_user("u1", &a).is_ok());
        assert!(registry.claim_user("u1", &a).is_ok());
        let owner = registry.claim_user("u1", &b).unwrap_err();
        assert!(Arc::ptr_eq(&owner, &a));
        assert_eq!(b.user_id(), None);

        // a binding to a record that is gone can be taken over
        registry.remove("a");
        registry.users.insert("u2".to_string(), "a".to_string());
        assert!(registry.claim_user("u2", &b).is_ok());
        assert_eq!(registry.session_for_user("u2").unwrap().id(), "b");
    }

    #[test]
    fn test_remove_if_same_ignores_replaced_record() {
        let registry = SessionRegistry::new();
        let old = session("s1");
        registry.put(old.clone());
        let current = session("s1");
        registry.put(current.clone());

        assert!(!registry.remove_if_same(&old));
        assert!(registry.contains("s1"));

        registry.claim_user("u1", &current).unwrap();
        assert!(registry.remove_if_same(&current));
        assert!(registry.is_empty());
        assert_eq!(registry.user_count(), 0);
        assert!(current.is_removed());
    }

    #[test]
    fn test_put_replaces_and_retires_previous() {
        let registry = SessionRegistry::new();
        let old = session("s1");
        registry.put(old.clone());
        registry.put(session("s1"));
        assert!(old.is_removed());
        assert_eq!(registry.len(), 1);
    }
}
