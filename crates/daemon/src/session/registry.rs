//! Session registry: the process-wide table of live sessions.
//!
//! The registry maps caller-chosen session ids onto running [`PtySession`]s.
//! All operations are O(1) map touches; spawning (the only I/O) happens
//! before insertion, never under a map guard.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::pty::{OutputEvent, PtySession, SessionError, SessionId, SessionSpec};

/// Result of [`SessionRegistry::create_or_attach`].
pub enum CreateOutcome {
    /// A new session was started; the receiver is its output channel and the
    /// caller must start a fan-out for it.
    Created(Arc<PtySession>, mpsc::Receiver<OutputEvent>),
    /// The id was already present; the caller becomes an additional
    /// attacher of the existing session.
    Attached(Arc<PtySession>),
}

/// Thread-safe registry of live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<PtySession>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Return the existing session for `spec.id`, or start a new one.
    ///
    /// A CREATE for an id that already exists is an attach: the existing
    /// session is returned and the new spec is ignored. On spawn failure
    /// nothing is inserted.
    pub async fn create_or_attach(&self, spec: SessionSpec) -> Result<CreateOutcome, SessionError> {
        if let Some(existing) = self.sessions.get(&spec.id) {
            return Ok(CreateOutcome::Attached(Arc::clone(existing.value())));
        }

        let id = spec.id.clone();
        let (session, rx) = PtySession::spawn(spec)?;

        // Two concurrent CREATEs can both pass the fast path above; the
        // entry decides the winner and the loser's child is stopped.
        let winner = match self.sessions.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&session));
                None
            }
        };

        match winner {
            Some(winner) => {
                tracing::debug!(session_id = %session.id(), "Lost create race, stopping duplicate");
                session.close().await;
                Ok(CreateOutcome::Attached(winner))
            }
            None => Ok(CreateOutcome::Created(session, rx)),
        }
    }

    /// Returns the session for `id`, if present.
    pub fn lookup(&self, id: &str) -> Option<Arc<PtySession>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes a session after termination. Idempotent.
    pub fn remove(&self, id: &str) {
        if self.sessions.remove(id).is_some() {
            tracing::debug!(session_id = %id, "Removed session from registry");
        }
    }

    /// Returns the ids of all sessions that are currently running.
    pub fn list_running(&self) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().is_running())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Returns every session in the registry, running or draining.
    pub fn all(&self) -> Vec<Arc<PtySession>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Returns the number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cat_spec(id: &str) -> SessionSpec {
        SessionSpec::new(id, "/bin/cat")
    }

    #[tokio::test]
    async fn test_create_then_lookup() {
        let registry = SessionRegistry::new();

        let outcome = registry.create_or_attach(cat_spec("t1")).await.unwrap();
        assert!(matches!(outcome, CreateOutcome::Created(..)));
        assert!(registry.lookup("t1").is_some());
        assert_eq!(registry.count(), 1);

        registry.lookup("t1").unwrap().close().await;
    }

    #[tokio::test]
    async fn test_create_existing_id_attaches() {
        let registry = SessionRegistry::new();

        let first = registry.create_or_attach(cat_spec("t2")).await.unwrap();
        let CreateOutcome::Created(session, _rx) = first else {
            panic!("first create should start a session");
        };

        // Second create with the same id, different spec: attach, spec
        // ignored.
        let mut other = SessionSpec::new("t2", "/bin/sh");
        other.args = vec!["-c".into(), "exit 1".into()];
        let second = registry.create_or_attach(other).await.unwrap();
        match second {
            CreateOutcome::Attached(existing) => {
                assert_eq!(existing.id(), session.id());
            }
            CreateOutcome::Created(..) => panic!("duplicate id must attach"),
        }
        assert_eq!(registry.count(), 1);

        session.close().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_not_inserted() {
        let registry = SessionRegistry::new();

        let spec = SessionSpec::new("t3", "/nonexistent/program/zzz");
        let result = registry.create_or_attach(spec).await;
        // Either the spawn fails outright, or the child dies immediately; in
        // the first case nothing may be inserted.
        if result.is_err() {
            assert!(registry.lookup("t3").is_none());
            assert_eq!(registry.count(), 0);
        }
    }

    #[tokio::test]
    async fn test_remove_idempotent() {
        let registry = SessionRegistry::new();
        registry.remove("missing");

        let outcome = registry.create_or_attach(cat_spec("t4")).await.unwrap();
        let CreateOutcome::Created(session, _rx) = outcome else {
            panic!("expected create");
        };
        session.close().await;

        registry.remove("t4");
        registry.remove("t4");
        assert!(registry.lookup("t4").is_none());
    }

    #[tokio::test]
    async fn test_list_running_excludes_exited() {
        let registry = SessionRegistry::new();

        let CreateOutcome::Created(alive, _rx1) =
            registry.create_or_attach(cat_spec("alive")).await.unwrap()
        else {
            panic!("expected create");
        };

        let mut dead_spec = SessionSpec::new("dead", "/bin/sh");
        dead_spec.args = vec!["-c".into(), "exit 0".into()];
        let CreateOutcome::Created(dead, _rx2) =
            registry.create_or_attach(dead_spec).await.unwrap()
        else {
            panic!("expected create");
        };

        tokio::time::timeout(Duration::from_secs(5), dead.exited().cancelled())
            .await
            .expect("short-lived child should exit");

        let running = registry.list_running();
        assert!(running.contains(&"alive".to_string()));
        assert!(!running.contains(&"dead".to_string()));

        alive.close().await;
    }
}
