//! Session storage.
//!
//! The dispatcher only needs a narrow contract from the backend, captured by
//! [`SessionStore`]. [`MemorySessionStore`] is the default: process-local,
//! expiring idle sessions after `session_max_age_minutes`. Expired sessions
//! are swept while new ones are opened, at most once per max-age.
//!
//! The one hard requirement is [`SessionStore::get_or_insert_with`]: it must
//! be atomic per `(session, key)`. The session-tier service registry is
//! created through it, and concurrent first requests of one session must all
//! end up with the same registry.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::Error;

/// A type-erased value stored in a session.
pub type SessionValue = Arc<dyn Any + Send + Sync>;

/// Backend contract consumed by the dispatcher.
pub trait SessionStore: Send + Sync + 'static {
    /// Resumes the session `requested` if it exists and is live, otherwise
    /// starts a new one. Returns the id and whether it was just created.
    fn open(&self, requested: Option<&str>) -> (String, bool);

    fn get_data(&self, id: &str, key: &str) -> Option<SessionValue>;

    fn set_data(&self, id: &str, key: &str, value: SessionValue);

    fn remove_data(&self, id: &str, key: &str) -> Option<SessionValue>;

    /// Returns the value at `key`, creating it with `init` first if absent.
    /// Must be atomic: `init` runs at most once per `(id, key)`.
    fn get_or_insert_with(&self, id: &str, key: &str, init: &mut dyn FnMut() -> SessionValue) -> SessionValue;

    /// Writes the session to durable storage. Called once in the trailer of
    /// every request that used the session.
    fn persist(&self, _session: &Session) -> Result<(), Error> {
        Ok(())
    }
}

// ── Session handle ───────────────────────────────────────────────────────────

/// One request's view of a session. Resolved once per request from the
/// request registry under [`SVC_SESSION`](crate::SVC_SESSION).
pub struct Session {
    id: String,
    fresh: bool,
    store: Arc<dyn SessionStore>,
}

impl Session {
    /// Opens (or starts) the session identified by `requested`.
    pub fn open(store: Arc<dyn SessionStore>, requested: Option<&str>) -> Self {
        let (id, fresh) = store.open(requested);
        Self { id, fresh, store }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// True when this request started the session; the client needs a cookie.
    pub fn is_new(&self) -> bool {
        self.fresh
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.store.get_data(&self.id, key)?.downcast::<T>().ok()
    }

    pub fn set<T: Any + Send + Sync>(&self, key: &str, value: T) {
        self.store.set_data(&self.id, key, Arc::new(value));
    }

    pub fn set_shared(&self, key: &str, value: SessionValue) {
        self.store.set_data(&self.id, key, value);
    }

    pub fn remove(&self, key: &str) -> bool {
        self.store.remove_data(&self.id, key).is_some()
    }

    /// Reads and removes `key` in one go.
    pub fn flash<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.store.remove_data(&self.id, key)?.downcast::<T>().ok()
    }

    /// Atomic get-or-create of a shared value. Fails if `key` already holds a
    /// value of another type.
    pub fn get_or_insert_with<T, F>(&self, key: &str, init: F) -> Result<Arc<T>, Error>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Arc<T>,
    {
        let mut init = Some(init);
        let mut make = || -> SessionValue {
            match init.take() {
                Some(f) => f() as SessionValue,
                // The store contract forbids a second call.
                None => Arc::new(()),
            }
        };
        self.store
            .get_or_insert_with(&self.id, key, &mut make)
            .downcast::<T>()
            .map_err(|_| Error::Session(format!("`{key}` does not hold a `{}`", type_name::<T>()).into()))
    }

    /// `Set-Cookie` value announcing this session to the client.
    pub fn cookie(&self, name: &str, max_age: Duration) -> String {
        format!("{name}={}; Path=/; HttpOnly; Max-Age={}", self.id, max_age.as_secs())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("id", &self.id).field("fresh", &self.fresh).finish()
    }
}

// ── In-memory store ──────────────────────────────────────────────────────────

struct Entry {
    data: HashMap<String, SessionValue>,
    last_accessed: Instant,
}

impl Entry {
    fn new() -> Self {
        Self { data: HashMap::new(), last_accessed: Instant::now() }
    }

    fn is_expired(&self, max_age: Duration) -> bool {
        self.last_accessed.elapsed() > max_age
    }
}

/// Thread-safe, process-local [`SessionStore`].
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Entry>>,
    max_age: Duration,
    last_purge: Mutex<Instant>,
}

impl MemorySessionStore {
    pub fn new(max_age: Duration) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), max_age, last_purge: Mutex::new(Instant::now()) }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Number of sessions currently held, expired ones included.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every expired session.
    pub fn purge_expired(&self) -> usize {
        let mut sessions = self.sessions.write();
        self.purge_locked(&mut sessions)
    }

    fn purge_locked(&self, sessions: &mut HashMap<String, Entry>) -> usize {
        *self.last_purge.lock() = Instant::now();
        let before = sessions.len();
        sessions.retain(|_, e| !e.is_expired(self.max_age));
        let purged = before - sessions.len();
        if purged > 0 {
            debug!(purged, held = sessions.len(), "expired sessions dropped");
        }
        purged
    }

    fn purge_due(&self) -> bool {
        self.last_purge.lock().elapsed() >= self.max_age
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(45 * 60))
    }
}

impl SessionStore for MemorySessionStore {
    fn open(&self, requested: Option<&str>) -> (String, bool) {
        let mut sessions = self.sessions.write();
        if let Some(id) = requested {
            match sessions.get_mut(id) {
                Some(entry) if !entry.is_expired(self.max_age) => {
                    entry.last_accessed = Instant::now();
                    return (id.to_owned(), false);
                }
                Some(_) => {
                    sessions.remove(id);
                }
                None => {}
            }
        }
        if self.purge_due() {
            self.purge_locked(&mut sessions);
        }
        let id = Uuid::new_v4().to_string();
        sessions.insert(id.clone(), Entry::new());
        (id, true)
    }

    fn get_data(&self, id: &str, key: &str) -> Option<SessionValue> {
        self.sessions.read().get(id)?.data.get(key).cloned()
    }

    fn set_data(&self, id: &str, key: &str, value: SessionValue) {
        if let Some(entry) = self.sessions.write().get_mut(id) {
            entry.data.insert(key.to_owned(), value);
        }
    }

    fn remove_data(&self, id: &str, key: &str) -> Option<SessionValue> {
        self.sessions.write().get_mut(id)?.data.remove(key)
    }

    fn get_or_insert_with(&self, id: &str, key: &str, init: &mut dyn FnMut() -> SessionValue) -> SessionValue {
        let mut sessions = self.sessions.write();
        let entry = sessions.entry(id.to_owned()).or_insert_with(Entry::new);
        Arc::clone(entry.data.entry(key.to_owned()).or_insert_with(init))
    }

    fn persist(&self, session: &Session) -> Result<(), Error> {
        if let Some(entry) = self.sessions.write().get_mut(session.id()) {
            entry.last_accessed = Instant::now();
        }
        Ok(())
    }
}
