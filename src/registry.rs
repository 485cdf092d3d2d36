//! Scoped service registry.
//!
//! Registries form a parent chain with three lifetime tiers:
//!
//! ```text
//!   process  ── created once at boot, holds every bundle's factories
//!    ▲    ▲
//!    │    └── session  ── created on first use per session, lives in the session store
//!    │
//!   request  ── created per inbound request, dropped after the trailer phase
//! ```
//!
//! Resolution at a tier checks its own cache, then its own factories, then
//! delegates to the parent. Factories always run against the registry the
//! lookup *started* at, so a process-wide factory can read request-scoped
//! values (the session factory reads the request head this way).
//!
//! Ownership only points upward: a tier holds an `Arc` to its parent and owns
//! its own cache. Nothing a request caches is visible to another request.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ConfigError, Error};

/// A type-erased service instance.
pub type Service = Arc<dyn Any + Send + Sync>;

/// Builds a fresh [`Service`]. Receives the registry the lookup started at.
pub type Factory = Arc<dyn Fn(&ServiceRegistry) -> Result<Service, Error> + Send + Sync>;

/// Lifetime tier of a [`ServiceRegistry`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Tier {
    Process,
    Session,
    Request,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Process => "process",
            Self::Session => "session",
            Self::Request => "request",
        })
    }
}

/// A chainable key → factory / cached-instance resolver.
pub struct ServiceRegistry {
    tier: Tier,
    parent: Option<Arc<ServiceRegistry>>,
    factories: HashMap<String, Factory>,
    // Session registries are shared between concurrent requests of the same
    // session, so the cache needs interior locking. Never held across a
    // factory call: factories resolve other keys re-entrantly.
    cache: Mutex<HashMap<String, Service>>,
}

impl ServiceRegistry {
    /// The root registry. One per process.
    pub fn process() -> Self {
        Self::with_parent(Tier::Process, None)
    }

    /// A registry chained to `parent`.
    pub fn child(parent: Arc<ServiceRegistry>, tier: Tier) -> Self {
        Self::with_parent(tier, Some(parent))
    }

    fn with_parent(tier: Tier, parent: Option<Arc<ServiceRegistry>>) -> Self {
        Self { tier, parent, factories: HashMap::new(), cache: Mutex::new(HashMap::new()) }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn parent(&self) -> Option<&Arc<ServiceRegistry>> {
        self.parent.as_ref()
    }

    /// The top of the chain, if this registry is not the top itself.
    pub fn root(&self) -> Option<Arc<ServiceRegistry>> {
        let mut cur = self.parent.as_ref()?;
        while let Some(next) = cur.parent.as_ref() {
            cur = next;
        }
        Some(Arc::clone(cur))
    }

    // ── registration ─────────────────────────────────────────────────────────

    /// Registers a raw factory. Fails if `key` already has a factory here.
    pub fn register_factory(&mut self, key: impl Into<String>, factory: Factory) -> Result<(), ConfigError> {
        match self.factories.entry(key.into()) {
            Entry::Occupied(e) => Err(ConfigError::DuplicateService(e.key().clone())),
            Entry::Vacant(e) => {
                e.insert(factory);
                Ok(())
            }
        }
    }

    /// Registers a factory producing a plain value, wrapped in an `Arc` per call.
    pub fn register<T, F>(&mut self, key: impl Into<String>, factory: F) -> Result<(), ConfigError>
    where
        T: Any + Send + Sync,
        F: Fn(&ServiceRegistry) -> Result<T, Error> + Send + Sync + 'static,
    {
        self.register_factory(key, Arc::new(move |reg| Ok(Arc::new(factory(reg)?) as Service)))
    }

    /// Registers a factory that already hands out shared instances.
    pub fn register_shared<T, F>(&mut self, key: impl Into<String>, factory: F) -> Result<(), ConfigError>
    where
        T: Any + Send + Sync,
        F: Fn(&ServiceRegistry) -> Result<Arc<T>, Error> + Send + Sync + 'static,
    {
        self.register_factory(key, Arc::new(move |reg| Ok(factory(reg)? as Service)))
    }

    /// True if `key` resolves anywhere along the chain.
    pub fn contains(&self, key: &str) -> bool {
        self.chain().any(|reg| reg.factories.contains_key(key) || reg.cache.lock().contains_key(key))
    }

    /// Keys with a factory at this tier, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    // ── resolution ───────────────────────────────────────────────────────────

    /// Walks cache → factories → parent. Invokes at most one factory and
    /// caches nothing.
    pub fn resolve_service(&self, key: &str) -> Result<Service, Error> {
        for reg in self.chain() {
            if let Some(svc) = reg.cache.lock().get(key) {
                return Ok(Arc::clone(svc));
            }
            if let Some(factory) = reg.factories.get(key) {
                return factory(self);
            }
        }
        Err(Error::ServiceNotFound(key.to_owned()))
    }

    /// Typed [`resolve_service`](Self::resolve_service).
    pub fn resolve<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>, Error> {
        downcast(key, self.resolve_service(key)?)
    }

    /// Stores `svc` in this tier's cache. Re-publishing a cached key fails.
    pub fn publish_service(&self, key: impl Into<String>, svc: Service) -> Result<(), ConfigError> {
        match self.cache.lock().entry(key.into()) {
            Entry::Occupied(e) => Err(ConfigError::DuplicatePublish(e.key().clone())),
            Entry::Vacant(e) => {
                e.insert(svc);
                Ok(())
            }
        }
    }

    /// Typed [`publish_service`](Self::publish_service).
    pub fn publish<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) -> Result<(), ConfigError> {
        self.publish_service(key, Arc::new(value))
    }

    /// Resolves `key` once per tier: the first call resolves and caches the
    /// result here, later calls return the identical instance.
    pub fn resolve_cached_service(&self, key: &str) -> Result<Service, Error> {
        if let Some(svc) = self.cached(key) {
            return Ok(svc);
        }
        let fresh = self.resolve_service(key)?;
        // Another request may have filled a shared tier meanwhile; keep theirs.
        let mut cache = self.cache.lock();
        Ok(Arc::clone(cache.entry(key.to_owned()).or_insert(fresh)))
    }

    /// Typed [`resolve_cached_service`](Self::resolve_cached_service).
    pub fn resolve_cached<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>, Error> {
        downcast(key, self.resolve_cached_service(key)?)
    }

    /// Always invokes the nearest factory for `key`, ignoring every cache.
    pub fn resolve_new_service(&self, key: &str) -> Result<Service, Error> {
        let factory = self
            .chain()
            .find_map(|reg| reg.factories.get(key))
            .ok_or_else(|| Error::ServiceNotFound(key.to_owned()))?;
        factory(self)
    }

    /// Typed [`resolve_new_service`](Self::resolve_new_service).
    pub fn resolve_new<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>, Error> {
        downcast(key, self.resolve_new_service(key)?)
    }

    /// The instance cached at this tier, if any. Does not consult the parent.
    pub fn cached(&self, key: &str) -> Option<Service> {
        self.cache.lock().get(key).cloned()
    }

    /// Removes a cached instance from this tier, allowing it to be published again.
    pub fn evict(&self, key: &str) -> Option<Service> {
        self.cache.lock().remove(key)
    }

    fn chain(&self) -> impl Iterator<Item = &ServiceRegistry> {
        std::iter::successors(Some(self), |reg| reg.parent.as_deref())
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("tier", &self.tier)
            .field("factories", &self.keys())
            .field("cached", &self.cache.lock().len())
            .field("parent", &self.parent.as_ref().map(|p| p.tier))
            .finish()
    }
}

fn downcast<T: Any + Send + Sync>(key: &str, svc: Service) -> Result<Arc<T>, Error> {
    svc.downcast::<T>()
        .map_err(|_| Error::ServiceType { key: key.to_owned(), expected: type_name::<T>() })
}
