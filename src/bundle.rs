//! Bundles and their registration surfaces.
//!
//! A bundle is an independently written group of services, routes and
//! middleware. The application boots them in five phases (see
//! [`Bootstrap`](crate::Bootstrap)); each phase hands the bundle a registrar
//! that only exposes what is legal at that point. There is no route API on
//! [`Services`], so registering a route during the services phase cannot
//! even be written.
//!
//! ```rust
//! use satchel::{BindingScope, Bundle, Context, Controller, Error, Flow, Middlewares, Routes};
//!
//! #[derive(Default)]
//! struct Posts;
//! impl Controller for Posts {}
//! impl Posts {
//!     fn index(&mut self, ctx: &mut Context) -> Flow {
//!         ctx.with("posts", ["hello", "world"])?;
//!         Ok(())
//!     }
//! }
//!
//! struct Blog;
//!
//! impl Bundle for Blog {
//!     fn name(&self) -> &str { "blog" }
//!
//!     fn register_routes(&self, routes: &mut Routes<'_>) -> Result<(), Error> {
//!         routes.controller("Posts", Posts::default).get("/posts", "index", Posts::index);
//!         Ok(())
//!     }
//!
//!     fn register_middleware(&self, mw: &mut Middlewares<'_>) -> Result<(), Error> {
//!         mw.callback("blog.Stamp", |ctx| {
//!             ctx.set_header("x-blog", "1");
//!             Ok(())
//!         })?;
//!         Ok(())
//!     }
//!
//!     fn bind_middleware(&self, scope: &mut BindingScope<'_>) {
//!         scope.set("blog.Stamp").everywhere();
//!     }
//! }
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::app::App;
use crate::binding::BindingScope;
use crate::config::AppConfig;
use crate::context::Context;
use crate::error::{ConfigError, Error};
use crate::flow::Flow;
use crate::middleware::{AfterAction, BeforeAction, Middleware, MiddlewareFn};
use crate::registry::{ServiceRegistry, Tier};
use crate::request::Request;
use crate::router::Routes;
use crate::session::{Session, SessionStore};

/// The request being dispatched, published into every request registry.
pub const SVC_REQUEST: &str = "http.request";
/// The request's [`Session`] handle.
pub const SVC_SESSION: &str = "session";
/// The session-tier [`ServiceRegistry`], shared by all requests of a session.
pub const SVC_SESSION_REGISTRY: &str = "session.registry";

/// A unit of routes, services and middleware.
///
/// Every hook has an empty default, so a bundle only implements what it
/// contributes.
pub trait Bundle: Send + Sync + 'static {
    /// Unique name. Also the directory name under `bundle_dir` holding the
    /// bundle's templates.
    fn name(&self) -> &str;

    /// Phase 1: service factories. Other bundles' services may not exist yet.
    fn register_services(&self, _services: &mut Services<'_>) -> Result<(), Error> {
        Ok(())
    }

    /// Phase 2: controllers and routes.
    fn register_routes(&self, _routes: &mut Routes<'_>) -> Result<(), Error> {
        Ok(())
    }

    /// Phase 3: named middleware.
    fn register_middleware(&self, _middleware: &mut Middlewares<'_>) -> Result<(), Error> {
        Ok(())
    }

    /// Phase 4: bundle-level bindings, covering this bundle's controllers.
    fn bind_middleware(&self, _scope: &mut BindingScope<'_>) {}

    /// Phase 5: everything is registered; services of any bundle resolve.
    fn boot(&self, _app: &App) -> Result<(), Error> {
        Ok(())
    }

    /// Shutdown. Best effort; errors are the bundle's to log.
    fn close(&self) {}
}

// ── Phase 1 ──────────────────────────────────────────────────────────────────

/// Service registrar handed to [`Bundle::register_services`].
pub struct Services<'a> {
    registry: &'a mut ServiceRegistry,
    config: &'a AppConfig,
    bundle: &'a str,
}

impl<'a> Services<'a> {
    pub(crate) fn new(registry: &'a mut ServiceRegistry, config: &'a AppConfig, bundle: &'a str) -> Self {
        Self { registry, config, bundle }
    }

    pub fn bundle(&self) -> &str {
        self.bundle
    }

    pub fn config(&self) -> &AppConfig {
        self.config
    }

    /// Registers a process-tier factory. The factory runs against the
    /// registry the lookup started at.
    pub fn register<T, F>(&mut self, key: &str, factory: F) -> Result<(), ConfigError>
    where
        T: Any + Send + Sync,
        F: Fn(&ServiceRegistry) -> Result<T, Error> + Send + Sync + 'static,
    {
        self.registry.register(key, factory)
    }

    /// Registers a factory handing out shared instances.
    pub fn register_shared<T, F>(&mut self, key: &str, factory: F) -> Result<(), ConfigError>
    where
        T: Any + Send + Sync,
        F: Fn(&ServiceRegistry) -> Result<Arc<T>, Error> + Send + Sync + 'static,
    {
        self.registry.register_shared(key, factory)
    }

    /// Registers one instance shared by every resolution.
    pub fn singleton<T: Any + Send + Sync>(&mut self, key: &str, value: T) -> Result<(), ConfigError> {
        let value = Arc::new(value);
        self.registry.register_shared(key, move |_| Ok(Arc::clone(&value)))
    }
}

// ── Phase 3 ──────────────────────────────────────────────────────────────────

/// Middleware registrar handed to [`Bundle::register_middleware`].
///
/// Middleware is a service like any other, so every request builds (and
/// caches) its own instance. The priority is fixed here: bound middleware of
/// an action runs highest priority first.
pub struct Middlewares<'a> {
    registry: &'a mut ServiceRegistry,
    priorities: &'a mut HashMap<String, i32>,
    bundle: &'a str,
}

impl<'a> Middlewares<'a> {
    pub(crate) fn new(
        registry: &'a mut ServiceRegistry,
        priorities: &'a mut HashMap<String, i32>,
        bundle: &'a str,
    ) -> Self {
        Self { registry, priorities, bundle }
    }

    pub fn bundle(&self) -> &str {
        self.bundle
    }

    /// Registers middleware `name` with an explicit priority.
    pub fn add<F>(&mut self, name: &str, priority: i32, factory: F) -> Result<&mut Self, ConfigError>
    where
        F: Fn(&ServiceRegistry) -> Result<Middleware, Error> + Send + Sync + 'static,
    {
        if self.priorities.contains_key(name) {
            return Err(ConfigError::DuplicateMiddleware(name.to_owned()));
        }
        self.registry.register(name, factory)?;
        self.priorities.insert(name.to_owned(), priority);
        Ok(self)
    }

    /// Pre-action middleware built by `factory` once per request.
    pub fn handler<H, F>(&mut self, name: &str, factory: F) -> Result<&mut Self, ConfigError>
    where
        H: BeforeAction,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.add(name, 0, move |_| Ok(Middleware::handler(factory())))
    }

    /// Stateless pre-action middleware.
    pub fn callback<F>(&mut self, name: &str, f: F) -> Result<&mut Self, ConfigError>
    where
        F: Fn(&mut Context) -> Flow + Send + Sync + 'static,
    {
        let f: Arc<MiddlewareFn> = Arc::new(f);
        self.add(name, 0, move |_| Ok(Middleware::Callback(Arc::clone(&f))))
    }

    /// Post-action middleware built by `factory` once per request.
    pub fn terminate<T, F>(&mut self, name: &str, factory: F) -> Result<&mut Self, ConfigError>
    where
        T: AfterAction,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.add(name, 0, move |_| Ok(Middleware::terminate(factory())))
    }
}

// ── Core bundle ──────────────────────────────────────────────────────────────

/// Always booted first. Provides the session services.
pub(crate) struct CoreBundle {
    store: Arc<dyn SessionStore>,
}

impl CoreBundle {
    pub(crate) const NAME: &'static str = "core";

    pub(crate) fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }
}

impl Bundle for CoreBundle {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn register_services(&self, services: &mut Services<'_>) -> Result<(), Error> {
        let store = Arc::clone(&self.store);
        let cookie = services.config().session_cookie.clone();
        services.register(SVC_SESSION, move |reg| {
            let req = reg.resolve::<Request>(SVC_REQUEST)?;
            Ok(Session::open(Arc::clone(&store), req.cookie(&cookie)))
        })?;

        services.register_shared(SVC_SESSION_REGISTRY, |reg| {
            let session = reg.resolve_cached::<Session>(SVC_SESSION)?;
            let process = reg
                .root()
                .ok_or_else(|| Error::Session("the session registry needs a request tier".into()))?;
            session.get_or_insert_with(SVC_SESSION_REGISTRY, move || {
                Arc::new(ServiceRegistry::child(process, Tier::Session))
            })
        })?;
        Ok(())
    }
}
