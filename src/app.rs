//! Application assembly and the five-phase boot.
//!
//! ```text
//!   AppBuilder ──bootstrap()──▶ Bootstrap
//!                                  │ 1. register_services   every bundle
//!                                  │ 2. register_routes     every bundle
//!                                  │ 3. register_middleware every bundle
//!                                  │ 4. bind_middleware     every bundle, then every controller
//!                                  ▼ 5. boot                every bundle, against the finished App
//!                                 App
//! ```
//!
//! Each phase runs to completion across all bundles before the next one
//! starts, in bundle registration order. [`AppBuilder::build`] runs them all;
//! [`Bootstrap`] exposes them one at a time.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::binding::{BindingBag, Bindings};
use crate::bundle::{Bundle, CoreBundle, Middlewares, Services};
use crate::config::AppConfig;
use crate::controller::ActionId;
use crate::error::{ConfigError, Error};
use crate::fallback::{DefaultNotFound, FileHandler, NotFoundHandler, StaticFiles};
use crate::registry::ServiceRegistry;
use crate::router::{RouteTable, Routes};
use crate::session::{MemorySessionStore, SessionStore};
use crate::view::{JinjaViews, ViewRenderer};

// ── Builder ──────────────────────────────────────────────────────────────────

/// Collects bundles and collaborators.
///
/// ```rust
/// use satchel::{AppBuilder, AppConfig};
///
/// let app = AppBuilder::new(AppConfig::default()).build().unwrap();
/// assert!(app.routes().is_empty());
/// ```
pub struct AppBuilder {
    config: AppConfig,
    bundles: Vec<Arc<dyn Bundle>>,
    sessions: Option<Arc<dyn SessionStore>>,
    views: Option<Arc<dyn ViewRenderer>>,
    not_found: Option<Arc<dyn NotFoundHandler>>,
    files: Option<Arc<dyn FileHandler>>,
}

impl AppBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self { config, bundles: Vec::new(), sessions: None, views: None, not_found: None, files: None }
    }

    /// Adds a bundle. Bundles boot in the order they are added.
    pub fn bundle(mut self, bundle: impl Bundle) -> Self {
        self.bundles.push(Arc::new(bundle));
        self
    }

    /// Replaces the in-memory session store.
    pub fn session_store(mut self, store: impl SessionStore) -> Self {
        self.sessions = Some(Arc::new(store));
        self
    }

    /// Replaces the minijinja renderer.
    pub fn views(mut self, views: impl ViewRenderer) -> Self {
        self.views = Some(Arc::new(views));
        self
    }

    pub fn not_found(mut self, handler: impl NotFoundHandler) -> Self {
        self.not_found = Some(Arc::new(handler));
        self
    }

    /// Replaces static file serving from `static_dir`.
    pub fn files(mut self, handler: impl FileHandler) -> Self {
        self.files = Some(Arc::new(handler));
        self
    }

    /// Starts a phase-by-phase boot.
    pub fn bootstrap(self) -> Bootstrap {
        let config = Arc::new(self.config);
        let sessions = self.sessions.unwrap_or_else(|| {
            Arc::new(MemorySessionStore::new(config.session_max_age()))
        });
        let views = self.views.unwrap_or_else(|| Arc::new(JinjaViews::new(config.view_file_ext.clone())));
        let not_found = self.not_found.unwrap_or_else(|| Arc::new(DefaultNotFound));
        let files = self.files.unwrap_or_else(|| Arc::new(StaticFiles::new(config.static_dir.clone())));

        let mut bundles: Vec<Arc<dyn Bundle>> = Vec::with_capacity(self.bundles.len() + 1);
        bundles.push(Arc::new(CoreBundle::new(sessions)));
        bundles.extend(self.bundles);

        Bootstrap {
            completed: Phase::Created,
            config,
            bundles,
            process: ServiceRegistry::process(),
            routes: RouteTable::new(),
            priorities: HashMap::new(),
            bindings: Bindings::default(),
            views,
            not_found,
            files,
        }
    }

    /// Runs every boot phase.
    pub fn build(self) -> Result<App, Error> {
        let mut boot = self.bootstrap();
        boot.register_services()?;
        boot.register_routes()?;
        boot.register_middleware()?;
        boot.bind_middleware()?;
        boot.boot()
    }
}

// ── Bootstrap ────────────────────────────────────────────────────────────────

/// Boot progress.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Phase {
    Created,
    Services,
    Routes,
    Middleware,
    Bindings,
    Booted,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Services => "services",
            Self::Routes => "routes",
            Self::Middleware => "middleware",
            Self::Bindings => "bindings",
            Self::Booted => "boot",
        }
    }

    fn next(self) -> Option<Self> {
        match self {
            Self::Created => Some(Self::Services),
            Self::Services => Some(Self::Routes),
            Self::Routes => Some(Self::Middleware),
            Self::Middleware => Some(Self::Bindings),
            Self::Bindings => Some(Self::Booted),
            Self::Booted => None,
        }
    }
}

/// An application in the middle of booting. Phases must run in order.
pub struct Bootstrap {
    completed: Phase,
    config: Arc<AppConfig>,
    bundles: Vec<Arc<dyn Bundle>>,
    process: ServiceRegistry,
    routes: RouteTable,
    priorities: HashMap<String, i32>,
    bindings: Bindings,
    views: Arc<dyn ViewRenderer>,
    not_found: Arc<dyn NotFoundHandler>,
    files: Arc<dyn FileHandler>,
}

impl Bootstrap {
    /// The last phase that ran to completion.
    pub fn completed(&self) -> Phase {
        self.completed
    }

    /// Every routed action known so far. Empty until the routes phase ran.
    pub fn actions(&self) -> Vec<ActionId> {
        self.routes.actions()
    }

    /// Phase 1.
    pub fn register_services(&mut self) -> Result<(), Error> {
        self.enter(Phase::Services)?;
        for bundle in &self.bundles {
            let mut services = Services::new(&mut self.process, &self.config, bundle.name());
            bundle.register_services(&mut services).map_err(|e| in_bundle(bundle.name(), e))?;
        }
        self.complete(Phase::Services);
        Ok(())
    }

    /// Phase 2.
    pub fn register_routes(&mut self) -> Result<(), Error> {
        self.enter(Phase::Routes)?;
        for bundle in &self.bundles {
            let name = bundle.name();
            bundle
                .register_routes(&mut Routes::new(&mut self.routes, name))
                .map_err(|e| in_bundle(name, e))?;
            if let Some(err) = self.routes.take_error() {
                return Err(in_bundle(name, err.into()));
            }
        }
        self.complete(Phase::Routes);
        Ok(())
    }

    /// Phase 3.
    pub fn register_middleware(&mut self) -> Result<(), Error> {
        self.enter(Phase::Middleware)?;
        for bundle in &self.bundles {
            let mut mw = Middlewares::new(&mut self.process, &mut self.priorities, bundle.name());
            bundle.register_middleware(&mut mw).map_err(|e| in_bundle(bundle.name(), e))?;
        }
        self.complete(Phase::Middleware);
        Ok(())
    }

    /// Phase 4. Bundle-level bindings first, then controller-level ones
    /// merged on top.
    pub fn bind_middleware(&mut self) -> Result<(), Error> {
        self.enter(Phase::Bindings)?;
        let mut bag = BindingBag::new(self.priorities.clone(), self.routes.actions());
        for bundle in &self.bundles {
            bundle.bind_middleware(&mut bag.scope(bundle.name(), None));
        }
        for entry in self.routes.controllers() {
            (entry.binder)(&mut bag.scope(&entry.bundle, Some(entry.name.as_str())));
        }
        self.bindings = bag.finish()?;
        self.complete(Phase::Bindings);
        Ok(())
    }

    /// Phase 5. Freezes the application and runs every bundle's boot hook.
    pub fn boot(self) -> Result<App, Error> {
        self.enter(Phase::Booted)?;
        let app = App {
            config: self.config,
            bundles: self.bundles,
            process: Arc::new(self.process),
            routes: self.routes,
            bindings: self.bindings,
            views: self.views,
            not_found: self.not_found,
            files: self.files,
            closed: AtomicBool::new(false),
        };
        for bundle in &app.bundles {
            bundle.boot(&app).map_err(|e| in_bundle(bundle.name(), e))?;
        }
        debug!(report = %app.describe(), "routes");
        info!(bundles = app.bundles.len(), routes = app.routes.routes().len(), "application booted");
        Ok(app)
    }

    fn enter(&self, requested: Phase) -> Result<(), ConfigError> {
        if self.completed.next() == Some(requested) {
            debug!(phase = requested.as_str(), "boot phase");
            Ok(())
        } else {
            Err(ConfigError::PhaseOrder { requested: requested.as_str(), completed: self.completed.as_str() })
        }
    }

    fn complete(&mut self, phase: Phase) {
        self.completed = phase;
    }
}

fn in_bundle(bundle: &str, source: Error) -> Error {
    Error::Bundle { bundle: bundle.to_owned(), source: Box::new(source) }
}

// ── App ──────────────────────────────────────────────────────────────────────

/// A booted application. Read-only; shared by every request.
pub struct App {
    pub(crate) config: Arc<AppConfig>,
    pub(crate) bundles: Vec<Arc<dyn Bundle>>,
    pub(crate) process: Arc<ServiceRegistry>,
    pub(crate) routes: RouteTable,
    pub(crate) bindings: Bindings,
    pub(crate) views: Arc<dyn ViewRenderer>,
    pub(crate) not_found: Arc<dyn NotFoundHandler>,
    pub(crate) files: Arc<dyn FileHandler>,
    closed: AtomicBool,
}

impl App {
    pub fn builder(config: AppConfig) -> AppBuilder {
        AppBuilder::new(config)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// The process-tier registry.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.process
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Every routed action, in registration order.
    pub fn actions(&self) -> Vec<ActionId> {
        self.routes.actions()
    }

    /// Middleware bound to `action`, in execution order.
    pub fn middleware_for(&self, action: &ActionId) -> &[String] {
        self.bindings.for_action(action)
    }

    /// Names of the registered bundles, in boot order.
    pub fn bundle_names(&self) -> Vec<&str> {
        self.bundles.iter().map(|b| b.name()).collect()
    }

    /// Human-readable route table with each action's middleware.
    pub fn describe(&self) -> String {
        let mut out = format!("satchel {}\n", self.config.version);
        for route in self.routes.routes() {
            let _ = write!(out, "{:<7} {:<32} {}", route.method().as_str(), route.pattern(), route.action());
            let mw = self.bindings.for_action(route.action());
            if !mw.is_empty() {
                let _ = write!(out, " [{}]", mw.join(", "));
            }
            out.push('\n');
        }
        out
    }

    /// Runs every bundle's close hook once, in registration order.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for bundle in &self.bundles {
            debug!(bundle = bundle.name(), "closing");
            bundle.close();
        }
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("bundles", &self.bundle_names())
            .field("routes", &self.routes.routes().len())
            .finish_non_exhaustive()
    }
}
