//! Radix-tree route table.
//!
//! One tree per HTTP method, O(path-length) lookup via [`matchit`]. Bundles
//! fill the table during the route phase of boot through [`Routes`]; after
//! boot it is read-only and shared by every request.

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use matchit::Router as MatchitRouter;

use crate::binding::BindingScope;
use crate::context::Context;
use crate::controller::{ActionId, BoxedAction, Controller, ControllerAction, SharedFactory};
use crate::error::ConfigError;
use crate::flow::Flow;

/// A routed action.
pub struct Route {
    pub(crate) action: ActionId,
    pub(crate) method: Method,
    pub(crate) pattern: String,
    pub(crate) handler: BoxedAction,
}

impl Route {
    pub fn action(&self) -> &ActionId { &self.action }
    pub fn method(&self) -> &Method { &self.method }
    pub fn pattern(&self) -> &str { &self.pattern }
}

/// A registered controller and its controller-level binding hook.
pub(crate) struct ControllerEntry {
    pub(crate) bundle: String,
    pub(crate) name: String,
    pub(crate) binder: fn(&mut BindingScope<'_>),
}

/// The application's routes.
#[derive(Default)]
pub struct RouteTable {
    trees: HashMap<Method, MatchitRouter<usize>>,
    routes: Vec<Route>,
    controllers: Vec<ControllerEntry>,
    errors: Vec<ConfigError>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the route for `method` + `path` and its captured parameters.
    pub fn lookup(&self, method: &Method, path: &str) -> Option<(&Route, HashMap<String, String>)> {
        let tree = self.trees.get(method)?;
        let matched = tree.at(path).ok()?;
        let route = self.routes.get(*matched.value)?;
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some((route, params))
    }

    /// Every routed action, once each, in registration order.
    pub fn actions(&self) -> Vec<ActionId> {
        let mut seen = Vec::<ActionId>::new();
        for route in &self.routes {
            if !seen.contains(&route.action) {
                seen.push(route.action.clone());
            }
        }
        seen
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub(crate) fn controllers(&self) -> &[ControllerEntry] {
        &self.controllers
    }

    /// The first error recorded while registering, if any.
    pub(crate) fn take_error(&mut self) -> Option<ConfigError> {
        if self.errors.is_empty() { None } else { Some(self.errors.swap_remove(0)) }
    }

    fn insert(&mut self, method: Method, pattern: &str, action: ActionId, handler: BoxedAction) {
        let index = self.routes.len();
        let inserted = self.trees.entry(method.clone()).or_default().insert(pattern, index);
        match inserted {
            Ok(()) => self.routes.push(Route { action, method, pattern: pattern.to_owned(), handler }),
            Err(e) => self.errors.push(ConfigError::InvalidRoute {
                path: format!("{method} {pattern}"),
                reason: e.to_string(),
            }),
        }
    }
}

// ── Registration surface ─────────────────────────────────────────────────────

/// Route registrar handed to [`Bundle::register_routes`](crate::Bundle::register_routes).
///
/// ```rust,no_run
/// # use satchel::{Context, Controller, Flow, Routes};
/// # #[derive(Default)] struct Posts;
/// # impl Controller for Posts {}
/// # impl Posts {
/// #     fn index(&mut self, _: &mut Context) -> Flow { Ok(()) }
/// #     fn show(&mut self, _: &mut Context) -> Flow { Ok(()) }
/// # }
/// # fn register(routes: &mut Routes<'_>) {
/// routes.controller("Posts", Posts::default)
///     .get("/posts", "index", Posts::index)
///     .get("/posts/{id}", "show", Posts::show);
/// # }
/// ```
pub struct Routes<'a> {
    table: &'a mut RouteTable,
    bundle: &'a str,
}

impl<'a> Routes<'a> {
    pub(crate) fn new(table: &'a mut RouteTable, bundle: &'a str) -> Self {
        Self { table, bundle }
    }

    pub fn bundle(&self) -> &str {
        self.bundle
    }

    /// Registers controller `name`, built by `factory` once per request.
    pub fn controller<C, F>(&mut self, name: &str, factory: F) -> ControllerRoutes<'_, C>
    where
        C: Controller,
        F: Fn() -> C + Send + Sync + 'static,
    {
        let duplicate = self.table.controllers.iter()
            .any(|c| c.bundle == self.bundle && c.name == name);
        if duplicate {
            self.table.errors.push(ConfigError::DuplicateController(format!("{}.{name}", self.bundle)));
        } else {
            self.table.controllers.push(ControllerEntry {
                bundle: self.bundle.to_owned(),
                name: name.to_owned(),
                binder: C::bind_middleware,
            });
        }
        ControllerRoutes {
            table: &mut *self.table,
            bundle: self.bundle.to_owned(),
            controller: name.to_owned(),
            factory: Arc::new(factory),
        }
    }
}

/// Routes of one controller. Each call maps a path to a named method.
pub struct ControllerRoutes<'r, C> {
    table: &'r mut RouteTable,
    bundle: String,
    controller: String,
    factory: SharedFactory<C>,
}

impl<C: Controller> ControllerRoutes<'_, C> {
    /// Maps `method` + `path` to the controller method registered as `action`.
    /// Path parameters use `{name}` syntax.
    pub fn on<M>(self, method: Method, path: &str, action: &str, handler: M) -> Self
    where
        M: Fn(&mut C, &mut Context) -> Flow + Send + Sync + 'static,
    {
        let id = ActionId::new(&*self.bundle, &*self.controller, action);
        let boxed = ControllerAction::boxed(Arc::clone(&self.factory), handler);
        self.table.insert(method, path, id, boxed);
        self
    }

    pub fn get<M>(self, path: &str, action: &str, handler: M) -> Self
    where
        M: Fn(&mut C, &mut Context) -> Flow + Send + Sync + 'static,
    {
        self.on(Method::GET, path, action, handler)
    }

    pub fn post<M>(self, path: &str, action: &str, handler: M) -> Self
    where
        M: Fn(&mut C, &mut Context) -> Flow + Send + Sync + 'static,
    {
        self.on(Method::POST, path, action, handler)
    }

    pub fn put<M>(self, path: &str, action: &str, handler: M) -> Self
    where
        M: Fn(&mut C, &mut Context) -> Flow + Send + Sync + 'static,
    {
        self.on(Method::PUT, path, action, handler)
    }

    pub fn delete<M>(self, path: &str, action: &str, handler: M) -> Self
    where
        M: Fn(&mut C, &mut Context) -> Flow + Send + Sync + 'static,
    {
        self.on(Method::DELETE, path, action, handler)
    }
}
