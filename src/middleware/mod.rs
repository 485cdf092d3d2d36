//! Middleware layer.
//!
//! Middleware intercepts an action before and after it runs, and is the
//! right place for cross-cutting concerns: authentication, per-request
//! view data, timing, debug toolbars.
//!
//! A middleware is one of three shapes, a closed set:
//!
//! | Variant | Runs in | Shape |
//! |---|---|---|
//! | [`Middleware::Handler`] | pre-action phase | a [`BeforeAction`] value |
//! | [`Middleware::Callback`] | pre-action phase | a bare `Fn(&mut Context) -> Flow` |
//! | [`Middleware::Terminate`] | post-action phase | an [`AfterAction`] value |
//!
//! Both phases walk an action's bound middleware in the **same** order.
//! The post phase is not a reversed unwind.
//!
//! Middleware is registered as a service under its name, so each request
//! resolves (and caches) its own instances in the request registry. A name
//! that resolves to anything other than a [`Middleware`] is a wiring bug and
//! fails the request with a message naming the middleware and the action.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::context::Context;
use crate::controller::ActionId;
use crate::error::{ConfigError, Error};
use crate::flow::Flow;
use crate::registry::ServiceRegistry;

/// Runs before the action. May mutate the context, return early or redirect.
pub trait BeforeAction: Send + Sync + 'static {
    fn handle(&self, ctx: &mut Context) -> Flow;
}

/// Runs after the action, once it completed without halting.
pub trait AfterAction: Send + Sync + 'static {
    fn terminate(&self, ctx: &mut Context) -> Flow;
}

/// Signature of a [`Middleware::Callback`].
pub type MiddlewareFn = dyn Fn(&mut Context) -> Flow + Send + Sync;

/// A resolved middleware instance.
#[derive(Clone)]
pub enum Middleware {
    Handler(Arc<dyn BeforeAction>),
    Callback(Arc<MiddlewareFn>),
    Terminate(Arc<dyn AfterAction>),
}

impl Middleware {
    pub fn handler(h: impl BeforeAction) -> Self {
        Self::Handler(Arc::new(h))
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&mut Context) -> Flow + Send + Sync + 'static,
    {
        Self::Callback(Arc::new(f))
    }

    pub fn terminate(t: impl AfterAction) -> Self {
        Self::Terminate(Arc::new(t))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handler(_) => "handler",
            Self::Callback(_) => "callback",
            Self::Terminate(_) => "terminate",
        }
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Middleware").field(&self.kind()).finish()
    }
}

/// An action's middleware, resolved for one request.
pub(crate) struct Chain {
    entries: Vec<(String, Middleware)>,
}

impl Chain {
    /// Resolves `names` against the request registry, caching each instance
    /// there so both phases (and any service asking again) see the same one.
    pub(crate) fn resolve(registry: &ServiceRegistry, names: &[String], action: &ActionId) -> Result<Self, Error> {
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let svc = registry.resolve_cached_service(name).map_err(|e| match e {
                Error::ServiceNotFound(_) => Error::Config(ConfigError::UnknownMiddleware {
                    middleware: name.clone(),
                    action: action.to_string(),
                }),
                other => other,
            })?;
            let mw = svc.downcast::<Middleware>().map_err(|_| ConfigError::NotMiddleware {
                middleware: name.clone(),
                action: action.to_string(),
            })?;
            entries.push((name.clone(), Middleware::clone(&mw)));
        }
        Ok(Self { entries })
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Pre-action phase. Stops at the first halt.
    pub(crate) fn run_before(&self, ctx: &mut Context) -> Flow {
        for (name, mw) in &self.entries {
            match mw {
                Middleware::Handler(h) => {
                    trace!(middleware = %name, "before");
                    h.handle(ctx)?;
                }
                Middleware::Callback(f) => {
                    trace!(middleware = %name, "before");
                    f(ctx)?;
                }
                Middleware::Terminate(_) => {}
            }
        }
        Ok(())
    }

    /// Post-action phase, in the same order as [`run_before`](Self::run_before).
    pub(crate) fn run_after(&self, ctx: &mut Context) -> Flow {
        for (name, mw) in &self.entries {
            if let Middleware::Terminate(t) = mw {
                trace!(middleware = %name, "terminate");
                t.terminate(ctx)?;
            }
        }
        Ok(())
    }
}
