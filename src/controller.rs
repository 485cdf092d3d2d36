//! Controllers and type-erased actions.
//!
//! # How actions are stored
//!
//! A bundle registers a controller type together with a factory and a set of
//! named methods. The route table must hold actions of *different*
//! controller types side by side, so each `(factory, method)` pair is erased
//! behind [`ErasedAction`]:
//!
//! ```text
//! routes.controller("Posts", Posts::default)          ← bundle writes this
//!       .get("/posts/{id}", "show", Posts::show)
//!        ↓
//! Arc::new(ControllerAction { factory, method })     ← one per route
//!        ↓  stored as BoxedAction = Arc<dyn ErasedAction>
//! action.invoke(&mut ctx)  at request time           ← one vtable dispatch
//!        ↓
//! let mut c = factory(); Posts::show(&mut c, ctx)    ← fresh controller per request
//! ```
//!
//! The request context is handed to the method as an explicit argument;
//! controllers never hold it.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::binding::BindingScope;
use crate::context::Context;
use crate::flow::Flow;

// ── ActionId ─────────────────────────────────────────────────────────────────

/// Fully qualified action name: `bundle.Controller.action`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ActionId {
    bundle: String,
    controller: String,
    action: String,
}

impl ActionId {
    pub fn new(bundle: impl Into<String>, controller: impl Into<String>, action: impl Into<String>) -> Self {
        Self { bundle: bundle.into(), controller: controller.into(), action: action.into() }
    }

    /// Parses `bundle.Controller.action`. All three segments must be non-empty.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, '.');
        let (b, c, a) = (parts.next()?, parts.next()?, parts.next()?);
        if b.is_empty() || c.is_empty() || a.is_empty() || a.contains('.') {
            return None;
        }
        Some(Self::new(b, c, a))
    }

    pub fn bundle(&self) -> &str { &self.bundle }
    pub fn controller(&self) -> &str { &self.controller }
    pub fn action(&self) -> &str { &self.action }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.bundle, self.controller, self.action)
    }
}

// ── Controller ───────────────────────────────────────────────────────────────

/// Implemented by every controller type.
///
/// ```rust
/// use satchel::{BindingScope, Context, Controller, Flow};
///
/// #[derive(Default)]
/// struct Posts;
///
/// impl Controller for Posts {
///     fn bind_middleware(scope: &mut BindingScope<'_>) {
///         scope.set("auth.Guard").only(&["edit"]);
///     }
/// }
///
/// impl Posts {
///     fn edit(&mut self, ctx: &mut Context) -> Flow {
///         ctx.write_str("editing");
///         Ok(())
///     }
/// }
/// ```
pub trait Controller: Send + 'static {
    /// Controller-level middleware bindings, applied after the bundle's own
    /// and merged with them. The default binds nothing.
    fn bind_middleware(_scope: &mut BindingScope<'_>) {}
}

// ── Type erasure ─────────────────────────────────────────────────────────────

/// Internal dispatch interface for one routed action.
pub(crate) trait ErasedAction: Send + Sync {
    fn invoke(&self, ctx: &mut Context) -> Flow;
}

/// A type-erased action shared by every request that matches its route.
pub(crate) type BoxedAction = Arc<dyn ErasedAction>;

/// Builds a controller instance. Shared by all actions of one controller.
pub(crate) type SharedFactory<C> = Arc<dyn Fn() -> C + Send + Sync>;

/// Bridges a typed `(factory, method)` pair to [`ErasedAction`].
pub(crate) struct ControllerAction<C, M> {
    factory: SharedFactory<C>,
    method: M,
    _controller: PhantomData<fn() -> C>,
}

impl<C, M> ControllerAction<C, M>
where
    C: Controller,
    M: Fn(&mut C, &mut Context) -> Flow + Send + Sync + 'static,
{
    pub(crate) fn boxed(factory: SharedFactory<C>, method: M) -> BoxedAction {
        Arc::new(Self { factory, method, _controller: PhantomData })
    }
}

impl<C, M> ErasedAction for ControllerAction<C, M>
where
    C: Controller,
    M: Fn(&mut C, &mut Context) -> Flow + Send + Sync,
{
    fn invoke(&self, ctx: &mut Context) -> Flow {
        let mut controller = (self.factory)();
        (self.method)(&mut controller, ctx)
    }
}
