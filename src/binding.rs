//! Middleware bindings: which middleware runs for which action, in what order.
//!
//! Bindings are configured once, during boot, in two passes:
//!
//! 1. every bundle's [`Bundle::bind_middleware`](crate::Bundle::bind_middleware)
//!    with a scope covering the bundle's own controllers;
//! 2. every controller's [`Controller::bind_middleware`](crate::Controller::bind_middleware)
//!    with a scope covering that controller only.
//!
//! The second pass adds to (or, via [`BindingScope::unset`], prunes) the
//! first; it never replaces it wholesale.
//!
//! ```rust
//! # use satchel::BindingScope;
//! fn bind(scope: &mut BindingScope<'_>) {
//!     // every action of this bundle
//!     scope.set("auth.Guard").everywhere();
//!     // only two actions
//!     scope.set("csrf.Check").only(&["create", "update"]);
//!     // every bundle, except one controller
//!     scope.set("debug.Toolbar").all_bundles().except_controllers(&["Debug"]).everywhere();
//! }
//! ```
//!
//! The final order per action is by middleware priority (higher first, fixed
//! at registration), ties broken by the order bindings were made. The order
//! is frozen after boot.

use std::collections::HashMap;

use crate::controller::ActionId;
use crate::error::ConfigError;

/// Mutable binding state used while booting.
pub(crate) struct BindingBag {
    priorities: HashMap<String, i32>,
    actions: Vec<ActionId>,
    bound: HashMap<ActionId, Vec<String>>,
    errors: Vec<ConfigError>,
}

impl BindingBag {
    /// `priorities` is the middleware catalog, `actions` every routed action.
    pub(crate) fn new(priorities: HashMap<String, i32>, actions: Vec<ActionId>) -> Self {
        Self { priorities, actions, bound: HashMap::new(), errors: Vec::new() }
    }

    pub(crate) fn scope<'a>(&'a mut self, bundle: &'a str, controller: Option<&'a str>) -> BindingScope<'a> {
        BindingScope { bag: self, bundle, controller }
    }

    /// Freezes the bindings. The first wiring error wins.
    pub(crate) fn finish(mut self) -> Result<Bindings, ConfigError> {
        if !self.errors.is_empty() {
            return Err(self.errors.swap_remove(0));
        }
        let priorities = self.priorities;
        let mut per_action = self.bound;
        for names in per_action.values_mut() {
            // Stable: equal priorities keep binding order.
            names.sort_by_key(|n| std::cmp::Reverse(priorities.get(n).copied().unwrap_or(0)));
        }
        Ok(Bindings { per_action })
    }

    fn bind(&mut self, name: &str, target: &Target<'_>) {
        if !self.priorities.contains_key(name) {
            self.errors.push(ConfigError::UnknownMiddleware {
                middleware: name.to_owned(),
                action: target.describe(),
            });
            return;
        }
        for action in self.actions.iter().filter(|a| target.matches(a)) {
            let names = self.bound.entry(action.clone()).or_default();
            if !names.iter().any(|n| n == name) {
                names.push(name.to_owned());
            }
        }
    }

    fn unbind(&mut self, name: &str, target: &Target<'_>) {
        for (action, names) in self.bound.iter_mut() {
            if target.matches(action) {
                names.retain(|n| n != name);
            }
        }
    }
}

/// Which actions a binding applies to.
struct Target<'t> {
    bundle: Option<&'t str>,
    controller: Option<&'t str>,
    except_controllers: &'t [String],
    only: Option<&'t [&'t str]>,
    except: &'t [&'t str],
}

impl Target<'_> {
    fn matches(&self, a: &ActionId) -> bool {
        self.bundle.is_none_or(|b| b == a.bundle())
            && self.controller.is_none_or(|c| c == a.controller())
            && !self.except_controllers.iter().any(|c| c == a.controller())
            && self.only.is_none_or(|only| only.contains(&a.action()))
            && !self.except.contains(&a.action())
    }

    fn describe(&self) -> String {
        match (self.bundle, self.controller) {
            (Some(b), Some(c)) => format!("{b}.{c}"),
            (Some(b), None) => format!("{b}.*"),
            _ => "*".to_owned(),
        }
    }
}

// ── Public configuration surface ─────────────────────────────────────────────

/// The slice of the application a bundle or controller is configuring.
pub struct BindingScope<'a> {
    bag: &'a mut BindingBag,
    bundle: &'a str,
    controller: Option<&'a str>,
}

impl<'a> BindingScope<'a> {
    pub fn bundle(&self) -> &str {
        self.bundle
    }

    /// `None` while the bundle-level pass runs.
    pub fn controller(&self) -> Option<&str> {
        self.controller
    }

    /// Starts binding middleware `name`. Nothing is bound until one of the
    /// selector's terminal methods runs.
    pub fn set(&mut self, name: &str) -> Selector<'_> {
        Selector {
            bag: &mut *self.bag,
            name: name.to_owned(),
            bundle: Some(self.bundle.to_owned()),
            controller: self.controller.map(str::to_owned),
            except_controllers: Vec::new(),
        }
    }

    /// Removes `name` from every action in this scope, undoing a broader binding.
    pub fn unset(&mut self, name: &str) -> &mut Self {
        let target = Target {
            bundle: Some(self.bundle),
            controller: self.controller,
            except_controllers: &[],
            only: None,
            except: &[],
        };
        self.bag.unbind(name, &target);
        self
    }
}

/// Chooses the actions a middleware binds to.
#[must_use = "a selector binds nothing until `everywhere`, `only` or `except` is called"]
pub struct Selector<'s> {
    bag: &'s mut BindingBag,
    name: String,
    bundle: Option<String>,
    controller: Option<String>,
    except_controllers: Vec<String>,
}

impl Selector<'_> {
    /// Widens the selection from the current bundle (or controller) to every bundle.
    pub fn all_bundles(mut self) -> Self {
        self.bundle = None;
        self.controller = None;
        self
    }

    pub fn except_controllers(mut self, controllers: &[&str]) -> Self {
        self.except_controllers.extend(controllers.iter().map(|c| (*c).to_owned()));
        self
    }

    /// Binds to every selected action.
    pub fn everywhere(self) {
        self.apply(None, &[]);
    }

    /// Binds to the selected actions named in `actions`.
    pub fn only(self, actions: &[&str]) {
        self.apply(Some(actions), &[]);
    }

    /// Binds to every selected action except those named in `actions`.
    pub fn except(self, actions: &[&str]) {
        self.apply(None, actions);
    }

    fn apply(self, only: Option<&[&str]>, except: &[&str]) {
        let target = Target {
            bundle: self.bundle.as_deref(),
            controller: self.controller.as_deref(),
            except_controllers: &self.except_controllers,
            only,
            except,
        };
        self.bag.bind(&self.name, &target);
    }
}

// ── Frozen result ────────────────────────────────────────────────────────────

/// Per-action middleware order, fixed after boot.
#[derive(Debug, Default)]
pub struct Bindings {
    per_action: HashMap<ActionId, Vec<String>>,
}

impl Bindings {
    /// Middleware names bound to `action`, in execution order.
    pub fn for_action(&self, action: &ActionId) -> &[String] {
        self.per_action.get(action).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bag(middleware: &[(&str, i32)]) -> BindingBag {
        let priorities = middleware.iter().map(|(n, p)| ((*n).to_owned(), *p)).collect();
        let actions = vec![
            ActionId::new("blog", "Posts", "index"),
            ActionId::new("blog", "Posts", "edit"),
            ActionId::new("blog", "Admin", "index"),
            ActionId::new("shop", "Cart", "show"),
        ];
        BindingBag::new(priorities, actions)
    }

    fn names<'a>(b: &'a Bindings, id: &str) -> Vec<&'a str> {
        b.for_action(&ActionId::parse(id).unwrap()).iter().map(String::as_str).collect()
    }

    #[test]
    fn bundle_scope_covers_only_its_bundle() {
        let mut bag = bag(&[("auth", 0)]);
        bag.scope("blog", None).set("auth").everywhere();
        let b = bag.finish().unwrap();
        assert_eq!(names(&b, "blog.Posts.index"), ["auth"]);
        assert_eq!(names(&b, "blog.Admin.index"), ["auth"]);
        assert!(names(&b, "shop.Cart.show").is_empty());
    }

    #[test]
    fn controller_bindings_merge_with_bundle_bindings() {
        let mut bag = bag(&[("log", 0), ("auth", 0)]);
        bag.scope("blog", None).set("log").everywhere();
        bag.scope("blog", Some("Posts")).set("auth").only(&["edit"]);
        let b = bag.finish().unwrap();
        assert_eq!(names(&b, "blog.Posts.edit"), ["log", "auth"]);
        assert_eq!(names(&b, "blog.Posts.index"), ["log"]);
        assert_eq!(names(&b, "blog.Admin.index"), ["log"]);
    }

    #[test]
    fn controller_can_unset_a_bundle_binding() {
        let mut bag = bag(&[("log", 0)]);
        bag.scope("blog", None).set("log").everywhere();
        bag.scope("blog", Some("Admin")).unset("log");
        let b = bag.finish().unwrap();
        assert_eq!(names(&b, "blog.Posts.index"), ["log"]);
        assert!(names(&b, "blog.Admin.index").is_empty());
    }

    #[test]
    fn all_bundles_with_exceptions() {
        let mut bag = bag(&[("debug", 0)]);
        bag.scope("shop", None).set("debug").all_bundles().except_controllers(&["Admin"]).everywhere();
        let b = bag.finish().unwrap();
        assert_eq!(names(&b, "blog.Posts.index"), ["debug"]);
        assert_eq!(names(&b, "shop.Cart.show"), ["debug"]);
        assert!(names(&b, "blog.Admin.index").is_empty());
    }

    #[test]
    fn except_skips_named_actions() {
        let mut bag = bag(&[("auth", 0)]);
        bag.scope("blog", Some("Posts")).set("auth").except(&["index"]);
        let b = bag.finish().unwrap();
        assert_eq!(names(&b, "blog.Posts.edit"), ["auth"]);
        assert!(names(&b, "blog.Posts.index").is_empty());
    }

    #[test]
    fn priority_orders_before_binding_order() {
        let mut bag = bag(&[("late", -100), ("a", 0), ("b", 0), ("early", 10_000)]);
        {
            let mut scope = bag.scope("blog", None);
            scope.set("late").everywhere();
            scope.set("a").everywhere();
            scope.set("b").everywhere();
            scope.set("early").everywhere();
        }
        let b = bag.finish().unwrap();
        assert_eq!(names(&b, "blog.Posts.index"), ["early", "a", "b", "late"]);
    }

    #[test]
    fn duplicate_bindings_collapse() {
        let mut bag = bag(&[("auth", 0)]);
        bag.scope("blog", None).set("auth").everywhere();
        bag.scope("blog", Some("Posts")).set("auth").everywhere();
        let b = bag.finish().unwrap();
        assert_eq!(names(&b, "blog.Posts.index"), ["auth"]);
    }

    #[test]
    fn unknown_middleware_fails_boot() {
        let mut bag = bag(&[]);
        bag.scope("blog", Some("Posts")).set("ghost").everywhere();
        let err = bag.finish().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownMiddleware { ref middleware, ref action }
                if middleware == "ghost" && action == "blog.Posts"
        ));
    }
}
