//! # satchel
//!
//! A bundle-based HTTP server framework.
//!
//! An application is a list of independently written **bundles**. Each one
//! contributes service factories, controllers with their routes, named
//! middleware and middleware bindings. satchel boots them in five fixed
//! phases and then dispatches every request through the same pipeline:
//!
//! ```text
//! Matching → PreMiddleware → Action → PostMiddleware → Flush → Trailer
//! ```
//!
//! ## What satchel owns
//!
//! - A three-tier service registry: process, session and request. Each
//!   request resolves services through its own tier, so per-request
//!   singletons never leak between requests.
//! - Ordered middleware. Pre-action and post-action middleware run in the
//!   same per-action order, fixed at boot.
//! - Early exits as values: middleware and actions return a [`Flow`]. A
//!   [`Halt`] stops the pipeline with a `Return`, a `Redirect` or a failure;
//!   the trailer (deferred callbacks, session persistence) always runs.
//!
//! ## What satchel delegates
//!
//! Route matching ([`matchit`]), templates ([`minijinja`]), session storage
//! ([`SessionStore`]), not-found and static-file handling. Each is consumed
//! through a narrow trait and can be swapped on the [`AppBuilder`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use satchel::{AppBuilder, AppConfig, Bundle, Context, Controller, Error, Flow, Routes, Server};
//!
//! #[derive(Default)]
//! struct Users;
//!
//! impl Controller for Users {}
//!
//! impl Users {
//!     fn show(&mut self, ctx: &mut Context) -> Flow {
//!         let id = ctx.param("id").unwrap_or("unknown").to_owned();
//!         ctx.with("id", id)?;
//!         Ok(())
//!     }
//! }
//!
//! struct Accounts;
//!
//! impl Bundle for Accounts {
//!     fn name(&self) -> &str { "accounts" }
//!
//!     fn register_routes(&self, routes: &mut Routes<'_>) -> Result<(), Error> {
//!         routes.controller("Users", Users::default).get("/users/{id}", "show", Users::show);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let app = AppBuilder::new(AppConfig::load_or_default("app.yml"))
//!         .bundle(Accounts)
//!         .build()?;
//!     Server::bind("0.0.0.0:3000").await?.serve(app).await
//! }
//! ```

mod app;
mod binding;
mod bundle;
mod config;
mod context;
mod controller;
mod dispatch;
mod error;
mod fallback;
mod flow;
mod registry;
mod request;
mod response;
mod router;
mod server;
mod session;
mod view;

pub mod middleware;

pub use app::{App, AppBuilder, Bootstrap, Phase};
pub use binding::{BindingScope, Bindings, Selector};
pub use bundle::{Bundle, Middlewares, SVC_REQUEST, SVC_SESSION, SVC_SESSION_REGISTRY, Services};
pub use config::AppConfig;
pub use context::{Context, MSG_HEADER, Template};
pub use controller::{ActionId, Controller};
pub use error::{ConfigError, Error};
pub use fallback::{DefaultNotFound, FileHandler, NoFiles, NotFoundHandler, StaticFiles};
pub use flow::{Flow, Halt, Redirect};
pub use middleware::{AfterAction, BeforeAction, Middleware};
pub use registry::{Factory, Service, ServiceRegistry, Tier};
pub use request::Request;
pub use response::{ContentType, Response};
pub use router::{ControllerRoutes, Route, RouteTable, Routes};
pub use server::Server;
pub use session::{MemorySessionStore, Session, SessionStore, SessionValue};
pub use view::{JinjaViews, ViewRenderer};
