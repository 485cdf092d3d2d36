#![allow(dead_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use satchel::{
    AfterAction, App, AppBuilder, AppConfig, BeforeAction, BindingScope, Bundle, Context, Controller, Error, Flow,
    Halt, MemorySessionStore, Middleware, Middlewares, Routes, Services, Session, SessionStore, SessionValue,
};
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context as LayerContext, Layer, SubscriberExt};
use tracing_subscriber::registry::Registry;

// ── Log capture ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct Record {
    pub level: Level,
    pub fields: HashMap<String, String>,
}

impl Record {
    pub fn field(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or("")
    }
}

/// Collects every event emitted on the current thread while installed.
#[derive(Clone, Default)]
pub struct Capture {
    records: Arc<Mutex<Vec<Record>>>,
}

impl Capture {
    pub fn at(&self, level: Level) -> Vec<Record> {
        self.records.lock().iter().filter(|r| r.level == level).cloned().collect()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl<S: Subscriber> Layer<S> for Capture {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let mut fields = Fields::default();
        event.record(&mut fields);
        self.records.lock().push(Record { level: *event.metadata().level(), fields: fields.0 });
    }
}

#[derive(Default)]
struct Fields(HashMap<String, String>);

impl Visit for Fields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_owned(), value.to_owned());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_owned(), format!("{value:?}"));
    }
}

pub fn capture() -> (Capture, DefaultGuard) {
    let capture = Capture::default();
    let guard = tracing::subscriber::set_default(Registry::default().with(capture.clone()));
    (capture, guard)
}

// ── Session store ────────────────────────────────────────────────────────────

/// In-memory store that counts `persist` calls.
pub struct CountingStore {
    inner: MemorySessionStore,
    persists: Arc<AtomicUsize>,
}

impl SessionStore for CountingStore {
    fn open(&self, requested: Option<&str>) -> (String, bool) {
        self.inner.open(requested)
    }

    fn get_data(&self, id: &str, key: &str) -> Option<SessionValue> {
        self.inner.get_data(id, key)
    }

    fn set_data(&self, id: &str, key: &str, value: SessionValue) {
        self.inner.set_data(id, key, value);
    }

    fn remove_data(&self, id: &str, key: &str) -> Option<SessionValue> {
        self.inner.remove_data(id, key)
    }

    fn get_or_insert_with(&self, id: &str, key: &str, init: &mut dyn FnMut() -> SessionValue) -> SessionValue {
        self.inner.get_or_insert_with(id, key, init)
    }

    fn persist(&self, session: &Session) -> Result<(), Error> {
        self.persists.fetch_add(1, Ordering::SeqCst);
        self.inner.persist(session)
    }
}

// ── Test bundle ──────────────────────────────────────────────────────────────

pub type Log = Arc<Mutex<Vec<String>>>;

/// Pre-action middleware that records its name.
struct Pre {
    name: &'static str,
    log: Log,
}

impl BeforeAction for Pre {
    fn handle(&self, _ctx: &mut Context) -> Flow {
        self.log.lock().push(format!("pre:{}", self.name));
        Ok(())
    }
}

/// Post-action middleware that records its name.
struct Post {
    name: &'static str,
    log: Log,
}

impl AfterAction for Post {
    fn terminate(&self, _ctx: &mut Context) -> Flow {
        self.log.lock().push(format!("post:{}", self.name));
        Ok(())
    }
}

/// Registers a deferred callback, then ends the request early.
struct Bouncer {
    log: Log,
}

impl BeforeAction for Bouncer {
    fn handle(&self, ctx: &mut Context) -> Flow {
        self.log.lock().push("pre:bouncer".to_owned());
        let log = Arc::clone(&self.log);
        ctx.defer(move |_| log.lock().push("defer".to_owned()));
        ctx.with("partial", true)?;
        Err(Halt::Return)
    }
}

#[derive(Debug)]
pub struct Token(pub usize);

struct Posts {
    log: Log,
}

impl Controller for Posts {
    fn bind_middleware(scope: &mut BindingScope<'_>) {
        scope.set("blog.second").only(&["show"]);
        scope.set("blog.after2").only(&["show"]);
    }
}

impl Posts {
    fn show(&mut self, ctx: &mut Context) -> Flow {
        self.log.lock().push("action".to_owned());
        let id = ctx.param("id").unwrap_or_default().to_owned();
        ctx.with("id", id)?;
        Ok(())
    }

    fn guarded(&mut self, _ctx: &mut Context) -> Flow {
        self.log.lock().push("action".to_owned());
        Ok(())
    }

    fn away(&mut self, ctx: &mut Context) -> Flow {
        ctx.with("discarded", true)?;
        ctx.write_str("also discarded");
        ctx.redirect("/login")
    }

    fn fail(&mut self, ctx: &mut Context) -> Flow {
        ctx.write_str("<p>partial</p>");
        Err(Error::handler("database on fire").into())
    }

    fn boom(&mut self, _ctx: &mut Context) -> Flow {
        panic!("controller exploded");
    }

    fn tokens(&mut self, ctx: &mut Context) -> Flow {
        let a = ctx.get_cached::<Token>("blog.token")?;
        let b = ctx.get_cached::<Token>("blog.token")?;
        let c = ctx.get_new::<Token>("blog.token")?;
        let d = ctx.get_new::<Token>("blog.token")?;
        ctx.with("cached_same", Arc::ptr_eq(&a, &b))?;
        ctx.with("new_distinct", !Arc::ptr_eq(&c, &d))?;
        ctx.with("cached", a.0)?;
        Ok(())
    }

    fn touch(&mut self, ctx: &mut Context) -> Flow {
        let session = ctx.session()?;
        ctx.with("session", session.id())?;
        Ok(())
    }

    fn shared(&mut self, ctx: &mut Context) -> Flow {
        let reg = ctx.session_registry()?;
        ctx.with("registry", Arc::as_ptr(&reg) as usize)?;
        Ok(())
    }

    fn page(&mut self, ctx: &mut Context) -> Flow {
        ctx.with("title", "Hello <world>")?;
        ctx.view();
        Ok(())
    }

    fn shaky(&mut self, ctx: &mut Context) -> Flow {
        ctx.session()?;
        let log = Arc::clone(&self.log);
        ctx.defer(|_| panic!("cleanup exploded"));
        ctx.defer(move |_| log.lock().push("defer:after".to_owned()));
        ctx.with("ok", true)?;
        Ok(())
    }

    fn slow(&mut self, ctx: &mut Context) -> Flow {
        thread::sleep(Duration::from_millis(1500));
        ctx.with("late", true)?;
        Ok(())
    }

    fn lost(&mut self, ctx: &mut Context) -> Flow {
        ctx.redirect("/next\r\nx-injected: 1")
    }
}

/// A bundle exercising every pipeline path. Shared state is exposed so
/// tests can observe it.
#[derive(Clone, Default)]
pub struct Blog {
    pub log: Log,
    pub tokens: Arc<AtomicUsize>,
    pub closed: Arc<AtomicBool>,
    pub booted: Arc<AtomicBool>,
    pub persists: Arc<AtomicUsize>,
}

impl Bundle for Blog {
    fn name(&self) -> &str {
        "blog"
    }

    fn register_services(&self, services: &mut Services<'_>) -> Result<(), Error> {
        let tokens = Arc::clone(&self.tokens);
        services.register("blog.token", move |_| Ok(Token(tokens.fetch_add(1, Ordering::SeqCst))))?;
        Ok(())
    }

    fn register_routes(&self, routes: &mut Routes<'_>) -> Result<(), Error> {
        let log = Arc::clone(&self.log);
        routes
            .controller("Posts", move || Posts { log: Arc::clone(&log) })
            .get("/posts/{id}", "show", Posts::show)
            .get("/guarded", "guarded", Posts::guarded)
            .get("/away", "away", Posts::away)
            .get("/fail", "fail", Posts::fail)
            .get("/boom", "boom", Posts::boom)
            .get("/tokens", "tokens", Posts::tokens)
            .get("/touch", "touch", Posts::touch)
            .get("/shared", "shared", Posts::shared)
            .get("/page", "page", Posts::page)
            .get("/shaky", "shaky", Posts::shaky)
            .get("/slow", "slow", Posts::slow)
            .get("/lost", "lost", Posts::lost);
        Ok(())
    }

    fn register_middleware(&self, mw: &mut Middlewares<'_>) -> Result<(), Error> {
        let pre = |name: &'static str, log: &Log| {
            let log = Arc::clone(log);
            move || Pre { name, log: Arc::clone(&log) }
        };
        let post = |name: &'static str, log: &Log| {
            let log = Arc::clone(log);
            move || Post { name, log: Arc::clone(&log) }
        };
        let bouncer_log = Arc::clone(&self.log);
        let early_log = Arc::clone(&self.log);

        mw.handler("blog.first", pre("first", &self.log))?
            .handler("blog.second", pre("second", &self.log))?
            .handler("blog.late", pre("late", &self.log))?
            .terminate("blog.after1", post("after1", &self.log))?
            .terminate("blog.after2", post("after2", &self.log))?
            .handler("blog.bouncer", move || Bouncer { log: Arc::clone(&bouncer_log) })?
            .add("blog.session", 50, |_| {
                Ok(Middleware::callback(|ctx| {
                    ctx.session()?;
                    Ok(())
                }))
            })?
            .add("blog.early", 100, move |_| {
                let log = Arc::clone(&early_log);
                Ok(Middleware::callback(move |_| {
                    log.lock().push("pre:early".to_owned());
                    Ok(())
                }))
            })?;
        Ok(())
    }

    fn bind_middleware(&self, scope: &mut BindingScope<'_>) {
        scope.set("blog.first").only(&["show"]);
        scope.set("blog.after1").only(&["show", "guarded"]);
        // Bound last, runs first: higher priority.
        scope.set("blog.early").only(&["show"]);
        scope.set("blog.bouncer").only(&["guarded"]);
        scope.set("blog.late").only(&["guarded"]);
        scope.set("blog.session").only(&["guarded", "away", "fail"]);
    }

    fn boot(&self, app: &App) -> Result<(), Error> {
        app.registry().resolve::<Token>("blog.token")?;
        self.booted.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub fn app_with(config: AppConfig, blog: &Blog) -> App {
    let store = CountingStore { inner: MemorySessionStore::default(), persists: Arc::clone(&blog.persists) };
    AppBuilder::new(config).bundle(blog.clone()).session_store(store).build().expect("boot")
}

pub fn app(blog: &Blog) -> App {
    app_with(AppConfig::default(), blog)
}

pub fn json(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body).expect("json body")
}
