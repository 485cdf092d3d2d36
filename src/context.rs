//! The per-request context.
//!
//! A [`Context`] is created once a route matched and lives until the trailer
//! phase ends. It owns:
//!
//! - the request, the route parameters and the resolved [`ActionId`];
//! - the request-tier [`ServiceRegistry`];
//! - the output: status, headers, raw body bytes, and the accumulated
//!   `data` map that the flush step renders as a template or JSON;
//! - the deferred callbacks the trailer runs.
//!
//! Middleware and actions talk to the framework exclusively through it.

use std::any::Any;
use std::cell::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::header::{CONTENT_TYPE, LOCATION, SET_COOKIE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::bundle::{SVC_SESSION, SVC_SESSION_REGISTRY};
use crate::config::AppConfig;
use crate::controller::ActionId;
use crate::dispatch::recover;
use crate::error::{ConfigError, Error};
use crate::flow::{Flow, Halt, Redirect};
use crate::registry::ServiceRegistry;
use crate::request::Request;
use crate::response::{ContentType, Response};
use crate::session::Session;
use crate::view::ViewRenderer;

/// Response header carrying the kind of a flash message (`info`, `danger`, …).
pub const MSG_HEADER: &str = "x-satchel-msg";

type Deferred = Box<dyn FnOnce(&Context) + Send>;

/// Template chosen for the flush step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Template {
    pub dir: PathBuf,
    pub name: String,
}

pub struct Context {
    request: Arc<Request>,
    params: HashMap<String, String>,
    action: ActionId,
    registry: ServiceRegistry,
    config: Arc<AppConfig>,
    started: Instant,

    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    data: Map<String, Value>,
    template: Option<Template>,
    // Set once the data map was serialized as JSON; later flushes are no-ops.
    used: bool,
    defers: Vec<Deferred>,

    query: OnceCell<Vec<(String, String)>>,
    form: OnceCell<Vec<(String, String)>>,
}

impl Context {
    pub(crate) fn new(
        request: Arc<Request>,
        params: HashMap<String, String>,
        action: ActionId,
        registry: ServiceRegistry,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            request,
            params,
            action,
            registry,
            config,
            started: Instant::now(),
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Vec::new(),
            data: Map::new(),
            template: None,
            used: false,
            defers: Vec::new(),
            query: OnceCell::new(),
            form: OnceCell::new(),
        }
    }

    // ── request side ─────────────────────────────────────────────────────────

    pub fn request(&self) -> &Request { &self.request }
    pub fn method(&self) -> &Method { self.request.method() }
    pub fn path(&self) -> &str { self.request.path() }
    pub fn action(&self) -> &ActionId { &self.action }
    pub fn config(&self) -> &AppConfig { &self.config }
    pub fn started(&self) -> Instant { self.started }

    pub(crate) fn shared_request(&self) -> Arc<Request> {
        Arc::clone(&self.request)
    }

    /// A route parameter, e.g. `id` for `/posts/{id}`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    /// URL query pairs followed by the route parameters. Parsed once.
    pub fn query_pairs(&self) -> &[(String, String)] {
        self.query.get_or_init(|| {
            let raw = self.request.query_string().unwrap_or("");
            with_params(url::form_urlencoded::parse(raw.as_bytes()).into_owned().collect(), &self.params)
        })
    }

    /// First query value for `name` (route parameters included).
    pub fn query(&self, name: &str) -> Option<&str> {
        first(self.query_pairs(), name)
    }

    /// URL-encoded body pairs followed by the route parameters. Parsed once.
    pub fn form_pairs(&self) -> &[(String, String)] {
        self.form.get_or_init(|| {
            let urlencoded = self
                .request
                .header_str(CONTENT_TYPE.as_str())
                .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
            let pairs = if urlencoded {
                url::form_urlencoded::parse(self.request.bytes()).into_owned().collect()
            } else {
                Vec::new()
            };
            with_params(pairs, &self.params)
        })
    }

    /// First form value for `name` (route parameters included).
    pub fn form(&self, name: &str) -> Option<&str> {
        first(self.form_pairs(), name)
    }

    // ── services ─────────────────────────────────────────────────────────────

    /// The request-tier registry.
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Resolves a service without caching it.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>, Error> {
        self.registry.resolve(key)
    }

    /// Resolves a service once for this request.
    pub fn get_cached<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>, Error> {
        self.registry.resolve_cached(key)
    }

    /// Always builds a fresh instance.
    pub fn get_new<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>, Error> {
        self.registry.resolve_new(key)
    }

    /// Publishes a request-scoped instance.
    pub fn publish<T: Any + Send + Sync>(&self, key: &str, value: T) -> Result<(), ConfigError> {
        self.registry.publish(key, value)
    }

    /// This request's session handle. Using it makes the trailer persist it.
    pub fn session(&self) -> Result<Arc<Session>, Error> {
        self.registry.resolve_cached(SVC_SESSION)
    }

    /// The session-tier registry, created on first use per session.
    pub fn session_registry(&self) -> Result<Arc<ServiceRegistry>, Error> {
        self.registry.resolve_cached(SVC_SESSION_REGISTRY)
    }

    // ── output ───────────────────────────────────────────────────────────────

    /// Adds `value` to the output data. Existing keys are never overwritten.
    pub fn with(&mut self, name: &str, value: impl Serialize) -> Result<(), Error> {
        if self.data.contains_key(name) {
            return Err(Error::DataExists(name.to_owned()));
        }
        self.data.insert(name.to_owned(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// Serializes `value` as JSON into the body right away.
    pub fn json(&mut self, value: &impl Serialize) -> Result<(), Error> {
        serde_json::to_writer(&mut self.body, value)?;
        self.set_content_type(ContentType::Json);
        Ok(())
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    pub fn write_str(&mut self, s: &str) {
        self.write(s.as_bytes());
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Replaces header `name`. Invalid names or values are dropped with a warning.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => warn!(header = name, "dropping invalid response header"),
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn set_cookie(&mut self, name: &str, value: &str, max_age: Duration) {
        let cookie = format!("{name}={value}; Path=/; Max-Age={}", max_age.as_secs());
        self.append_cookie(&cookie);
    }

    fn append_cookie(&mut self, cookie: &str) {
        match HeaderValue::try_from(cookie) {
            Ok(v) => {
                self.headers.append(SET_COOKIE, v);
            }
            Err(_) => warn!("dropping invalid cookie"),
        }
    }

    fn set_content_type(&mut self, ct: ContentType) {
        self.headers.insert(CONTENT_TYPE, HeaderValue::from_static(ct.as_str()));
    }

    // ── views ────────────────────────────────────────────────────────────────

    /// Selects the template named after the action (first letter lower-cased)
    /// in the action's own bundle.
    pub fn view(&mut self) -> &mut Self {
        let name = lower_first(self.action.action());
        let bundle = self.action.bundle().to_owned();
        self.view_bundle(&bundle, &name)
    }

    /// Selects template `name` in the action's bundle.
    pub fn view_named(&mut self, name: &str) -> &mut Self {
        let bundle = self.action.bundle().to_owned();
        self.view_bundle(&bundle, name)
    }

    /// Selects template `name` in another bundle's view directory.
    pub fn view_bundle(&mut self, bundle: &str, name: &str) -> &mut Self {
        self.template = Some(Template { dir: self.config.view_dir(bundle), name: name.to_owned() });
        self
    }

    pub fn template(&self) -> Option<&Template> {
        self.template.as_ref()
    }

    // ── messages ─────────────────────────────────────────────────────────────

    pub fn danger(&mut self, msg: &str) -> Result<(), Error> { self.msg(msg, "danger") }
    pub fn info(&mut self, msg: &str) -> Result<(), Error> { self.msg(msg, "info") }
    pub fn success(&mut self, msg: &str) -> Result<(), Error> { self.msg(msg, "success") }
    pub fn warning(&mut self, msg: &str) -> Result<(), Error> { self.msg(msg, "warning") }

    /// Flags the response as a message of kind `kind` and adds it to the data
    /// under `msg`.
    pub fn msg(&mut self, msg: &str, kind: &str) -> Result<(), Error> {
        self.set_header(MSG_HEADER, kind);
        self.with("msg", serde_json::json!({ "type": kind, "content": msg }))
    }

    // ── control ──────────────────────────────────────────────────────────────

    /// Registers `f` to run in the trailer phase, whatever the outcome.
    pub fn defer(&mut self, f: impl FnOnce(&Context) + Send + 'static) {
        self.defers.push(Box::new(f));
    }

    /// `Err(Halt::redirect(location))`, for `return ctx.redirect("/login")`.
    pub fn redirect(&self, location: &str) -> Flow {
        Err(Halt::redirect(location))
    }

    // ── pipeline steps (driven by the dispatcher) ────────────────────────────

    /// Emits the accumulated output: the selected template, else the data as
    /// JSON, once.
    pub(crate) fn flush(&mut self, views: &dyn ViewRenderer) -> Result<(), Error> {
        if let Some(tpl) = &self.template {
            let data = Value::Object(self.data.clone());
            views.render(&mut self.body, &tpl.dir, &tpl.name, &data)?;
            if !self.headers.contains_key(CONTENT_TYPE) {
                self.set_content_type(ContentType::Html);
            }
        } else if !self.data.is_empty() && !self.used {
            serde_json::to_writer(&mut self.body, &self.data)?;
            self.set_content_type(ContentType::Json);
            self.used = true;
        }
        Ok(())
    }

    /// Replaces the output with a redirect. Headers already set stay. A
    /// location that cannot be sent as a header leaves the output untouched.
    pub(crate) fn apply_redirect(&mut self, redirect: &Redirect) -> Result<(), Error> {
        let location = HeaderValue::try_from(redirect.location.as_str())
            .map_err(|_| Error::InvalidRedirect(redirect.location.clone()))?;
        self.body.clear();
        self.data.clear();
        self.template = None;
        self.status = redirect.status;
        self.headers.remove(CONTENT_TYPE);
        self.headers.insert(LOCATION, location);
        Ok(())
    }

    /// Appends an error page after whatever was already written.
    pub(crate) fn apply_error_page(&mut self, page: &str) {
        self.status = StatusCode::INTERNAL_SERVER_ERROR;
        self.template = None;
        self.set_content_type(ContentType::Html);
        self.body.extend_from_slice(page.as_bytes());
    }

    /// Trailer: deferred callbacks in registration order, then the session.
    /// A panicking callback does not stop the ones after it; the panics are
    /// returned for the dispatcher to log.
    pub(crate) fn run_trailer(&mut self) -> Vec<Error> {
        let mut failures = Vec::new();
        for f in std::mem::take(&mut self.defers) {
            let ctx = &*self;
            if let Err(err) = recover(|| f(ctx)) {
                failures.push(err);
            }
        }

        let Some(svc) = self.registry.cached(SVC_SESSION) else {
            return failures;
        };
        let Ok(session) = svc.downcast::<Session>() else {
            return failures;
        };
        if session.is_new() {
            let cookie = session.cookie(&self.config.session_cookie, self.config.session_max_age());
            self.append_cookie(&cookie);
        }
        match recover(|| session.store().persist(&session)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session = session.id(), error = %e, "session persist failed"),
            Err(panic) => failures.push(panic),
        }
        failures
    }

    pub(crate) fn into_response(self) -> Response {
        Response { status: self.status, headers: self.headers, body: self.body }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("action", &self.action.to_string())
            .field("path", &self.request.path())
            .field("status", &self.status)
            .field("data", &self.data)
            .field("template", &self.template)
            .finish_non_exhaustive()
    }
}

fn with_params(mut pairs: Vec<(String, String)>, params: &HashMap<String, String>) -> Vec<(String, String)> {
    pairs.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
    pairs
}

fn first<'a>(pairs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    pairs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
}

fn lower_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::registry::Tier;

    pub(crate) fn context(req: Request, params: &[(&str, &str)]) -> Context {
        let params = params.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
        let registry = ServiceRegistry::child(Arc::new(ServiceRegistry::process()), Tier::Request);
        Context::new(
            Arc::new(req),
            params,
            ActionId::new("blog", "Posts", "ShowAll"),
            registry,
            Arc::new(AppConfig::default()),
        )
    }

    struct Echo;

    impl ViewRenderer for Echo {
        fn render(&self, out: &mut dyn std::io::Write, _dir: &std::path::Path, name: &str, data: &Value) -> Result<(), Error> {
            write!(out, "{name}:{data}")?;
            Ok(())
        }
    }

    #[test]
    fn query_merges_route_params() {
        let ctx = context(Request::new(Method::GET, "/posts/7?sort=new&tag=a&tag=b"), &[("id", "7")]);
        assert_eq!(ctx.query("sort"), Some("new"));
        assert_eq!(ctx.query("tag"), Some("a"));
        assert_eq!(ctx.query("id"), Some("7"));
        assert_eq!(ctx.query_pairs().len(), 4);
    }

    #[test]
    fn form_reads_urlencoded_bodies_only() {
        let req = Request::new(Method::POST, "/posts")
            .header("content-type", "application/x-www-form-urlencoded")
            .body("title=Hello+world&draft=1");
        let ctx = context(req, &[]);
        assert_eq!(ctx.form("title"), Some("Hello world"));

        let req = Request::new(Method::POST, "/posts").header("content-type", "application/json").body("{}");
        assert!(context(req, &[]).form_pairs().is_empty());
    }

    #[test]
    fn with_refuses_duplicates() {
        let mut ctx = context(Request::new(Method::GET, "/"), &[]);
        ctx.with("title", "a").unwrap();
        assert!(matches!(ctx.with("title", "b"), Err(Error::DataExists(_))));
        assert_eq!(ctx.data()["title"], "a");
    }

    #[test]
    fn data_is_serialized_once() {
        let mut ctx = context(Request::new(Method::GET, "/"), &[]);
        ctx.with("n", 1).unwrap();
        ctx.flush(&Echo).unwrap();
        ctx.flush(&Echo).unwrap();
        assert_eq!(ctx.body(), br#"{"n":1}"#);
        assert_eq!(ctx.headers()[CONTENT_TYPE], ContentType::Json.as_str());
    }

    #[test]
    fn template_renders_each_flush() {
        let mut ctx = context(Request::new(Method::GET, "/"), &[]);
        ctx.view();
        assert_eq!(ctx.template().unwrap().name, "showAll");
        assert!(ctx.template().unwrap().dir.ends_with("blog/view"));
        ctx.with("n", 1).unwrap();
        ctx.flush(&Echo).unwrap();
        ctx.flush(&Echo).unwrap();
        assert_eq!(ctx.body(), br#"showAll:{"n":1}showAll:{"n":1}"#);
    }

    #[test]
    fn messages_set_header_and_data() {
        let mut ctx = context(Request::new(Method::GET, "/"), &[]);
        ctx.warning("careful").unwrap();
        assert_eq!(ctx.headers()[MSG_HEADER], "warning");
        assert_eq!(ctx.data()["msg"]["content"], "careful");
    }

    #[test]
    fn redirect_discards_output_but_keeps_cookies() {
        let mut ctx = context(Request::new(Method::GET, "/"), &[]);
        ctx.write_str("partial");
        ctx.with("n", 1).unwrap();
        ctx.set_cookie("seen", "1", Duration::from_secs(10));
        ctx.apply_redirect(&Redirect::new("/login")).unwrap();
        let res = ctx.into_response();
        assert_eq!(res.status(), StatusCode::FOUND);
        assert_eq!(res.header_str("location"), Some("/login"));
        assert!(res.body().is_empty());
        assert!(res.header_str("set-cookie").is_some());
    }

    #[test]
    fn trailer_runs_defers_in_order() {
        use parking_lot::Mutex;

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = context(Request::new(Method::GET, "/"), &[]);
        for i in 0..3 {
            let log = Arc::clone(&log);
            ctx.defer(move |_| log.lock().push(i));
        }
        assert!(ctx.run_trailer().is_empty());
        assert_eq!(*log.lock(), [0, 1, 2]);
    }

    #[test]
    fn panicking_defer_does_not_stop_the_trailer() {
        use parking_lot::Mutex;

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = context(Request::new(Method::GET, "/"), &[]);
        ctx.defer(|_| panic!("flaky cleanup"));
        let after = Arc::clone(&log);
        ctx.defer(move |_| after.lock().push("after"));

        let failures = ctx.run_trailer();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].to_string().contains("flaky cleanup"));
        assert_eq!(*log.lock(), ["after"]);
    }

    #[test]
    fn unusable_redirect_location_is_an_error() {
        let mut ctx = context(Request::new(Method::GET, "/"), &[]);
        ctx.write_str("kept");
        let err = ctx.apply_redirect(&Redirect::new("/next\r\nx-injected: 1")).unwrap_err();
        assert!(matches!(err, Error::InvalidRedirect(_)));
        let res = ctx.into_response();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body(), b"kept");
        assert_eq!(res.header_str("location"), None);
    }
}
