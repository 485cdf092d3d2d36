//! The request dispatcher.
//!
//! ```text
//!   Matching ──static──▶ FileHandler ─────────────────────────────┐
//!      │ ──no route──▶ NotFoundHandler ───────────────────────────┤
//!      ▼                                                          │
//!   PreMiddleware → Action → PostMiddleware → Flush → Trailer → Done
//!      └──── Halt::Return ─────────────────────────▶ Flush
//!      └──── Halt::Redirect ──▶ Redirecting ──────────────▶ Trailer
//!      └──── Halt::Fail / panic ──▶ Erroring ─────────────▶ Trailer
//! ```
//!
//! Everything runs synchronously on the calling thread. The single recovery
//! point is [`App::dispatch`]: it inspects the [`Halt`] produced by the
//! pipeline and always proceeds to the trailer. Deferred callbacks get a
//! recovery point each, so one panicking callback cannot skip the others.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Once};

use tracing::{debug, error};

use crate::app::App;
use crate::bundle::SVC_REQUEST;
use crate::context::Context;
use crate::error::Error;
use crate::flow::{Flow, Halt};
use crate::middleware::Chain;
use crate::registry::{Service, ServiceRegistry, Tier};
use crate::request::Request;
use crate::response::Response;
use crate::router::Route;

impl App {
    /// Dispatches one request and produces its response. Never fails: every
    /// failure becomes a 500 response and one `error!` record.
    pub fn dispatch(&self, req: Request) -> Response {
        if self.files.handles(&req) {
            return self.files.serve(&req);
        }
        let Some((route, params)) = self.routes.lookup(req.method(), req.path()) else {
            debug!(method = %req.method(), path = req.path(), "no route");
            return self.not_found.not_found(&req);
        };

        let registry = ServiceRegistry::child(Arc::clone(&self.process), Tier::Request);
        let mut ctx = Context::new(Arc::new(req), params, route.action().clone(), registry, Arc::clone(&self.config));

        let outcome = recover(|| run(self, route, &mut ctx)).unwrap_or_else(|err| Err(Halt::Fail(err)));

        match outcome {
            Ok(()) | Err(Halt::Return) => {
                if let Err(err) = ctx.flush(self.views.as_ref()) {
                    self.fail(&mut ctx, &err);
                }
            }
            Err(Halt::Redirect(redirect)) => {
                if let Err(err) = ctx.apply_redirect(&redirect) {
                    self.fail(&mut ctx, &err);
                }
            }
            Err(Halt::Fail(err)) => self.fail(&mut ctx, &err),
        }

        for err in ctx.run_trailer() {
            log_failure(&ctx, &err, "deferred callback failed");
        }
        debug!(
            action = %ctx.action(),
            status = ctx.status().as_u16(),
            elapsed_us = ctx.started().elapsed().as_micros() as u64,
            "dispatched"
        );
        ctx.into_response()
    }

    /// Erroring: logs once and appends the error page.
    fn fail(&self, ctx: &mut Context, err: &Error) {
        log_failure(ctx, err, "request failed");
        let page = if self.config.debug { debug_page(&err.chain(), err.trace()) } else { ERROR_PAGE.to_owned() };
        ctx.apply_error_page(&page);
    }
}

fn log_failure(ctx: &Context, err: &Error, what: &str) {
    let client = ctx.request().client_ip().map_or_else(|| "-".to_owned(), |ip| ip.to_string());
    // Panics carry the backtrace of the panic site. Other errors get the
    // current one, disabled unless RUST_BACKTRACE asks for it.
    let trace = err.trace().map_or_else(|| Backtrace::capture().to_string(), str::to_owned);
    error!(
        client = %client,
        url = %ctx.request().url(),
        action = %ctx.action(),
        error = %err,
        causes = ?err.chain(),
        trace = %trace,
        "{what}"
    );
}

/// PreMiddleware → Action → PostMiddleware.
fn run(app: &App, route: &Route, ctx: &mut Context) -> Flow {
    let request: Service = ctx.shared_request();
    ctx.registry().publish_service(SVC_REQUEST, request)?;

    let chain = Chain::resolve(ctx.registry(), app.bindings.for_action(route.action()), route.action())?;
    chain.run_before(ctx)?;
    route.handler.invoke(ctx)?;
    chain.run_after(ctx)
}

thread_local! {
    // True while `recover` runs user code on this thread.
    static RECOVERING: Cell<bool> = const { Cell::new(false) };
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chains a panic hook that keeps the backtrace of panics raised under
/// [`recover`]. The previously installed hook still runs for every panic.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if RECOVERING.try_with(Cell::get).unwrap_or(false) {
                let trace = Backtrace::force_capture().to_string();
                let _ = PANIC_TRACE.try_with(|slot| slot.replace(Some(trace)));
            }
            previous(info);
        }));
    });
}

/// Runs `f`, turning a panic into [`Error::Panic`].
pub(crate) fn recover<R>(f: impl FnOnce() -> R) -> Result<R, Error> {
    install_panic_hook();
    PANIC_TRACE.take();
    let outer = RECOVERING.replace(true);
    let result = catch_unwind(AssertUnwindSafe(f));
    RECOVERING.set(outer);
    result.map_err(panicked)
}

fn panicked(payload: Box<dyn Any + Send>) -> Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_owned());
    let trace = PANIC_TRACE.take().unwrap_or_else(|| Backtrace::capture().to_string());
    Error::Panic { message, trace }
}

fn debug_page(chain: &[String], trace: Option<&str>) -> String {
    let mut page = String::from(
        "<!doctype html>\n<html lang=\"en\">\n<head><meta charset=\"UTF-8\"><title>500 Internal Server Error</title></head>\n<body><h1>500 Internal Server Error</h1>\n<pre>",
    );
    for (i, line) in chain.iter().enumerate() {
        if i > 0 {
            page.push_str("\ncaused by: ");
        }
        page.push_str(&escape_html(line));
    }
    page.push_str("</pre>\n");
    if let Some(trace) = trace {
        page.push_str("<pre>");
        page.push_str(&escape_html(trace));
        page.push_str("</pre>\n");
    }
    page.push_str("</body>\n</html>");
    page
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

const ERROR_PAGE: &str = r#"<!doctype html>
<html lang="en">
<head><meta charset="UTF-8"><title>500 Internal Server Error</title></head>
<body><h1>500 Internal Server Error</h1></body>
</html>"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_page_escapes_the_chain() {
        let page = debug_page(&["bad <input>".to_owned(), "root & cause".to_owned()], None);
        assert!(page.contains("bad &lt;input&gt;"));
        assert!(page.contains("caused by: root &amp; cause"));
        assert_eq!(page.matches("<pre>").count(), 1);

        let page = debug_page(&["panicked: x".to_owned()], Some("0: <frame>"));
        assert!(page.contains("0: &lt;frame&gt;"));
    }

    #[test]
    fn panic_payloads_become_errors() {
        let err = panicked(Box::new("boom"));
        assert_eq!(err.to_string(), "panicked: boom");
        let err = panicked(Box::new(String::from("kaput")));
        assert_eq!(err.to_string(), "panicked: kaput");
    }

    #[test]
    fn recovered_panics_keep_their_backtrace() {
        let err = recover(|| -> u8 { panic!("kaput") }).unwrap_err();
        assert_eq!(err.to_string(), "panicked: kaput");
        assert!(err.trace().is_some_and(|t| !t.is_empty()));
        assert_eq!(recover(|| 7).unwrap(), 7);
    }
}
