//! Minimal satchel application: one bundle, a session counter, middleware
//! in both phases and a redirect.
//!
//! Run with:
//!   cargo run --example basic
//!
//! Try:
//!   curl -i http://localhost:3000/notes
//!   curl -i http://localhost:3000/notes/7?verbose=1
//!   curl -i -b 'satchel-session=<id from Set-Cookie>' http://localhost:3000/visits
//!   curl -i http://localhost:3000/old-notes

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use satchel::{
    AfterAction, AppBuilder, AppConfig, BeforeAction, BindingScope, Bundle, Context, Controller, Error, Flow,
    Middlewares, Routes, Server, Services,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let app = AppBuilder::new(AppConfig::load_or_default("app.yml")).bundle(Notes).build()?;
    print!("{}", app.describe());

    Server::bind("0.0.0.0:3000").await?.serve(app).await
}

// ── Bundle ───────────────────────────────────────────────────────────────────

struct Notes;

impl Bundle for Notes {
    fn name(&self) -> &str {
        "notes"
    }

    fn register_services(&self, services: &mut Services<'_>) -> Result<(), Error> {
        services.singleton("notes.hits", AtomicU64::new(0))?;
        Ok(())
    }

    fn register_routes(&self, routes: &mut Routes<'_>) -> Result<(), Error> {
        routes
            .controller("Notes", NotesController::default)
            .get("/notes", "index", NotesController::index)
            .get("/notes/{id}", "show", NotesController::show)
            .get("/old-notes", "moved", NotesController::moved)
            .get("/visits", "visits", NotesController::visits);
        Ok(())
    }

    fn register_middleware(&self, mw: &mut Middlewares<'_>) -> Result<(), Error> {
        mw.handler("notes.Hits", || CountHits)?
            .terminate("notes.Timing", || Timing(Instant::now()))?;
        Ok(())
    }

    fn bind_middleware(&self, scope: &mut BindingScope<'_>) {
        scope.set("notes.Hits").everywhere();
        scope.set("notes.Timing").everywhere();
    }

    fn close(&self) {
        info!("notes bundle closed");
    }
}

// ── Middleware ───────────────────────────────────────────────────────────────

struct CountHits;

impl BeforeAction for CountHits {
    fn handle(&self, ctx: &mut Context) -> Flow {
        let hits = ctx.get::<AtomicU64>("notes.hits")?;
        let n = hits.fetch_add(1, Ordering::Relaxed) + 1;
        ctx.set_header("x-hits", &n.to_string());
        Ok(())
    }
}

struct Timing(Instant);

impl AfterAction for Timing {
    fn terminate(&self, ctx: &mut Context) -> Flow {
        ctx.set_header("x-elapsed-us", &self.0.elapsed().as_micros().to_string());
        Ok(())
    }
}

// ── Controller ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct NotesController;

impl Controller for NotesController {}

impl NotesController {
    fn index(&mut self, ctx: &mut Context) -> Flow {
        ctx.with("notes", ["buy milk", "write docs"])?;
        Ok(())
    }

    fn show(&mut self, ctx: &mut Context) -> Flow {
        let id = ctx.param("id").unwrap_or_default().to_owned();
        ctx.with("id", &id)?;
        if ctx.query("verbose").is_some() {
            ctx.info("verbose mode")?;
        }
        Ok(())
    }

    fn moved(&mut self, ctx: &mut Context) -> Flow {
        ctx.redirect("/notes")
    }

    fn visits(&mut self, ctx: &mut Context) -> Flow {
        let session = ctx.session()?;
        let visits = session.get::<u64>("visits").map_or(1, |v| *v + 1);
        session.set("visits", visits);
        ctx.with("visits", visits)?;
        Ok(())
    }
}
