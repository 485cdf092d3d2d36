//! Early termination for middleware and actions.
//!
//! Every middleware and action returns a [`Flow`]. `Ok(())` continues the
//! pipeline; `Err(Halt)` stops it. The dispatcher inspects the [`Halt`] kind at
//! a single recovery point:
//!
//! | Halt | Remaining pre/action/post | Flush | Trailer |
//! |---|---|---|---|
//! | [`Halt::Return`] | skipped | runs | runs |
//! | [`Halt::Redirect`] | skipped | replaced by the redirect | runs |
//! | [`Halt::Fail`] | skipped | replaced by a 500 page | runs |
//!
//! Because [`Error`] converts into `Halt`, `?` works inside actions:
//!
//! ```rust
//! use satchel::{Context, Flow, Halt};
//!
//! fn show(ctx: &mut Context) -> Flow {
//!     if ctx.param("id").is_none() {
//!         return Err(Halt::redirect("/"));
//!     }
//!     ctx.with("title", "post")?;
//!     Ok(())
//! }
//! ```

use http::StatusCode;

use crate::error::Error;

/// Result of one middleware or action invocation.
pub type Flow = Result<(), Halt>;

/// Why the pipeline stopped early.
#[derive(Debug)]
pub enum Halt {
    /// Abandon the rest of the pipeline but keep the output produced so far.
    Return,
    /// Abandon the rest of the pipeline and answer with a redirect.
    Redirect(Redirect),
    /// An unrecovered failure.
    Fail(Error),
}

impl Halt {
    /// `302 Found` to `location`.
    pub fn redirect(location: impl Into<String>) -> Self {
        Self::Redirect(Redirect::new(location))
    }

    /// Redirect with an explicit status code.
    pub fn redirect_with(location: impl Into<String>, status: StatusCode) -> Self {
        Self::Redirect(Redirect::new(location).status(status))
    }

    /// True for `Return` and `Redirect`, which are never logged as failures.
    pub fn is_control(&self) -> bool {
        !matches!(self, Self::Fail(_))
    }
}

impl From<Error> for Halt {
    fn from(err: Error) -> Self {
        Self::Fail(err)
    }
}

impl From<crate::error::ConfigError> for Halt {
    fn from(err: crate::error::ConfigError) -> Self {
        Self::Fail(Error::Config(err))
    }
}

impl From<serde_json::Error> for Halt {
    fn from(err: serde_json::Error) -> Self {
        Self::Fail(Error::Json(err))
    }
}

/// Target and status of a redirect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Redirect {
    pub location: String,
    pub status: StatusCode,
}

impl Redirect {
    pub fn new(location: impl Into<String>) -> Self {
        Self { location: location.into(), status: StatusCode::FOUND }
    }

    /// Overrides the status. Anything outside 3xx falls back to `302`.
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = if status.is_redirection() { status } else { StatusCode::FOUND };
        self
    }
}
