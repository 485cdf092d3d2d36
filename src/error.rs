//! Unified error types.
//!
//! Two layers:
//!
//! - [`ConfigError`]: wiring mistakes. Raised while the bundles boot (and,
//!   for middleware that only resolves at request time, while dispatching).
//!   A `ConfigError` at boot aborts startup; it is never tolerated silently.
//! - [`Error`]: everything else satchel's fallible operations return.
//!
//! Early returns and redirects are *not* errors. They travel as
//! [`Halt`](crate::Halt) values and are resolved at the dispatcher boundary.

use std::borrow::Cow;

use thiserror::Error;

/// A wiring bug detected while assembling the application.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("service `{0}` is already registered at this tier")]
    DuplicateService(String),

    #[error("service `{0}` is already cached at this tier")]
    DuplicatePublish(String),

    #[error("unknown middleware `{middleware}` bound to `{action}`")]
    UnknownMiddleware { middleware: String, action: String },

    #[error("service `{middleware}` bound to `{action}` is not a middleware")]
    NotMiddleware { middleware: String, action: String },

    #[error("middleware `{0}` is already registered")]
    DuplicateMiddleware(String),

    #[error("invalid route `{path}`: {reason}")]
    InvalidRoute { path: String, reason: String },

    #[error("controller `{0}` is registered twice")]
    DuplicateController(String),

    #[error("boot phase `{requested}` cannot run after `{completed}`")]
    PhaseOrder { requested: &'static str, completed: &'static str },
}

/// The error type returned by satchel's fallible operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("service `{0}` is not registered")]
    ServiceNotFound(String),

    #[error("service `{key}` is not a `{expected}`")]
    ServiceType { key: String, expected: &'static str },

    #[error("view data `{0}` already exists")]
    DataExists(String),

    #[error("render `{template}`: {reason}")]
    Render { template: String, reason: String },

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("session: {0}")]
    Session(Cow<'static, str>),

    #[error("bundle `{bundle}` failed to boot: {source}")]
    Bundle {
        bundle: String,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid redirect location `{0}`")]
    InvalidRedirect(String),

    /// A panic caught at a recovery point. `trace` holds the backtrace of the
    /// panicking thread, rendered when the panic happened.
    #[error("panicked: {message}")]
    Panic { message: String, trace: String },

    #[error("{0}")]
    Handler(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
    /// Wraps an arbitrary application error raised from an action or middleware.
    pub fn handler<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Self::Handler(err.into())
    }

    /// The backtrace captured where the error arose, if one was.
    pub fn trace(&self) -> Option<&str> {
        match self {
            Self::Panic { trace, .. } => Some(trace.as_str()),
            _ => None,
        }
    }

    /// Renders the error followed by every `source()` in its chain, one per line.
    pub fn chain(&self) -> Vec<String> {
        let mut lines = vec![self.to_string()];
        let mut cur = std::error::Error::source(self);
        while let Some(err) = cur {
            lines.push(err.to_string());
            cur = err.source();
        }
        lines
    }
}
