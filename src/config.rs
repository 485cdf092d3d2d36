//! Process configuration.
//!
//! One [`AppConfig`] is created at startup and shared, behind an `Arc`, by
//! the [`App`](crate::App) and every request [`Context`](crate::Context).
//! Nothing is read from ambient globals.
//!
//! ```yaml
//! # app.yml: every key is optional
//! debug: false
//! bundle_dir: ./bundle
//! static_dir: ./public
//! view_file_ext: .html
//! session_cookie: satchel-session
//! session_max_age_minutes: 45
//! read_timeout_secs: 30     # 0 disables
//! write_timeout_secs: 30    # 0 disables
//! max_body_bytes: 4194304
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::Error;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Detailed error pages instead of the generic 500 page.
    pub debug: bool,
    /// Root of the per-bundle directories; templates live in `<bundle_dir>/<bundle>/view`.
    pub bundle_dir: PathBuf,
    /// Directory static assets are served from.
    pub static_dir: PathBuf,
    /// Extension appended to template names.
    pub view_file_ext: String,
    /// Cookie carrying the session id.
    pub session_cookie: String,
    /// Idle time after which a session is discarded.
    pub session_max_age_minutes: u64,
    /// Limit for receiving a request body; exceeded means `408`.
    pub read_timeout_secs: u64,
    /// Limit for producing a response; exceeded means `503`.
    pub write_timeout_secs: u64,
    /// Largest accepted request body; larger means `413`.
    pub max_body_bytes: usize,
    /// Reported by [`App::describe`](crate::App::describe).
    pub version: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            debug: false,
            bundle_dir: PathBuf::from("bundle"),
            static_dir: PathBuf::from("public"),
            view_file_ext: ".html".to_owned(),
            session_cookie: "satchel-session".to_owned(),
            session_max_age_minutes: 45,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            max_body_bytes: 4 * 1024 * 1024,
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

impl AppConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Like [`load`](Self::load), but a missing or malformed file only logs a
    /// warning and yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        Self::load(path).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "config unreadable, using defaults");
            Self::default()
        })
    }

    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_minutes.saturating_mul(60))
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_secs > 0).then(|| Duration::from_secs(self.read_timeout_secs))
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_secs > 0).then(|| Duration::from_secs(self.write_timeout_secs))
    }

    /// Directory holding `bundle`'s templates.
    pub fn view_dir(&self, bundle: &str) -> PathBuf {
        self.bundle_dir.join(bundle).join("view")
    }
}
