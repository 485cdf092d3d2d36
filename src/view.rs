//! Template rendering.
//!
//! The dispatcher renders through the [`ViewRenderer`] trait, a pure
//! function of its inputs. [`JinjaViews`] is the default, reading templates
//! from disk with [`minijinja`]; templates may `{% extends %}` or
//! `{% include %}` siblings from the same directory.

use std::io;
use std::path::{Component, Path, PathBuf};

use minijinja::{Environment, ErrorKind};
use serde_json::Value;

use crate::error::Error;

pub trait ViewRenderer: Send + Sync + 'static {
    /// Renders template `name` from `dir` with `data` into `out`.
    fn render(&self, out: &mut dyn io::Write, dir: &Path, name: &str, data: &Value) -> Result<(), Error>;
}

/// File-backed minijinja renderer. `name` is completed with the configured extension.
pub struct JinjaViews {
    ext: String,
}

impl JinjaViews {
    pub fn new(ext: impl Into<String>) -> Self {
        Self { ext: ext.into() }
    }
}

impl ViewRenderer for JinjaViews {
    fn render(&self, out: &mut dyn io::Write, dir: &Path, name: &str, data: &Value) -> Result<(), Error> {
        let file = format!("{name}{}", self.ext);
        let fail = |e: minijinja::Error| Error::Render { template: file.clone(), reason: e.to_string() };

        let root = dir.to_path_buf();
        let mut env = Environment::new();
        env.set_loader(move |tpl| load(&root, tpl));

        let tmpl = env.get_template(&file).map_err(fail)?;
        tmpl.render_to_write(data, out).map_err(fail)?;
        Ok(())
    }
}

fn load(root: &Path, name: &str) -> Result<Option<String>, minijinja::Error> {
    let Some(path) = map_path(root, name) else {
        return Ok(None);
    };
    match std::fs::read_to_string(&path) {
        Ok(source) => Ok(Some(source)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(minijinja::Error::new(ErrorKind::InvalidOperation, format!("read {}", path.display()))
            .with_source(e)),
    }
}

/// Joins `rel` under `root`, refusing anything that would climb out of it.
pub(crate) fn map_path(root: &Path, rel: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for comp in Path::new(rel.trim_start_matches('/')).components() {
        match comp {
            Component::Normal(s) => path.push(s),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(path)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn renders_with_layout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("layout.html"), "<main>{% block body %}{% endblock %}</main>").unwrap();
        std::fs::write(
            dir.path().join("index.html"),
            r#"{% extends "layout.html" %}{% block body %}hi {{ name }}{% endblock %}"#,
        )
        .unwrap();

        let mut out = Vec::new();
        JinjaViews::new(".html").render(&mut out, dir.path(), "index", &json!({ "name": "ada" })).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "<main>hi ada</main>");
    }

    #[test]
    fn missing_template_is_a_render_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        let err = JinjaViews::new(".html").render(&mut out, dir.path(), "nope", &json!({})).unwrap_err();
        assert!(matches!(err, Error::Render { ref template, .. } if template == "nope.html"));
    }

    #[test]
    fn map_path_prevents_traversal() {
        let root = Path::new("/srv/views");
        assert!(map_path(root, "../secret").is_none());
        assert_eq!(map_path(root, "/a/./b.html"), Some(PathBuf::from("/srv/views/a/b.html")));
    }
}
