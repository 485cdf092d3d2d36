//! Not-found and static-file strategies.
//!
//! Both are pluggable through [`AppBuilder`](crate::AppBuilder). The
//! defaults serve a fixed 404 page and files from `static_dir`.

use std::path::{Path, PathBuf};

use http::StatusCode;

use crate::request::Request;
use crate::response::{ContentType, Response};
use crate::view::map_path;

/// Answers requests no route matched.
pub trait NotFoundHandler: Send + Sync + 'static {
    fn not_found(&self, req: &Request) -> Response;
}

/// Claims and serves static assets before routing.
pub trait FileHandler: Send + Sync + 'static {
    /// True if `req` should bypass routing and be served as a file.
    fn handles(&self, req: &Request) -> bool;

    fn serve(&self, req: &Request) -> Response;
}

/// Fixed HTML 404 page.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultNotFound;

impl NotFoundHandler for DefaultNotFound {
    fn not_found(&self, _req: &Request) -> Response {
        not_found_page()
    }
}

pub(crate) fn not_found_page() -> Response {
    Response::html(NOT_FOUND_PAGE).with_status(StatusCode::NOT_FOUND)
}

/// Serves any path whose last segment carries an extension from a directory.
#[derive(Clone, Debug)]
pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileHandler for StaticFiles {
    fn handles(&self, req: &Request) -> bool {
        let last = req.path().rsplit('/').next().unwrap_or("");
        Path::new(last).extension().is_some()
    }

    fn serve(&self, req: &Request) -> Response {
        let Some(path) = map_path(&self.root, req.path()) else {
            return not_found_page();
        };
        match std::fs::read(&path) {
            Ok(bytes) => {
                let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
                Response::new(StatusCode::OK).with_body(ContentType::from_extension(ext), bytes)
            }
            Err(_) => not_found_page(),
        }
    }
}

/// Never claims a request. Installs when static serving is off.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFiles;

impl FileHandler for NoFiles {
    fn handles(&self, _req: &Request) -> bool {
        false
    }

    fn serve(&self, _req: &Request) -> Response {
        not_found_page()
    }
}

const NOT_FOUND_PAGE: &str = r#"<!doctype html>
<html lang="en">
<head><meta charset="UTF-8"><title>404 Not Found</title></head>
<body><h1>404 Page Not Found</h1></body>
</html>"#;

#[cfg(test)]
mod tests {
    use http::Method;

    use super::*;

    #[test]
    fn extension_marks_a_static_asset() {
        let files = StaticFiles::new("public");
        assert!(files.handles(&Request::new(Method::GET, "/css/site.css")));
        assert!(!files.handles(&Request::new(Method::GET, "/posts/12")));
        assert!(!files.handles(&Request::new(Method::GET, "/v1.2/posts")));
    }

    #[test]
    fn serves_existing_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "Hello\n").unwrap();
        let files = StaticFiles::new(dir.path());

        let res = files.serve(&Request::new(Method::GET, "/hello.txt"));
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body(), b"Hello\n");
        assert_eq!(res.header_str("content-type"), Some("text/plain; charset=utf-8"));

        let res = files.serve(&Request::new(Method::GET, "/missing.txt"));
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = files.serve(&Request::new(Method::GET, "/../hello.txt"));
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
