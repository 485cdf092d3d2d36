//! Incoming HTTP request type.

use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};

/// An incoming HTTP request with its body fully read.
///
/// Immutable once built. The dispatcher shares it through an `Arc` with the
/// request registry so services (the session factory, for one) can read it.
#[derive(Debug)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) query: Option<String>,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) remote_addr: Option<SocketAddr>,
}

impl Request {
    /// A bodiless request for `uri` (path plus optional `?query`).
    pub fn new(method: Method, uri: &str) -> Self {
        let (path, query) = match uri.split_once('?') {
            Some((p, q)) => (p.to_owned(), Some(q.to_owned())),
            None => (uri.to_owned(), None),
        };
        Self { method, path, query, headers: HeaderMap::new(), body: Bytes::new(), remote_addr: None }
    }

    pub(crate) fn from_parts(parts: http::request::Parts, body: Bytes, remote_addr: SocketAddr) -> Self {
        Self {
            method: parts.method,
            path: parts.uri.path().to_owned(),
            query: parts.uri.query().map(str::to_owned),
            headers: parts.headers,
            body,
            remote_addr: Some(remote_addr),
        }
    }

    /// Adds a header. Invalid names or values are dropped.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn path(&self) -> &str { &self.path }
    pub fn query_string(&self) -> Option<&str> { self.query.as_deref() }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn bytes(&self) -> &[u8] { &self.body }
    pub fn peer_addr(&self) -> Option<SocketAddr> { self.remote_addr }

    /// Path plus query, as the client sent it.
    pub fn url(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{q}", self.path),
            None => self.path.clone(),
        }
    }

    /// Case-insensitive header lookup. Non-UTF-8 values read as absent.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Value of the cookie `name`, if the client sent one.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .get_all(http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }

    /// Best guess at the client address: `X-Real-IP`, then the first
    /// `X-Forwarded-For` hop, then the socket peer.
    pub fn client_ip(&self) -> Option<IpAddr> {
        let forwarded = self
            .header_str("x-real-ip")
            .or_else(|| self.header_str("x-forwarded-for").and_then(|v| v.split(',').next()))
            .and_then(|v| parse_ip(v.trim()));
        forwarded.or_else(|| self.remote_addr.map(|a| a.ip()))
    }
}

// Proxies send either a bare IP or `ip:port`.
fn parse_ip(s: &str) -> Option<IpAddr> {
    s.parse::<IpAddr>()
        .ok()
        .or_else(|| s.parse::<SocketAddr>().ok().map(|a| a.ip()))
}
