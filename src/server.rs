//! HTTP transport and graceful shutdown.
//!
//! One tokio task per connection, hyper's `auto` builder for HTTP/1.1 and
//! HTTP/2. Request bodies are collected in full, then the synchronous
//! [`App::dispatch`] runs on the blocking pool so a slow action never stalls
//! the reactor.
//!
//! Limits from [`AppConfig`](crate::AppConfig):
//!
//! | key | exceeded |
//! |---|---|
//! | `max_body_bytes` | `413 Payload Too Large` |
//! | `read_timeout_secs` | `408 Request Timeout` while receiving the body |
//! | `write_timeout_secs` | `503 Service Unavailable` while dispatching |
//!
//! On SIGTERM or Ctrl-C the server:
//! 1. stops accepting connections;
//! 2. lets every in-flight connection run to completion;
//! 3. calls [`App::close`], running each bundle's close hook;
//! 4. returns from [`Server::serve`].

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::app::App;
use crate::error::Error;
use crate::request::Request;
use crate::response::Response;

/// The HTTP server.
pub struct Server {
    listener: TcpListener,
}

impl Server {
    /// Binds to `addr` (`host:port`).
    ///
    /// ```rust,no_run
    /// # async fn run(app: satchel::App) -> Result<(), satchel::Error> {
    /// satchel::Server::bind("0.0.0.0:3000").await?.serve(app).await
    /// # }
    /// ```
    pub async fn bind(addr: &str) -> Result<Self, Error> {
        Ok(Self { listener: TcpListener::bind(addr).await? })
    }

    /// Serves on an already bound listener.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self { listener }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves `app` until SIGTERM or Ctrl-C, then drains and closes it.
    pub async fn serve(self, app: App) -> Result<(), Error> {
        self.serve_with_shutdown(app, shutdown_signal()).await
    }

    /// Serves `app` until `shutdown` resolves, then drains and closes it.
    pub async fn serve_with_shutdown(self, app: App, shutdown: impl Future<Output = ()>) -> Result<(), Error> {
        let app = Arc::new(app);
        let addr = self.listener.local_addr()?;
        info!(addr = %addr, version = %app.config().version, "satchel listening");

        let mut tasks = tokio::task::JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Shutdown wins over queued connections.
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = self.listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let app = Arc::clone(&app);
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        let svc = service_fn(move |req| handle(Arc::clone(&app), req, remote_addr));
                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            warn!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        app.close();
        info!("satchel stopped");
        Ok(())
    }
}

async fn handle(
    app: Arc<App>,
    req: hyper::Request<Incoming>,
    remote_addr: SocketAddr,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let config = app.config();
    let (read_timeout, write_timeout) = (config.read_timeout(), config.write_timeout());

    let (parts, body) = req.into_parts();
    let body = match within(read_timeout, Limited::new(body, config.max_body_bytes).collect()).await {
        Some(Ok(collected)) => collected.to_bytes(),
        Some(Err(e)) if e.downcast_ref::<LengthLimitError>().is_some() => {
            warn!(peer = %remote_addr, limit = config.max_body_bytes, "request body too large");
            return Ok(Response::new(StatusCode::PAYLOAD_TOO_LARGE).into_http());
        }
        Some(Err(e)) => {
            warn!(peer = %remote_addr, "failed to read request body: {e}");
            return Ok(Response::new(StatusCode::BAD_REQUEST).into_http());
        }
        None => {
            warn!(peer = %remote_addr, "timed out reading request body");
            return Ok(Response::new(StatusCode::REQUEST_TIMEOUT).into_http());
        }
    };
    let request = Request::from_parts(parts, body, remote_addr);

    let response = match within(write_timeout, tokio::task::spawn_blocking(move || app.dispatch(request))).await {
        Some(Ok(res)) => res,
        Some(Err(e)) => {
            error!(peer = %remote_addr, "dispatch task failed: {e}");
            Response::new(StatusCode::INTERNAL_SERVER_ERROR)
        }
        // The blocking task cannot be cancelled; it runs to completion unseen.
        None => {
            warn!(peer = %remote_addr, "timed out producing the response");
            Response::new(StatusCode::SERVICE_UNAVAILABLE)
        }
    };
    Ok(response.into_http())
}

/// `fut`'s output, or `None` once `limit` elapsed first.
async fn within<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Resolves on the first SIGTERM or Ctrl-C. A handler that cannot be
/// installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = sigterm => {}
    }
}
