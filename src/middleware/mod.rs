//! Handler wrappers — composable before/after request logic.
//!
//! A middleware here is simply a [`Handler`] that owns another handler and
//! decides whether and how to call it. Wrappers nest freely with each other
//! and with [`ServeMux`](crate::router::ServeMux):
//!
//! ```rust,no_run
//! use rgemini::{Router, ServeMux};
//! use rgemini::middleware::{Logger, strip_prefix};
//!
//! # fn files() -> ServeMux { ServeMux::new() }
//! let mut mux = ServeMux::new();
//! mux.handle("/static/:rest", strip_prefix("/static", files())).unwrap();
//! let app = Logger::new(mux);
//! ```
//!
//! ## Provided wrappers
//!
//! - [`StripPrefix`] — rewrites the request path before delegating.
//! - [`Logger`] — one `tracing::info!` line per request.

use tokio::time::Instant;

use crate::context::Context;
use crate::proto::Request;
use crate::server::{Handler, HandlerFuture, ResponseWriter};

/// Serves requests by removing `prefix` from the request path and handing
/// the rewritten request to the inner handler.
///
/// Requests whose path does not start with `prefix` are dropped: the inner
/// handler is not invoked and nothing is written, so the server falls back
/// to `51 not found`. The original [`Request`] is never mutated; the inner
/// handler receives a clone with the shortened path.
///
/// # Examples
///
/// ```rust,no_run
/// use rgemini::middleware::strip_prefix;
/// use rgemini::{Context, Request, ResponseWriter, server::HandlerResult};
///
/// async fn show(_ctx: Context, req: Request, w: ResponseWriter) -> HandlerResult {
///     // "/docs/intro.gmi" arrives here as "/intro.gmi"
///     w.write_str(req.path()).await?;
///     Ok(())
/// }
///
/// let handler = strip_prefix("/docs", show);
/// ```
#[derive(Debug, Clone)]
pub struct StripPrefix<H> {
    prefix: String,
    inner: H,
}

/// Wrap `handler` in a [`StripPrefix`] for `prefix`.
pub fn strip_prefix<H: Handler>(prefix: impl Into<String>, handler: H) -> StripPrefix<H> {
    StripPrefix {
        prefix: prefix.into(),
        inner: handler,
    }
}

impl<H: Handler> Handler for StripPrefix<H> {
    fn serve(&self, ctx: Context, req: Request, w: ResponseWriter) -> HandlerFuture {
        if self.prefix.is_empty() {
            return self.inner.serve(ctx, req, w);
        }

        match req.path().strip_prefix(self.prefix.as_str()) {
            Some(rest) => {
                let rewritten = req.with_path(rest);
                self.inner.serve(ctx, rewritten, w)
            }
            None => {
                tracing::debug!(path = req.path(), prefix = %self.prefix, "prefix mismatch, dropping request");
                Box::pin(async { Ok(()) })
            }
        }
    }
}

/// Logs each request's path, response status, and duration.
///
/// Emits a single `tracing::info!` line after the inner handler completes:
///
/// ```text
/// /path - 20 (1.2ms)
/// ```
///
/// The status is whatever the handler wrote; a handler that wrote nothing is
/// logged with status `-`.
#[derive(Debug, Clone)]
pub struct Logger<H> {
    inner: H,
}

impl<H: Handler> Logger<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

impl<H: Handler> Handler for Logger<H> {
    fn serve(&self, ctx: Context, req: Request, w: ResponseWriter) -> HandlerFuture {
        let start = Instant::now();
        let path = req.path().to_owned();
        let fut = self.inner.serve(ctx, req, w.clone());

        Box::pin(async move {
            let result = fut.await;

            let duration = start.elapsed();
            let status = match w.written().await {
                Some((status, _)) => status.to_string(),
                None => "-".to_owned(),
            };

            tracing::info!("{} - {} ({:?})", path, status, duration);

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt, duplex};

    use super::*;
    use crate::server::HandlerError;

    /// Records every path it is called with and echoes it back.
    #[derive(Clone, Default)]
    struct Echo(Arc<Mutex<Vec<String>>>);

    impl Handler for Echo {
        fn serve(&self, _ctx: Context, req: Request, w: ResponseWriter) -> HandlerFuture {
            self.0.lock().unwrap().push(req.path().to_owned());
            Box::pin(async move {
                w.write_str(req.path()).await?;
                Ok::<(), HandlerError>(())
            })
        }
    }

    async fn call(handler: &impl Handler, url: &str) -> String {
        let (server, mut client) = duplex(4096);
        let w = ResponseWriter::new(server);
        let req = Request::new(url).unwrap();
        handler
            .serve(Context::background(), req, w.clone())
            .await
            .unwrap();
        w.finish().await.unwrap();

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn strips_matching_prefix() {
        let echo = Echo::default();
        let handler = strip_prefix("/docs", echo.clone());

        let out = call(&handler, "gemini://localhost/docs/intro.gmi").await;
        assert_eq!(out, "20 text/gemini\r\n/intro.gmi");
        assert_eq!(*echo.0.lock().unwrap(), vec!["/intro.gmi".to_owned()]);
    }

    #[tokio::test]
    async fn mismatch_skips_inner_handler() {
        let echo = Echo::default();
        let handler = strip_prefix("/docs", echo.clone());

        let out = call(&handler, "gemini://localhost/other").await;
        assert_eq!(out, "");
        assert!(echo.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_prefix_passes_through() {
        let echo = Echo::default();
        let handler = strip_prefix("", echo.clone());

        let out = call(&handler, "gemini://localhost/a/b").await;
        assert_eq!(out, "20 text/gemini\r\n/a/b");
    }

    #[tokio::test]
    async fn logger_delegates_unchanged() {
        let handler = Logger::new(Echo::default());
        let out = call(&handler, "gemini://localhost/logged").await;
        assert_eq!(out, "20 text/gemini\r\n/logged");
    }
}
