//! The handler contract shared by the router, middleware, and the server.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use super::writer::{ResponseWriter, WriterError};
use crate::context::Context;
use crate::proto::Request;

/// Boxed error type for handler failures of any kind.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Heap-allocated handler future.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send + 'static>>;

/// What a handler reports back to the server once it is done.
pub type HandlerResult = Result<(), HandlerError>;

/// Ways a handler can finish other than successfully.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Close the connection as-is: no forced status, no error log. This is
    /// how a handler deliberately interrupts a response.
    #[error("handler aborted the response")]
    AbortedSilently,

    #[error("response writer error: {0}")]
    Writer(#[from] WriterError),

    #[error("handler failed: {0}")]
    Failed(#[from] BoxError),
}

/// Responds to a Gemini request.
///
/// Handlers receive the request-scoped [`Context`] (carrying route params),
/// the [`Request`], and a [`ResponseWriter`] to answer through. The writer
/// must not be used after the returned future completes; the server closes
/// it at that point.
///
/// Returning without writing anything makes the server answer
/// `51 not found`. Returning [`HandlerError::Failed`], or panicking, makes it
/// log the failure and answer `42` if nothing was written yet.
///
/// Any `Fn(Context, Request, ResponseWriter) -> impl Future<Output = HandlerResult>`
/// is a handler:
///
/// ```rust,no_run
/// use rgemini::{Context, Request, ResponseWriter, server::HandlerResult};
///
/// async fn hello(ctx: Context, _req: Request, w: ResponseWriter) -> HandlerResult {
///     let name = ctx.params().get(0).unwrap_or("world");
///     w.write_str(&format!("Hello {name}!\n")).await?;
///     Ok(())
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    /// Serve one request.
    fn serve(&self, ctx: Context, req: Request, w: ResponseWriter) -> HandlerFuture;
}

impl<T, F> Handler for T
where
    T: Fn(Context, Request, ResponseWriter) -> F + Send + Sync + 'static,
    F: Future<Output = HandlerResult> + Send + 'static,
{
    fn serve(&self, ctx: Context, req: Request, w: ResponseWriter) -> HandlerFuture {
        Box::pin((self)(ctx, req, w))
    }
}

/// A type-erased, cheaply cloneable handler.
pub type SharedHandler = Arc<dyn Handler>;
