//! Async TLS server using Tokio and rustls.
//!
//! Accepts TCP connections, wraps each in TLS on its own task, reads one
//! request line, and dispatches it to a [`Handler`]. Gemini has no
//! keep-alive: every connection carries exactly one transaction.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once};
use std::time::Duration;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::proto::{DEFAULT_PORT, Request, Status};

pub mod handler;
pub mod writer;

pub use handler::{BoxError, Handler, HandlerError, HandlerFuture, HandlerResult, SharedHandler};
pub use writer::{ResponseWriter, WriterError};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
}

/// Too many open files, per process and system-wide (Linux and the BSDs).
const EMFILE: i32 = 24;
const ENFILE: i32 = 23;

/// Delay between retries after a transient accept failure: starts at 5 ms,
/// doubles on every consecutive failure, and is capped at 1 s.
#[derive(Debug, Default)]
struct AcceptBackoff {
    delay: Option<Duration>,
}

impl AcceptBackoff {
    const INITIAL: Duration = Duration::from_millis(5);
    const MAX: Duration = Duration::from_secs(1);

    fn next_delay(&mut self) -> Duration {
        let next = match self.delay {
            None => Self::INITIAL,
            Some(delay) => (delay * 2).min(Self::MAX),
        };
        self.delay = Some(next);
        next
    }

    fn reset(&mut self) {
        self.delay = None;
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || matches!(err.raw_os_error(), Some(EMFILE | ENFILE))
}

/// The rgemini server.
///
/// Binds to a TCP address and serves Gemini requests over TLS.
///
/// # Examples
///
/// ```rust,no_run
/// use rgemini::{Context, Request, ResponseWriter, Router, ServeMux, Server, tls};
/// use rgemini::server::HandlerResult;
///
/// async fn index(_ctx: Context, _req: Request, w: ResponseWriter) -> HandlerResult {
///     w.write_str("# Hello, Gemini\n").await?;
///     Ok(())
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let tls = tls::server_config_from_pem("cert.pem", "key.pem")?;
///     let mut mux = ServeMux::new();
///     mux.handle("/", index)?;
///
///     let server = Server::bind("0.0.0.0:1965", tls).await?;
///     server.serve(mux).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    acceptor: TlsAcceptor,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(
        addr: impl AsRef<str>,
        tls: Arc<rustls::ServerConfig>,
    ) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        Self::from_listener(listener, tls)
    }

    /// Serves on an already-bound listener.
    pub fn from_listener(
        listener: TcpListener,
        tls: Arc<rustls::ServerConfig>,
    ) -> Result<Self, ServerError> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            acceptor: TlsAcceptor::from(tls),
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections and dispatching requests to `handler`.
    ///
    /// Each connection gets its own Tokio task, so a slow handler never
    /// blocks the accept loop. Transient accept failures (connection resets,
    /// file descriptor exhaustion) are retried with backoff.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Accept`] on the first non-transient accept
    /// failure.
    pub async fn serve(self, handler: impl Handler) -> Result<(), ServerError> {
        let handler: SharedHandler = Arc::new(handler);
        let mut backoff = AcceptBackoff::default();
        info!(address = %self.local_addr, "rgemini listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => {
                    backoff.reset();
                    pair
                }
                Err(e) if is_transient(&e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, ?delay, "accept failed, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "accept failed, shutting down listener");
                    return Err(ServerError::Accept(e));
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let acceptor = self.acceptor.clone();
            let handler = Arc::clone(&handler);

            tokio::spawn(handle_connection(stream, peer_addr, acceptor, handler));
        }
    }
}

/// Binds `addr` (`0.0.0.0:1965` if empty) and serves `handler` on it.
pub async fn listen_and_serve(
    addr: &str,
    tls: Arc<rustls::ServerConfig>,
    handler: impl Handler,
) -> Result<(), ServerError> {
    let addr = if addr.is_empty() {
        format!("0.0.0.0:{DEFAULT_PORT}")
    } else {
        addr.to_owned()
    };
    Server::bind(addr, tls).await?.serve(handler).await
}

/// Handles a single connection: handshake, decode, dispatch, close.
///
/// Handshake and decode failures are logged and the connection is closed
/// without a response.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    handler: SharedHandler,
) {
    let stream = match acceptor.accept(stream).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(peer = %peer_addr, error = %e, "TLS handshake failed");
            return;
        }
    };

    let (sni, identity) = {
        let (_, conn) = stream.get_ref();
        (
            conn.server_name().map(str::to_owned),
            conn.peer_certificates()
                .and_then(|certs| certs.first().cloned()),
        )
    };

    let mut reader = BufReader::new(stream);
    let request = match Request::read_from(&mut reader).await {
        Ok(request) => request.with_identity(identity),
        Err(e) => {
            warn!(peer = %peer_addr, error = %e, "bad request, closing connection");
            return;
        }
    };
    let request = match sni {
        Some(name) => request.with_server_name(name),
        None => request,
    };

    debug!(
        peer = %peer_addr,
        url = %request.url(),
        identity = request.identity().is_some(),
        "dispatching request"
    );

    let writer = ResponseWriter::new(reader.into_inner());
    dispatch(handler.as_ref(), request, writer).await;
}

/// Runs `handler` for one request and guarantees the response ends with a
/// status line, unless the handler aborted deliberately.
///
/// - Nothing written on return → `51 not found`.
/// - [`HandlerError::AbortedSilently`] → close as-is, nothing logged.
/// - A body written after a non-success status → warned, nothing more sent.
/// - Any other error or a panic → logged, and `42` if nothing was written.
pub(crate) async fn dispatch(handler: &dyn Handler, request: Request, writer: ResponseWriter) {
    let url = request.url().clone();
    // Dropped on return, which cancels anything still tied to the context.
    let (ctx, _cancel) = Context::with_cancel();
    install_panic_hook();

    let outcome = AssertUnwindSafe(async { handler.serve(ctx, request, writer.clone()).await })
        .catch_unwind()
        .await;

    let fallback = match outcome {
        Ok(Ok(())) => Some((Status::NOT_FOUND, "not found")),
        Ok(Err(HandlerError::AbortedSilently)) => None,
        // The status line already went out; only the body was refused.
        Ok(Err(HandlerError::Writer(WriterError::BodyNotAllowed(status)))) => {
            warn!(%url, %status, "handler wrote a body after a non-success status");
            None
        }
        Ok(Err(e)) => {
            error!(%url, error = %e, "handler failed");
            Some((Status::CGI_ERROR, "internal server error"))
        }
        Err(payload) => {
            let backtrace = take_panic_trace().unwrap_or_else(Backtrace::force_capture);
            error!(
                %url,
                panic = panic_message(payload.as_ref()),
                %backtrace,
                "handler panicked"
            );
            Some((Status::CGI_ERROR, "internal server error"))
        }
    };

    if let Some((status, meta)) = fallback {
        if !writer.has_written().await {
            if let Err(e) = writer.write_status(status, meta).await {
                warn!(%url, error = %e, "failed to write fallback status");
            }
        }
    }

    match writer.written().await {
        Some((status, meta)) => info!(%url, %status, %meta, "request served"),
        None => debug!(%url, "response aborted by handler"),
    }

    if let Err(e) = writer.finish().await {
        debug!(%url, error = %e, "error closing connection");
    }
}

thread_local! {
    static PANIC_TRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chains a hook that records a backtrace at the panic site, so the
/// dispatcher can log it after `catch_unwind` has already unwound the stack.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(Backtrace::force_capture()));
            previous(info);
        }));
    });
}

/// Takes the backtrace of the last panic on this thread, if one was recorded.
fn take_panic_trace() -> Option<Backtrace> {
    PANIC_TRACE.with(|slot| slot.borrow_mut().take())
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}
