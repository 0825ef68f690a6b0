//! Gemini client: TLS dial, single request/response exchange, and the
//! redirect-following loop.
//!
//! ```rust,no_run
//! use rgemini::Client;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new()?;
//! let response = client.get("gemini://geminiprotocol.net/").await?;
//!
//! if let Some(body) = response.into_body() {
//!     println!("{}", body.text().await?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Server certificates are not validated: Gemini relies on trust on first
//! use, which is left to the caller.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, InvalidDnsNameError, PrivateKeyDer, ServerName};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Host;

use crate::context::Context;
use crate::proto::{DEFAULT_PORT, ProtoError, Request, Response, SCHEME};
use crate::server::BoxError;
use crate::tls::{self, Identity, TlsError};

/// Requests allowed by the default redirect policy before it gives up.
pub const DEFAULT_MAX_REDIRECTS: usize = 5;

/// Errors produced by [`Client`].
///
/// The redirect-loop and status variants are soft failures: they carry the
/// last [`Response`] received so callers can still inspect it. See
/// [`ClientError::response`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] TlsError),

    #[error("invalid TLS server name: {0}")]
    InvalidServerName(#[from] InvalidDnsNameError),

    #[error("request URL has no host: {0}")]
    MissingHost(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid redirect target: {source}")]
    InvalidRedirect {
        #[source]
        source: url::ParseError,
        response: Box<Response>,
    },

    #[error("unknown status code {}", .response.status())]
    UnknownStatus { response: Box<Response> },

    #[error("redirect to unsupported scheme {scheme:?}")]
    UnknownProtocol {
        scheme: String,
        response: Box<Response>,
    },

    #[error("redirect rejected: {source}")]
    RedirectPolicy {
        #[source]
        source: BoxError,
        response: Box<Response>,
    },
}

impl ClientError {
    /// The last response received, for soft failures.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::InvalidRedirect { response, .. }
            | Self::UnknownStatus { response }
            | Self::UnknownProtocol { response, .. }
            | Self::RedirectPolicy { response, .. } => Some(response),
            _ => None,
        }
    }

    /// Consumes the error, returning the last response for soft failures.
    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::InvalidRedirect { response, .. }
            | Self::UnknownStatus { response }
            | Self::UnknownProtocol { response, .. }
            | Self::RedirectPolicy { response, .. } => Some(*response),
            _ => None,
        }
    }
}

/// Rejection returned by [`MaxRedirects`].
#[derive(Debug, Error)]
#[error("stopped after {limit} requests")]
pub struct TooManyRedirects {
    pub limit: usize,
}

/// Decides whether the client follows a redirect.
///
/// `next` is the request about to be sent; `via` holds the requests already
/// made, oldest first. Returning an error stops the loop before `next` is
/// sent.
///
/// Closures with the same signature are policies:
///
/// ```rust,no_run
/// use rgemini::{Client, Request};
/// use rgemini::server::BoxError;
///
/// # fn build() -> Result<Client, rgemini::ClientError> {
/// let same_host = |next: &Request, via: &[Request]| -> Result<(), BoxError> {
///     if next.url().host_str() != via[0].url().host_str() {
///         return Err("cross-host redirect".into());
///     }
///     Ok(())
/// };
/// let client = Client::new()?.with_redirect_policy(same_host);
/// # Ok(client)
/// # }
/// ```
pub trait RedirectPolicy: Send + Sync + 'static {
    fn check(&self, next: &Request, via: &[Request]) -> Result<(), BoxError>;
}

impl<F> RedirectPolicy for F
where
    F: Fn(&Request, &[Request]) -> Result<(), BoxError> + Send + Sync + 'static,
{
    fn check(&self, next: &Request, via: &[Request]) -> Result<(), BoxError> {
        (self)(next, via)
    }
}

/// The default policy: stop once `limit` requests have been made.
#[derive(Debug, Clone, Copy)]
pub struct MaxRedirects(pub usize);

impl Default for MaxRedirects {
    fn default() -> Self {
        Self(DEFAULT_MAX_REDIRECTS)
    }
}

impl RedirectPolicy for MaxRedirects {
    fn check(&self, _next: &Request, via: &[Request]) -> Result<(), BoxError> {
        if via.len() >= self.0 {
            return Err(Box::new(TooManyRedirects { limit: self.0 }));
        }
        Ok(())
    }
}

/// A Gemini client.
///
/// Cloning is cheap and clones share configuration. There is no process-wide
/// default client; build one where it is needed.
#[derive(Clone)]
pub struct Client {
    connector: TlsConnector,
    policy: Arc<dyn RedirectPolicy>,
}

impl Client {
    /// A client with no identity and the default redirect policy.
    pub fn new() -> Result<Self, ClientError> {
        Ok(Self::with_tls_config(tls::client_config(None)?))
    }

    /// A client using a prebuilt rustls configuration as-is.
    pub fn with_tls_config(config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            connector: TlsConnector::from(config),
            policy: Arc::new(MaxRedirects::default()),
        }
    }

    /// A client that presents `certs`/`key` as its identity to every server.
    pub fn with_identity(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, ClientError> {
        let config = tls::client_config(Some(Identity::new(certs, key)))?;
        Ok(Self::with_tls_config(config))
    }

    /// [`with_identity`](Self::with_identity) from PEM files on disk.
    pub fn with_identity_pem(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, ClientError> {
        let identity = Identity::from_pem_files(cert_path, key_path)?;
        Self::with_identity(identity.certs, identity.key)
    }

    /// Replaces the redirect policy.
    #[must_use]
    pub fn with_redirect_policy(mut self, policy: impl RedirectPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Fetches `url`, following redirects.
    pub async fn get(&self, url: &str) -> Result<Response, ClientError> {
        self.send(Request::new(url)?).await
    }

    /// Sends `req`, following redirects.
    pub async fn send(&self, req: Request) -> Result<Response, ClientError> {
        self.send_context(&Context::background(), req).await
    }

    /// Sends `req`, following redirects, until done or `ctx` is cancelled.
    ///
    /// Each attempt races against cancellation. The losing side is dropped,
    /// which closes its connection, so nothing keeps running after this
    /// returns.
    ///
    /// The returned response's body streams from the live connection; close
    /// it (or drop it) to release the socket.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Cancelled`] — `ctx` was cancelled first.
    /// - [`ClientError::UnknownStatus`] — the status is outside the known
    ///   bands.
    /// - [`ClientError::UnknownProtocol`] — a redirect left the `gemini`
    ///   scheme.
    /// - [`ClientError::RedirectPolicy`] — the policy refused a redirect.
    /// - Dial, TLS and decode failures abort the call immediately.
    pub async fn send_context(&self, ctx: &Context, req: Request) -> Result<Response, ClientError> {
        let mut req = req;
        let mut via: Vec<Request> = Vec::new();

        loop {
            let response = tokio::select! {
                biased;
                () = ctx.cancelled() => return Err(ClientError::Cancelled),
                result = self.transact(&req) => result?,
            };

            if response.status().class().is_none() {
                return Err(ClientError::UnknownStatus {
                    response: Box::new(response),
                });
            }
            if !response.is_redirect() {
                return Ok(response);
            }

            let target = match req.url().join(response.meta()) {
                Ok(target) => target,
                Err(source) => {
                    return Err(ClientError::InvalidRedirect {
                        source,
                        response: Box::new(response),
                    });
                }
            };
            if target.scheme() != SCHEME {
                return Err(ClientError::UnknownProtocol {
                    scheme: target.scheme().to_owned(),
                    response: Box::new(response),
                });
            }

            via.push(req);
            let next = Request::from_url(target);
            if let Err(source) = self.policy.check(&next, &via) {
                return Err(ClientError::RedirectPolicy {
                    source,
                    response: Box::new(response),
                });
            }

            debug!(status = %response.status(), to = %next.url(), hops = via.len(), "following redirect");
            req = next;
        }
    }

    /// One exchange: dial, handshake, send the request line, read the header.
    async fn transact(&self, req: &Request) -> Result<Response, ClientError> {
        let url = req.url();
        let port = url.port().unwrap_or(DEFAULT_PORT);
        let tcp = match url.host() {
            Some(Host::Domain(domain)) => TcpStream::connect((domain, port)).await?,
            Some(Host::Ipv4(ip)) => TcpStream::connect((ip, port)).await?,
            Some(Host::Ipv6(ip)) => TcpStream::connect((ip, port)).await?,
            None => return Err(ClientError::MissingHost(url.to_string())),
        };

        let mut stream = self.connector.connect(server_name(req)?, tcp).await?;
        stream.write_all(&req.encode()).await?;
        stream.flush().await?;

        Ok(Response::read_from(stream).await?)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

/// The SNI name for `req`, with IPv6 brackets removed.
fn server_name(req: &Request) -> Result<ServerName<'static>, ClientError> {
    let name = req
        .server_name()
        .ok_or_else(|| ClientError::MissingHost(req.url().to_string()))?;
    let name = name
        .strip_prefix('[')
        .and_then(|n| n.strip_suffix(']'))
        .unwrap_or(name);
    Ok(ServerName::try_from(name.to_owned())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Status;

    fn chain(n: usize) -> Vec<Request> {
        (0..n)
            .map(|i| Request::new(&format!("gemini://localhost/{i}")).unwrap())
            .collect()
    }

    #[test]
    fn default_policy_stops_at_limit() {
        let policy = MaxRedirects::default();
        let next = Request::new("gemini://localhost/next").unwrap();

        assert!(policy.check(&next, &chain(4)).is_ok());
        let err = policy.check(&next, &chain(5)).unwrap_err();
        assert_eq!(err.to_string(), "stopped after 5 requests");
    }

    #[test]
    fn closures_are_policies() {
        let client = Client::new()
            .unwrap()
            .with_redirect_policy(|_: &Request, _: &[Request]| -> Result<(), BoxError> {
                Err("never".into())
            });
        let next = Request::new("gemini://localhost/").unwrap();
        assert!(client.policy.check(&next, &[]).is_err());
    }

    #[test]
    fn server_name_sources() {
        let req = Request::new("gemini://example.org/").unwrap();
        assert_eq!(
            server_name(&req).unwrap(),
            ServerName::try_from("example.org").unwrap()
        );

        let req = Request::new("gemini://[::1]:1965/").unwrap();
        assert!(matches!(server_name(&req).unwrap(), ServerName::IpAddress(_)));

        let req = Request::new("gemini://127.0.0.1/")
            .unwrap()
            .with_server_name("proxy.example");
        assert_eq!(
            server_name(&req).unwrap(),
            ServerName::try_from("proxy.example").unwrap()
        );
    }

    #[test]
    fn soft_errors_expose_response() {
        let err = ClientError::UnknownStatus {
            response: Box::new(Response::new(Status::new(99), "odd")),
        };
        assert_eq!(err.to_string(), "unknown status code 99");
        assert_eq!(err.response().unwrap().meta(), "odd");
        assert!(ClientError::Cancelled.into_response().is_none());
    }

    #[tokio::test]
    async fn cancelled_context_wins_immediately() {
        let client = Client::new().unwrap();
        let (ctx, handle) = Context::with_cancel();
        handle.cancel();

        // Port 9 (discard) on a TEST-NET address is never dialed.
        let req = Request::new("gemini://192.0.2.1:9/").unwrap();
        let err = client.send_context(&ctx, req).await.unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
    }
}
