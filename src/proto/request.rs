//! Gemini request parsing and encoding.
//!
//! A request is a single line: an absolute URL followed by CRLF.

use bytes::{BufMut, Bytes, BytesMut};
use rustls::pki_types::CertificateDer;
use tokio::io::AsyncBufRead;
use url::Url;

use super::{MAX_REQUEST_LINE, ProtoError, SCHEME, clean_path, read_line};

/// A Gemini request, either received by a server or about to be sent by a
/// client.
///
/// Requests are immutable once built; middleware that needs a different path
/// works on a rewritten clone (see [`Request::with_path`]).
///
/// # Examples
///
/// ```
/// use rgemini::proto::Request;
///
/// let request = Request::new("example.org/a/./b/").unwrap();
///
/// assert_eq!(request.url().as_str(), "gemini://example.org/a/b/");
/// assert_eq!(request.path(), "/a/b/");
/// assert_eq!(request.server_name(), Some("example.org"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    url: Url,
    server_name: Option<String>,
    identity: Option<CertificateDer<'static>>,
}

impl Request {
    /// Parses `raw` as a URL and builds a request for it.
    ///
    /// A missing scheme defaults to `gemini` and the path is normalized.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::InvalidUrl`] if `raw` cannot be parsed.
    pub fn new(raw: &str) -> Result<Self, ProtoError> {
        Ok(Self::from_url(parse_url(raw)?))
    }

    /// Builds a request for an already-parsed URL, normalizing its path.
    pub fn from_url(mut url: Url) -> Self {
        let path = clean_path(url.path());
        url.set_path(&path);
        Self {
            url,
            server_name: None,
            identity: None,
        }
    }

    /// Overrides the name sent via SNI. Only needed when the TLS peer differs
    /// from the URL host, e.g. for proxy requests.
    #[must_use]
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    /// Returns a clone of this request with its URL path replaced by `path`.
    ///
    /// The path is stored verbatim; the original request is untouched.
    pub fn with_path(&self, path: &str) -> Self {
        let mut rewritten = self.clone();
        rewritten.url.set_path(path);
        rewritten
    }

    pub(crate) fn with_identity(mut self, identity: Option<CertificateDer<'static>>) -> Self {
        self.identity = identity;
        self
    }

    /// Returns the request URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the URL path.
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Returns the TLS server name: the explicit override if one was set
    /// (on the server, the SNI the client sent), otherwise the URL host.
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref().or_else(|| self.url.host_str())
    }

    /// Returns the certificate the client presented during the handshake.
    ///
    /// Only ever set on the server side.
    pub fn identity(&self) -> Option<&CertificateDer<'static>> {
        self.identity.as_ref()
    }

    /// Serializes the request line: `<absolute-url>\r\n`.
    pub fn encode(&self) -> Bytes {
        let url = self.url.as_str();
        let mut buf = BytesMut::with_capacity(url.len() + 2);
        buf.put(url.as_bytes());
        buf.put(&b"\r\n"[..]);
        buf.freeze()
    }

    /// Reads and parses one request line from `reader`.
    ///
    /// Only the line itself is consumed. The path is normalized and the
    /// scheme defaults to `gemini` when absent.
    ///
    /// # Errors
    ///
    /// - [`ProtoError::MalformedLine`] — the line is missing its CRLF
    ///   terminator or exceeds the maximum URL length.
    /// - [`ProtoError::InvalidUrl`] — the line is not a URL.
    /// - [`ProtoError::Io`] — the underlying read failed.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtoError>
    where
        R: AsyncBufRead + Unpin,
    {
        let line = read_line(reader, MAX_REQUEST_LINE).await?;
        Self::new(&line)
    }
}

// Go-style leniency: `example.org/path` and `//example.org/path` are both
// accepted and given the protocol's own scheme.
fn parse_url(raw: &str) -> Result<Url, url::ParseError> {
    match Url::parse(raw) {
        Err(url::ParseError::RelativeUrlWithoutBase) if raw.starts_with("//") => {
            Url::parse(&format!("{SCHEME}:{raw}"))
        }
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(&format!("{SCHEME}://{raw}")),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parse_request_line() {
        let mut raw: &[u8] = b"gemini://example.org:1966/docs/../index.gmi?q=1\r\n";
        let req = Request::read_from(&mut raw).await.unwrap();
        assert_eq!(req.url().scheme(), "gemini");
        assert_eq!(req.url().port(), Some(1966));
        assert_eq!(req.path(), "/index.gmi");
        assert_eq!(req.url().query(), Some("q=1"));
        assert!(req.identity().is_none());
    }

    #[tokio::test]
    async fn missing_scheme_defaults_to_gemini() {
        let mut raw: &[u8] = b"//example.org/hello\r\n";
        let req = Request::read_from(&mut raw).await.unwrap();
        assert_eq!(req.url().as_str(), "gemini://example.org/hello");

        let req = Request::new("example.org").unwrap();
        assert_eq!(req.url().as_str(), "gemini://example.org/");
    }

    #[tokio::test]
    async fn trailing_slash_is_preserved() {
        let mut raw: &[u8] = b"gemini://example.org//docs//\r\n";
        let req = Request::read_from(&mut raw).await.unwrap();
        assert_eq!(req.path(), "/docs/");
    }

    #[tokio::test]
    async fn missing_terminator_is_malformed() {
        let mut raw: &[u8] = b"gemini://example.org/";
        assert!(matches!(
            Request::read_from(&mut raw).await,
            Err(ProtoError::MalformedLine)
        ));
    }

    #[tokio::test]
    async fn overlong_url_is_malformed() {
        let line = format!("gemini://example.org/{}\r\n", "a".repeat(MAX_REQUEST_LINE));
        let mut raw = line.as_bytes();
        assert!(matches!(
            Request::read_from(&mut raw).await,
            Err(ProtoError::MalformedLine)
        ));
    }

    #[tokio::test]
    async fn encode_then_decode_keeps_url() {
        let req = Request::new("gemini://example.org/a b/?x=y").unwrap();
        let encoded = req.encode();
        assert!(encoded.ends_with(b"\r\n"));

        let mut raw: &[u8] = &encoded;
        let decoded = Request::read_from(&mut raw).await.unwrap();
        assert_eq!(decoded.url(), req.url());
    }

    #[test]
    fn with_path_leaves_original_untouched() {
        let req = Request::new("gemini://example.org/files/a.txt").unwrap();
        let stripped = req.with_path("/a.txt");
        assert_eq!(stripped.path(), "/a.txt");
        assert_eq!(req.path(), "/files/a.txt");
        assert_eq!(stripped.url().host_str(), Some("example.org"));
    }

    #[test]
    fn server_name_override() {
        let req = Request::new("gemini://example.org/").unwrap();
        assert_eq!(req.server_name(), Some("example.org"));
        let req = req.with_server_name("proxy.example.net");
        assert_eq!(req.server_name(), Some("proxy.example.net"));
    }
}
