//! Gemini response header codec and the streaming response body.
//!
//! A response is `<status> <meta>\r\n`, followed by raw body bytes only when
//! the status is in the Success band. There is no length prefix: the body
//! ends when the connection does.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};

use super::{MAX_HEADER_LINE, ProtoError, Status, StatusClass, read_line};

/// Any bidirectional byte stream a response can be read from.
///
/// Blanket-implemented for every `AsyncRead + AsyncWrite + Send + Unpin`
/// type, so TLS streams and in-memory pipes both qualify.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A received Gemini response.
///
/// Responses read off a connection stream their body lazily; the body is
/// only present for Success statuses. Dropping the response closes the
/// connection without reading the rest of the body.
///
/// # Examples
///
/// ```
/// use rgemini::proto::{Response, Status};
///
/// let response = Response::new(Status::REDIRECT, "/docs/");
/// assert!(response.is_redirect());
/// assert!(response.body().is_none());
/// ```
#[derive(Debug)]
pub struct Response {
    status: Status,
    meta: String,
    body: Option<Body>,
}

impl Response {
    /// Creates a body-less response.
    pub fn new(status: Status, meta: impl Into<String>) -> Self {
        Self {
            status,
            meta: meta.into(),
            body: None,
        }
    }

    /// Reads the response header from `conn` and keeps the connection as the
    /// body stream if the status is in the Success band.
    ///
    /// For every other status the connection is dropped immediately.
    ///
    /// # Errors
    ///
    /// - [`ProtoError::MalformedLine`] — no CRLF-terminated header line.
    /// - [`ProtoError::InvalidResponse`] — the header has no space separator.
    /// - [`ProtoError::MalformedStatus`] — the status token is not a number.
    pub async fn read_from<C>(conn: C) -> Result<Self, ProtoError>
    where
        C: Connection + 'static,
    {
        let mut reader = BufReader::new(Box::new(conn) as Box<dyn Connection>);
        let line = read_line(&mut reader, MAX_HEADER_LINE).await?;
        let (status, meta) = parse_header(&line)?;

        let body = status.is_success().then(|| Body { reader });
        Ok(Self { status, meta, body })
    }

    /// Returns the status code.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Returns the meta string: a media type on success, a URL on redirect,
    /// a prompt for input, an error message otherwise.
    pub fn meta(&self) -> &str {
        &self.meta
    }

    /// Returns the body, present only for Success responses.
    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Returns a mutable handle to the body for streaming reads.
    pub fn body_mut(&mut self) -> Option<&mut Body> {
        self.body.as_mut()
    }

    /// Consumes the response and returns its body.
    pub fn into_body(self) -> Option<Body> {
        self.body
    }

    /// Closes the underlying connection, sending a TLS close notification.
    pub async fn close(self) -> io::Result<()> {
        match self.body {
            Some(body) => body.close().await,
            None => Ok(()),
        }
    }

    /// Parses the meta of a Success response as a media type.
    ///
    /// An empty meta means `text/gemini; charset=utf-8`. Returns `None` for
    /// any non-Success status.
    pub fn media_type(&self) -> Option<MediaType> {
        if !self.is_success() {
            return None;
        }
        if self.meta.trim().is_empty() {
            return Some(MediaType::parse("text/gemini; charset=utf-8"));
        }
        Some(MediaType::parse(&self.meta))
    }

    pub fn is_input(&self) -> bool {
        self.status.class() == Some(StatusClass::Input)
    }

    pub fn is_success(&self) -> bool {
        self.status.class() == Some(StatusClass::Success)
    }

    pub fn is_redirect(&self) -> bool {
        self.status.class() == Some(StatusClass::Redirect)
    }

    pub fn is_temporary_failure(&self) -> bool {
        self.status.class() == Some(StatusClass::TemporaryFailure)
    }

    pub fn is_permanent_failure(&self) -> bool {
        self.status.class() == Some(StatusClass::PermanentFailure)
    }

    pub fn is_certificate_required(&self) -> bool {
        self.status.class() == Some(StatusClass::CertificateRequired)
    }
}

/// Serializes a response header line: `<status> <meta>\r\n`.
pub fn encode_header(status: Status, meta: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(meta.len() + 5);
    buf.put(format!("{status} {meta}\r\n").as_bytes());
    buf
}

fn parse_header(line: &str) -> Result<(Status, String), ProtoError> {
    let (code, meta) = line
        .split_once(' ')
        .ok_or_else(|| ProtoError::InvalidResponse(line.to_owned()))?;

    let code: u16 = code
        .parse()
        .map_err(|_| ProtoError::MalformedStatus(code.to_owned()))?;

    Ok((Status::new(code), meta.to_owned()))
}

/// The body of a Success response, streamed from the live connection.
pub struct Body {
    reader: BufReader<Box<dyn Connection>>,
}

impl Body {
    /// Reads the rest of the body into memory.
    pub async fn bytes(mut self) -> io::Result<Bytes> {
        let mut buf = Vec::new();
        self.reader.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Reads the rest of the body and decodes it as UTF-8.
    pub async fn text(mut self) -> io::Result<String> {
        let mut text = String::new();
        self.reader.read_to_string(&mut text).await?;
        Ok(text)
    }

    /// Shuts the connection down without reading the remaining bytes.
    pub async fn close(mut self) -> io::Result<()> {
        self.reader.get_mut().shutdown().await
    }
}

impl AsyncRead for Body {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body")
            .field("buffered", &self.reader.buffer().len())
            .finish_non_exhaustive()
    }
}

/// A parsed media type such as `text/gemini; charset=utf-8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    essence: String,
    params: HashMap<String, String>,
}

impl MediaType {
    /// Parses `type/subtype; key=value; ...`. Keys and the essence are
    /// lowercased; quoted values are unquoted.
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.split(';');
        let essence = parts
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        let params = parts
            .filter_map(|param| {
                let (key, value) = param.split_once('=')?;
                let value = value.trim().trim_matches('"');
                Some((key.trim().to_ascii_lowercase(), value.to_owned()))
            })
            .collect();

        Self { essence, params }
    }

    /// Returns `type/subtype`.
    pub fn essence(&self) -> &str {
        &self.essence
    }

    /// Returns a parameter value by (case-insensitive) key.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn wire(bytes: &[u8]) -> Cursor<Vec<u8>> {
        Cursor::new(bytes.to_vec())
    }

    #[tokio::test]
    async fn success_round_trip() {
        let mut raw = encode_header(Status::SUCCESS, "text/plain").to_vec();
        raw.extend_from_slice(b"hello\nworld");

        let response = Response::read_from(wire(&raw)).await.unwrap();
        assert_eq!(response.status(), Status::SUCCESS);
        assert_eq!(response.meta(), "text/plain");

        let body = response.into_body().unwrap().bytes().await.unwrap();
        assert_eq!(&body[..], b"hello\nworld");
    }

    #[tokio::test]
    async fn non_success_has_no_body() {
        let response = Response::read_from(wire(b"51 not found\r\ntrailing"))
            .await
            .unwrap();
        assert_eq!(response.status(), Status::NOT_FOUND);
        assert_eq!(response.meta(), "not found");
        assert!(response.body().is_none());
        assert!(response.is_permanent_failure());
    }

    #[tokio::test]
    async fn meta_may_contain_spaces() {
        let response = Response::read_from(wire(b"40 try again later\r\n"))
            .await
            .unwrap();
        assert_eq!(response.meta(), "try again later");
    }

    #[tokio::test]
    async fn empty_meta_is_allowed() {
        let response = Response::read_from(wire(b"20 \r\n")).await.unwrap();
        assert_eq!(response.meta(), "");
        assert_eq!(response.media_type().unwrap().essence(), "text/gemini");
    }

    #[tokio::test]
    async fn header_without_space_is_invalid() {
        let err = Response::read_from(wire(b"20\r\n")).await.unwrap_err();
        assert!(matches!(err, ProtoError::InvalidResponse(line) if line == "20"));
    }

    #[tokio::test]
    async fn non_numeric_status_is_malformed() {
        let err = Response::read_from(wire(b"OK text/plain\r\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtoError::MalformedStatus(code) if code == "OK"));
    }

    #[tokio::test]
    async fn missing_terminator_is_malformed() {
        let err = Response::read_from(wire(b"20 text/plain"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtoError::MalformedLine));
    }

    #[tokio::test]
    async fn unknown_status_still_decodes() {
        let response = Response::read_from(wire(b"99 strange\r\n")).await.unwrap();
        assert_eq!(response.status().as_u16(), 99);
        assert!(response.status().class().is_none());
    }

    #[test]
    fn encode_header_format() {
        assert_eq!(
            &encode_header(Status::PERMANENT_REDIRECT, "/docs/")[..],
            b"31 /docs/\r\n"
        );
    }

    #[test]
    fn media_type_params() {
        let response = Response::new(Status::SUCCESS, "Text/Gemini; Charset=\"utf-8\"; lang=en");
        let media = response.media_type().unwrap();
        assert_eq!(media.essence(), "text/gemini");
        assert_eq!(media.param("charset"), Some("utf-8"));
        assert_eq!(media.param("LANG"), Some("en"));
        assert_eq!(media.param("missing"), None);

        assert!(Response::new(Status::NOT_FOUND, "x").media_type().is_none());
    }
}
