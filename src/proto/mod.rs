//! Gemini protocol types and the line-oriented wire codec.
//!
//! This module provides the core protocol primitives:
//! [`Status`], [`StatusClass`], [`Request`], and [`Response`], plus the
//! path normalization shared by request decoding and route matching.

use std::fmt;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

pub mod request;
pub mod response;

pub use request::Request;
pub use response::{Body, MediaType, Response};

/// The URL scheme spoken by this protocol.
pub const SCHEME: &str = "gemini";

/// Port used when a URL does not name one.
pub const DEFAULT_PORT: u16 = 1965;

/// Media type sent when a handler writes a body without calling
/// `write_status` first.
pub const DEFAULT_MEDIA_TYPE: &str = "text/gemini";

/// Longest absolute URL a request line may carry.
pub const MAX_URL_LENGTH: usize = 1024;

/// Longest meta string a response header may carry.
pub const MAX_META_LENGTH: usize = 1024;

// `<url>\r\n`
const MAX_REQUEST_LINE: usize = MAX_URL_LENGTH + 2;
// `<2-digit status> <meta>\r\n`
const MAX_HEADER_LINE: usize = 3 + MAX_META_LENGTH + 2;

/// Errors raised while decoding the request line or the response header.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed line: missing CRLF terminator")]
    MalformedLine,

    #[error("invalid response header {0:?}: expected `<status> <meta>`")]
    InvalidResponse(String),

    #[error("malformed status {0:?}")]
    MalformedStatus(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("line is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The semantic class a status code belongs to.
///
/// Each class covers a band of ten codes, e.g. [`StatusClass::Success`] is
/// `20..30`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusClass {
    Input,
    Success,
    Redirect,
    TemporaryFailure,
    PermanentFailure,
    CertificateRequired,
}

/// A response status code.
///
/// Any integer read off the wire is representable so that peers sending
/// codes outside the known bands can still be inspected; [`Status::class`]
/// returns `None` for those.
///
/// # Examples
///
/// ```
/// use rgemini::proto::{Status, StatusClass};
///
/// let status = Status::NOT_FOUND;
/// assert_eq!(status.as_u16(), 51);
/// assert_eq!(status.class(), Some(StatusClass::PermanentFailure));
/// assert!(Status::new(71).class().is_none());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Status(u16);

impl Status {
    pub const INPUT: Status = Status(10);
    pub const SENSITIVE_INPUT: Status = Status(11);
    pub const SUCCESS: Status = Status(20);
    pub const REDIRECT: Status = Status(30);
    pub const PERMANENT_REDIRECT: Status = Status(31);
    pub const TEMPORARY_FAILURE: Status = Status(40);
    pub const SERVER_UNAVAILABLE: Status = Status(41);
    pub const CGI_ERROR: Status = Status(42);
    pub const PROXY_ERROR: Status = Status(43);
    pub const SLOW_DOWN: Status = Status(44);
    pub const PERMANENT_FAILURE: Status = Status(50);
    pub const NOT_FOUND: Status = Status(51);
    pub const GONE: Status = Status(52);
    pub const PROXY_REFUSED_REQUEST: Status = Status(53);
    pub const BAD_REQUEST: Status = Status(59);
    pub const CERTIFICATE_REQUIRED: Status = Status(60);
    pub const CERTIFICATE_NOT_AUTHORIZED: Status = Status(61);
    pub const CERTIFICATE_NOT_VALID: Status = Status(62);

    /// Wraps a raw status code.
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Returns the numeric status code.
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns the band this code falls in, or `None` outside `10..70`.
    pub fn class(self) -> Option<StatusClass> {
        match self.0 {
            10..20 => Some(StatusClass::Input),
            20..30 => Some(StatusClass::Success),
            30..40 => Some(StatusClass::Redirect),
            40..50 => Some(StatusClass::TemporaryFailure),
            50..60 => Some(StatusClass::PermanentFailure),
            60..70 => Some(StatusClass::CertificateRequired),
            _ => None,
        }
    }

    /// Returns `true` if this code is in the Success band, the only band
    /// whose responses carry a body.
    pub fn is_success(self) -> bool {
        self.class() == Some(StatusClass::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for Status {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

impl From<Status> for u16 {
    fn from(status: Status) -> u16 {
        status.0
    }
}

/// Normalizes a URL path.
///
/// The result always starts with `/`, has `.`/`..` segments and duplicate
/// slashes collapsed, and keeps a trailing slash if the input had one.
///
/// # Examples
///
/// ```
/// use rgemini::proto::clean_path;
///
/// assert_eq!(clean_path(""), "/");
/// assert_eq!(clean_path("a//b/../c/"), "/a/c/");
/// assert_eq!(clean_path("/a/./b"), "/a/b");
/// ```
pub fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let mut cleaned = String::with_capacity(path.len() + 1);
    cleaned.push('/');
    cleaned.push_str(&segments.join("/"));

    if path.ends_with('/') && cleaned != "/" {
        cleaned.push('/');
    }
    cleaned
}

/// Reads one CRLF-terminated line of at most `limit` bytes and returns it
/// without the terminator.
pub(crate) async fn read_line<R>(reader: &mut R, limit: usize) -> Result<String, ProtoError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(64);
    (&mut *reader)
        .take(limit as u64)
        .read_until(b'\n', &mut buf)
        .await?;

    let line = buf.strip_suffix(b"\r\n").ok_or(ProtoError::MalformedLine)?;
    Ok(String::from_utf8(line.to_vec())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_bands() {
        assert_eq!(Status::new(9).class(), None);
        assert_eq!(Status::INPUT.class(), Some(StatusClass::Input));
        assert_eq!(Status::new(19).class(), Some(StatusClass::Input));
        assert_eq!(Status::SUCCESS.class(), Some(StatusClass::Success));
        assert_eq!(
            Status::PERMANENT_REDIRECT.class(),
            Some(StatusClass::Redirect)
        );
        assert_eq!(
            Status::SLOW_DOWN.class(),
            Some(StatusClass::TemporaryFailure)
        );
        assert_eq!(
            Status::BAD_REQUEST.class(),
            Some(StatusClass::PermanentFailure)
        );
        assert_eq!(
            Status::new(69).class(),
            Some(StatusClass::CertificateRequired)
        );
        assert_eq!(Status::new(70).class(), None);
    }

    #[test]
    fn only_success_band_is_success() {
        assert!(Status::SUCCESS.is_success());
        assert!(Status::new(29).is_success());
        assert!(!Status::REDIRECT.is_success());
        assert!(!Status::INPUT.is_success());
    }

    #[test]
    fn clean_path_cases() {
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path("//"), "/");
        assert_eq!(clean_path("docs"), "/docs");
        assert_eq!(clean_path("/docs/"), "/docs/");
        assert_eq!(clean_path("/a/b/.."), "/a");
        assert_eq!(clean_path("/a/b/../"), "/a/");
        assert_eq!(clean_path("/../.."), "/");
        assert_eq!(clean_path("/a//b///c"), "/a/b/c");
    }

    #[tokio::test]
    async fn read_line_requires_crlf() {
        let mut input: &[u8] = b"gemini://example.org/\n";
        assert!(matches!(
            read_line(&mut input, 64).await,
            Err(ProtoError::MalformedLine)
        ));

        let mut eof: &[u8] = b"gemini://example.org/";
        assert!(matches!(
            read_line(&mut eof, 64).await,
            Err(ProtoError::MalformedLine)
        ));
    }

    #[tokio::test]
    async fn read_line_stops_at_limit() {
        let mut input: &[u8] = b"0123456789\r\n";
        assert!(matches!(
            read_line(&mut input, 8).await,
            Err(ProtoError::MalformedLine)
        ));
    }

    #[tokio::test]
    async fn read_line_leaves_rest_unread() {
        let mut input: &[u8] = b"20 text/plain\r\nbody";
        let line = read_line(&mut input, 64).await.unwrap();
        assert_eq!(line, "20 text/plain");
        assert_eq!(input, b"body");
    }
}
