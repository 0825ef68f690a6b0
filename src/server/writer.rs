//! The response writer handed to every handler.
//!
//! The writer enforces the framing rules of the protocol: exactly one
//! status line per response, an implicit `20 text/gemini` before the first
//! body write, and no body bytes at all for non-Success statuses.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::warn;

use crate::proto::response::encode_header;
use crate::proto::{DEFAULT_MEDIA_TYPE, MAX_META_LENGTH, Status};

/// Errors returned by [`ResponseWriter`] operations.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("response writer used after the handler returned")]
    Closed,

    #[error("status {0} does not allow a response body")]
    BodyNotAllowed(Status),

    #[error("status {0} is outside the known status bands")]
    InvalidStatus(Status),

    #[error("meta must be at most {MAX_META_LENGTH} bytes and contain no CR or LF")]
    InvalidMeta,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

type Sink = BufWriter<Box<dyn AsyncWrite + Send + Unpin>>;

struct WriterState {
    conn: Option<Sink>,
    written: Option<(Status, String)>,
}

impl WriterState {
    async fn write_header(&mut self, status: Status, meta: &str) -> Result<(), WriterError> {
        let conn = self.conn.as_mut().ok_or(WriterError::Closed)?;
        self.written = Some((status, meta.to_owned()));
        conn.write_all(&encode_header(status, meta)).await?;
        Ok(())
    }
}

/// Writes one Gemini response onto a connection.
///
/// Cloning is cheap; all clones share the same response. The server keeps a
/// clone to learn what the handler wrote and closes the writer once the
/// handler returns, after which every call fails with
/// [`WriterError::Closed`].
#[derive(Clone)]
pub struct ResponseWriter {
    inner: Arc<Mutex<WriterState>>,
}

impl ResponseWriter {
    /// Wraps `conn` as a fresh writer that has written nothing yet.
    pub fn new<W>(conn: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let sink: Box<dyn AsyncWrite + Send + Unpin> = Box::new(conn);
        Self {
            inner: Arc::new(Mutex::new(WriterState {
                conn: Some(BufWriter::new(sink)),
                written: None,
            })),
        }
    }

    /// Sends the status line `<status> <meta>`.
    ///
    /// Only the first call has an effect; later calls log a warning and
    /// return `Ok(())` without touching the connection.
    ///
    /// # Errors
    ///
    /// - [`WriterError::InvalidStatus`] — `status` is outside `10..70`.
    /// - [`WriterError::InvalidMeta`] — `meta` would break the header line.
    /// - [`WriterError::Closed`] — the handler already returned.
    pub async fn write_status(&self, status: Status, meta: &str) -> Result<(), WriterError> {
        let mut state = self.inner.lock().await;

        if let Some((first, _)) = &state.written {
            warn!(%status, first = %first, "status already written, ignoring");
            return Ok(());
        }
        if status.class().is_none() {
            return Err(WriterError::InvalidStatus(status));
        }
        if meta.len() > MAX_META_LENGTH || meta.contains(['\r', '\n']) {
            return Err(WriterError::InvalidMeta);
        }

        state.write_header(status, meta).await
    }

    /// Writes body bytes, sending `20 text/gemini` first if no status has
    /// been written.
    ///
    /// # Errors
    ///
    /// Returns [`WriterError::BodyNotAllowed`] and writes nothing if the
    /// status already sent is not a Success status.
    pub async fn write(&self, data: &[u8]) -> Result<usize, WriterError> {
        let mut state = self.inner.lock().await;

        if state.written.is_none() {
            state
                .write_header(Status::SUCCESS, DEFAULT_MEDIA_TYPE)
                .await?;
        }

        if let Some((status, _)) = &state.written {
            if !status.is_success() {
                warn!(%status, bytes = data.len(), "discarding body write");
                return Err(WriterError::BodyNotAllowed(*status));
            }
        }

        let conn = state.conn.as_mut().ok_or(WriterError::Closed)?;
        conn.write_all(data).await?;
        Ok(data.len())
    }

    /// Writes a UTF-8 string as body bytes. See [`write`](Self::write).
    pub async fn write_str(&self, text: &str) -> Result<usize, WriterError> {
        self.write(text.as_bytes()).await
    }

    /// The status line written so far, if any.
    pub async fn written(&self) -> Option<(Status, String)> {
        self.inner.lock().await.written.clone()
    }

    /// Returns `true` once a status line has been written.
    pub async fn has_written(&self) -> bool {
        self.inner.lock().await.written.is_some()
    }

    /// Flushes and shuts the connection down. Every later call on any clone
    /// fails with [`WriterError::Closed`].
    pub(crate) async fn finish(&self) -> io::Result<()> {
        let conn = self.inner.lock().await.conn.take();
        if let Some(mut conn) = conn {
            conn.flush().await?;
            conn.shutdown().await?;
        }
        Ok(())
    }
}

impl fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseWriter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};

    use super::*;

    fn pipe() -> (ResponseWriter, DuplexStream) {
        let (server, client) = duplex(4096);
        (ResponseWriter::new(server), client)
    }

    async fn read_all(w: &ResponseWriter, mut client: DuplexStream) -> String {
        w.finish().await.unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn implicit_success_status() {
        let (w, client) = pipe();
        w.write_str("hello").await.unwrap();
        assert_eq!(
            w.written().await,
            Some((Status::SUCCESS, "text/gemini".to_owned()))
        );
        assert_eq!(read_all(&w, client).await, "20 text/gemini\r\nhello");
    }

    #[tokio::test]
    async fn explicit_status_then_body() {
        let (w, client) = pipe();
        w.write_status(Status::SUCCESS, "text/plain").await.unwrap();
        w.write(b"a").await.unwrap();
        w.write(b"b").await.unwrap();
        assert_eq!(read_all(&w, client).await, "20 text/plain\r\nab");
    }

    #[tokio::test]
    async fn second_status_is_ignored() {
        let (w, client) = pipe();
        w.write_status(Status::NOT_FOUND, "nope").await.unwrap();
        w.write_status(Status::SUCCESS, "text/plain").await.unwrap();
        assert_eq!(w.written().await.unwrap().0, Status::NOT_FOUND);
        assert_eq!(read_all(&w, client).await, "51 nope\r\n");
    }

    #[tokio::test]
    async fn body_rejected_outside_success() {
        let (w, client) = pipe();
        w.write_status(Status::REDIRECT, "/elsewhere").await.unwrap();
        let err = w.write(b"leak").await.unwrap_err();
        assert!(matches!(err, WriterError::BodyNotAllowed(s) if s == Status::REDIRECT));
        assert_eq!(read_all(&w, client).await, "30 /elsewhere\r\n");
    }

    #[tokio::test]
    async fn invalid_meta_and_status_rejected() {
        let (w, _client) = pipe();
        assert!(matches!(
            w.write_status(Status::SUCCESS, "text/plain\r\n20 x").await,
            Err(WriterError::InvalidMeta)
        ));
        assert!(matches!(
            w.write_status(Status::new(99), "x").await,
            Err(WriterError::InvalidStatus(_))
        ));
        assert!(!w.has_written().await);
    }

    #[tokio::test]
    async fn closed_after_finish() {
        let (w, _client) = pipe();
        let clone = w.clone();
        w.finish().await.unwrap();
        assert!(matches!(
            clone.write_status(Status::SUCCESS, "text/plain").await,
            Err(WriterError::Closed)
        ));
    }
}
