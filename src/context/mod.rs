//! Per-request context — captured route parameters and cancellation.
//!
//! A [`Context`] is threaded explicitly through every handler call. The
//! server creates one per connection and the router attaches the matched
//! [`Params`] to it; clients accept one to make a transaction cancellable.

use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::watch;

/// Positional path parameters captured by the router.
///
/// One entry per `:param` segment on the path from the root to the matched
/// route, in traversal order. Parameter names are not retained.
///
/// # Examples
///
/// ```
/// use rgemini::context::Params;
///
/// let params = Params::from(vec!["42".to_owned()]);
/// assert_eq!(params.get(0), Some("42"));
/// assert_eq!(params.get(1), None);
/// assert_eq!(params.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Arc<[String]>);

impl Params {
    /// Create an empty parameter list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the parameter at position `index`.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }
}

impl Deref for Params {
    type Target = [String];

    fn deref(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<String>> for Params {
    fn from(values: Vec<String>) -> Self {
        Self(values.into())
    }
}

/// Request-scoped values shared with handlers and client calls.
#[derive(Debug, Clone, Default)]
pub struct Context {
    params: Params,
    cancel: Option<watch::Receiver<bool>>,
}

impl Context {
    /// A context that is never cancelled and carries no params.
    pub fn background() -> Self {
        Self::default()
    }

    /// A cancellable context and the handle that cancels it.
    ///
    /// Dropping the handle cancels the context as well, so work tied to the
    /// context cannot outlive whoever created it.
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            params: Params::new(),
            cancel: Some(rx),
        };
        (ctx, CancelHandle { tx })
    }

    /// Derive a context carrying `params`, keeping the cancellation signal.
    #[must_use]
    pub fn with_params(&self, params: Params) -> Self {
        Self {
            params,
            cancel: self.cancel.clone(),
        }
    }

    /// The parameters captured by the router; empty if none were attached.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Returns `true` once the context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        match &self.cancel {
            Some(rx) => *rx.borrow() || rx.has_changed().is_err(),
            None => false,
        }
    }

    /// Resolves when the context is cancelled. Never resolves for a
    /// background context.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.cancel else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        // A closed channel means the handle was dropped, which also cancels.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Cancels the [`Context`] it was created with.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation to every clone of the context.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn params_default_empty() {
        let ctx = Context::background();
        assert!(ctx.params().is_empty());
        assert_eq!(ctx.params().get(0), None);
    }

    #[test]
    fn with_params_keeps_order() {
        let ctx = Context::background().with_params(Params::from(vec![
            "a".to_owned(),
            "b".to_owned(),
        ]));
        assert_eq!(&ctx.params()[..], &["a".to_owned(), "b".to_owned()]);
    }

    #[tokio::test]
    async fn background_never_cancels() {
        let ctx = Context::background();
        assert!(!ctx.is_cancelled());
        let waited = tokio::time::timeout(Duration::from_millis(20), ctx.cancelled()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn cancel_wakes_derived_contexts() {
        let (ctx, handle) = Context::with_cancel();
        let derived = ctx.with_params(Params::from(vec!["x".to_owned()]));
        assert!(!derived.is_cancelled());

        let waiter = tokio::spawn(async move { derived.cancelled().await });
        handle.cancel();
        waiter.await.unwrap();
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn dropping_handle_cancels() {
        let (ctx, handle) = Context::with_cancel();
        drop(handle);
        assert!(ctx.is_cancelled());
        tokio::time::timeout(Duration::from_millis(100), ctx.cancelled())
            .await
            .unwrap();
    }
}
