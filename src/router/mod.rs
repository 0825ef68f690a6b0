//! Request routing — a segment trie mapping URL paths to handlers.
//!
//! This module provides [`ServeMux`], which dispatches requests by path. Three
//! pattern styles are supported:
//!
//! | Pattern            | Example match            | Captured params |
//! |--------------------|--------------------------|-----------------|
//! | `/docs`            | `/docs`                  | *(none)*        |
//! | `/users/:id/posts` | `/users/42/posts`        | `["42"]`        |
//! | `/files/:rest`     | `/files/docs/readme.txt` | *(none)*        |
//!
//! A trailing slash is significant: `/docs/` and `/docs` are separate
//! routes. With [`ServeMux::set_redirect_slash`] on (the default) a request
//! for one form is redirected to the other when only the other is
//! registered. A trailing `/:rest` registers a catch-all, which also serves
//! every deeper path that has no catch-all of its own.
//!
//! Matching prefers literal segments, then params, then catch-alls. A path
//! that runs out of tree is first redirected to its trailing-slash form
//! (when redirects are on), so catch-alls answer at a separator boundary.
//!
//! The tree is built during setup and read-only once serving starts.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::context::{Context, Params};
use crate::proto::{Request, Status, clean_path};
use crate::server::handler::{Handler, HandlerError, HandlerFuture, SharedHandler};
use crate::server::writer::ResponseWriter;

/// The trailing segment that turns a pattern into a catch-all.
const CATCH_ALL: &str = ":rest";

/// Which of a node's three handler slots a pattern occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// The bare pattern, e.g. `/docs`.
    Exact,
    /// The pattern with a trailing slash, e.g. `/docs/`.
    Slash,
    /// A trailing `/:rest`.
    CatchAll,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Slot::Exact => "exact",
            Slot::Slash => "trailing slash",
            Slot::CatchAll => "catch-all",
        })
    }
}

/// Route registration errors. These are setup-time configuration errors and
/// are never produced while serving.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("a {slot} handler is already registered for {pattern:?}")]
    Conflict { pattern: String, slot: Slot },
}

/// Registration interface shared by [`ServeMux`] and mounted [`Scope`]s.
///
/// Patterns passed to a scope are relative to the scope's mount point.
pub trait Router {
    /// Register `handler` for `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Conflict`] if the slot `pattern` maps to is
    /// already taken.
    fn handle(&mut self, pattern: &str, handler: impl Handler) -> Result<(), RouteError>;

    /// Register the catch-all for this router's root. Equivalent to
    /// `handle("/:rest", handler)`.
    fn not_found(&mut self, handler: impl Handler) -> Result<(), RouteError> {
        self.handle(CATCH_ALL, handler)
    }

    /// Mount a sub-router at `prefix`, let `build` register routes on it,
    /// and return it for further registration.
    fn route<F>(&mut self, prefix: &str, build: F) -> Result<Scope<'_>, RouteError>
    where
        F: FnOnce(&mut Scope<'_>) -> Result<(), RouteError>;
}

type NodeId = usize;

const ROOT: NodeId = 0;

#[derive(Default)]
struct Node {
    exact: Option<SharedHandler>,
    slash: Option<SharedHandler>,
    catch_all: Option<SharedHandler>,
    children: HashMap<String, NodeId>,
    param: Option<NodeId>,
    // Read-only navigation for catch-all inheritance.
    parent: Option<NodeId>,
    // Number of parameter edges between the root and this node.
    param_depth: usize,
}

impl Node {
    fn slot_mut(&mut self, slot: Slot) -> &mut Option<SharedHandler> {
        match slot {
            Slot::Exact => &mut self.exact,
            Slot::Slash => &mut self.slash,
            Slot::CatchAll => &mut self.catch_all,
        }
    }
}

/// What a path resolved to.
enum Found {
    Handler { handler: SharedHandler, params: Params },
    Redirect(String),
}

// Per-lookup state threaded through the recursive match.
struct Lookup<'p> {
    path: &'p str,
    trailing_slash: bool,
    allow_redirect: bool,
    params: Vec<String>,
}

// Nodes live in a growable arena; parent/child links are indices.
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
        }
    }

    fn insert(&mut self, from: NodeId, pattern: &str, handler: SharedHandler) -> Result<(), RouteError> {
        let cleaned = clean_path(pattern);
        let (segments, slot) = if pattern.is_empty() {
            (Vec::new(), Slot::Exact)
        } else {
            let mut segments = split_segments(&cleaned);
            if cleaned.ends_with('/') {
                (segments, Slot::Slash)
            } else if segments.last() == Some(&CATCH_ALL) {
                segments.pop();
                (segments, Slot::CatchAll)
            } else {
                (segments, Slot::Exact)
            }
        };

        let target = self.ensure(from, &segments);
        let slot_ref = self.nodes[target].slot_mut(slot);
        if slot_ref.is_some() {
            return Err(RouteError::Conflict {
                pattern: pattern.to_owned(),
                slot,
            });
        }
        *slot_ref = Some(handler);
        Ok(())
    }

    fn ensure(&mut self, from: NodeId, segments: &[&str]) -> NodeId {
        segments
            .iter()
            .fold(from, |id, segment| self.ensure_child(id, segment))
    }

    fn ensure_child(&mut self, id: NodeId, segment: &str) -> NodeId {
        let is_param = segment.starts_with(':');
        let existing = if is_param {
            self.nodes[id].param
        } else {
            self.nodes[id].children.get(segment).copied()
        };
        if let Some(child) = existing {
            return child;
        }

        let child = self.nodes.len();
        let param_depth = self.nodes[id].param_depth + usize::from(is_param);
        self.nodes.push(Node {
            parent: Some(id),
            param_depth,
            ..Node::default()
        });

        if is_param {
            self.nodes[id].param = Some(child);
        } else {
            self.nodes[id].children.insert(segment.to_owned(), child);
        }
        child
    }

    fn find(&self, path: &str, allow_redirect: bool) -> Option<Found> {
        let cleaned = clean_path(path);
        let segments = split_segments(&cleaned);
        let mut lookup = Lookup {
            path: &cleaned,
            trailing_slash: cleaned.ends_with('/'),
            allow_redirect,
            params: Vec::new(),
        };
        self.walk(ROOT, &segments, &mut lookup)
    }

    fn walk(&self, id: NodeId, rest: &[&str], lookup: &mut Lookup<'_>) -> Option<Found> {
        let Some((next, remaining)) = rest.split_first() else {
            return self.at_leaf(id, lookup);
        };
        let node = &self.nodes[id];

        if let Some(&child) = node.children.get(*next) {
            if let Some(found) = self.walk(child, remaining, lookup) {
                return Some(found);
            }
        }

        if let Some(param) = node.param {
            lookup.params.push((*next).to_owned());
            if let Some(found) = self.walk(param, remaining, lookup) {
                return Some(found);
            }
            lookup.params.pop();
        }

        // Unmatched position: move to a separator boundary first, then let
        // the nearest catch-all on the way back to the root serve it.
        if lookup.allow_redirect && !lookup.trailing_slash {
            return Some(Found::Redirect(format!("{}/", lookup.path)));
        }
        self.inherited_catch_all(id, &lookup.params)
    }

    fn inherited_catch_all(&self, from: NodeId, params: &[String]) -> Option<Found> {
        let mut current = Some(from);
        while let Some(id) = current {
            let node = &self.nodes[id];
            if let Some(handler) = &node.catch_all {
                let depth = node.param_depth.min(params.len());
                return Some(Found::Handler {
                    handler: Arc::clone(handler),
                    params: Params::from(params[..depth].to_vec()),
                });
            }
            current = node.parent;
        }
        None
    }

    fn at_leaf(&self, id: NodeId, lookup: &Lookup<'_>) -> Option<Found> {
        let node = &self.nodes[id];
        let handler = |h: &SharedHandler| Found::Handler {
            handler: Arc::clone(h),
            params: Params::from(lookup.params.clone()),
        };

        if lookup.trailing_slash {
            if let Some(h) = &node.slash {
                return Some(handler(h));
            }
            if lookup.allow_redirect && node.exact.is_some() && lookup.path != "/" {
                let trimmed = lookup.path.trim_end_matches('/');
                return Some(Found::Redirect(trimmed.to_owned()));
            }
        } else {
            if let Some(h) = &node.exact {
                return Some(handler(h));
            }
            if lookup.allow_redirect && node.slash.is_some() {
                return Some(Found::Redirect(format!("{}/", lookup.path)));
            }
        }

        node.catch_all.as_ref().map(handler)
    }
}

fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn register(tree: &mut Tree, node: NodeId, pattern: &str, handler: impl Handler) -> Result<(), RouteError> {
    tree.insert(node, pattern, Arc::new(handler))
}

fn mount<'t, F>(tree: &'t mut Tree, node: NodeId, prefix: &str, build: F) -> Result<Scope<'t>, RouteError>
where
    F: FnOnce(&mut Scope<'_>) -> Result<(), RouteError>,
{
    let cleaned = clean_path(prefix);
    let target = tree.ensure(node, &split_segments(&cleaned));
    let mut scope = Scope { tree, node: target };
    build(&mut scope)?;
    Ok(scope)
}

/// A router multiplexing requests onto handlers by URL path.
///
/// `ServeMux` is itself a [`Handler`]: when no route matches it writes
/// nothing and lets the server answer `51 not found`.
///
/// # Examples
///
/// ```rust,no_run
/// use rgemini::{Context, Request, ResponseWriter, Router, ServeMux};
/// use rgemini::server::HandlerResult;
///
/// async fn hello(ctx: Context, _req: Request, w: ResponseWriter) -> HandlerResult {
///     w.write_str(&format!("Hello {}!\n", ctx.params()[0])).await?;
///     Ok(())
/// }
///
/// let mut mux = ServeMux::new();
/// mux.handle("/hello/:name", hello).unwrap();
/// ```
pub struct ServeMux {
    tree: Tree,
    redirect_slash: bool,
}

impl Default for ServeMux {
    fn default() -> Self {
        Self::new()
    }
}

impl ServeMux {
    /// Create an empty mux with slash redirects enabled.
    pub fn new() -> Self {
        Self {
            tree: Tree::new(),
            redirect_slash: true,
        }
    }

    /// Toggle redirecting between `/path` and `/path/` when only the other
    /// form is registered.
    pub fn set_redirect_slash(&mut self, enabled: bool) {
        self.redirect_slash = enabled;
    }

    pub fn redirect_slash(&self) -> bool {
        self.redirect_slash
    }
}

impl Router for ServeMux {
    fn handle(&mut self, pattern: &str, handler: impl Handler) -> Result<(), RouteError> {
        register(&mut self.tree, ROOT, pattern, handler)
    }

    fn route<F>(&mut self, prefix: &str, build: F) -> Result<Scope<'_>, RouteError>
    where
        F: FnOnce(&mut Scope<'_>) -> Result<(), RouteError>,
    {
        mount(&mut self.tree, ROOT, prefix, build)
    }
}

impl Handler for ServeMux {
    fn serve(&self, ctx: Context, req: Request, w: ResponseWriter) -> HandlerFuture {
        match self.tree.find(req.path(), self.redirect_slash) {
            Some(Found::Handler { handler, params }) => {
                debug!(path = %req.path(), params = params.len(), "route matched");
                handler.serve(ctx.with_params(params), req, w)
            }
            Some(Found::Redirect(target)) => {
                debug!(path = %req.path(), %target, "redirecting to canonical path");
                Box::pin(async move {
                    w.write_status(Status::REDIRECT, &target).await?;
                    Ok::<(), HandlerError>(())
                })
            }
            None => {
                debug!(path = %req.path(), "no route matched");
                Box::pin(async { Ok::<(), HandlerError>(()) })
            }
        }
    }
}

/// A sub-router mounted at a node of a [`ServeMux`] tree.
pub struct Scope<'t> {
    tree: &'t mut Tree,
    node: NodeId,
}

impl Router for Scope<'_> {
    fn handle(&mut self, pattern: &str, handler: impl Handler) -> Result<(), RouteError> {
        register(self.tree, self.node, pattern, handler)
    }

    fn route<F>(&mut self, prefix: &str, build: F) -> Result<Scope<'_>, RouteError>
    where
        F: FnOnce(&mut Scope<'_>) -> Result<(), RouteError>,
    {
        mount(self.tree, self.node, prefix, build)
    }
}
