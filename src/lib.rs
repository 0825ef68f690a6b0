//! # rgemini
//!
//! An async Gemini protocol server and client framework written in Rust.
//!
//! One request line in, one `<status> <meta>` header (and, on success, a
//! body) out, over TLS, one transaction per connection.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rgemini::{Context, Request, ResponseWriter, Router, ServeMux, Server, tls};
//! use rgemini::server::HandlerResult;
//!
//! async fn hello(ctx: Context, _req: Request, w: ResponseWriter) -> HandlerResult {
//!     let name = ctx.params().get(0).unwrap_or("world");
//!     w.write_str(&format!("# Hello, {name}!\n")).await?;
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let tls = tls::server_config_from_pem("cert.pem", "key.pem")?;
//!
//!     let mut mux = ServeMux::new();
//!     mux.handle("/hello/:name", hello)?;
//!
//!     let server = Server::bind("127.0.0.1:1965", tls).await?;
//!     println!("Listening on gemini://127.0.0.1/");
//!     server.serve(mux).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`proto`] — status codes, requests, responses and the wire codec.
//! - [`router`] — the segment-tree [`ServeMux`].
//! - [`server`] — the accept loop, [`Handler`] and [`ResponseWriter`].
//! - [`client`] — the redirect-following [`Client`].
//! - [`middleware`] — handler wrappers.
//! - [`context`] — per-request params and cancellation.
//! - [`tls`] — rustls configuration.

pub mod client;
pub mod context;
pub mod middleware;
pub mod proto;
pub mod router;
pub mod server;
pub mod tls;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use client::{Client, ClientError};
pub use context::{Context, Params};
pub use proto::{Request, Response, Status, StatusClass};
pub use router::{Router, ServeMux};
pub use server::{Handler, ResponseWriter, Server, ServerError};
