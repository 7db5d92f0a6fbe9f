#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # weft
//!
//! weft is an HTTP/1.1 server engine: the per-connection parsing, framing,
//! and exchange-loop machinery that a higher-level HTTP server is built on
//! top of.
//!
//! Applications register routes and handlers elsewhere; weft accepts a
//! connected, bidirectional byte stream (anything implementing
//! [`tokio::io::AsyncRead`] + [`tokio::io::AsyncWrite`]) and drives it as a
//! sequence of request/response exchanges, handling:
//!
//! - request-line and header parsing, with strict size caps and a lenient
//!   line-terminator grammar,
//! - `Content-Length` and `Transfer-Encoding: chunked` request bodies,
//!   including trailers,
//! - response framing invariants (`Transfer-Encoding` vs `Content-Length`,
//!   1xx/204/304/HEAD/CONNECT rules, `Connection: close` tracking),
//! - persistent-connection reuse, idle/body/response timeouts, and recovery
//!   through a user-configurable error-handler chain.
//!
//! Route registries, path-parameter matching, TLS, and listener bootstrap
//! are not part of this crate; [`service::RequestHandler`] and
//! [`service::ErrorHandler`] are the seams where an application plugs in.
//! Each dispatched request carries a [`RequestTarget`] in its
//! [`Extensions`](http::Extensions), giving a route registry normalized
//! path segments and query pairs to match against without redoing the
//! splitting and percent-decoding itself.

#[doc(no_inline)]
pub use http::{HeaderMap, Method, Request, Response, StatusCode, Version};

pub use crate::error::{Error, Result};

#[macro_use]
mod trace;

pub mod body;
#[macro_use]
mod common;
mod error;
mod headers;
mod proto;
pub mod rt;
pub mod server;
pub mod service;
mod target;

pub use crate::target::RequestTarget;
