//! The server side of the exchange loop: [`conn::Builder`] configures and
//! drives a single connection. Accepting sockets and fanning them out to
//! `Builder::serve_connection` calls is left to the caller.

pub mod conn;
