//! Pieces pertaining to the HTTP/1.1 message protocol.

pub(crate) mod h1;

pub(crate) use self::h1::{Conn, ConnOptions};

/// The body length a request or response declares, prior to it being
/// folded into a `DecodedLength`/`Encoder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyLength {
    /// `Content-Length`.
    Known(u64),
    /// `Transfer-Encoding: chunked`.
    Unknown,
}
