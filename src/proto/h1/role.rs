//! Request decoder selection and response framing.
//!
//! This is the seam between the wire-level parsers (`parse.rs`, `decode.rs`)
//! and the application: it turns a parsed request head into a body decoder,
//! and turns an application-produced response into a ready-to-serialize head
//! plus the `Encoder` that will frame its body.
use http::header::{CONNECTION, CONTENT_LENGTH, TRAILER, TRANSFER_ENCODING};
use http::{HeaderValue, Method, StatusCode, Version};

use crate::error::{Error, Kind};
use crate::headers;
use crate::proto::h1::Decoder;
use crate::proto::h1::Encoder;
use crate::proto::BodyLength;

use super::DecodedLength;

/// Default cap on the number of trailer fields a chunked body may carry,
/// used whenever a connection hasn't configured its own `h1_max_headers`.
pub(crate) const DEFAULT_MAX_HEADERS: usize = 100;

/// Picks the body decoder for a parsed request, per the framing rules a
/// request observes: `Content-Length` and `Transfer-Encoding: chunked` are
/// mutually exclusive, and a request with neither has an empty body.
pub(crate) fn decoder_for_request(
    method: &Method,
    headers: &http::HeaderMap,
    h1_max_headers: Option<usize>,
    h1_max_header_size: Option<usize>,
) -> Result<(Decoder, DecodedLength), Error> {
    let has_content_length = headers.get(CONTENT_LENGTH).is_some();
    let is_chunked = headers::transfer_encoding_is_chunked(headers);

    if has_content_length && headers.get(TRANSFER_ENCODING).is_some() {
        // A request declaring both is ambiguous; reject outright rather than
        // guess which framing the client intended.
        return Err(Error::new_framing_mismatch());
    }

    if is_chunked {
        let len = DecodedLength::CHUNKED;
        let decoder = Decoder::chunked(h1_max_headers, h1_max_header_size);
        return Ok((decoder, len));
    }

    if has_content_length {
        let n =
            headers::content_length_parse_all(headers).ok_or_else(Error::new_framing_mismatch)?;
        let len = DecodedLength::checked_new(n)?;
        let decoder = Decoder::length(n);
        return Ok((decoder, len));
    }

    let _ = method;
    Ok((Decoder::length(0), DecodedLength::ZERO))
}

/// What the exchange loop knows about the request an outgoing response is
/// answering. `headers` is `None` for a response synthesized before any
/// request bytes were successfully read (an early/pre-dispatch error).
pub(crate) struct RequestContext<'a> {
    pub(crate) method: &'a Method,
    pub(crate) version: Version,
    pub(crate) headers: Option<&'a http::HeaderMap>,
}

/// Result of framing a response: the encoder the caller should drive the
/// body through, and the two shutdown signals the exchange loop acts on.
pub(crate) struct Framing {
    pub(crate) encoder: Encoder,
    pub(crate) close_output: bool,
    pub(crate) close_channel: bool,
}

/// Rewrites `parts` in place to satisfy response framing invariants and
/// returns the `Encoder` that must be used to write the body.
///
/// `body_len` is the length the application's body reports through its
/// `SizeHint` before any bytes are pulled from it, so the body is consulted
/// for its length exactly once regardless of how many frames it later
/// yields. `is_final` marks the last response of the exchange (as opposed
/// to an interim `1xx`); only the last response's close decision can close
/// the write side.
#[allow(clippy::too_many_arguments)]
pub(crate) fn prepare_response(
    parts: &mut http::response::Parts,
    req: &RequestContext<'_>,
    body_len: BodyLength,
    is_final: bool,
    read_shutdown: bool,
    server_stopping: bool,
    error_response_count: &mut usize,
    max_error_responses: usize,
) -> Result<Framing, Error> {
    let is_1xx = parts.status.is_informational();
    let is_204 = parts.status == StatusCode::NO_CONTENT;
    let is_304 = parts.status == StatusCode::NOT_MODIFIED;
    let is_connect_2xx = *req.method == Method::CONNECT && parts.status.is_success();
    let must_be_empty = is_1xx || is_204 || is_304;

    // A HEAD response whose body already declares a non-zero exact length
    // is a handler bug: catch it here, before a single byte has reached
    // the wire, so the error-handler chain can still substitute a clean
    // response. A body with an unknown or streamed-to-zero length can only
    // be caught once it actually yields data, after the head is written;
    // see the `is_head` guard in `Conn::write_final`.
    if *req.method == Method::HEAD {
        if let BodyLength::Known(n) = body_len {
            if n > 0 {
                return Err(Error::new_illegal_body_in_head_response());
            }
        }
    }

    // An early or HTTP/1.0 response always advertises that the connection
    // won't persist.
    if !is_1xx && (req.version < Version::HTTP_11 || req.headers.is_none()) {
        force_connection_close(parts);
    }

    // Framing decision: chunked is selected when trailers are present (and
    // the request can see them) or the body's length is unknown.
    let mut trailer_fields: Option<Vec<HeaderValue>> = None;
    if parts.headers.contains_key(TRAILER) {
        if req.version < Version::HTTP_11 {
            parts.headers.remove(TRAILER);
        } else {
            trailer_fields = Some(parts.headers.get_all(TRAILER).iter().cloned().collect());
        }
    }

    let wants_chunked = trailer_fields.is_some() || matches!(body_len, BodyLength::Unknown);

    if wants_chunked && must_be_empty {
        return Err(Error::new_illegal_body_in_1xx_or_no_content());
    }

    let mut encoder = if must_be_empty {
        parts.headers.remove(TRANSFER_ENCODING);
        parts.headers.remove(CONTENT_LENGTH);
        Encoder::length(0)
    } else if is_connect_2xx {
        parts.headers.remove(CONTENT_LENGTH);
        parts.headers.remove(TRANSFER_ENCODING);
        Encoder::close_delimited()
    } else if wants_chunked {
        if parts.headers.get(TRANSFER_ENCODING).is_some() {
            return Err(Error::new_framing_mismatch());
        }
        parts
            .headers
            .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        Encoder::chunked()
    } else {
        match body_len {
            BodyLength::Known(n) => Encoder::length(n),
            BodyLength::Unknown => unreachable!("handled by wants_chunked above"),
        }
    };

    if let Some(fields) = trailer_fields {
        encoder = encoder.into_chunked_with_trailing_fields(fields);
    }

    // Track `Connection: close` across all four triggers; once any fires,
    // the final response must carry it too.
    let saw_close = response_says_close(parts)
        || req
            .headers
            .and_then(|h| h.get(CONNECTION))
            .map_or(false, headers::connection_close)
        || read_shutdown
        || server_stopping;
    if saw_close && !is_1xx {
        force_connection_close(parts);
    }

    // Enforce the remaining invariants now that framing is settled.
    if (is_1xx || is_204) && parts.headers.get(TRANSFER_ENCODING).is_some() {
        return Err(Error::new_transfer_encoding_in_1xx());
    }
    if parts.headers.get(TRANSFER_ENCODING).is_some()
        && parts.headers.get(CONTENT_LENGTH).is_some()
    {
        return Err(Error::new_framing_mismatch());
    }
    if is_connect_2xx && parts.headers.get(CONTENT_LENGTH).is_some() {
        return Err(Error::new_framing_mismatch());
    }
    if !wants_chunked && !must_be_empty && !is_connect_2xx {
        if let Some(declared) = headers::content_length_parse_all(&parts.headers) {
            if let BodyLength::Known(actual) = body_len {
                if declared != actual {
                    return Err(Error::new_framing_mismatch());
                }
            }
        } else if let BodyLength::Known(n) = body_len {
            parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(n));
        }
    }

    // The per-connection error-response budget.
    let mut close_channel = server_stopping;
    if parts.status.is_client_error() || parts.status.is_server_error() {
        *error_response_count += 1;
        if *error_response_count >= max_error_responses {
            close_channel = true;
        }
    }

    Ok(Framing {
        encoder,
        close_output: saw_close && is_final,
        close_channel,
    })
}

fn response_says_close(parts: &http::response::Parts) -> bool {
    parts
        .headers
        .get(CONNECTION)
        .map_or(false, headers::connection_close)
}

fn force_connection_close(parts: &mut http::response::Parts) {
    if !response_says_close(parts) {
        parts
            .headers
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }
}

/// The default status used by the built-in error handler when a wire-level
/// error reaches the end of the error-handler chain without a more specific
/// substitute response.
pub(crate) fn default_status_for_error(err: &Error) -> StatusCode {
    // A response the application itself framed illegally is the
    // application's bug, not the client's malformed request; it falls
    // through to the same generic 500 a handler panic would produce,
    // matching the reference behavior of only mapping *parse* errors to
    // 400 and leaving every other kind to the catch-all.
    let is_response_side_bug = matches!(
        err.kind(),
        Kind::IllegalBodyInHeadResponse
            | Kind::IllegalBodyIn1xxOrNoContent
            | Kind::TransferEncodingIn1xx
    );

    if err.is_unsupported_version() {
        StatusCode::HTTP_VERSION_NOT_SUPPORTED
    } else if err.is_size_limit() {
        StatusCode::from_u16(431).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    } else if !is_response_side_bug && (err.is_parse() || err.is_framing()) {
        StatusCode::BAD_REQUEST
    } else if err.is_timeout() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// Serializes a header map as `name: value\r\n` pairs, lower-case as stored.
pub(crate) fn write_headers(headers: &http::HeaderMap, dst: &mut Vec<u8>) {
    for (name, value) in headers.iter() {
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
}

/// Same as [`write_headers`], but title-cases each hyphen-separated segment
/// of the header name (`content-length` -> `Content-Length`), for peers that
/// expect or prefer conventional casing.
pub(crate) fn write_headers_title_case(headers: &http::HeaderMap, dst: &mut Vec<u8>) {
    for (name, value) in headers.iter() {
        title_case(name.as_str().as_bytes(), dst);
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
}

fn title_case(name: &[u8], dst: &mut Vec<u8>) {
    let mut at_boundary = true;
    for &b in name {
        if b == b'-' {
            dst.push(b);
            at_boundary = true;
        } else if at_boundary {
            dst.push(b.to_ascii_uppercase());
            at_boundary = false;
        } else {
            dst.push(b);
        }
    }
}
