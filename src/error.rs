//! Error and Result types for the exchange engine.
use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can produce a [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// The position at which a parse error was detected: the byte immediately
/// before it, the offending byte,
/// its absolute offset in the stream, and how many bytes had already been
/// consumed by the time it was raised.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParsePosition {
    /// The byte immediately preceding the offending one, if any.
    pub previous_byte: Option<u8>,
    /// The byte that caused the parser to reject the input, if the error
    /// was not simply running out of bytes.
    pub current_byte: Option<u8>,
    /// Absolute offset of `current_byte` (or of EOF) in the byte stream.
    pub absolute_position: u64,
    /// Bytes consumed so far by this parser, across all prior calls.
    pub bytes_consumed: u64,
}

/// Represents errors that can occur while driving an HTTP/1.1 exchange.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
    /// Previous error in an error-handler recovery chain, kept as
    /// `source()` so a caught-and-rethrown error doesn't lose its history.
    suppressed: Option<Box<Error>>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    RequestLineParse(ParsePosition),
    HeaderParse(ParsePosition),
    ChunkDecode(ParsePosition),
    HeadSizeExceeded(usize),
    TrailerSizeExceeded(usize),
    FramingMismatch,
    UnsupportedVersion,
    IllegalBodyInHeadResponse,
    IllegalBodyIn1xxOrNoContent,
    TransferEncodingIn1xx,
    RequestBodyTimeout,
    ResponseTimeout,
    WriteTimeout,
    EndOfStream,
    ClosedStream,
    BrokenPipe,
    InvalidDemand,
    User,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl {
                kind,
                cause: None,
                suppressed: None,
            }),
        }
    }

    pub(crate) fn with(mut self, cause: impl Into<Cause>) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    /// Attaches a previously-raised error as suppressed context, used when
    /// the error-handler chain raises a second, different error while
    /// recovering from the first.
    pub fn with_suppressed(mut self, suppressed: Error) -> Error {
        self.inner.suppressed = Some(Box::new(suppressed));
        self
    }

    /// The previous error this one superseded during error-handler
    /// recovery, if any.
    pub fn suppressed(&self) -> Option<&Error> {
        self.inner.suppressed.as_deref()
    }

    pub(crate) fn new_request_line_parse(pos: ParsePosition) -> Error {
        Error::new(Kind::RequestLineParse(pos))
    }

    pub(crate) fn new_header_parse(pos: ParsePosition) -> Error {
        Error::new(Kind::HeaderParse(pos))
    }

    pub(crate) fn new_chunk_decode(pos: ParsePosition) -> Error {
        Error::new(Kind::ChunkDecode(pos))
    }

    pub(crate) fn new_head_size_exceeded(limit: usize) -> Error {
        Error::new(Kind::HeadSizeExceeded(limit))
    }

    pub(crate) fn new_trailer_size_exceeded(limit: usize) -> Error {
        Error::new(Kind::TrailerSizeExceeded(limit))
    }

    pub(crate) fn new_framing_mismatch() -> Error {
        Error::new(Kind::FramingMismatch)
    }

    /// The request line named an HTTP version this engine won't serve
    /// (`HTTP/0.9`, or `HTTP/1.0` when configured to reject it).
    pub(crate) fn new_unsupported_version() -> Error {
        Error::new(Kind::UnsupportedVersion)
    }

    pub(crate) fn new_illegal_body_in_head_response() -> Error {
        Error::new(Kind::IllegalBodyInHeadResponse)
    }

    pub(crate) fn new_illegal_body_in_1xx_or_no_content() -> Error {
        Error::new(Kind::IllegalBodyIn1xxOrNoContent)
    }

    pub(crate) fn new_transfer_encoding_in_1xx() -> Error {
        Error::new(Kind::TransferEncodingIn1xx)
    }

    pub(crate) fn new_request_body_timeout() -> Error {
        Error::new(Kind::RequestBodyTimeout)
    }

    pub(crate) fn new_response_timeout() -> Error {
        Error::new(Kind::ResponseTimeout)
    }

    pub(crate) fn new_write_timeout() -> Error {
        Error::new(Kind::WriteTimeout)
    }

    pub(crate) fn new_end_of_stream() -> Error {
        Error::new(Kind::EndOfStream)
    }

    pub(crate) fn new_closed_stream() -> Error {
        Error::new(Kind::ClosedStream)
    }

    pub(crate) fn new_broken_pipe(cause: std::io::Error) -> Error {
        Error::new(Kind::BrokenPipe).with(cause)
    }

    pub(crate) fn new_invalid_demand() -> Error {
        Error::new(Kind::InvalidDemand)
    }

    pub(crate) fn new_user(cause: impl Into<Cause>) -> Error {
        Error::new(Kind::User).with(cause)
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    /// True for any of the request-line/header/chunk grammar errors.
    pub fn is_parse(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::RequestLineParse(_) | Kind::HeaderParse(_) | Kind::ChunkDecode(_)
        )
    }

    /// True for `HeadSizeExceeded` / `TrailerSizeExceeded`.
    pub fn is_size_limit(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::HeadSizeExceeded(_) | Kind::TrailerSizeExceeded(_)
        )
    }

    /// True for any response-framing invariant violation.
    pub fn is_framing(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::FramingMismatch
                | Kind::IllegalBodyInHeadResponse
                | Kind::IllegalBodyIn1xxOrNoContent
                | Kind::TransferEncodingIn1xx
        )
    }

    /// True for any of the three configured timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::RequestBodyTimeout | Kind::ResponseTimeout | Kind::WriteTimeout
        )
    }

    /// True when the underlying byte stream ended or was closed out from
    /// under the connection.
    pub fn is_closed(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::EndOfStream | Kind::ClosedStream | Kind::BrokenPipe
        )
    }

    /// True when this error was raised by a handler, before-action, or
    /// error-handler, rather than by the parsing/framing machinery.
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User)
    }

    /// True when the request named an HTTP version this engine refuses to
    /// serve.
    pub fn is_unsupported_version(&self) -> bool {
        matches!(self.inner.kind, Kind::UnsupportedVersion)
    }

    /// The position at which a parse error was detected, if this is a
    /// parse error.
    pub fn parse_position(&self) -> Option<ParsePosition> {
        match self.inner.kind {
            Kind::RequestLineParse(p) | Kind::HeaderParse(p) | Kind::ChunkDecode(p) => Some(p),
            _ => None,
        }
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::RequestLineParse(_) => "invalid request line",
            Kind::HeaderParse(_) => "invalid header",
            Kind::ChunkDecode(_) => "invalid chunked encoding",
            Kind::HeadSizeExceeded(_) => "request head size exceeded the configured limit",
            Kind::TrailerSizeExceeded(_) => "trailer size exceeded the configured limit",
            Kind::FramingMismatch => "response framing invariant violated",
            Kind::UnsupportedVersion => "request named an unsupported HTTP version",
            Kind::IllegalBodyInHeadResponse => "response to HEAD request had a non-empty body",
            Kind::IllegalBodyIn1xxOrNoContent => "1xx/204/304 response had a non-empty body",
            Kind::TransferEncodingIn1xx => "Transfer-Encoding present on a 1xx/204 response",
            Kind::RequestBodyTimeout => "timed out waiting for request body bytes",
            Kind::ResponseTimeout => "timed out waiting for the application's response",
            Kind::WriteTimeout => "timed out writing to the connection",
            Kind::EndOfStream => "end of stream",
            Kind::ClosedStream => "connection closed",
            Kind::BrokenPipe => "broken pipe",
            Kind::InvalidDemand => "body subscriber requested a non-positive number of items",
            Kind::User => "error from user code",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("Error");
        builder.field("kind", &self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            builder.field("cause", cause);
        }
        if let Some(ref suppressed) = self.inner.suppressed {
            builder.field("suppressed", suppressed);
        }
        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())?;
        if let Some(pos) = self.parse_position() {
            write!(
                f,
                " (at byte {}, after {} consumed)",
                pos.absolute_position, pos.bytes_consumed
            )?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        if let Some(ref cause) = self.inner.cause {
            Some(&**cause)
        } else {
            self.inner.suppressed.as_ref().map(|e| e as &(dyn StdError + 'static))
        }
    }
}

/// Wrapped inside an `io::Error` by the chunked decoder when a trailer
/// block exceeds the configured byte limit, so the blanket `io::Error`
/// conversion below can still surface it as `TrailerSizeExceeded` instead
/// of folding it into a generic `ChunkDecode`.
#[derive(Debug)]
pub(crate) struct TrailerTooLarge(pub(crate) usize);

impl fmt::Display for TrailerTooLarge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trailer block exceeded {} bytes", self.0)
    }
}

impl StdError for TrailerTooLarge {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        use std::io::ErrorKind;

        if let Some(limit) = err
            .get_ref()
            .and_then(|cause| cause.downcast_ref::<TrailerTooLarge>())
            .map(|too_large| too_large.0)
        {
            return Error::new_trailer_size_exceeded(limit);
        }

        match err.kind() {
            ErrorKind::UnexpectedEof => Error::new_end_of_stream().with(err),
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => Error::new_broken_pipe(err),
            // the chunked decoder (`proto::h1::decode`) reports every grammar
            // violation this way, since it only has a plain `io::Result` to
            // work with; surface it as a parse error rather than a closed one.
            ErrorKind::InvalidData => Error::new_chunk_decode(ParsePosition::default()).with(err),
            _ => Error::new_closed_stream().with(err),
        }
    }
}
