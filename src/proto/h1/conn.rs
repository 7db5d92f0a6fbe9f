//! The per-connection HTTP/1.1 exchange loop.
//!
//! A [`Conn`] owns the raw transport (wrapped in the shared read/write
//! [`Pool`]) and drives it through a sequence of request/response exchanges:
//! read a request head, hand the body off to the application, await
//! whatever interim and final responses the handler produces, write them
//! back, and either loop for the next request or close the connection.
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Context;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use http::{HeaderValue, Method, Request, Response, StatusCode, Version};
use http_body::Body;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::body::{DecodedLength, Incoming};
use crate::common::time::{Dur, Time};
use crate::error::Error;
use crate::proto::h1::io::{Cursor, MemRead, Pool, BUF_COUNT, BUF_SIZE};
use crate::proto::h1::parse::{HeaderBlockReader, RequestLineParser};
use crate::proto::h1::role::{self, RequestContext};
use crate::proto::h1::{date, Decoder, Encoder};
use crate::proto::BodyLength;
use crate::rt::{Sleep, Timer};
use crate::service::{
    BoxBody, ChannelMessage, DefaultErrorHandler, ErrorHandler, RequestHandler, ResponseChannel,
};

/// Per-connection tuning. Built by [`crate::server::conn::Builder`] and
/// handed to [`Conn::new`] along with a [`Time`] to back the three
/// configurable timeouts.
#[derive(Clone)]
pub(crate) struct ConnOptions {
    pub(crate) max_request_head_size: usize,
    pub(crate) h1_max_headers: Option<usize>,
    /// Also bounds trailer size; there's no separate trailer parser state to
    /// cap independently of the chunked-body decoder's own header cap.
    pub(crate) h1_max_header_size: Option<usize>,
    pub(crate) max_error_responses: usize,
    pub(crate) max_error_recovery_attempts: usize,
    pub(crate) timeout_idle_connection: Dur,
    pub(crate) timeout_request_body: Dur,
    pub(crate) timeout_response: Dur,
    pub(crate) reject_clients_using_http1_0: bool,
    pub(crate) title_case_headers: bool,
    pub(crate) buf_count: usize,
    pub(crate) buf_size: usize,
}

impl Default for ConnOptions {
    fn default() -> Self {
        ConnOptions {
            max_request_head_size: 8 * 1024,
            h1_max_headers: None,
            h1_max_header_size: None,
            max_error_responses: 100,
            max_error_recovery_attempts: 3,
            timeout_idle_connection: Dur::Default(None),
            timeout_request_body: Dur::Default(None),
            timeout_response: Dur::Default(None),
            reject_clients_using_http1_0: false,
            title_case_headers: false,
            buf_count: BUF_COUNT,
            buf_size: BUF_SIZE,
        }
    }
}

/// A fully parsed request head, ready to become an [`http::Request`] once a
/// body is attached.
struct ParsedHead {
    method: Method,
    uri: http::Uri,
    version: Version,
    headers: http::HeaderMap,
    decoder: Decoder,
    content_length: DecodedLength,
}

/// What happened while writing a final response: `BeforeWrite` means
/// [`role::prepare_response`] rejected it before a single byte reached the
/// socket, so the exchange loop can still substitute a different response;
/// `Terminal` means bytes were already written (or the write itself failed),
/// so the connection can only be torn down.
enum FinalWriteOutcome {
    BeforeWrite(Error),
    Terminal(Error),
}

impl FinalWriteOutcome {
    fn into_error(self) -> Error {
        match self {
            FinalWriteOutcome::BeforeWrite(e) | FinalWriteOutcome::Terminal(e) => e,
        }
    }
}

/// Reads the shared [`Pool`] on the application's behalf, type-erasing the
/// connection's transport so [`Incoming`] doesn't need to carry it.
struct PoolReader<I> {
    pool: Arc<Mutex<Pool<I>>>,
}

impl<I: AsyncRead + Unpin> MemRead for PoolReader<I> {
    fn read_mem(
        &mut self,
        cx: &mut Context<'_>,
        len: usize,
    ) -> std::task::Poll<io::Result<Bytes>> {
        self.pool.lock().unwrap().poll_read_mem(cx, len)
    }
}

/// Drives one connection's worth of HTTP/1.1 exchanges.
pub(crate) struct Conn<I> {
    pool: Arc<Mutex<Pool<I>>>,
    options: ConnOptions,
    timer: Time,
    error_response_count: usize,
    open_for_read: Arc<AtomicBool>,
    open_for_write: Arc<AtomicBool>,
}

impl<I> Conn<I>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(io: I, options: ConnOptions, timer: Time) -> Self {
        let mut pool = Pool::new(io);
        pool.set_buf_size(options.buf_size);
        pool.set_buf_count(options.buf_count);
        Conn {
            pool: Arc::new(Mutex::new(pool)),
            options,
            timer,
            error_response_count: 0,
            open_for_read: Arc::new(AtomicBool::new(true)),
            open_for_write: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Drives exchanges until the peer closes the connection, the
    /// application closes its channel, or an error can no longer be
    /// recovered from by writing a substitute response.
    pub(crate) async fn run<H, EH>(mut self, handler: H, error_handlers: &[EH]) -> crate::Result<()>
    where
        H: RequestHandler,
        EH: ErrorHandler,
    {
        loop {
            match self.exchange(&handler, error_handlers).await {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    fn timer_handle(&self) -> Option<Arc<dyn Timer + Send + Sync>> {
        match &self.timer {
            Time::Timer(t) => Some(t.clone()),
            Time::Empty => None,
        }
    }

    /// Runs a single request/response exchange. `Ok(true)` means the
    /// connection should parse another request; `Ok(false)` means it should
    /// close cleanly; `Err` means it failed in a way nothing further can be
    /// written for.
    async fn exchange<H, EH>(&mut self, handler: &H, error_handlers: &[EH]) -> crate::Result<bool>
    where
        H: RequestHandler,
        EH: ErrorHandler,
    {
        let head = match self.read_head().await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(false),
            Err(err) => {
                // A read error with nothing parsed yet is an ordinary client
                // abort, not something worth telling an error handler about.
                if err.is_closed() {
                    return Ok(false);
                }
                let substitute = resolve_error_response(
                    err,
                    None,
                    error_handlers,
                    self.options.max_error_recovery_attempts,
                );
                let req_ctx = RequestContext {
                    method: &Method::GET,
                    version: Version::HTTP_11,
                    headers: None,
                };
                let framing = self
                    .write_final(substitute, &req_ctx, false)
                    .await
                    .map_err(FinalWriteOutcome::into_error)?;
                self.finish_write(&framing).await?;
                return Ok(false);
            }
        };

        let method = head.method.clone();
        let version = head.version;
        let request_headers = head.headers.clone();

        let body_timer = self
            .timer
            .check(self.options.timeout_request_body, "timeout_request_body")
            .and_then(|dur| self.timer_handle().map(|t| (t, dur)));
        let body_io: Box<dyn MemRead + Send> = Box::new(PoolReader {
            pool: self.pool.clone(),
        });
        let (incoming, body_handle) =
            Incoming::new(head.decoder, head.content_length, body_io, body_timer);

        let target = crate::target::RequestTarget::parse(&head.uri.to_string());

        let mut builder = Request::builder()
            .method(head.method)
            .uri(head.uri)
            .version(head.version);
        if let Some(headers_mut) = builder.headers_mut() {
            *headers_mut = head.headers;
        }
        let mut request = builder.body(incoming).map_err(Error::new_user)?;
        request.extensions_mut().insert(target);

        let (channel, mut channel_handle) = ResponseChannel::new_with_flags(
            self.open_for_read.clone(),
            self.open_for_write.clone(),
        );

        let dispatch = handler.call(request, channel);
        tokio::pin!(dispatch);
        let req_ctx = RequestContext {
            method: &method,
            version,
            headers: Some(&request_headers),
        };

        // Interim (1xx) responses must reach the wire as the handler
        // produces them, not only once it finishes — an `Expect:
        // 100-continue` reply is useless to the peer if it's held back
        // until the final response is also ready. So the handler's
        // dispatch future and the channel it writes through are driven
        // concurrently: each message is written as soon as it arrives,
        // and the loop keeps draining the channel after dispatch
        // completes (the handler may have queued messages it never
        // waited on).
        let mut sleep: Option<Pin<Box<dyn Sleep>>> = self
            .timer
            .check(self.options.timeout_response, "timeout_response")
            .map(|dur| self.timer.sleep_until(Instant::now() + dur));

        let mut close_output = false;
        let mut close_channel = false;
        let mut saw_final = false;
        let mut dispatch_done = false;
        let mut timed_out = false;

        'drive: loop {
            if dispatch_done {
                match channel_handle.rx.try_recv() {
                    Ok(msg) => {
                        self.apply_channel_message(
                            msg,
                            &req_ctx,
                            error_handlers,
                            &mut close_output,
                            &mut close_channel,
                            &mut saw_final,
                        )
                        .await?;
                        continue 'drive;
                    }
                    Err(_) => break 'drive,
                }
            }

            tokio::select! {
                _ = &mut dispatch => {
                    dispatch_done = true;
                }
                maybe_msg = channel_handle.rx.recv() => {
                    match maybe_msg {
                        Some(msg) => {
                            self.apply_channel_message(
                                msg,
                                &req_ctx,
                                error_handlers,
                                &mut close_output,
                                &mut close_channel,
                                &mut saw_final,
                            )
                            .await?;
                        }
                        None => dispatch_done = true,
                    }
                }
                _ = sleep_or_pending(&mut sleep) => {
                    timed_out = true;
                    break 'drive;
                }
            }
        }

        if timed_out && !saw_final {
            drop(channel_handle);
            let _ = body_handle.drain().await;
            let mut substitute = Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .body(crate::service::boxed(
                    http_body::Empty::new().map_err(|e: std::convert::Infallible| match e {}),
                ))
                .expect("building the timeout response cannot fail");
            substitute
                .headers_mut()
                .insert(http::header::CONNECTION, HeaderValue::from_static("close"));
            let framing = self
                .write_final(substitute, &req_ctx, false)
                .await
                .map_err(FinalWriteOutcome::into_error)?;
            self.finish_write(&framing).await?;
            return Ok(false);
        }

        // A handler that never sends a final response has nothing more to
        // say to this client; same if the exchange had to be torn down by
        // the response timeout after already writing one.
        if !saw_final || timed_out {
            close_channel = true;
        }

        if let Err(err) = body_handle.drain().await {
            if !err.is_timeout() {
                return Err(err);
            }
            close_channel = true;
        }

        if close_output || close_channel {
            self.shutdown_write().await?;
            return Ok(false);
        }

        Ok(true)
    }

    /// Applies one message from a [`ResponseChannel`] — writing an interim
    /// or final response, or updating the half-close/close flags the loop
    /// acts on once the exchange settles.
    #[allow(clippy::too_many_arguments)]
    async fn apply_channel_message<EH: ErrorHandler>(
        &mut self,
        msg: ChannelMessage,
        req_ctx: &RequestContext<'_>,
        error_handlers: &[EH],
        close_output: &mut bool,
        close_channel: &mut bool,
        saw_final: &mut bool,
    ) -> crate::Result<()> {
        match msg {
            ChannelMessage::Interim(resp) => {
                self.write_interim(resp, req_ctx).await?;
            }
            ChannelMessage::Final(resp) => {
                *saw_final = true;
                let read_shutdown = !self.open_for_read.load(Ordering::Acquire);
                match self.write_final(resp, req_ctx, read_shutdown).await {
                    Ok(framing) => {
                        *close_output |= framing.close_output;
                        *close_channel |= framing.close_channel;
                    }
                    Err(FinalWriteOutcome::BeforeWrite(err)) => {
                        let substitute = resolve_error_response(
                            err,
                            None,
                            error_handlers,
                            self.options.max_error_recovery_attempts,
                        );
                        let framing = self
                            .write_final(substitute, req_ctx, true)
                            .await
                            .map_err(FinalWriteOutcome::into_error)?;
                        *close_output |= framing.close_output;
                        *close_channel |= framing.close_channel;
                    }
                    Err(FinalWriteOutcome::Terminal(err)) => return Err(err),
                }
            }
            ChannelMessage::ShutdownInput => {
                self.open_for_read.store(false, Ordering::Release);
            }
            ChannelMessage::ShutdownOutput => *close_output = true,
            ChannelMessage::Close => *close_channel = true,
        }
        Ok(())
    }

    async fn finish_write(&mut self, framing: &role::Framing) -> crate::Result<()> {
        if framing.close_output || framing.close_channel {
            self.shutdown_write().await?;
        }
        Ok(())
    }

    /// Parses the next request-line and header block off the wire.
    /// `Ok(None)` is a clean end-of-stream at a message boundary.
    async fn read_head(&mut self) -> crate::Result<Option<ParsedHead>> {
        let max_head = self.options.max_request_head_size;
        let mut line_parser = RequestLineParser::new(max_head);
        let raw_line = {
            let pool = &self.pool;
            poll_fn(|cx| {
                let mut guard = pool.lock().unwrap();
                line_parser.poll_parse(&mut guard, cx)
            })
            .await
        };
        let raw_line = match raw_line {
            Ok(line) => line,
            Err(e) => {
                if e.is_closed() && line_parser.bytes_consumed() == 0 {
                    return Ok(None);
                }
                return Err(e);
            }
        };

        if raw_line.version == Version::HTTP_09 {
            return Err(Error::new_unsupported_version());
        }
        if self.options.reject_clients_using_http1_0 && raw_line.version == Version::HTTP_10 {
            return Err(Error::new_unsupported_version());
        }

        let mut header_reader = HeaderBlockReader::new(max_head, line_parser.bytes_consumed());
        let headers = {
            let pool = &self.pool;
            poll_fn(|cx| {
                let mut guard = pool.lock().unwrap();
                header_reader.poll_parse(&mut guard, cx)
            })
            .await?
        };

        let (decoder, content_length) = role::decoder_for_request(
            &raw_line.method,
            &headers,
            self.options.h1_max_headers,
            self.options.h1_max_header_size,
        )?;

        Ok(Some(ParsedHead {
            method: raw_line.method,
            uri: raw_line.target,
            version: raw_line.version,
            headers,
            decoder,
            content_length,
        }))
    }

    async fn write_interim(
        &mut self,
        response: Response<()>,
        req_ctx: &RequestContext<'_>,
    ) -> crate::Result<()> {
        let (mut parts, ()) = response.into_parts();
        role::prepare_response(
            &mut parts,
            req_ctx,
            BodyLength::Known(0),
            false,
            false,
            false,
            &mut self.error_response_count,
            self.options.max_error_responses,
        )?;
        let head = serialize_response_head(&parts, req_ctx.version, self.options.title_case_headers);
        self.write_all_timed(Cursor::new(head)).await
    }

    async fn write_final(
        &mut self,
        response: Response<BoxBody>,
        req_ctx: &RequestContext<'_>,
        read_shutdown: bool,
    ) -> Result<role::Framing, FinalWriteOutcome> {
        let (mut parts, mut body) = response.into_parts();
        if !parts.headers.contains_key(http::header::DATE) {
            parts
                .headers
                .insert(http::header::DATE, date::update_and_header_value());
        }
        let body_len = match body.size_hint().exact() {
            Some(n) => BodyLength::Known(n),
            None => BodyLength::Unknown,
        };
        let role::Framing {
            mut encoder,
            close_output,
            close_channel,
        } = role::prepare_response(
            &mut parts,
            req_ctx,
            body_len,
            true,
            read_shutdown,
            false,
            &mut self.error_response_count,
            self.options.max_error_responses,
        )
        .map_err(FinalWriteOutcome::BeforeWrite)?;

        let head = serialize_response_head(&parts, req_ctx.version, self.options.title_case_headers);
        self.write_all_timed(Cursor::new(head))
            .await
            .map_err(FinalWriteOutcome::Terminal)?;

        let is_head = *req_ctx.method == Method::HEAD;
        loop {
            let frame = poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await;
            let frame = match frame {
                None => break,
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(FinalWriteOutcome::Terminal(e)),
            };
            if frame.is_data() {
                let data = match frame.into_data() {
                    Ok(data) => data,
                    Err(_) => unreachable!("checked is_data() above"),
                };
                if !data.is_empty() {
                    if is_head {
                        return Err(FinalWriteOutcome::Terminal(
                            Error::new_illegal_body_in_head_response(),
                        ));
                    }
                    let encoded = encoder.encode(data);
                    self.write_all_timed(encoded)
                        .await
                        .map_err(FinalWriteOutcome::Terminal)?;
                }
            } else if frame.is_trailers() {
                let trailers = match frame.into_trailers() {
                    Ok(trailers) => trailers,
                    Err(_) => unreachable!("checked is_trailers() above"),
                };
                if let Some(encoded) =
                    encoder.encode_trailers::<Bytes>(trailers, self.options.title_case_headers)
                {
                    self.write_all_timed(encoded)
                        .await
                        .map_err(FinalWriteOutcome::Terminal)?;
                }
            }
        }

        match encoder.end::<Bytes>() {
            Ok(Some(end)) => {
                self.write_all_timed(end)
                    .await
                    .map_err(FinalWriteOutcome::Terminal)?;
            }
            Ok(None) => {}
            Err(_not_eof) => {
                return Err(FinalWriteOutcome::Terminal(Error::new_framing_mismatch()));
            }
        }

        Ok(role::Framing {
            encoder,
            close_output,
            close_channel,
        })
    }

    async fn shutdown_write(&self) -> crate::Result<()> {
        let pool = &self.pool;
        poll_fn(|cx| {
            let mut guard = pool.lock().unwrap();
            Pin::new(guard.get_mut()).poll_shutdown(cx)
        })
        .await
        .map_err(Error::from)
    }

    /// Writes `buf` to the socket, guarding each underlying write with
    /// `timeout_idle_connection`.
    async fn write_all_timed<B: Buf>(&mut self, mut buf: B) -> crate::Result<()> {
        while buf.has_remaining() {
            let pool = &self.pool;
            let write_once = poll_fn(|cx| {
                let mut guard = pool.lock().unwrap();
                Pin::new(guard.get_mut()).poll_write(cx, buf.chunk())
            });

            let n = match self
                .timer
                .check(self.options.timeout_idle_connection, "timeout_idle_connection")
            {
                Some(dur) => {
                    let sleep = self.timer.sleep_until(Instant::now() + dur);
                    tokio::select! {
                        res = write_once => res.map_err(Error::from)?,
                        _ = sleep => return Err(Error::new_write_timeout()),
                    }
                }
                None => write_once.await.map_err(Error::from)?,
            };

            if n == 0 {
                return Err(Error::from(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write zero bytes into the connection",
                )));
            }
            buf.advance(n);
        }
        Ok(())
    }
}

/// Walks the error-handler chain for `err`, bounded by `max_attempts`
/// successive handler invocations; a handler that raises a different error
/// restarts the chain with that error (the previous one attached as
/// suppressed context). Falls through to [`DefaultErrorHandler`] once the
/// bound is hit or every handler has declined.
fn resolve_error_response<EH: ErrorHandler>(
    mut err: Error,
    request: Option<&Request<Incoming>>,
    error_handlers: &[EH],
    max_attempts: usize,
) -> Response<BoxBody> {
    let mut attempts = 0;
    'outer: while !error_handlers.is_empty() {
        for handler in error_handlers {
            if attempts >= max_attempts {
                break 'outer;
            }
            attempts += 1;
            match handler.call(&err, request) {
                Ok(resp) => return resp,
                Err(new_err) => err = new_err.with_suppressed(err),
            }
        }
    }
    DefaultErrorHandler
        .call(&err, request)
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(crate::service::boxed(
                    http_body::Empty::new().map_err(|e: std::convert::Infallible| match e {}),
                ))
                .expect("building a minimal 500 response cannot fail")
        })
}

/// Awaits `sleep` if set, otherwise never resolves — lets the timeout arm of
/// a `select!` stay structurally present even when `timeout_response` isn't
/// configured, instead of branching the whole `select!` on its presence.
async fn sleep_or_pending(sleep: &mut Option<Pin<Box<dyn Sleep>>>) {
    match sleep {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

fn serialize_response_head(
    parts: &http::response::Parts,
    version: Version,
    title_case_headers: bool,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(match version {
        Version::HTTP_10 => b"HTTP/1.0 ",
        _ => b"HTTP/1.1 ",
    });
    itoa::write(&mut buf, parts.status.as_u16()).expect("itoa::write into a Vec<u8> cannot fail");
    buf.push(b' ');
    buf.extend_from_slice(parts.status.canonical_reason().unwrap_or("").as_bytes());
    buf.extend_from_slice(b"\r\n");
    if title_case_headers {
        role::write_headers_title_case(&parts.headers, &mut buf);
    } else {
        role::write_headers(&parts.headers, &mut buf);
    }
    buf.extend_from_slice(b"\r\n");
    buf
}
