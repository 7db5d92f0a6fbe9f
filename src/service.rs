//! The collaborator interfaces the exchange loop drives: the request
//! handler that turns a parsed request into 0..N interim responses plus
//! exactly one final response, and the error handler invoked when the
//! handler (or the engine itself) fails.
//!
//! Unlike a pull-style `Request -> Future<Response>` service, a handler
//! here is handed a [`ResponseChannel`] up front so it can push interim
//! `1xx` responses (`100 Continue`, `103 Early Hints`, ...) before its
//! final response is ready.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::combinators::BoxBody as HttpBoxBody;
use http_body_util::BodyExt;
use tokio::sync::mpsc;

use crate::body::Incoming;
use crate::error::Error;

/// A response body with its concrete type erased, so handlers can return
/// whichever [`http_body::Body`] implementation is convenient.
pub type BoxBody = HttpBoxBody<Bytes, Error>;

/// Turns any `Body` into a [`BoxBody`].
pub fn boxed<B>(body: B) -> BoxBody
where
    B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Error>,
{
    body.map_err(Into::into).boxed()
}

/// Applies a request to produce 0..N interim responses and one final
/// response, writing each through `channel` as it becomes available.
///
/// Implemented for closures returning a future via [`handler_fn`]; most
/// applications won't implement this by hand.
pub trait RequestHandler {
    type Future: Future<Output = ()> + Send;

    fn call(&self, req: Request<Incoming>, channel: ResponseChannel) -> Self::Future;
}

/// Creates a [`RequestHandler`] from an async closure.
pub fn handler_fn<F, Ret>(f: F) -> HandlerFn<F>
where
    F: Fn(Request<Incoming>, ResponseChannel) -> Ret,
    Ret: Future<Output = ()> + Send,
{
    HandlerFn { f }
}

/// Handler returned by [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

impl<F, Ret> RequestHandler for HandlerFn<F>
where
    F: Fn(Request<Incoming>, ResponseChannel) -> Ret,
    Ret: Future<Output = ()> + Send,
{
    type Future = Ret;

    fn call(&self, req: Request<Incoming>, channel: ResponseChannel) -> Self::Future {
        (self.f)(req, channel)
    }
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("impl RequestHandler").finish()
    }
}

impl<F: Clone> Clone for HandlerFn<F> {
    fn clone(&self) -> Self {
        HandlerFn { f: self.f.clone() }
    }
}

/// Produces a response for an error raised either by the engine (a parse,
/// framing, or timeout failure) or by a [`RequestHandler`]. May itself
/// fail, in which case the previous error is kept as
/// [`Error::with_suppressed`] and the chain continues, bounded by
/// `max_error_recovery_attempts`.
pub trait ErrorHandler {
    fn call(
        &self,
        err: &Error,
        req: Option<&Request<Incoming>>,
    ) -> Result<Response<BoxBody>, Error>;
}

/// An [`ErrorHandler`] built from a closure.
pub fn error_handler_fn<F>(f: F) -> ErrorHandlerFn<F>
where
    F: Fn(&Error, Option<&Request<Incoming>>) -> Result<Response<BoxBody>, Error>,
{
    ErrorHandlerFn { f }
}

pub struct ErrorHandlerFn<F> {
    f: F,
}

impl<F> ErrorHandler for ErrorHandlerFn<F>
where
    F: Fn(&Error, Option<&Request<Incoming>>) -> Result<Response<BoxBody>, Error>,
{
    fn call(
        &self,
        err: &Error,
        req: Option<&Request<Incoming>>,
    ) -> Result<Response<BoxBody>, Error> {
        (self.f)(err, req)
    }
}

impl<F> fmt::Debug for ErrorHandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("impl ErrorHandler").finish()
    }
}

/// The default error handler: maps the error to a status code via
/// [`crate::proto::h1::role::default_status_for_error`] and an empty
/// body, which the exchange loop fills in with `Connection: close`
/// framing as needed.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultErrorHandler;

impl ErrorHandler for DefaultErrorHandler {
    fn call(
        &self,
        err: &Error,
        _req: Option<&Request<Incoming>>,
    ) -> Result<Response<BoxBody>, Error> {
        let status = crate::proto::h1::role::default_status_for_error(err);
        let body = boxed(http_body::Empty::new().map_err(|e: std::convert::Infallible| match e {}));
        Response::builder()
            .status(status)
            .body(body)
            .map_err(Error::new_user)
    }
}

/// Messages a [`ResponseChannel`] forwards to the exchange loop driving
/// the connection.
pub(crate) enum ChannelMessage {
    Interim(Response<()>),
    Final(Response<BoxBody>),
    ShutdownInput,
    ShutdownOutput,
    Close,
}

/// The handle a [`RequestHandler`] uses to write interim and final
/// responses, and to half-close or close the connection.
///
/// Sending is synchronous: messages queue on an unbounded channel that
/// the exchange loop drains one exchange at a time, so a handler is
/// never blocked waiting for bytes to reach the wire.
pub struct ResponseChannel {
    tx: mpsc::UnboundedSender<ChannelMessage>,
    open_for_read: Arc<AtomicBool>,
    open_for_write: Arc<AtomicBool>,
}

/// The exchange loop's side of a [`ResponseChannel`]: the message
/// receiver plus the flags the channel's `is_open_for_*` queries read.
pub(crate) struct ChannelHandle {
    pub(crate) rx: mpsc::UnboundedReceiver<ChannelMessage>,
    pub(crate) open_for_read: Arc<AtomicBool>,
    pub(crate) open_for_write: Arc<AtomicBool>,
}

impl ResponseChannel {
    pub(crate) fn new() -> (ResponseChannel, ChannelHandle) {
        let open_for_read = Arc::new(AtomicBool::new(true));
        let open_for_write = Arc::new(AtomicBool::new(true));
        Self::new_with_flags(open_for_read, open_for_write)
    }

    /// Builds a channel sharing the given read/write flags, so a
    /// connection driving several exchanges in sequence can persist the
    /// half-close state a handler left behind across exchanges.
    pub(crate) fn new_with_flags(
        open_for_read: Arc<AtomicBool>,
        open_for_write: Arc<AtomicBool>,
    ) -> (ResponseChannel, ChannelHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ResponseChannel {
                tx,
                open_for_read: open_for_read.clone(),
                open_for_write: open_for_write.clone(),
            },
            ChannelHandle {
                rx,
                open_for_read,
                open_for_write,
            },
        )
    }

    /// Writes an interim (`1xx`) response. May be called any number of
    /// times before the final response.
    pub fn send_interim(&self, response: Response<()>) -> Result<(), Error> {
        if !response.status().is_informational() {
            return Err(Error::new_framing_mismatch());
        }
        self.send(ChannelMessage::Interim(response))
    }

    /// Writes the final response for this exchange. Consumes the
    /// channel: a handler can only ever send one.
    pub fn send_final(self, response: Response<BoxBody>) -> Result<(), Error> {
        if response.status().is_informational() {
            return Err(Error::new_framing_mismatch());
        }
        self.send(ChannelMessage::Final(response))
    }

    /// Half-closes the read side: no further request bytes will be
    /// accepted on this connection.
    pub fn shutdown_input(&self) -> Result<(), Error> {
        self.send(ChannelMessage::ShutdownInput)
    }

    /// Half-closes the write side after the final response has been
    /// flushed.
    pub fn shutdown_output(&self) -> Result<(), Error> {
        self.send(ChannelMessage::ShutdownOutput)
    }

    /// Closes the connection outright once the current exchange settles.
    pub fn close(&self) -> Result<(), Error> {
        self.send(ChannelMessage::Close)
    }

    pub fn is_open_for_read(&self) -> bool {
        self.open_for_read.load(Ordering::Acquire)
    }

    pub fn is_open_for_write(&self) -> bool {
        self.open_for_write.load(Ordering::Acquire)
    }

    fn send(&self, msg: ChannelMessage) -> Result<(), Error> {
        self.tx.send(msg).map_err(|_| Error::new_closed_stream())
    }
}

impl fmt::Debug for ResponseChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseChannel").finish()
    }
}

fn _assert_send_sync() {
    fn assert_send<T: Send>() {}
    assert_send::<ResponseChannel>();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn informational() -> Response<()> {
        Response::builder().status(103).body(()).unwrap()
    }

    fn ok() -> Response<BoxBody> {
        Response::builder()
            .status(StatusCode::OK)
            .body(boxed(http_body::Empty::new().map_err(|e: std::convert::Infallible| match e {})))
            .unwrap()
    }

    #[test]
    fn interim_rejects_non_1xx_status() {
        let (channel, _handle) = ResponseChannel::new();
        let err = channel.send_interim(Response::builder().status(200).body(()).unwrap());
        assert!(err.is_err());
    }

    #[test]
    fn final_rejects_1xx_status() {
        let (channel, _handle) = ResponseChannel::new();
        let resp = Response::builder()
            .status(103)
            .body(boxed(http_body::Empty::new().map_err(|e: std::convert::Infallible| match e {})))
            .unwrap();
        assert!(channel.send_final(resp).is_err());
    }

    #[test]
    fn interim_then_final_both_reach_the_handle() {
        let (channel, mut handle) = ResponseChannel::new();
        channel.send_interim(informational()).unwrap();
        channel.send_final(ok()).unwrap();

        assert!(matches!(
            handle.rx.try_recv().unwrap(),
            ChannelMessage::Interim(_)
        ));
        assert!(matches!(
            handle.rx.try_recv().unwrap(),
            ChannelMessage::Final(_)
        ));
    }

    #[test]
    fn send_after_handle_dropped_reports_closed() {
        let (channel, handle) = ResponseChannel::new();
        drop(handle);
        let err = channel.send_interim(informational()).unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn handler_fn_wraps_an_async_closure() {
        let handler = handler_fn(|_req: Request<Incoming>, channel: ResponseChannel| async move {
            channel.send_final(ok()).unwrap();
        });

        let (channel, mut handle) = ResponseChannel::new();
        let req = Request::builder().body(Incoming::empty()).unwrap();
        handler.call(req, channel).await;

        assert!(matches!(
            handle.rx.try_recv().unwrap(),
            ChannelMessage::Final(_)
        ));
    }
}
