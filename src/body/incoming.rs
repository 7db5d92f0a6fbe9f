use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};

use crate::error::Error;
use crate::proto::h1::io::MemRead;
use crate::proto::h1::Decoder;
use crate::rt::{Sleep, Timer};

use super::DecodedLength;

/// A stream of `Bytes` making up a request body, as delivered to a
/// [`RequestHandler`](crate::service::RequestHandler).
///
/// `Incoming` implements [`http_body::Body`]; exactly one of its frames is
/// ever polled out of the underlying connection at a time (one buffer in
/// flight at most), and dropping it mid-stream cancels the subscription: the
/// exchange loop still drains whatever the message boundary demands before
/// starting the next request.
#[must_use = "streams do nothing unless polled"]
pub struct Incoming {
    kind: Kind,
}

enum Kind {
    Empty,
    Streaming {
        content_length: DecodedLength,
        shared: Arc<Mutex<Streaming>>,
        timer: Option<(Arc<dyn Timer + Send + Sync>, Duration)>,
        sleep: Option<Pin<Box<dyn Sleep>>>,
    },
}

pub(crate) struct Streaming {
    decoder: Decoder,
    io: Box<dyn MemRead + Send>,
}

impl Incoming {
    pub(crate) fn empty() -> Incoming {
        Incoming { kind: Kind::Empty }
    }

    pub(crate) fn new(
        decoder: Decoder,
        content_length: DecodedLength,
        io: Box<dyn MemRead + Send>,
        timer: Option<(Arc<dyn Timer + Send + Sync>, Duration)>,
    ) -> (Incoming, BodyHandle) {
        let shared = Arc::new(Mutex::new(Streaming { decoder, io }));
        let handle = BodyHandle {
            shared: shared.clone(),
        };
        (
            Incoming {
                kind: Kind::Streaming {
                    content_length,
                    shared,
                    timer,
                    sleep: None,
                },
            },
            handle,
        )
    }

    #[cfg(test)]
    pub(crate) fn from_decoder(decoder: Decoder, io: Box<dyn MemRead + Send>) -> Incoming {
        let (incoming, _handle) = Incoming::new(decoder, DecodedLength::CHUNKED, io, None);
        incoming
    }
}

/// A handle retained by the exchange loop so it can finish draining a body
/// the application never fully consumed without racing the application's
/// own polls — the two sides
/// are never active at the same time, so a plain mutex is enough.
#[derive(Clone)]
pub(crate) struct BodyHandle {
    shared: Arc<Mutex<Streaming>>,
}

impl BodyHandle {
    /// Drives the decoder to completion, discarding any bytes the
    /// application left unread, so the underlying stream sits exactly at
    /// the next message boundary.
    pub(crate) async fn drain(&self) -> Result<(), Error> {
        std::future::poll_fn(|cx| {
            let mut guard = self.shared.lock().unwrap();
            loop {
                if guard.decoder.is_eof() {
                    return Poll::Ready(Ok(()));
                }
                match guard.decoder.decode(cx, &mut *guard.io) {
                    Poll::Ready(Ok(frame)) => {
                        if frame.is_data() && frame.data_ref().map_or(true, |d| d.is_empty()) {
                            // zero-length data frame from an exhausted Length/Eof decoder
                            continue;
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(Error::from(e))),
                    Poll::Pending => return Poll::Pending,
                }
            }
        })
        .await
    }
}

impl Body for Incoming {
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Error>>> {
        let this = self.get_mut();
        match this.kind {
            Kind::Empty => Poll::Ready(None),
            Kind::Streaming {
                ref shared,
                ref timer,
                ref mut sleep,
                ..
            } => {
                if let Some((timer, dur)) = timer {
                    let sleep = sleep.get_or_insert_with(|| timer.sleep(*dur));
                    if sleep.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(Some(Err(Error::new_request_body_timeout())));
                    }
                }

                let mut guard = shared.lock().unwrap();
                if guard.decoder.is_eof() {
                    return Poll::Ready(None);
                }
                match guard.decoder.decode(cx, &mut *guard.io) {
                    Poll::Ready(Ok(frame)) => {
                        if let Some(data) = frame.data_ref() {
                            if data.is_empty() && guard.decoder.is_eof() {
                                return Poll::Ready(None);
                            }
                        }
                        Poll::Ready(Some(Ok(frame)))
                    }
                    Poll::Ready(Err(e)) => Poll::Ready(Some(Err(Error::from(e)))),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match self.kind {
            Kind::Empty => true,
            Kind::Streaming { ref shared, .. } => shared.lock().unwrap().decoder.is_eof(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self.kind {
            Kind::Empty => SizeHint::with_exact(0),
            Kind::Streaming { content_length, .. } => match content_length.into_opt() {
                Some(n) => SizeHint::with_exact(n),
                None => SizeHint::default(),
            },
        }
    }
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming").finish()
    }
}

fn _assert_send_sync() {
    fn assert_send<T: Send>() {}
    assert_send::<Incoming>();
}
