//! Per-connection configuration and the entry point for driving one.

use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::common::time::{Dur, Time};
use crate::proto::{Conn, ConnOptions};
use crate::rt::Timer;
use crate::service::{ErrorHandler, RequestHandler};

/// Configures a connection's parsing limits, timeouts, and buffer-pool
/// sizing, then drives it with [`Builder::serve_connection`].
///
/// A `Builder` holds no connection state itself; the same one can be
/// reused to serve any number of connections.
#[derive(Clone)]
pub struct Builder {
    options: ConnOptions,
    timer: Time,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder").finish()
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            options: ConnOptions::default(),
            timer: Time::Empty,
        }
    }
}

impl Builder {
    /// Creates a new connection builder with the engine's defaults: no
    /// size caps beyond the request head itself, no timeouts, and no
    /// title-casing of response header names.
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Supplies the timer backing `timeout_idle_connection`,
    /// `timeout_request_body`, and `timeout_response`. Required if any of
    /// those are set to a non-zero duration; [`serve_connection`] panics
    /// on the first timeout check otherwise.
    ///
    /// [`serve_connection`]: Builder::serve_connection
    pub fn timer<T>(&mut self, timer: T) -> &mut Builder
    where
        T: Timer + Send + Sync + 'static,
    {
        self.timer = Time::Timer(std::sync::Arc::new(timer));
        self
    }

    /// Caps the request-line plus header block at `size` bytes. A request
    /// whose head doesn't fit is rejected with `431 Request Header Fields
    /// Too Large` before any handler runs.
    ///
    /// Default is 8KiB.
    pub fn max_request_head_size(&mut self, size: usize) -> &mut Builder {
        self.options.max_request_head_size = size;
        self
    }

    /// Caps the number of headers a single request's head (or trailer
    /// block) may carry.
    ///
    /// Default is unbounded.
    pub fn max_headers(&mut self, count: usize) -> &mut Builder {
        self.options.h1_max_headers = Some(count);
        self
    }

    /// Caps the size of an individual header (or trailer) line.
    ///
    /// Default is unbounded, beyond [`max_request_head_size`].
    ///
    /// [`max_request_head_size`]: Builder::max_request_head_size
    pub fn max_trailer_size(&mut self, size: usize) -> &mut Builder {
        self.options.h1_max_header_size = Some(size);
        self
    }

    /// Caps how many error responses a single connection will write
    /// before the connection is forced closed, so a client that keeps
    /// sending malformed requests can't hold a connection open forever.
    ///
    /// Default is 100.
    pub fn max_error_responses(&mut self, count: usize) -> &mut Builder {
        self.options.max_error_responses = count;
        self
    }

    /// Caps how many times the error-handler chain is allowed to fail
    /// over to the next handler for a single error, before the engine
    /// falls back to its own default response.
    ///
    /// Default is 3.
    pub fn max_error_recovery_attempts(&mut self, count: usize) -> &mut Builder {
        self.options.max_error_recovery_attempts = count;
        self
    }

    /// How long a connection may sit idle, waiting for the next request
    /// line, before it's closed.
    ///
    /// Default is no timeout.
    pub fn timeout_idle_connection(&mut self, duration: Duration) -> &mut Builder {
        self.options.timeout_idle_connection = Dur::Configured(Some(duration));
        self
    }

    /// How long a request body may go without a forward-progress read
    /// before the exchange fails with a timeout error.
    ///
    /// Default is no timeout.
    pub fn timeout_request_body(&mut self, duration: Duration) -> &mut Builder {
        self.options.timeout_request_body = Dur::Configured(Some(duration));
        self
    }

    /// How long a handler may take to produce its final response before
    /// the exchange fails with a timeout error.
    ///
    /// Default is no timeout.
    pub fn timeout_response(&mut self, duration: Duration) -> &mut Builder {
        self.options.timeout_response = Dur::Configured(Some(duration));
        self
    }

    /// Whether to reject `HTTP/1.0` requests outright with a `505 HTTP
    /// Version Not Supported` response instead of serving them.
    ///
    /// Default is false.
    pub fn reject_clients_using_http1_0(&mut self, reject: bool) -> &mut Builder {
        self.options.reject_clients_using_http1_0 = reject;
        self
    }

    /// Whether to write response header names in their originally
    /// registered title case (`Content-Type`) instead of lowercase.
    ///
    /// Default is false.
    pub fn title_case_headers(&mut self, enabled: bool) -> &mut Builder {
        self.options.title_case_headers = enabled;
        self
    }

    /// The number of buffers the connection's read/write pool keeps on
    /// hand.
    ///
    /// Default is the engine's built-in pool size.
    pub fn pool_buf_count(&mut self, count: usize) -> &mut Builder {
        self.options.buf_count = count;
        self
    }

    /// The size of each buffer in the connection's read/write pool.
    ///
    /// Default is the engine's built-in buffer size.
    pub fn pool_buf_size(&mut self, size: usize) -> &mut Builder {
        self.options.buf_size = size;
        self
    }

    /// Drives `io` as a sequence of request/response exchanges, calling
    /// `handler` for each request and falling back through
    /// `error_handlers` in order whenever the handler or the engine
    /// itself fails.
    ///
    /// Resolves once the peer closes the connection, a handler closes
    /// its [`ResponseChannel`](crate::service::ResponseChannel), or an
    /// error can't be recovered from.
    pub async fn serve_connection<I, H, EH>(
        &self,
        io: I,
        handler: H,
        error_handlers: &[EH],
    ) -> crate::Result<()>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        H: RequestHandler,
        EH: ErrorHandler,
    {
        let conn = Conn::new(io, self.options.clone(), self.timer.clone());
        conn.run(handler, error_handlers).await
    }
}
