//! Shared harness for exchange-loop integration tests: spins up a
//! [`weft::server::conn::Builder`] connection over an in-memory duplex
//! pair, feeds it raw request bytes, and collects whatever comes back.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

use weft::server::conn::Builder;
use weft::service::{DefaultErrorHandler, ErrorHandler, RequestHandler};

/// How long to wait, after the last byte arrives, before deciding the
/// server has nothing more to say for this round.
const IDLE_GAP: Duration = Duration::from_millis(80);

/// Drives `handler` over a fresh duplex connection: writes `request` in
/// full, then reads until the server goes quiet for [`IDLE_GAP`].
///
/// Returns the bytes read and a handle to the still-running (or already
/// finished) server task, so a caller that expects the connection to stay
/// open can keep talking to it, or one that expects it to close can await
/// the handle.
pub async fn roundtrip<H>(builder: Builder, handler: H, request: &[u8]) -> (Vec<u8>, ConnHandle)
where
    H: RequestHandler + Send + 'static,
{
    roundtrip_with_errors(builder, handler, vec![DefaultErrorHandler], request).await
}

pub async fn roundtrip_with_errors<H, EH>(
    builder: Builder,
    handler: H,
    error_handlers: Vec<EH>,
    request: &[u8],
) -> (Vec<u8>, ConnHandle)
where
    H: RequestHandler + Send + 'static,
    EH: ErrorHandler + Send + Sync + 'static,
{
    let (mut client, server_io) = tokio::io::duplex(64 * 1024);
    let task: JoinHandle<weft::Result<()>> = tokio::spawn(async move {
        builder
            .serve_connection(server_io, handler, &error_handlers)
            .await
    });

    client.write_all(request).await.expect("write request");

    let response = read_until_idle(&mut client).await;

    (response, ConnHandle { client, task })
}

/// The client-side duplex half plus the server task, handed back so a
/// test exercising keep-alive can send a second request, or a test
/// expecting connection teardown can await the task's result.
pub struct ConnHandle {
    pub client: tokio::io::DuplexStream,
    pub task: JoinHandle<weft::Result<()>>,
}

impl ConnHandle {
    /// Writes another request on the same connection and waits for the
    /// next response.
    pub async fn send(&mut self, request: &[u8]) -> Vec<u8> {
        self.client.write_all(request).await.expect("write request");
        read_until_idle(&mut self.client).await
    }

    /// Drops the client half (signalling EOF to the server) and waits for
    /// the server task to finish, with a generous timeout so a hung
    /// connection fails the test instead of the test suite.
    pub async fn close_and_join(self) -> weft::Result<()> {
        drop(self.client);
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server task did not finish")
            .expect("server task panicked")
    }
}

async fn read_until_idle(stream: &mut tokio::io::DuplexStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match tokio::time::timeout(IDLE_GAP, stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => panic!("reading response: {e}"),
            Err(_timed_out) => break,
        }
    }
    out
}
