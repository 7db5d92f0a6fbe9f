//! Size-cap and timeout scenarios (§8 "Oversize head" and "Idle-write
//! timeout").

use std::time::Duration;

use bytes::Bytes;
use weft::body::Incoming;
use weft::rt::TokioTimer;
use weft::server::conn::Builder;
use weft::service::{boxed, handler_fn, ResponseChannel};
use weft::{Request, Response, StatusCode};

mod support;

#[tokio::test]
async fn oversize_request_head_is_rejected_with_431() {
    let handler = handler_fn(|_req: Request<Incoming>, channel: ResponseChannel| async move {
        channel
            .send_final(
                Response::builder()
                    .status(StatusCode::OK)
                    .body(boxed(
                        http_body_util::Empty::new().map_err(|e: std::convert::Infallible| match e {}),
                    ))
                    .unwrap(),
            )
            .unwrap();
    });

    let mut builder = Builder::new();
    builder.max_request_head_size(32);

    let long_path = "/".to_string() + &"a".repeat(64);
    let request = format!("GET {long_path} HTTP/1.1\r\nHost: x\r\n\r\n");

    let (response, conn) = support::roundtrip(builder, handler, request.as_bytes()).await;

    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 431 "), "{text}");
    assert!(text.contains("connection: close\r\n"), "{text}");

    // The head never finished parsing, so there's no well-formed message
    // boundary to resume from; the connection ends here.
    conn.close_and_join().await.unwrap();
}

#[tokio::test]
async fn a_request_head_exactly_at_the_cap_still_parses() {
    let handler = handler_fn(|_req: Request<Incoming>, channel: ResponseChannel| async move {
        channel
            .send_final(
                Response::builder()
                    .status(StatusCode::NO_CONTENT)
                    .body(boxed(
                        http_body_util::Empty::new().map_err(|e: std::convert::Infallible| match e {}),
                    ))
                    .unwrap(),
            )
            .unwrap();
    });

    let request = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";

    let mut builder = Builder::new();
    builder.max_request_head_size(request.len());

    let (response, conn) = support::roundtrip(builder, handler, request).await;
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 204 "), "{text}");

    conn.close_and_join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn idle_write_timeout_tears_down_the_connection_without_a_second_exchange() {
    let handler = handler_fn(|_req: Request<Incoming>, channel: ResponseChannel| async move {
        let body = boxed(
            http_body_util::Full::new(Bytes::from(vec![b'x'; 64 * 1024]))
                .map_err(|e: std::convert::Infallible| match e {}),
        );
        channel
            .send_final(Response::builder().status(StatusCode::OK).body(body).unwrap())
            .unwrap();
    });

    let mut builder = Builder::new();
    builder.timer(TokioTimer);
    builder.timeout_idle_connection(Duration::from_millis(50));
    // A write-pool small enough, and a response body large enough, that the
    // duplex pipe backs up instead of draining in one write.
    let (client, server_io) = tokio::io::duplex(4 * 1024);

    let task = tokio::spawn(async move {
        builder
            .serve_connection(server_io, handler, &[weft::service::DefaultErrorHandler])
            .await
    });

    let mut client = client;
    use tokio::io::AsyncWriteExt;
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    // Never read the response: the duplex pipe fills up and every further
    // write stalls until `timeout_idle_connection` fires.
    tokio::time::advance(Duration::from_millis(200)).await;

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("connection task did not finish")
        .unwrap();

    let err = result.expect_err("a stalled write should surface as an error");
    assert!(err.is_timeout());
}
