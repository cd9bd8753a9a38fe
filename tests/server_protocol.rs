//! Protocol-level tests against the router, without a network socket.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::StreamExt;
use tower::ServiceExt;

use everstream::headers::*;
use everstream::sse::{SseDecoder, SseEvent};
use everstream::types::format_offset;
use everstream::{create_router, FaultDirective, ServerContext, ServerOptions};

fn ctx() -> Arc<ServerContext> {
    ServerContext::new(ServerOptions {
        long_poll_timeout_ms: 300,
        ..Default::default()
    })
}

async fn send(app: &axum::Router, req: Request<Body>) -> axum::http::Response<Body> {
    app.clone().oneshot(req).await.unwrap()
}

fn put_json(uri: &str) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_string(response: axum::http::Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn header<'a>(response: &'a axum::http::Response<Body>, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

#[tokio::test]
async fn multi_chunk_append_and_read() {
    let app = create_router(ctx());

    send(&app, put_json("/t1")).await;
    send(&app, post_json("/t1", "{\"a\":1}")).await;
    send(&app, post_json("/t1", "{\"a\":2}")).await;

    let r = send(&app, get("/t1?offset=-1")).await;
    assert_eq!(r.status(), StatusCode::OK);
    assert_eq!(header(&r, STREAM_UP_TO_DATE), Some("true"));
    assert_eq!(body_string(r).await, "[{\"a\":1},{\"a\":2}]");
}

#[tokio::test]
async fn read_from_now_is_empty_and_up_to_date() {
    let app = create_router(ctx());
    send(&app, put_json("/t1")).await;
    send(&app, post_json("/t1", "{\"a\":1}")).await;

    let r = send(&app, get("/t1?offset=now")).await;
    assert_eq!(r.status(), StatusCode::OK);
    assert_eq!(header(&r, STREAM_UP_TO_DATE), Some("true"));
    assert_eq!(header(&r, STREAM_OFFSET), Some(format_offset(0, 1).as_str()));
    assert_eq!(body_string(r).await, "[]");
}

#[tokio::test]
async fn binary_streams_concatenate() {
    let app = create_router(ctx());

    send(
        &app,
        Request::builder()
            .method("PUT")
            .uri("/bin")
            .header("Content-Type", "application/octet-stream")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    for part in ["ab", "cd"] {
        send(
            &app,
            Request::builder()
                .method("POST")
                .uri("/bin")
                .header("Content-Type", "application/octet-stream")
                .body(Body::from(part))
                .unwrap(),
        )
        .await;
    }

    let r = send(&app, get("/bin?offset=-1")).await;
    assert_eq!(body_string(r).await, "abcd");
}

#[tokio::test]
async fn reads_are_replayable_from_any_offset() {
    let app = create_router(ctx());
    send(&app, put_json("/t1")).await;
    for i in 1..=4 {
        send(&app, post_json("/t1", &format!("{}", i))).await;
    }

    let r = send(&app, get(&format!("/t1?offset={}", format_offset(0, 2)))).await;
    assert_eq!(body_string(r).await, "[3,4]");

    let r = send(&app, get(&format!("/t1?offset={}", format_offset(0, 4)))).await;
    assert_eq!(header(&r, STREAM_UP_TO_DATE), Some("true"));
    assert_eq!(body_string(r).await, "[]");
}

#[tokio::test]
async fn etag_stable_for_identical_reads() {
    let app = create_router(ctx());
    send(&app, put_json("/t1")).await;
    send(&app, post_json("/t1", "1")).await;

    let r1 = send(&app, get("/t1?offset=-1")).await;
    let r2 = send(&app, get("/t1?offset=-1")).await;
    assert_eq!(header(&r1, "etag"), header(&r2, "etag"));

    // Closing the stream changes the tag for the same range.
    send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/t1")
            .header("Content-Type", "application/json")
            .header(STREAM_CLOSED, "true")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let r3 = send(&app, get("/t1?offset=-1")).await;
    assert_ne!(header(&r1, "etag"), header(&r3, "etag"));
    assert!(header(&r3, "etag").unwrap().contains(":c"));
}

#[tokio::test]
async fn cursor_echo_advances_for_caught_up_clients() {
    let app = create_router(ctx());
    send(&app, put_json("/t1")).await;

    let r = send(&app, get("/t1?offset=-1")).await;
    let first: u64 = header(&r, STREAM_CURSOR).unwrap().parse().unwrap();

    let r = send(&app, get(&format!("/t1?offset=-1&cursor={}", first))).await;
    let second: u64 = header(&r, STREAM_CURSOR).unwrap().parse().unwrap();
    assert!(second > first);
}

#[tokio::test]
async fn sse_replays_then_follows_until_close() {
    let ctx = ctx();
    let app = create_router(ctx.clone());
    send(&app, put_json("/t1")).await;
    send(&app, post_json("/t1", "\"a\"")).await;

    let response = send(&app, get("/t1?offset=-1&live=sse")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header(&response, "content-type"),
        Some("text/event-stream")
    );

    // Feed the stream while the SSE response is open.
    {
        let store = ctx.store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            store.append("/t1", b"\"b\"".to_vec(), None, None).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            store.close("/t1", None).unwrap();
        });
    }

    let mut data_events = Vec::new();
    let mut controls = Vec::new();
    let mut decoder = SseDecoder::new();
    let mut body = response.into_body().into_data_stream();

    let outcome = tokio::time::timeout(Duration::from_secs(5), async {
        'read: while let Some(chunk) = body.next().await {
            decoder.push(&chunk.unwrap());
            while let Some(event) = decoder.next_event() {
                match event {
                    SseEvent::Data(payload) => data_events.push(payload),
                    SseEvent::Control(frame) => {
                        let closed = frame.closed;
                        controls.push(frame);
                        if closed {
                            break 'read;
                        }
                    }
                }
            }
        }
    })
    .await;
    assert!(outcome.is_ok(), "SSE stream did not close in time");

    assert_eq!(data_events, vec!["\"a\"", "\"b\""]);
    let last = controls.last().unwrap();
    assert!(last.closed);
    assert_eq!(last.offset, format_offset(0, 2));
}

#[tokio::test]
async fn fault_injection_corrupts_one_response() {
    let ctx = ctx();
    let app = create_router(ctx.clone());
    send(&app, put_json("/t1")).await;
    send(&app, post_json("/t1", "{\"a\":1}")).await;

    ctx.faults.install(
        "/t1",
        FaultDirective {
            corrupt_body: true,
            remaining: 1,
            ..Default::default()
        },
    );

    let clean = "[{\"a\":1}]";
    let r = send(&app, get("/t1?offset=-1")).await;
    assert_ne!(body_string(r).await, clean);

    let r = send(&app, get("/t1?offset=-1")).await;
    assert_eq!(body_string(r).await, clean);
}

#[tokio::test]
async fn create_with_ttl_and_expires_conflicts() {
    let app = create_router(ctx());

    let r = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri("/t1")
            .header("Content-Type", "application/json")
            .header(STREAM_TTL, "60")
            .header(STREAM_EXPIRES_AT, "2030-01-01T00:00:00Z")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(r.status(), StatusCode::BAD_REQUEST);

    let r = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri("/t1")
            .header("Content-Type", "application/json")
            .header(STREAM_TTL, "not-a-number")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(r.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn seeded_create_with_close_freezes_stream() {
    let app = create_router(ctx());

    let r = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri("/frozen")
            .header("Content-Type", "application/json")
            .header(STREAM_CLOSED, "true")
            .body(Body::from("[1,2]"))
            .unwrap(),
    )
    .await;
    assert_eq!(r.status(), StatusCode::CREATED);

    let r = send(&app, post_json("/frozen", "3")).await;
    assert_eq!(r.status(), StatusCode::CONFLICT);

    let r = send(&app, get("/frozen?offset=-1")).await;
    assert_eq!(header(&r, STREAM_CLOSED), Some("true"));
    assert_eq!(body_string(r).await, "[1,2]");
}
