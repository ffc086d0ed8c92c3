//! HTTP/1.1 end-to-end behavior against scripted peers.

mod support;

use std::time::Duration;

use http::StatusCode;
use tokio::io::AsyncWriteExt;

use turbine::{Client, Request};

fn uri(addr: std::net::SocketAddr, path: &str) -> http::Uri {
    format!("http://{}{}", addr, path).parse().unwrap()
}

#[tokio::test]
async fn chunked_response_materializes() {
    let addr = support::serve(1, |mut socket, _| async move {
        let head = support::read_request_head(&mut socket).await;
        assert!(head.starts_with("GET / HTTP/1.1\r\n"));
        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
            )
            .await
            .unwrap();
    })
    .await;

    let client = Client::new();
    let resp = client.get(uri(addr, "/")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(&resp.body()[..], b"hello");
    assert!(resp.elapsed() > Duration::ZERO);
}

#[tokio::test]
async fn informational_head_is_skipped() {
    let addr = support::serve(1, |mut socket, _| async move {
        let _ = support::read_request_head(&mut socket).await;
        socket
            .write_all(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();
    })
    .await;

    let client = Client::new();
    let resp = client.get(uri(addr, "/")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert!(resp.body().is_empty());
}

#[tokio::test]
async fn conflicting_content_lengths_never_reach_the_wire() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut headers = http::HeaderMap::new();
    headers.append(http::header::CONTENT_LENGTH, "5".parse().unwrap());
    headers.append(http::header::CONTENT_LENGTH, "6".parse().unwrap());
    let req = Request::builder(http::Method::POST, uri(addr, "/"))
        .headers(headers)
        .body("hello")
        .build()
        .unwrap();

    let client = Client::new();
    let err = client.send(req).await.unwrap_err();
    assert!(err.is_invalid_request());

    // The request was refused before any connection was opened.
    let attempted =
        tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
    assert!(attempted.is_err(), "no connection may be opened");
}

#[tokio::test]
async fn keep_alive_reuses_the_connection() {
    let addr = support::serve(1, |mut socket, _| async move {
        for _ in 0..2 {
            let head = support::read_request_head(&mut socket).await;
            assert!(head.starts_with("GET "));
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                .await
                .unwrap();
        }
    })
    .await;

    let client = Client::new();
    let first = client.get(uri(addr, "/a")).send().await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    // Both requests ride the single scripted connection.
    let second = client.get(uri(addr, "/b")).send().await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
}

#[tokio::test]
async fn stale_pooled_connection_is_retried_once() {
    // First connection: serves one response, then dies as soon as the next
    // request starts arriving. Second connection: serves normally.
    let addr = support::serve(2, |mut socket, nth| async move {
        if nth == 0 {
            let _ = support::read_request_head(&mut socket).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 1\r\n\r\n1")
                .await
                .unwrap();
            // wait for the reused request, then vanish without answering
            let mut probe = [0u8; 1];
            use tokio::io::AsyncReadExt;
            let _ = socket.read(&mut probe).await;
            drop(socket);
        } else {
            let _ = support::read_request_head(&mut socket).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 1\r\n\r\n2")
                .await
                .unwrap();
        }
    })
    .await;

    let client = Client::new();
    let first = client.get(uri(addr, "/")).send().await.unwrap();
    assert_eq!(&first.body()[..], b"1");
    let second = client.get(uri(addr, "/")).send().await.unwrap();
    assert_eq!(&second.body()[..], b"2");
}

#[tokio::test]
async fn oversized_body_is_refused() {
    let addr = support::serve(1, |mut socket, _| async move {
        let _ = support::read_request_head(&mut socket).await;
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\n")
            .await
            .unwrap();
        let filler = vec![b'x'; 100];
        let _ = socket.write_all(&filler).await;
    })
    .await;

    let client = Client::builder()
        .max_response_body_bytes(10)
        .build()
        .unwrap();
    let err = client.get(uri(addr, "/")).send().await.unwrap_err();
    assert!(err.is_network());
}

#[tokio::test]
async fn multi_value_headers_round_trip() {
    let addr = support::serve(1, |mut socket, _| async move {
        let head = support::read_request_head(&mut socket).await;
        assert_eq!(head.matches("x-tag: ").count(), 2);
        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\nset-cookie: a=1\r\nset-cookie: b=2\r\ncontent-length: 0\r\n\r\n",
            )
            .await
            .unwrap();
    })
    .await;

    let client = Client::new();
    let resp = client
        .get(uri(addr, "/"))
        .header("x-tag".parse().unwrap(), http::HeaderValue::from_static("one"))
        .header("x-tag".parse().unwrap(), http::HeaderValue::from_static("two"))
        .send()
        .await
        .unwrap();
    let cookies: Vec<_> = resp.headers().get_all("set-cookie").iter().collect();
    assert_eq!(cookies, vec!["a=1", "b=2"]);
}

#[tokio::test]
async fn head_requests_read_no_body() {
    let addr = support::serve(1, |mut socket, _| async move {
        let head = support::read_request_head(&mut socket).await;
        assert!(head.starts_with("HEAD "));
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 512\r\n\r\n")
            .await
            .unwrap();
    })
    .await;

    let client = Client::new();
    let resp = client.head(uri(addr, "/")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.body().is_empty());
    assert_eq!(resp.headers()["content-length"], "512");
}
