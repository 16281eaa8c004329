//! HttpFetcher against a local stub server

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use pagesweep_core::{FailureKind, FetchRequest, HttpConfig, HttpFetcher, PageFetcher};

/// Serve one canned response per connection, reporting each request line.
fn stub(responses: Vec<String>, delay: Duration) -> (SocketAddr, mpsc::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for response in responses {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            loop {
                let mut header = String::new();
                if reader.read_line(&mut header).unwrap() == 0 || header == "\r\n" {
                    break;
                }
            }
            let _ = tx.send(request_line.trim().to_string());
            thread::sleep(delay);
            let _ = stream.write_all(response.as_bytes());
        }
    });
    (addr, rx)
}

fn response(status: &str, extra_headers: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n{extra_headers}\r\n{body}",
        body.len()
    )
}

fn fetcher(addr: SocketAddr, timeout: Duration) -> HttpFetcher {
    HttpFetcher::new(HttpConfig {
        base_url: format!("http://{addr}/api/v1/items"),
        request_timeout: timeout,
        ..Default::default()
    })
    .unwrap()
}

fn request() -> FetchRequest {
    FetchRequest {
        partition_key: "TJAM".into(),
        page: 2,
        page_size: 100,
        date_range_start: "2025-11-06".into(),
        date_range_end: "2025-11-10".into(),
        extra_filters: BTreeMap::new(),
    }
}

#[test]
fn ok_response_with_query() {
    let body = r#"{"status":"success","count":1,"items":[{"id":1}]}"#;
    let (addr, requests) = stub(vec![response("200 OK", "", body)], Duration::ZERO);

    let reply = fetcher(addr, Duration::from_secs(5)).fetch(&request()).unwrap();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, body.as_bytes());
    assert!(reply.retry_after.is_none());

    let line = requests.recv().unwrap();
    assert!(line.starts_with("GET /api/v1/items?"), "{line}");
    assert!(line.contains("page=2"));
    assert!(line.contains("pageSize=100"));
    assert!(line.contains("partitionKey=TJAM"));
    assert!(line.contains("dateRangeEnd=2025-11-10"));
}

#[test]
fn throttle_carries_retry_after() {
    let (addr, _requests) = stub(
        vec![response("429 Too Many Requests", "Retry-After: 2\r\n", "")],
        Duration::ZERO,
    );
    let reply = fetcher(addr, Duration::from_secs(5)).fetch(&request()).unwrap();
    assert_eq!(reply.status, 429);
    assert_eq!(reply.retry_after, Some(Duration::from_secs(2)));
}

#[test]
fn gateway_error_is_a_reply() {
    let (addr, _requests) = stub(
        vec![response("503 Service Unavailable", "", "busy")],
        Duration::ZERO,
    );
    let reply = fetcher(addr, Duration::from_secs(5)).fetch(&request()).unwrap();
    assert_eq!(reply.status, 503);
}

#[test]
fn slow_server_times_out() {
    let (addr, _requests) = stub(
        vec![response("200 OK", "", "{}")],
        Duration::from_millis(800),
    );
    let err = fetcher(addr, Duration::from_millis(200))
        .fetch(&request())
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Timeout);
}

#[test]
fn refused_connection_is_transport() {
    // bind then drop to get a port nobody listens on
    let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let err = fetcher(addr, Duration::from_secs(2))
        .fetch(&request())
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::TransportError);
}
