use cache_proxy::http::request::{HttpRequest, Method, ParseError, ParsingState};
use cache_proxy::http::response::{self, HttpResponse};
use cache_proxy::session::{response_mode, Session};

#[test]
fn parses_simple_get_request() {
    let mut req = HttpRequest::new();
    req.buffer
        .extend_from_slice(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");
    req.parse_request().unwrap();
    assert_eq!(req.method, Method::GET);
    assert_eq!(req.url, "/index.html");
    assert_eq!(req.state, ParsingState::Complete);
    // Headers are stored lowercase regardless of how they arrived on the wire.
    assert_eq!(req.headers.get("host").unwrap(), "localhost");
}

#[test]
fn rejects_unsupported_method() {
    let mut req = HttpRequest::new();
    req.buffer
        .extend_from_slice(b"PATCH /invalid HTTP/1.1\r\n\r\n");
    assert_eq!(req.parse_request().unwrap_err(), ParseError::InvalidMethod);
}

#[test]
fn response_to_bytes_contains_status_headers_and_body() {
    let mut res = HttpResponse::new(200, "OK");
    res.set_header("Content-Type", "text/plain")
        .set_body(b"Hello Rust".to_vec(), "text/plain");

    let bytes = res.to_bytes();
    let s = String::from_utf8_lossy(&bytes);

    assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(s.contains("Content-Type: text/plain\r\n"));
    assert!(s.contains("Content-Length: 10\r\n"));
    assert!(s.ends_with("\r\n\r\nHello Rust"));
}

#[test]
fn build_http_sets_content_length_for_length_delimited_body() {
    let mut sess = Session::new(1, 4096, None);
    sess.status = 200;
    sess.res_mode = response_mode::RES_LEN;
    sess.wantbody = true;

    let body = b"cached payload".to_vec();
    let head = response::build_http(&sess, &body);

    assert_eq!(head.headers.get("content-length").unwrap(), &body.len().to_string());
    assert!(!head.headers.contains_key("transfer-encoding"));
}

#[test]
fn build_http_omits_content_length_when_chunked() {
    let mut sess = Session::new(1, 4096, None);
    sess.status = 200;
    sess.res_mode = response_mode::RES_CHUNKED;
    sess.wantbody = true;

    let head = response::build_http(&sess, b"");
    assert!(!head.headers.contains_key("content-length"));
    assert_eq!(head.headers.get("transfer-encoding").unwrap(), "chunked");
}

#[test]
fn build_http_clamps_out_of_range_status_to_not_implemented() {
    let mut sess = Session::new(1, 4096, None);
    sess.status = 5000;
    let head = response::build_http(&sess, b"");
    assert_eq!(head.status_code, 501);
}
