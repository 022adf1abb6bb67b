//! Backend fetch — the TCP-upstream analogue of `cgi.rs`'s subprocess
//! pipe. Reuses the same shape (a small parse-state machine driven by
//! readable events, writing straight into a response buffer) but talks
//! to a real `mio::net::TcpStream` instead of a child process's stdout,
//! and implements the retry-once-on-recycled-connection rule from
//! SPEC_FULL.md §C.4: a backend connection pulled out of a keep-alive
//! pool may have been closed by the far end between requests, so the
//! first write failure on such a connection is retried once on a fresh
//! connect rather than failed straight to the session.

use crate::config::BackendConfig;
use crate::http::find_subsequence;
use flate2::write::GzDecoder;
use mio::net::TcpStream;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Instant;

#[derive(Debug, PartialEq)]
pub enum FetchParseState {
    SendRequest,
    ReadHeaders,
    StreamBody,
    StreamBodyChunked(ChunkReadState),
    Done,
}

#[derive(Debug, PartialEq)]
pub enum ChunkReadState {
    ReadSize,
    ReadData(usize),
}

/// Whether this connection came fresh off `connect()` or was handed back
/// from a keep-alive pool — governs the retry-once rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnOrigin {
    Fresh,
    Recycled,
}

pub struct FetchSession {
    pub stream: TcpStream,
    pub origin: ConnOrigin,
    pub parse_state: FetchParseState,
    pub header_buf: Vec<u8>,
    pub request_buf: Vec<u8>,
    pub request_sent: usize,
    pub status: u16,
    pub resp_headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// How much of `body` `take_new_body` has already handed to the
    /// reactor — the streaming pump's read cursor into an otherwise
    /// append-only buffer.
    body_emitted: usize,
    pub content_length: Option<usize>,
    pub started: Instant,
    retried: bool,
    read_buf_size: usize,
    /// Lazily built the first time a streaming fetch needs to gunzip a
    /// chunk on the fly (`prepresp` set `RES_GUNZIP`): the stored object
    /// stays gzip-encoded, but this client asked for plain.
    gunzip: Option<GzDecoder<Vec<u8>>>,
}

impl FetchSession {
    /// Opens a fresh connection to `backend` and queues `request_bytes`
    /// (a full HTTP/1.1 request line + headers + optional body) to be
    /// written once the socket becomes writable. `read_buf_size` sizes the
    /// per-event socket read (`EngineParams::gzip_stack_buffer`) — named
    /// for the gzip stack frame it originally sized, reused here as the
    /// one knob that bounds how large a single `poll()` read chunk gets.
    pub fn connect(backend: &BackendConfig, request_bytes: Vec<u8>, read_buf_size: usize) -> io::Result<Self> {
        let addr = resolve(backend)?;
        let stream = TcpStream::connect(addr)?;
        Ok(Self {
            stream,
            origin: ConnOrigin::Fresh,
            parse_state: FetchParseState::SendRequest,
            header_buf: Vec::new(),
            request_buf: request_bytes,
            request_sent: 0,
            status: 0,
            resp_headers: Vec::new(),
            body: Vec::new(),
            body_emitted: 0,
            content_length: None,
            started: Instant::now(),
            retried: false,
            read_buf_size: read_buf_size.max(256),
            gunzip: None,
        })
    }

    pub fn reconnect_recycled(backend: &BackendConfig, request_bytes: Vec<u8>, read_buf_size: usize) -> io::Result<Self> {
        let mut session = Self::connect(backend, request_bytes, read_buf_size)?;
        session.origin = ConnOrigin::Recycled;
        Ok(session)
    }

    /// Drives the write half. Returns `Ok(true)` once the whole request
    /// has been flushed. A write error on a `Recycled` connection that
    /// hasn't been retried yet is reported via `NeedsRetry` so the caller
    /// can reconnect fresh and resend, matching the teacher's stdin-pipe
    /// write loop in `handle_cgi_event`.
    pub fn write_request(&mut self) -> FetchWriteOutcome {
        loop {
            if self.request_sent >= self.request_buf.len() {
                self.parse_state = FetchParseState::ReadHeaders;
                return FetchWriteOutcome::Complete;
            }
            match self.stream.write(&self.request_buf[self.request_sent..]) {
                Ok(0) => return FetchWriteOutcome::Error,
                Ok(n) => self.request_sent += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return FetchWriteOutcome::Pending,
                Err(_) => {
                    if self.origin == ConnOrigin::Recycled && !self.retried {
                        self.retried = true;
                        return FetchWriteOutcome::NeedsRetry;
                    }
                    return FetchWriteOutcome::Error;
                }
            }
        }
    }

    /// Drives the read half for one readable event, draining the socket
    /// to `WouldBlock`. Reports progress instead of a single pass/fail
    /// bool so the reactor can dispatch response headers to the client
    /// the moment they're parsed, then keep pumping body bytes as they
    /// arrive rather than waiting for the whole response to buffer.
    pub fn poll(&mut self) -> io::Result<FetchPoll> {
        let headers_ready_before = self.headers_ready();
        let body_len_before = self.body.len();
        let mut buf = vec![0u8; self.read_buf_size];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    if self.parse_state == FetchParseState::StreamBody && self.content_length.is_none() {
                        self.parse_state = FetchParseState::Done;
                    }
                    break;
                }
                Ok(n) => {
                    self.feed(&buf[..n]);
                    if self.parse_state == FetchParseState::Done {
                        break;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(FetchPoll {
            headers_just_became_ready: !headers_ready_before && self.headers_ready(),
            has_new_body: self.body.len() > body_len_before,
            done: self.parse_state == FetchParseState::Done,
        })
    }

    /// Whether the status line and header block have been fully parsed —
    /// everything past that point is body.
    pub fn headers_ready(&self) -> bool {
        !matches!(self.parse_state, FetchParseState::SendRequest | FetchParseState::ReadHeaders)
    }

    /// Drains whatever body bytes have arrived since the last call,
    /// advancing the emitted cursor so the next call only returns what's
    /// new. `body` itself is left intact — the session still needs the
    /// full thing once the fetch finishes, to store in the cache.
    pub fn take_new_body(&mut self) -> Vec<u8> {
        let chunk = self.body[self.body_emitted..].to_vec();
        self.body_emitted = self.body.len();
        chunk
    }

    /// Feeds `raw` (gzip-encoded bytes straight off the wire) through an
    /// incremental gunzip decoder and returns whatever plaintext that
    /// produced. Used only when streaming to a client that didn't ask for
    /// gzip while the object is being stored gzipped — `raw` itself is
    /// still what gets appended to the cached body.
    pub fn gunzip_chunk(&mut self, raw: &[u8]) -> Vec<u8> {
        if raw.is_empty() {
            return Vec::new();
        }
        let decoder = self.gunzip.get_or_insert_with(|| GzDecoder::new(Vec::new()));
        if decoder.write_all(raw).is_err() {
            return Vec::new();
        }
        std::mem::take(decoder.get_mut())
    }

    /// Flushes the gzip trailer and returns any plaintext bytes still
    /// buffered in the decoder. No-op if `gunzip_chunk` was never called.
    pub fn finish_gunzip(&mut self) -> Vec<u8> {
        let Some(decoder) = self.gunzip.take() else {
            return Vec::new();
        };
        decoder.finish().unwrap_or_default()
    }

    fn feed(&mut self, data: &[u8]) {
        match &mut self.parse_state {
            FetchParseState::ReadHeaders => {
                self.header_buf.extend_from_slice(data);
                if let Some(pos) = find_subsequence(&self.header_buf, b"\r\n\r\n", 0) {
                    let header_bytes = self.header_buf[..pos].to_vec();
                    let rest = self.header_buf[pos + 4..].to_vec();
                    let (status, headers) = parse_status_and_headers(&header_bytes);
                    self.status = status;
                    let chunked = headers
                        .iter()
                        .any(|(k, v)| k == "transfer-encoding" && v.eq_ignore_ascii_case("chunked"));
                    self.content_length = headers
                        .iter()
                        .find(|(k, _)| k == "content-length")
                        .and_then(|(_, v)| v.parse().ok());
                    self.resp_headers = headers;
                    self.parse_state = if chunked {
                        FetchParseState::StreamBodyChunked(ChunkReadState::ReadSize)
                    } else {
                        FetchParseState::StreamBody
                    };
                    if !rest.is_empty() {
                        self.feed_body(&rest);
                    }
                }
            }
            FetchParseState::StreamBody | FetchParseState::StreamBodyChunked(_) => {
                self.feed_body(data);
            }
            FetchParseState::SendRequest | FetchParseState::Done => {}
        }
    }

    fn feed_body(&mut self, data: &[u8]) {
        match &mut self.parse_state {
            FetchParseState::StreamBody => {
                self.body.extend_from_slice(data);
                if let Some(len) = self.content_length {
                    if self.body.len() >= len {
                        self.body.truncate(len);
                        self.parse_state = FetchParseState::Done;
                    }
                }
            }
            FetchParseState::StreamBodyChunked(_) => {
                self.feed_chunked(data);
            }
            _ => {}
        }
    }

    /// Same size-then-data chunk loop as `parse_chunked_body` in
    /// `http/request.rs`, mirrored here for the backend's response body.
    fn feed_chunked(&mut self, data: &[u8]) {
        self.header_buf.clear();
        self.header_buf.extend_from_slice(data);
        let mut cursor = 0;
        loop {
            let state = match &self.parse_state {
                FetchParseState::StreamBodyChunked(s) => s,
                _ => return,
            };
            match state {
                ChunkReadState::ReadSize => {
                    let Some(pos) = find_subsequence(&self.header_buf[cursor..], b"\r\n", 0) else {
                        return;
                    };
                    let line = &self.header_buf[cursor..cursor + pos];
                    let size_str = std::str::from_utf8(line).unwrap_or("0");
                    let size = usize::from_str_radix(size_str.trim(), 16).unwrap_or(0);
                    cursor += pos + 2;
                    if size == 0 {
                        self.parse_state = FetchParseState::Done;
                        return;
                    }
                    self.parse_state = FetchParseState::StreamBodyChunked(ChunkReadState::ReadData(size));
                }
                ChunkReadState::ReadData(size) => {
                    let size = *size;
                    if self.header_buf.len() - cursor < size + 2 {
                        return;
                    }
                    self.body.extend_from_slice(&self.header_buf[cursor..cursor + size]);
                    cursor += size + 2;
                    self.parse_state = FetchParseState::StreamBodyChunked(ChunkReadState::ReadSize);
                }
            }
        }
    }
}

pub enum FetchWriteOutcome {
    Complete,
    Pending,
    NeedsRetry,
    Error,
}

/// Progress made by a single `poll()` call.
pub struct FetchPoll {
    pub headers_just_became_ready: bool,
    pub has_new_body: bool,
    pub done: bool,
}

fn resolve(backend: &BackendConfig) -> io::Result<SocketAddr> {
    (backend.host.as_str(), backend.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "backend host did not resolve"))
}

fn parse_status_and_headers(bytes: &[u8]) -> (u16, Vec<(String, String)>) {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.lines();
    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(502);
    let mut headers = Vec::new();
    for line in lines {
        if let Some((key, val)) = line.split_once(':') {
            headers.push((key.trim().to_lowercase(), val.trim().to_string()));
        }
    }
    (status, headers)
}

/// Builds the request line + headers a fetch sends upstream, forwarding
/// the client's method/URL/headers and rewriting `Accept-Encoding` per
/// SPEC_FULL.md §C.3: when `gzip_support` is on the engine only ever asks
/// the backend for gzip-or-nothing (never deflate/br, so its own
/// negotiation table in `filters::negotiate_encoding` stays exhaustive);
/// when it's off the header is dropped entirely, matching
/// `normalize_accept_encoding`'s non-gzip branch.
pub fn build_request(
    method: &str,
    url: &str,
    host: &str,
    headers: &std::collections::HashMap<String, String>,
    body: &[u8],
    gzip_support: bool,
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("{method} {url} HTTP/1.1\r\n").as_bytes());
    out.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
    for (k, v) in headers {
        if k.eq_ignore_ascii_case("host") || k.eq_ignore_ascii_case("accept-encoding") {
            continue;
        }
        out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
    }
    if gzip_support {
        out.extend_from_slice(b"Accept-Encoding: gzip\r\n");
    }
    if !body.is_empty() {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"Connection: keep-alive\r\n\r\n");
    out.extend_from_slice(body);
    out
}
