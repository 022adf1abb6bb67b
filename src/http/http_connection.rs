//! One TCP client connection, paired with the `Session` it drives.
//! Grounded in the teacher's `HttpConnection`: the same `read_data`/
//! `write_data`/`touch` primitives and the same
//! `handle_read_phase`/`handle_write_phase`/`handle_post_write_update`
//! split in the reactor loop, generalized from serving static
//! files/CGI/uploads to feeding bytes into the session state machine and
//! writing back whatever `prepresp`/`deliver` produced.

use crate::backend::FetchSession;
use crate::config::ServerConfig;
use crate::http::request::{HttpRequest, ParseError};
use crate::session::Session;
use mio::net::TcpStream;
use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Instant;

pub const READ_BUF_SIZE: usize = 16 * 1024;

/// What this connection is doing on top of its own client socket.
#[derive(Default)]
pub enum ActiveAction {
    #[default]
    None,
    /// A backend fetch is in flight; the reactor drives `FetchSession`'s
    /// socket and feeds the result back into `Session::backend_response`.
    Fetch(FetchSession),
    /// `pipe`: raw byte shuttling between the client and a backend
    /// socket, bypassing request/response parsing entirely.
    Pipe(TcpStream),
}

pub struct Conn {
    pub stream: TcpStream,
    pub s_cfg: Arc<ServerConfig>,
    pub session: Session,
    pub write_buffer: Vec<u8>,
    pub action: ActiveAction,
    pub closed: bool,
    pub last_activity: Instant,
}

impl Conn {
    pub fn new(stream: TcpStream, s_cfg: Arc<ServerConfig>, session: Session) -> Self {
        Self {
            stream,
            s_cfg,
            session,
            write_buffer: Vec::new(),
            action: ActiveAction::None,
            closed: false,
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn should_close(&self) -> bool {
        self.closed && self.write_buffer.is_empty()
    }

    /// Reads whatever is available straight into the session's in-flight
    /// request buffer. Returns `Ok(true)` on EOF, `Ok(false)` when the
    /// read would block with no error.
    pub fn read_data(&mut self) -> std::io::Result<bool> {
        let req = self.session.request.get_or_insert_with(HttpRequest::new);
        req.max_body_bytes = self.s_cfg.client_max_body_size;
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    self.touch();
                    req.buffer.extend_from_slice(&buf[..n]);
                    if n < buf.len() {
                        return Ok(false);
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }

    /// Drives the HTTP/1 parser as far as the buffered bytes allow.
    pub fn try_parse(&mut self) -> Result<(), ParseError> {
        match self.session.request.as_mut() {
            Some(req) => req.parse_request(),
            None => Err(ParseError::IncompleteRequestLine),
        }
    }

    /// Flushes `write_buffer` to the socket. Returns `true` once fully
    /// drained.
    pub fn write_data(&mut self) -> bool {
        loop {
            if self.write_buffer.is_empty() {
                return true;
            }
            match self.stream.write(&self.write_buffer) {
                Ok(0) => return true,
                Ok(n) => {
                    self.touch();
                    self.write_buffer.drain(..n);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return false,
                Err(_) => {
                    self.closed = true;
                    return true;
                }
            }
        }
    }

    pub fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
