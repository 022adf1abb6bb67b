use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    GET,
    HEAD,
    POST,
    DELETE,
}

impl Method {
    pub fn is_allowed(&self, allowed_methods: &[String]) -> bool {
        allowed_methods.iter().any(|m| m == self.as_str())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::HEAD => "HEAD",
            Method::POST => "POST",
            Method::DELETE => "DELETE",
        }
    }
}

impl FromStr for Method {
    type Err = ParseError;
    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Method::GET),
            "HEAD" => Ok(Method::HEAD),
            "POST" => Ok(Method::POST),
            "DELETE" => Ok(Method::DELETE),
            _ => Err(ParseError::InvalidMethod),
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A request moves RequestLine -> Headers -> (Body(len) | ChunkedBody) ->
/// Complete. `parse_request` re-enters at `state` every time more bytes
/// land on the socket, so no byte is ever parsed twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsingState {
    RequestLine,
    Headers,
    Body(usize),
    ChunkedBody,
    Complete,
}

const CRLN_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    IncompleteRequestLine,
    MalformedRequestLine,
    InvalidMethod,
    HeaderTooLong,
    TooManyHeaders,
    InvalidChunkSize,
    PayloadTooLarge,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::IncompleteRequestLine => write!(f, "incomplete request"),
            ParseError::MalformedRequestLine => write!(f, "malformed request line"),
            ParseError::InvalidMethod => write!(f, "invalid HTTP method"),
            ParseError::HeaderTooLong => write!(f, "header line too long"),
            ParseError::TooManyHeaders => write!(f, "too many headers"),
            ParseError::InvalidChunkSize => write!(f, "invalid chunk size"),
            ParseError::PayloadTooLarge => write!(f, "payload too large"),
        }
    }
}

impl std::error::Error for ParseError {}

impl ParseError {
    /// Maps a parse failure to the status `start` should reply with
    /// before moving the session to `error` (400 for anything the peer
    /// simply got wrong, 413/431 when a limit was hit).
    pub fn status_code(&self) -> u16 {
        match self {
            ParseError::HeaderTooLong | ParseError::TooManyHeaders => HTTP_URI_TOO_LONG,
            ParseError::PayloadTooLarge => HTTP_PAYLOAD_TOO_LARGE,
            ParseError::InvalidMethod => HTTP_METHOD_NOT_ALLOWED,
            ParseError::MalformedRequestLine | ParseError::InvalidChunkSize => HTTP_BAD_REQUEST,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    ReadSize,
    ReadData(usize),
    ReadTrailers,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub trailers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub buffer: Vec<u8>,
    pub cursor: usize,
    pub state: ParsingState,
    chunk_state: ChunkState,
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRequest {
    pub fn new() -> Self {
        HttpRequest {
            method: Method::GET,
            url: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            trailers: HashMap::new(),
            body: Vec::new(),
            buffer: Vec::with_capacity(4096),
            cursor: 0,
            state: ParsingState::RequestLine,
            chunk_state: ChunkState::ReadSize,
            max_header_bytes: 8 * 1024,
            max_body_bytes: 1024 * 1024,
        }
    }

    pub fn clear(&mut self) {
        self.method = Method::GET;
        self.url.clear();
        self.version.clear();
        self.headers.clear();
        self.trailers.clear();
        self.body.clear();
        self.state = ParsingState::RequestLine;
        self.chunk_state = ChunkState::ReadSize;
    }

    /// Slides the consumed prefix out of the buffer so a pipelined
    /// second request, or the next request on a connection handed back
    /// to `wait`, starts parsing at offset zero.
    pub fn finish_request(&mut self) {
        self.buffer.drain(..self.cursor);
        self.cursor = 0;
        self.clear();
    }

    pub fn parse_request(&mut self) -> core::result::Result<(), ParseError> {
        loop {
            match self.state {
                ParsingState::RequestLine => self.parse_request_line()?,
                ParsingState::Headers => self.parse_headers()?,
                ParsingState::Body(len) => self.parse_body(len)?,
                ParsingState::ChunkedBody => self.parse_chunked_body()?,
                ParsingState::Complete => return Ok(()),
            }
        }
    }

    fn parse_request_line(&mut self) -> core::result::Result<(), ParseError> {
        let Some(abs_index) = find_crlf(&self.buffer, self.cursor) else {
            if self.buffer.len() - self.cursor > self.max_header_bytes {
                return Err(ParseError::HeaderTooLong);
            }
            return Err(ParseError::IncompleteRequestLine);
        };
        let line_bytes = &self.buffer[self.cursor..abs_index];
        let request_line =
            std::str::from_utf8(line_bytes).map_err(|_| ParseError::MalformedRequestLine)?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(ParseError::MalformedRequestLine);
        }
        self.method = parts[0].parse()?;
        self.url = parts[1].to_string();
        self.version = parts[2].to_string();
        self.cursor = abs_index + CRLN_LEN;
        self.state = ParsingState::Headers;
        Ok(())
    }

    fn extract_and_parse_header(
        &mut self,
    ) -> core::result::Result<Option<(String, String)>, ParseError> {
        let Some(abs_index) = find_crlf(&self.buffer, self.cursor) else {
            if self.buffer.len() - self.cursor > self.max_header_bytes {
                return Err(ParseError::HeaderTooLong);
            }
            return Err(ParseError::IncompleteRequestLine);
        };
        let line_bytes = &self.buffer[self.cursor..abs_index];
        self.cursor = abs_index + CRLN_LEN;
        if line_bytes.is_empty() {
            return Ok(None);
        }
        let line =
            std::str::from_utf8(line_bytes).map_err(|_| ParseError::MalformedRequestLine)?;
        let sep = line.find(':').ok_or(ParseError::MalformedRequestLine)?;
        let key = line[..sep].trim().to_ascii_lowercase();
        let val = line[sep + 1..].trim().to_string();
        Ok(Some((key, val)))
    }

    fn parse_headers(&mut self) -> core::result::Result<(), ParseError> {
        loop {
            match self.extract_and_parse_header()? {
                Some((k, v)) => {
                    if self.headers.len() >= 128 {
                        return Err(ParseError::TooManyHeaders);
                    }
                    self.headers.insert(k, v);
                }
                None => {
                    let chunked = self
                        .headers
                        .get("transfer-encoding")
                        .map(|v| v.eq_ignore_ascii_case("chunked"))
                        .unwrap_or(false);
                    let content_length = self
                        .headers
                        .get("content-length")
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(0);
                    if content_length > self.max_body_bytes {
                        return Err(ParseError::PayloadTooLarge);
                    }
                    self.state = if chunked {
                        ParsingState::ChunkedBody
                    } else if content_length > 0 {
                        ParsingState::Body(content_length)
                    } else {
                        ParsingState::Complete
                    };
                    return Ok(());
                }
            }
        }
    }

    fn parse_body(&mut self, len: usize) -> core::result::Result<(), ParseError> {
        let available = self.buffer.len() - self.cursor;
        if available < len {
            return Err(ParseError::IncompleteRequestLine);
        }
        self.body = self.buffer[self.cursor..self.cursor + len].to_vec();
        self.cursor += len;
        self.state = ParsingState::Complete;
        Ok(())
    }

    fn parse_chunked_body(&mut self) -> core::result::Result<(), ParseError> {
        loop {
            match self.chunk_state {
                ChunkState::ReadSize => {
                    let Some(abs_index) = find_crlf(&self.buffer, self.cursor) else {
                        return Err(ParseError::IncompleteRequestLine);
                    };
                    let hex_str = std::str::from_utf8(&self.buffer[self.cursor..abs_index])
                        .map_err(|_| ParseError::InvalidChunkSize)?;
                    let size_str = hex_str.split(';').next().unwrap_or(hex_str).trim();
                    let size = usize::from_str_radix(size_str, 16)
                        .map_err(|_| ParseError::InvalidChunkSize)?;
                    if self.body.len() + size > self.max_body_bytes {
                        return Err(ParseError::PayloadTooLarge);
                    }
                    self.cursor = abs_index + CRLN_LEN;
                    self.chunk_state = if size == 0 {
                        ChunkState::ReadTrailers
                    } else {
                        ChunkState::ReadData(size)
                    };
                }
                ChunkState::ReadData(size) => {
                    if self.buffer.len() - self.cursor < size + CRLN_LEN {
                        return Err(ParseError::IncompleteRequestLine);
                    }
                    self.body
                        .extend_from_slice(&self.buffer[self.cursor..self.cursor + size]);
                    self.cursor += size + CRLN_LEN;
                    self.chunk_state = ChunkState::ReadSize;
                }
                ChunkState::ReadTrailers => match self.extract_and_parse_header()? {
                    Some((k, v)) => {
                        self.trailers.insert(k, v);
                    }
                    None => {
                        self.state = ParsingState::Complete;
                        return Ok(());
                    }
                },
            }
        }
    }
}

fn find_crlf(buffer: &[u8], start_offset: usize) -> Option<usize> {
    let search_area = buffer.get(start_offset..)?;
    let mut current_pos = 0;
    while let Some(r_pos) = search_area[current_pos..].iter().position(|&b| b == b'\r') {
        let abs_r_pos_in_search = current_pos + r_pos;
        if search_area.get(abs_r_pos_in_search + 1) == Some(&b'\n') {
            return Some(start_offset + abs_r_pos_in_search);
        }
        current_pos = abs_r_pos_in_search + 1;
    }
    None
}

/// Shared with `backend.rs`'s response parser.
pub fn find_subsequence(buffer: &[u8], needle: &[u8], start_offset: usize) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    let search_area = buffer.get(start_offset..)?;
    let first_byte = needle[0];
    let mut current_pos = 0;
    while let Some(rel_pos) = search_area[current_pos..]
        .iter()
        .position(|&b| b == first_byte)
    {
        let abs_pos_in_search = current_pos + rel_pos;
        match search_area.get(abs_pos_in_search..abs_pos_in_search + needle.len()) {
            Some(candidate) if candidate == needle => {
                return Some(start_offset + abs_pos_in_search);
            }
            Some(_) => {}
            None => return None,
        }
        current_pos = abs_pos_in_search + 1;
    }
    None
}

impl Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- HTTP Request ---")?;
        writeln!(f, "{} {} {}", self.method, self.url, self.version)?;
        writeln!(f, "Headers:")?;
        for (key, value) in &self.headers {
            writeln!(f, "  {}: {}", key, value)?;
        }
        if !self.body.is_empty() {
            writeln!(f, "Body ({} bytes)", self.body.len())?;
        } else {
            writeln!(f, "Body: <empty>")?;
        }
        write!(f, "--------------------")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_get_request() {
        let mut req = HttpRequest::new();
        req.buffer
            .extend_from_slice(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");
        req.parse_request().unwrap();
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.url, "/index.html");
        assert_eq!(req.state, ParsingState::Complete);
        assert_eq!(req.headers.get("host").unwrap(), "localhost");
    }

    #[test]
    fn fragmented_request_line_then_headers() {
        let mut req = HttpRequest::new();
        req.buffer.extend_from_slice(b"GET /path ");
        assert_eq!(
            req.parse_request().unwrap_err(),
            ParseError::IncompleteRequestLine
        );
        req.buffer.extend_from_slice(b"HTTP/1.1\r\n");
        assert_eq!(
            req.parse_request().unwrap_err(),
            ParseError::IncompleteRequestLine
        );
        assert_eq!(req.state, ParsingState::Headers);
        req.buffer.extend_from_slice(b"User-Agent: test\r\n\r\n");
        req.parse_request().unwrap();
        assert_eq!(req.state, ParsingState::Complete);
    }

    #[test]
    fn post_request_with_body() {
        let mut req = HttpRequest::new();
        req.buffer
            .extend_from_slice(b"POST /api HTTP/1.1\r\nContent-Length: 13\r\n\r\nHello, World!");
        req.parse_request().unwrap();
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.body, b"Hello, World!");
        assert_eq!(req.state, ParsingState::Complete);
    }

    #[test]
    fn fragmented_body_leaves_unconsumed_bytes_in_buffer() {
        let mut req = HttpRequest::new();
        let head = b"POST /data HTTP/1.1\r\nContent-Length: 5\r\n\r\n";
        req.buffer.extend_from_slice(head);
        assert_eq!(
            req.parse_request().unwrap_err(),
            ParseError::IncompleteRequestLine
        );
        assert!(matches!(req.state, ParsingState::Body(5)));

        req.buffer.extend_from_slice(b"HelloWorld");
        req.parse_request().unwrap();
        assert_eq!(req.body, b"Hello");
        assert_eq!(req.state, ParsingState::Complete);
        assert_eq!(&req.buffer[req.cursor..], b"World");
    }

    #[test]
    fn invalid_method_is_rejected() {
        let mut req = HttpRequest::new();
        req.buffer
            .extend_from_slice(b"PATCH /invalid HTTP/1.1\r\n\r\n");
        assert_eq!(req.parse_request().unwrap_err(), ParseError::InvalidMethod);
    }

    #[test]
    fn chunked_body_is_reassembled() {
        let mut req = HttpRequest::new();
        req.buffer.extend_from_slice(
            b"POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
        );
        req.parse_request().unwrap();
        assert_eq!(req.body, b"Wikipedia");
        assert_eq!(req.state, ParsingState::Complete);
    }

    #[test]
    fn chunked_body_across_fragments() {
        let mut req = HttpRequest::new();
        req.buffer
            .extend_from_slice(b"POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        req.parse_request().unwrap_err();
        req.buffer.extend_from_slice(b"3\r\nfoo\r\n");
        req.parse_request().unwrap_err();
        req.buffer.extend_from_slice(b"0\r\n\r\n");
        req.parse_request().unwrap();
        assert_eq!(req.body, b"foo");
    }

    #[test]
    fn pipelined_requests_reuse_the_buffer_after_finish_request() {
        let mut req = HttpRequest::new();
        req.buffer
            .extend_from_slice(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        req.parse_request().unwrap();
        assert_eq!(req.url, "/a");
        req.finish_request();
        assert!(!req.buffer.is_empty());
        req.parse_request().unwrap();
        assert_eq!(req.url, "/b");
    }

    #[test]
    fn oversized_headers_are_rejected() {
        let mut req = HttpRequest::new();
        req.max_header_bytes = 16;
        req.buffer
            .extend_from_slice(b"GET /a-long-enough-url-to-overflow HTTP/1.1\r\n");
        assert_eq!(req.parse_request().unwrap_err(), ParseError::HeaderTooLong);
    }
}
