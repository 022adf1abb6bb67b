use crate::prelude::*;
use crate::session::Session;

/// The response shaper: turns a `Session` that has reached `prepresp`
/// into the bytes the reactor writes to the client. Grounded in the
/// teacher's `HttpResponse` (status line/header formatting), generalized
/// so headers and body come from `Session::response_headers`/`obj`
/// instead of a filesystem read.
#[derive(Debug)]
pub struct HttpResponse {
    pub version: String,
    pub status_code: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        Self {
            version: "HTTP/1.1".to_string(),
            status_code,
            status_text: status_text.to_string(),
            headers: HashMap::from([("Content-Length".to_string(), "0".to_string())]),
            body: Vec::new(),
        }
    }

    pub fn set_header(&mut self, key: &str, value: &str) -> &mut Self {
        self.headers.insert(key.to_lowercase(), value.to_string());
        self
    }

    pub fn set_body(&mut self, body: Vec<u8>, content_type: &str) -> &mut Self {
        self.headers
            .insert("content-length".to_string(), body.len().to_string());
        self.headers
            .insert("content-type".to_string(), content_type.to_string());
        self.body = body;
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut res = self.to_bytes_headers_only();
        res.extend_from_slice(&self.body);
        res
    }

    pub fn to_bytes_headers_only(&self) -> Vec<u8> {
        let mut res = format!(
            "{} {} {}\r\n",
            self.version, self.status_code, self.status_text
        )
        .into_bytes();
        for (key, val) in &self.headers {
            let formatted_key = Self::to_pascal_case(key);
            res.extend_from_slice(format!("{}: {}\r\n", formatted_key, val).as_bytes());
        }
        res.extend_from_slice(b"\r\n");
        res
    }

    pub fn status_text(code: u16) -> &'static str {
        match code {
            100 => "Continue",
            200 => "OK",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            400 => "Bad Request",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            413 => "Payload Too Large",
            414 => "URI Too Long",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "Unknown",
        }
    }

    pub fn set_status_code(&mut self, code: u16) -> &mut Self {
        self.status_code = code;
        self.status_text = HttpResponse::status_text(code).to_string();
        self
    }

    fn to_pascal_case(s: &str) -> String {
        s.split('-')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    None => String::new(),
                    Some(f) => f.to_uppercase().collect::<String>() + chars.as_str(),
                }
            })
            .collect::<Vec<String>>()
            .join("-")
    }

    pub fn redirect(code: u16, target_url: &str) -> Self {
        let mut res = HttpResponse::new(code, HttpResponse::status_text(code));
        res.set_header("Location", target_url)
            .set_header("Content-Length", "0")
            .set_header("Connection", "close");
        res
    }
}

/// Builds the status line and header block for a session that has
/// reached `prepresp`/`deliver`, honoring the `res_mode` bits `prepresp`
/// computed (content-length vs chunked vs close-on-eof). `body` is the
/// exact byte sequence `queue_response` is about to write for a length-
/// delimited (`RES_LEN`) response, so its length becomes `Content-Length`.
pub fn build_http(sess: &Session, body: &[u8]) -> HttpResponse {
    let status = if (100..=999).contains(&sess.status) {
        sess.status
    } else {
        501
    };
    let mut res = HttpResponse::new(status, HttpResponse::status_text(status));
    res.headers.remove("content-length");
    for (k, v) in &sess.response_headers {
        res.set_header(k, v);
    }

    use crate::session::response_mode::*;
    if sess.res_mode & RES_CHUNKED != 0 {
        res.set_header("transfer-encoding", "chunked");
    } else if sess.res_mode & RES_EOF != 0 {
        res.set_header("connection", "close");
    } else if sess.res_mode & RES_LEN != 0 {
        let len = if sess.wantbody { body.len() } else { 0 };
        res.set_header("content-length", &len.to_string());
    }
    if let Some(reason) = sess.doclose {
        res.set_header("connection", "close");
        let _ = reason;
    }
    res
}

/// The body a buffered (`hit`/non-streaming `miss`) delivery writes: the
/// stored object's bytes, gunzipped on the fly if `prepresp` set
/// `RES_GUNZIP` (the object was stored gzip but this client didn't ask
/// for it), falling back to a synthesized `"<code> <reason>"` line for
/// an error response whose object body was never filled in.
///
/// Must be called once `sess.state` has just become `Deliver` (i.e.
/// between the `step()` call that ran `prepresp` and the one that runs
/// `deliver`) — `deliver` drops `sess.obj` itself.
pub fn extract_deliver_body(sess: &Session) -> Vec<u8> {
    let mut body = sess
        .obj
        .as_ref()
        .and_then(|obj| obj.lock().ok().and_then(|g| g.object.as_ref().map(|h| h.object().body.clone())))
        .unwrap_or_default();

    if sess.res_mode & crate::session::response_mode::RES_GUNZIP != 0 && !body.is_empty() {
        if let Ok(decoded) = crate::filters::filter_for(crate::filters::FilterKind::Gunzip).apply(&body) {
            body = decoded;
        }
    }

    if body.is_empty() && sess.status >= 400 {
        body = format!("{} {}", sess.status, HttpResponse::status_text(sess.status)).into_bytes();
    }
    body
}

/// Wraps a body chunk for the wire according to `res_mode`: raw bytes
/// when length-delimited, a chunk frame when `RES_CHUNKED` is set.
pub fn write_object(res_mode: u16, data: &[u8]) -> Vec<u8> {
    use crate::session::response_mode::RES_CHUNKED;
    if res_mode & RES_CHUNKED != 0 && !data.is_empty() {
        let mut out = format!("{:x}\r\n", data.len()).into_bytes();
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\n");
        out
    } else {
        data.to_vec()
    }
}

/// Terminates a chunked body; a no-op for length-delimited or
/// close-on-eof responses.
pub fn stream_end(res_mode: u16) -> Vec<u8> {
    use crate::session::response_mode::RES_CHUNKED;
    if res_mode & RES_CHUNKED != 0 {
        b"0\r\n\r\n".to_vec()
    } else {
        Vec::new()
    }
}
