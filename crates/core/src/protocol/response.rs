use std::fmt;

use crate::protocol::request::RTSP_VERSION;

/// Status codes the relay emits (RFC 2326 §7.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    SessionNotFound,
    MethodNotValidInThisState,
    UnsupportedTransport,
    InternalServerError,
    VersionNotSupported,
}

impl StatusCode {
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::SessionNotFound => 454,
            StatusCode::MethodNotValidInThisState => 455,
            StatusCode::UnsupportedTransport => 461,
            StatusCode::InternalServerError => 500,
            StatusCode::VersionNotSupported => 505,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::SessionNotFound => "Session Not Found",
            StatusCode::MethodNotValidInThisState => "Method Not Valid in This State",
            StatusCode::UnsupportedTransport => "Unsupported Transport",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::VersionNotSupported => "RTSP Version Not Supported",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// An RTSP response (RFC 2326 §7).
///
/// Serializes to the standard text format:
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 1\r\n
/// Content-Length: 142\r\n
/// Content-Type: application/sdp\r\n
/// Server: rtsp-relay/0.1\r\n
/// \r\n
/// v=0\r\n...
/// ```
///
/// Uses a builder pattern: chain [`add_header`](Self::add_header) and
/// [`with_body`](Self::with_body), then call [`encode`](Self::encode).
/// Headers are written sorted by name so output is deterministic, and
/// `Content-Length` is computed from the body. Body bytes pass through
/// untouched.
#[must_use]
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Server identification string included in every RTSP response
/// per RFC 2326 §12.36.
pub const SERVER_AGENT: &str = "rtsp-relay/0.1";

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Response {
            status,
            headers: vec![("Server".to_string(), SERVER_AGENT.to_string())],
            body: Vec::new(),
        }
    }

    /// 200 OK, success (RFC 2326 §7.1.1).
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok)
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Replace every header named `name` with a single value.
    pub fn set_header(mut self, name: &str, value: &str) -> Self {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.add_header(name, value)
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Look up a header value by name (case-insensitive).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Serialize to the RTSP wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut headers: Vec<(&str, String)> = self
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("Content-Length"))
            .map(|(name, value)| (name.as_str(), value.clone()))
            .collect();
        if !self.body.is_empty() {
            headers.push(("Content-Length", self.body.len().to_string()));
        }
        // Stable sort keeps repeated headers in insertion order.
        headers.sort_by(|a, b| a.0.cmp(b.0));

        let mut head = format!(
            "{} {} {}\r\n",
            RTSP_VERSION,
            self.status.code(),
            self.status.reason()
        );
        for (name, value) in &headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(resp: &Response) -> String {
        String::from_utf8(resp.encode()).unwrap()
    }

    #[test]
    fn encode_no_body() {
        let resp = Response::ok()
            .add_header("CSeq", "1")
            .add_header("Public", "OPTIONS");
        let s = text(&resp);
        assert!(s.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(s.contains("Server: rtsp-relay/0.1\r\n"));
        assert!(s.contains("CSeq: 1\r\n"));
        assert!(s.contains("Public: OPTIONS\r\n"));
        assert!(!s.contains("Content-Length"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn headers_sorted_by_name() {
        let resp = Response::ok()
            .add_header("Session", "A")
            .add_header("CSeq", "9")
            .add_header("Content-Type", "application/sdp")
            .with_body(b"v=0\r\n".to_vec());
        let s = text(&resp);
        let order: Vec<&str> = s
            .lines()
            .skip(1)
            .take_while(|l| !l.is_empty())
            .map(|l| l.split(':').next().unwrap())
            .collect();
        assert_eq!(
            order,
            vec!["CSeq", "Content-Length", "Content-Type", "Server", "Session"]
        );
    }

    #[test]
    fn body_bytes_pass_through() {
        let body = vec![0u8, 0xff, b'\r', b'\n', b'\r', b'\n', 42];
        let resp = Response::ok()
            .add_header("CSeq", "2")
            .add_header("Content-Length", "1")
            .with_body(body.clone());
        let bytes = resp.encode();
        assert!(bytes.ends_with(&body));
        let head = String::from_utf8_lossy(&bytes[..bytes.len() - body.len()]);
        assert!(head.contains("Content-Length: 7\r\n"));
        assert_eq!(head.matches("Content-Length").count(), 1);
    }

    #[test]
    fn status_lines() {
        let s = text(&Response::new(StatusCode::MethodNotValidInThisState));
        assert!(s.starts_with("RTSP/1.0 455 Method Not Valid in This State\r\n"));
        let s = text(&Response::new(StatusCode::UnsupportedTransport));
        assert!(s.starts_with("RTSP/1.0 461 Unsupported Transport\r\n"));
    }

    #[test]
    fn set_header_replaces() {
        let resp = Response::ok()
            .add_header("Session", "A")
            .set_header("session", "B");
        assert_eq!(resp.get_header("Session"), Some("B"));
        assert_eq!(resp.headers.len(), 2);
    }
}
