use std::io::{BufRead, Read};

use crate::error::{ParseErrorKind, RelayError, Result};
use crate::protocol::method::{Method, UnknownMethod};

/// The only protocol version the relay speaks.
pub const RTSP_VERSION: &str = "RTSP/1.0";

const MAX_LINE_LEN: u64 = 4096;
const MAX_HEADERS: usize = 64;
const MAX_BODY_LEN: usize = 64 * 1024;

/// A parsed RTSP request (RFC 2326 §6).
///
/// RTSP requests follow HTTP/1.1 syntax:
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Header lookup is case-insensitive per RFC 2326 §4.2. The body is kept as
/// raw bytes; an ANNOUNCE description is forwarded to viewers unmodified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// RTSP method token as received.
    pub method: String,
    /// Request-URI (e.g. `rtsp://host:8554/cam1/trackID=0`).
    pub uri: String,
    /// Protocol version, always [`RTSP_VERSION`] once parsed.
    pub version: String,
    /// Headers as ordered (name, value) pairs. Names are stored as-received;
    /// lookups via [`get_header`](Self::get_header) are case-insensitive.
    pub headers: Vec<(String, String)>,
    /// `Content-Length` bytes following the header block.
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, uri: &str) -> Self {
        Request {
            method: method.as_str().to_string(),
            uri: uri.to_string(),
            version: RTSP_VERSION.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Read exactly one request from a buffered stream.
    ///
    /// Empty lines before the request line are skipped (some clients send a
    /// bare CRLF as keepalive). Returns `Ok(None)` when the peer closed the
    /// stream before sending anything.
    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Option<Self>> {
        let request_line = loop {
            match read_line(reader)? {
                None => return Ok(None),
                Some(line) if line.is_empty() => continue,
                Some(line) => break line,
            }
        };

        let (method, uri, version) =
            parse_request_line(&request_line).ok_or(RelayError::parse(ParseErrorKind::InvalidRequestLine))?;

        if version != RTSP_VERSION {
            return Err(RelayError::UnsupportedVersion(version.to_string()));
        }

        let mut headers = Vec::new();
        loop {
            let line = read_line(reader)?.ok_or(RelayError::Truncated)?;
            if line.is_empty() {
                break;
            }
            if headers.len() == MAX_HEADERS {
                return Err(RelayError::parse(ParseErrorKind::TooManyHeaders));
            }
            let (name, value) = line
                .split_once(':')
                .ok_or(RelayError::parse(ParseErrorKind::InvalidHeader))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(RelayError::parse(ParseErrorKind::InvalidHeader));
            }
            headers.push((name.to_string(), value.trim().to_string()));
        }

        let mut request = Request {
            method: method.to_string(),
            uri: uri.to_string(),
            version: version.to_string(),
            headers,
            body: Vec::new(),
        };

        if let Some(len) = request.content_length()? {
            if len > MAX_BODY_LEN {
                return Err(RelayError::parse(ParseErrorKind::BodyTooLarge));
            }
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).map_err(RelayError::from_read)?;
            request.body = body;
        }

        Ok(Some(request))
    }

    /// Parse a complete request held in memory.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let mut cursor = raw;
        Self::read_from(&mut cursor)?.ok_or(RelayError::Truncated)
    }

    /// Serialize to the RTSP wire format. `Content-Length` is recomputed from
    /// the body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.uri, self.version);
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !self.body.is_empty() {
            out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        out.push_str("\r\n");

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    /// The method as a [`Method`], or the raw token if unknown.
    pub fn method(&self) -> std::result::Result<Method, UnknownMethod> {
        self.method.parse()
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the CSeq header value, which numbers and orders RTSP
    /// request/response pairs (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// Session id from the `Session` header, without the `;timeout=` suffix.
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim())
            .filter(|s| !s.is_empty())
    }

    /// Media type of the body, without parameters.
    pub fn content_type(&self) -> Option<&str> {
        self.get_header("Content-Type")
            .map(|s| s.split(';').next().unwrap_or(s).trim())
    }

    fn content_length(&self) -> Result<Option<usize>> {
        match self.get_header("Content-Length") {
            None => Ok(None),
            Some(v) => v
                .parse::<usize>()
                .map(Some)
                .map_err(|_| RelayError::parse(ParseErrorKind::InvalidContentLength)),
        }
    }
}

/// `OPTIONS rtsp://192.168.0.1:554/live RTSP/1.0` → (method, uri, version).
fn parse_request_line(line: &str) -> Option<(&str, &str, &str)> {
    let mut parts = line.split(' ');
    let method = parts.next().filter(|s| !s.is_empty())?;
    let uri = parts.next().filter(|s| !s.is_empty())?;
    let version = parts.next().filter(|s| !s.is_empty())?;
    if parts.next().is_some() {
        return None;
    }
    Some((method, uri, version))
}

/// Read one CRLF (or bare LF) terminated line without its terminator.
///
/// `Ok(None)` means EOF before any byte of the line.
fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    let mut buf = Vec::new();
    let n = reader
        .by_ref()
        .take(MAX_LINE_LEN)
        .read_until(b'\n', &mut buf)?;

    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        if n as u64 == MAX_LINE_LEN {
            return Err(RelayError::parse(ParseErrorKind::LineTooLong));
        }
        return Err(RelayError::Truncated);
    }

    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| RelayError::parse(ParseErrorKind::InvalidUtf8))
}
