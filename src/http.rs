use crate::auth::Authenticator;
use crate::buffer::ByteBuffer;
use crate::error::{ServerError, ServerResult};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

const CRLF: &[u8] = b"\r\n";

/// Short paths that are served as `<path>.html`.
const HTML_PAGES: [&str; 6] = ["/index", "/register", "/login", "/welcome", "/video", "/picture"];

/// HTTP Status Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok = 200,
    BadRequest = 400,
    Forbidden = 403,
    NotFound = 404,
    ServiceUnavailable = 503,
}

impl Status {
    /// Numeric status code
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Get the text description for this status code
    pub fn as_str(&self) -> &'static str {
        match *self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::ServiceUnavailable => "Service Unavailable",
        }
    }
}

/// HTTP Methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Trace,
    Connect,
    Patch,
}

impl Method {
    /// Parse a method token
    pub fn from_token(s: &str) -> ServerResult<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "OPTIONS" => Ok(Method::Options),
            "TRACE" => Ok(Method::Trace),
            "CONNECT" => Ok(Method::Connect),
            "PATCH" => Ok(Method::Patch),
            _ => Err(ServerError::HttpParse(format!("Invalid method: {}", s))),
        }
    }

    /// Convert the method to a string
    pub fn as_str(&self) -> &'static str {
        match *self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Patch => "PATCH",
        }
    }
}

/// HTTP Parser State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpParserState {
    RequestLine,
    Headers,
    Body,
    Finished,
}

/// Outcome of feeding the parser from a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// A full request was consumed.
    Complete,
    /// More bytes are needed; nothing partial was consumed.
    Incomplete,
}

/// A token produced by the line scanner.
#[derive(Debug, PartialEq, Eq)]
enum Line<'a> {
    RequestLine {
        method: &'a str,
        path: &'a str,
        version: &'a str,
    },
    Header {
        key: &'a str,
        value: &'a str,
    },
    /// Anything that is not a header, the blank separator included.
    Separator,
}

fn scan_request_line(line: &[u8]) -> ServerResult<Line<'_>> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ServerError::HttpParse("Request line is not UTF-8".to_string()))?;

    let mut parts = text.split(' ');
    let (method, path, protocol) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(p), Some(v), None) if !m.is_empty() && !p.is_empty() => (m, p, v),
        _ => {
            return Err(ServerError::HttpParse(format!("Invalid request line: {:?}", text)));
        }
    };

    let version = protocol
        .strip_prefix("HTTP/")
        .filter(|v| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit() || b == b'.'))
        .ok_or_else(|| ServerError::HttpParse(format!("Invalid protocol: {:?}", protocol)))?;

    Ok(Line::RequestLine {
        method,
        path,
        version,
    })
}

fn scan_header_line(line: &str) -> Line<'_> {
    match line.split_once(':') {
        Some((key, value)) => Line::Header {
            key,
            value: value.strip_prefix(' ').unwrap_or(value),
        },
        None => Line::Separator,
    }
}

/// Decode an `application/x-www-form-urlencoded` component.
pub fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Split a urlencoded body into decoded key/value pairs.
pub fn parse_form(body: &str) -> HashMap<String, String> {
    body.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (url_decode(k), url_decode(v)),
            None => (url_decode(pair), String::new()),
        })
        .collect()
}

/// Incremental HTTP/1.x request parser.
///
/// `parse` consumes whole lines from a buffer and keeps its state between
/// calls, so a request may arrive in any number of pieces.
pub struct HttpParser {
    pub state: HttpParserState,
    pub method: Option<Method>,
    pub path: Option<String>,
    pub version: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub form: HashMap<String, String>,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl HttpParser {
    /// Create a new HTTP parser
    pub fn new() -> Self {
        Self {
            state: HttpParserState::RequestLine,
            method: None,
            path: None,
            version: None,
            headers: HashMap::new(),
            body: Vec::new(),
            form: HashMap::new(),
            authenticator: None,
        }
    }

    /// A parser that verifies login/register forms with `authenticator`.
    pub fn with_authenticator(authenticator: Arc<dyn Authenticator>) -> Self {
        let mut parser = Self::new();
        parser.authenticator = Some(authenticator);
        parser
    }

    /// Consume as much of `buffer` as forms complete lines.
    ///
    /// Returns `Incomplete` when a line or the body is still partial; the
    /// partial bytes stay in the buffer. A malformed request line is an
    /// error and nothing after it is consumed.
    pub fn parse<B: ByteBuffer>(&mut self, buffer: &mut B) -> ServerResult<ParseStatus> {
        loop {
            match self.state {
                HttpParserState::RequestLine => {
                    let line = match buffer.read_until(CRLF) {
                        Some(line) => line,
                        None => return Ok(ParseStatus::Incomplete),
                    };
                    self.parse_request_line(&line)?;
                    self.state = HttpParserState::Headers;
                }
                HttpParserState::Headers => {
                    let line = match buffer.read_until(CRLF) {
                        Some(line) => line,
                        None => return Ok(ParseStatus::Incomplete),
                    };
                    let line = String::from_utf8_lossy(&line);
                    match scan_header_line(&line) {
                        Line::Header { key, value } => {
                            self.headers.insert(key.to_string(), value.to_string());
                            // Only the terminating blank line is left.
                            if buffer.readable_bytes() == CRLF.len() && buffer.peek_all() == CRLF {
                                buffer.read_exact(CRLF.len());
                                self.state = if self.content_length() == 0 {
                                    HttpParserState::Finished
                                } else {
                                    HttpParserState::Body
                                };
                            }
                        }
                        _ => self.state = HttpParserState::Body,
                    }
                }
                HttpParserState::Body => {
                    let len = self.content_length();
                    let body = match buffer.read_exact(len) {
                        Some(body) => body,
                        None => return Ok(ParseStatus::Incomplete),
                    };
                    self.body = body;
                    self.parse_post();
                    self.state = HttpParserState::Finished;
                }
                HttpParserState::Finished => {
                    debug!(
                        "Parsed {} {} HTTP/{}",
                        self.method.map(|m| m.as_str()).unwrap_or("-"),
                        self.path.as_deref().unwrap_or("-"),
                        self.version.as_deref().unwrap_or("-")
                    );
                    return Ok(ParseStatus::Complete);
                }
            }
        }
    }

    fn parse_request_line(&mut self, line: &[u8]) -> ServerResult<()> {
        if let Line::RequestLine {
            method,
            path,
            version,
        } = scan_request_line(line)?
        {
            self.method = Some(Method::from_token(method)?);
            self.path = Some(normalize_path(path));
            self.version = Some(version.to_string());
        }
        Ok(())
    }

    /// `Content-Length` as a byte count; absent or unparsable means 0.
    pub fn content_length(&self) -> usize {
        self.headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    fn parse_post(&mut self) {
        if self.method != Some(Method::Post) {
            return;
        }
        let urlencoded = self
            .headers
            .get("Content-Type")
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim() == "application/x-www-form-urlencoded")
            .unwrap_or(false);
        if !urlencoded {
            return;
        }

        self.form = parse_form(&String::from_utf8_lossy(&self.body));

        let is_login = match self.path.as_deref() {
            Some("/login.html") => true,
            Some("/register.html") => false,
            _ => return,
        };
        if let Some(auth) = &self.authenticator {
            let user = self.form.get("username").map(String::as_str).unwrap_or("");
            let password = self.form.get("password").map(String::as_str).unwrap_or("");
            let verified = auth.verify(user, password, is_login);
            debug!("User verification for {:?} (login: {}): {}", user, is_login, verified);
            self.path = Some(if verified { "/welcome.html" } else { "/error.html" }.to_string());
        }
    }

    /// Check if the parser has completed parsing a request
    pub fn is_complete(&self) -> bool {
        self.state == HttpParserState::Finished
    }

    /// Keep-alive requires HTTP/1.1 and `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        self.version.as_deref() == Some("1.1")
            && self
                .headers
                .get("Connection")
                .map(|v| v.eq_ignore_ascii_case("keep-alive"))
                .unwrap_or(false)
    }

    /// Reset the parser for a new request
    pub fn reset(&mut self) {
        self.state = HttpParserState::RequestLine;
        self.method = None;
        self.path = None;
        self.version = None;
        self.headers.clear();
        self.body.clear();
        self.form.clear();
    }

    /// Get the parsed request
    pub fn get_request(&self) -> ServerResult<Request> {
        if !self.is_complete() {
            return Err(ServerError::HttpParse("Request not complete".to_string()));
        }

        let method = self
            .method
            .ok_or_else(|| ServerError::HttpParse("Method not set".to_string()))?;
        let path = self
            .path
            .clone()
            .ok_or_else(|| ServerError::HttpParse("Path not set".to_string()))?;

        Ok(Request {
            method,
            path,
            version: self.version.clone().unwrap_or_default(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            form: self.form.clone(),
            keep_alive: self.is_keep_alive(),
        })
    }
}

impl Default for HttpParser {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_path(path: &str) -> String {
    if path == "/" {
        "/index.html".to_string()
    } else if HTML_PAGES.contains(&path) {
        format!("{}.html", path)
    } else {
        path.to_string()
    }
}

/// HTTP Request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Decoded urlencoded form fields
    pub form: HashMap<String, String>,
    pub keep_alive: bool,
}

impl Request {
    /// Get a header (names are case-sensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Get a decoded form field
    pub fn form(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanner_tokens() {
        assert_eq!(
            scan_request_line(b"GET /a HTTP/1.0").unwrap(),
            Line::RequestLine {
                method: "GET",
                path: "/a",
                version: "1.0"
            }
        );
        assert!(scan_request_line(b"GET /a").is_err());
        assert!(scan_request_line(b"GET /a FTP/1.0").is_err());
        assert!(scan_request_line(b"GET  /a HTTP/1.1").is_err());
        assert_eq!(scan_header_line("Host:x"), Line::Header { key: "Host", value: "x" });
        assert_eq!(scan_header_line(""), Line::Separator);
    }

    #[test]
    fn url_decoding() {
        assert_eq!(url_decode("a+b%21"), "a b!");
        assert_eq!(url_decode("100%"), "100%");
        assert_eq!(url_decode("%zz"), "%zz");
        assert_eq!(url_decode("%4"), "%4");
    }

    #[test]
    fn path_normalization() {
        assert_eq!(normalize_path("/"), "/index.html");
        assert_eq!(normalize_path("/login"), "/login.html");
        assert_eq!(normalize_path("/img/a.png"), "/img/a.png");
    }
}
