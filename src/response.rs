use crate::buffer::ByteBuffer;
use crate::error::BufferError;
use crate::http::Status;
use bytes::Bytes;
use log::{debug, warn};
use memmap2::Mmap;
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

/// Suffix to Content-Type; anything else is served as `text/plain`.
const CONTENT_TYPES: &[(&str, &str)] = &[
    ("html", "text/html"),
    ("xml", "text/xml"),
    ("xhtml", "application/xhtml+xml"),
    ("txt", "text/plain"),
    ("rtf", "application/rtf"),
    ("pdf", "application/pdf"),
    ("word", "application/nsword"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("au", "audio/basic"),
    ("mpeg", "video/mpeg"),
    ("mpg", "video/mpeg"),
    ("avi", "video/x-msvideo"),
    ("gz", "application/x-gzip"),
    ("tar", "application/x-tar"),
    ("css", "text/css"),
    ("js", "text/javascript"),
    ("json", "application/json"),
    ("svg", "image/svg+xml"),
    ("ico", "image/x-icon"),
    ("wasm", "application/wasm"),
    ("mp4", "video/mp4"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
];

const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Get the content type for a file based on its extension
pub fn content_type(path: &Path) -> &'static str {
    let ext = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => ext,
        None => return DEFAULT_CONTENT_TYPE,
    };
    CONTENT_TYPES
        .iter()
        .find(|(suffix, _)| suffix.eq_ignore_ascii_case(ext))
        .map(|(_, ty)| *ty)
        .unwrap_or(DEFAULT_CONTENT_TYPE)
}

/// Response payload
pub enum Body {
    Empty,
    Inline(Bytes),
    /// A mapped file, sent as a second output segment after the head
    File(Mmap),
}

impl Body {
    pub fn len(&self) -> usize {
        match self {
            Body::Empty => 0,
            Body::Inline(bytes) => bytes.len(),
            Body::File(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A response ready to be serialized into a connection's write buffer
pub struct Response {
    pub status: Status,
    pub keep_alive: bool,
    pub content_type: &'static str,
    pub body: Body,
}

impl Response {
    /// The reply sent when the connection ceiling is reached.
    pub fn busy() -> Self {
        Self::inline(Status::ServiceUnavailable, "Server busy!", false)
    }

    /// A terse HTML error page generated in memory
    pub fn inline(status: Status, message: &str, keep_alive: bool) -> Self {
        let html = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p><hr><em>reactor-server</em></body></html>",
            status.code(),
            status.as_str(),
            message
        );
        Self {
            status,
            keep_alive,
            content_type: "text/html",
            body: Body::Inline(Bytes::from(html)),
        }
    }

    /// Status line and headers as bytes
    pub fn head(&self) -> String {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status.code(), self.status.as_str());
        if self.keep_alive {
            head.push_str("Connection: keep-alive\r\n");
            head.push_str("keep-alive: max=6, timeout=120\r\n");
        } else {
            head.push_str("Connection: close\r\n");
        }
        head.push_str(&format!("Content-Type: {}\r\n", self.content_type));
        head.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        head
    }

    /// Write the head, plus an inline body, into `buffer`. A file body is
    /// left in place for the caller to send as its own segment.
    pub fn write_into<B: ByteBuffer>(&self, buffer: &mut B) -> Result<(), BufferError> {
        buffer.append(self.head().as_bytes())?;
        if let Body::Inline(bytes) = &self.body {
            buffer.append(bytes)?;
        }
        Ok(())
    }

    /// Take the mapped file out of the response, if there is one. Stage the
    /// head with `write_into` first; afterwards the body reads as empty.
    pub fn take_file(&mut self) -> Option<Mmap> {
        match std::mem::replace(&mut self.body, Body::Empty) {
            Body::File(map) => Some(map),
            other => {
                self.body = other;
                None
            }
        }
    }
}

/// Where a request path led.
enum Resolved {
    File(PathBuf, u64),
    Missing,
    Forbidden,
}

/// Maps request paths onto files under a resources directory.
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    root: PathBuf,
}

impl ResponseBuilder {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Build the response for `path`, or for the error page of `status`
    /// when the request already failed.
    pub fn build(&self, path: &str, keep_alive: bool, status: Option<Status>) -> Response {
        let status = match status {
            Some(Status::Ok) | None => match self.resolve(path) {
                Resolved::File(file, len) => match self.open(&file, len) {
                    Some(body) => {
                        return Response {
                            status: Status::Ok,
                            keep_alive,
                            content_type: content_type(&file),
                            body,
                        };
                    }
                    None => Status::NotFound,
                },
                Resolved::Missing => Status::NotFound,
                Resolved::Forbidden => Status::Forbidden,
            },
            Some(status) => status,
        };
        self.error_page(status, keep_alive)
    }

    /// `/<code>.html` from the resources directory, or a generated page.
    pub fn error_page(&self, status: Status, keep_alive: bool) -> Response {
        let page = format!("/{}.html", status.code());
        if let Resolved::File(file, len) = self.resolve(&page) {
            if let Some(body) = self.open(&file, len) {
                return Response {
                    status,
                    keep_alive,
                    content_type: "text/html",
                    body,
                };
            }
        }
        let message = match status {
            Status::NotFound => "File NotFound!",
            Status::Forbidden => "Permission denied!",
            Status::BadRequest => "Bad request!",
            Status::ServiceUnavailable => "Server busy!",
            Status::Ok => "",
        };
        Response::inline(status, message, keep_alive)
    }

    fn resolve(&self, path: &str) -> Resolved {
        let relative = Path::new(path.trim_start_matches('/'));
        // no escaping the resources directory
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Resolved::Forbidden;
        }

        let file = self.root.join(relative);
        match fs::metadata(&file) {
            Err(_) => Resolved::Missing,
            Ok(meta) if meta.is_dir() => Resolved::Missing,
            Ok(meta) if meta.permissions().mode() & 0o004 == 0 => Resolved::Forbidden,
            Ok(meta) => Resolved::File(file, meta.len()),
        }
    }

    fn open(&self, file: &Path, len: u64) -> Option<Body> {
        if len == 0 {
            return Some(Body::Empty);
        }
        let handle = match File::open(file) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Cannot open {}: {}", file.display(), e);
                return None;
            }
        };
        match unsafe { Mmap::map(&handle) } {
            Ok(map) => {
                debug!("Mapped {} ({} bytes)", file.display(), map.len());
                Some(Body::File(map))
            }
            Err(e) => {
                warn!("Cannot map {}: {}", file.display(), e);
                None
            }
        }
    }
}
