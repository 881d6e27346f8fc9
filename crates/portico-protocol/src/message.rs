//! Normalized request/response pair handed through the dispatch core.

use std::net::SocketAddr;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use tracing::warn;

/// An inbound request, fully buffered.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: Option<SocketAddr>,
}

impl DispatchRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: None,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Header value as text, if present and valid UTF-8.
    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Virtual host name: the URI authority or `Host` header, without port.
    pub fn host(&self) -> Option<&str> {
        let raw = self
            .uri
            .host()
            .or_else(|| self.header(header::HOST))?;
        let host = match raw.strip_prefix('[') {
            // IPv6 literal, keep the brackets off
            Some(rest) => rest.split(']').next().unwrap_or(rest),
            None => raw.split(':').next().unwrap_or(raw),
        };
        if host.is_empty() { None } else { Some(host) }
    }
}

/// The response being produced for one request.
///
/// `committed` mirrors a servlet response: once a body has been written (or
/// an error sent) later stages must not overwrite it.
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    status: StatusCode,
    status_set: bool,
    headers: HeaderMap,
    body: Bytes,
    committed: bool,
}

impl Default for DispatchResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchResponse {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            status_set: false,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            committed: false,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Whether anything explicitly set a status.
    pub fn is_status_set(&self) -> bool {
        self.status_set
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
        self.status_set = true;
    }

    /// Insert a header. Values that are not valid header text are logged and
    /// dropped; returns whether the header was set.
    pub fn insert_header(&mut self, name: HeaderName, value: &str) -> bool {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.insert(name, value);
                true
            }
            Err(_) => {
                warn!("Dropped invalid {name} header value {value:?}");
                false
            }
        }
    }

    pub fn append_header(&mut self, name: HeaderName, value: &str) -> bool {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.append(name, value);
                true
            }
            Err(_) => {
                warn!("Dropped invalid {name} header value {value:?}");
                false
            }
        }
    }

    /// Write the body and commit the response.
    pub fn write_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
        self.committed = true;
    }

    /// Set status, content type and body in one go.
    pub fn send(&mut self, status: StatusCode, content_type: &str, body: impl Into<Bytes>) {
        self.set_status(status);
        self.insert_header(header::CONTENT_TYPE, content_type);
        self.write_body(body);
    }

    /// Plain-text error page.
    pub fn send_error(&mut self, status: StatusCode, message: &str) {
        let reason = status.canonical_reason().unwrap_or("Error");
        let body = if message.is_empty() {
            format!("{} {reason}\n", status.as_u16())
        } else {
            format!("{} {reason}: {message}\n", status.as_u16())
        };
        self.send(status, "text/plain; charset=utf-8", body);
    }

    pub fn into_parts(self) -> (StatusCode, HeaderMap, Bytes) {
        (self.status, self.headers, self.body)
    }
}
